//! The signed envelope wrapping every channel message on the wire.
use std::fmt;

use digest::Digest;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{
    identity::{Identity, PublicIdentity},
    serde::{encode, write_prefixed},
};

/// A content digest identifying a logical message.
///
/// Retransmitted copies of a message share its fingerprint, since the
/// retransmission counter is not part of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

/// A channel message, as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub sender: Vec<u8>,
    pub payload: Vec<u8>,
    #[serde(rename = "type")]
    pub message_type: Vec<u8>,
    pub channel: Vec<u8>,
    pub encrypted: bool,
    pub retransmission: u32,
    pub signature: Vec<u8>,
}

/// Every field except the signature, in wire order.
#[derive(Serialize)]
struct Unsigned<'a> {
    sender: &'a [u8],
    payload: &'a [u8],
    message_type: &'a [u8],
    channel: &'a [u8],
    encrypted: bool,
    retransmission: u32,
}

impl NetworkMessage {
    /// Build and sign a new original message.
    pub fn signed(
        identity: &Identity,
        channel: &str,
        message_type: &str,
        payload: Vec<u8>,
    ) -> Result<Self, rmp_serde::encode::Error> {
        let mut message = Self {
            sender: identity.peer_id().as_bytes().to_vec(),
            payload,
            message_type: message_type.as_bytes().to_vec(),
            channel: channel.as_bytes().to_vec(),
            encrypted: false,
            retransmission: 0,
            signature: Vec::new(),
        };
        message.sign(identity)?;
        Ok(message)
    }

    /// A copy of this message with another retransmission counter, signed anew.
    ///
    /// The original message is left untouched.
    pub fn retransmitted(
        &self,
        identity: &Identity,
        retransmission: u32,
    ) -> Result<Self, rmp_serde::encode::Error> {
        let mut copy = self.clone();
        copy.retransmission = retransmission;
        copy.sign(identity)?;
        Ok(copy)
    }

    fn sign(&mut self, identity: &Identity) -> Result<(), rmp_serde::encode::Error> {
        let bytes = self.signing_bytes()?;
        self.signature = identity.sign(&bytes);
        Ok(())
    }

    /// The bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        encode(&Unsigned {
            sender: &self.sender,
            payload: &self.payload,
            message_type: &self.message_type,
            channel: &self.channel,
            encrypted: self.encrypted,
            retransmission: self.retransmission,
        })
    }

    /// Check the signature against the public key of the claimed sender.
    pub fn verify(&self, sender: &PublicIdentity) -> bool {
        match self.signing_bytes() {
            Ok(bytes) => sender.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut buf = Vec::with_capacity(
            32 + self.sender.len() + self.channel.len() + self.message_type.len() + self.payload.len(),
        );
        write_prefixed(&mut buf, &self.sender);
        write_prefixed(&mut buf, &self.channel);
        write_prefixed(&mut buf, &self.message_type);
        write_prefixed(&mut buf, &self.payload);

        Fingerprint(Sha256::digest(&buf).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(identity: &Identity) -> NetworkMessage {
        NetworkMessage::signed(identity, "channel", "type", b"payload".to_vec()).unwrap()
    }

    #[test]
    fn test_signed_message_verifies() {
        let identity = Identity::generate();
        let message = message(&identity);
        assert!(message.verify(identity.public()));
        assert!(!message.verify(Identity::generate().public()));
    }

    #[test]
    fn test_any_tampered_field_breaks_signature() {
        let identity = Identity::generate();
        let original = message(&identity);

        let mut m = original.clone();
        m.payload[0] ^= 1;
        assert!(!m.verify(identity.public()));

        let mut m = original.clone();
        m.channel = b"other".to_vec();
        assert!(!m.verify(identity.public()));

        let mut m = original.clone();
        m.message_type = b"other".to_vec();
        assert!(!m.verify(identity.public()));

        let mut m = original.clone();
        m.retransmission = 3;
        assert!(!m.verify(identity.public()));

        let mut m = original;
        m.encrypted = true;
        assert!(!m.verify(identity.public()));
    }

    #[test]
    fn test_fingerprint_ignores_only_retransmission() {
        let identity = Identity::generate();
        let original = message(&identity);
        let fingerprint = original.fingerprint();

        let copy = original.retransmitted(&identity, 7).unwrap();
        assert_eq!(copy.fingerprint(), fingerprint);
        assert!(copy.verify(identity.public()));
        assert_eq!(original.retransmission, 0);

        let other_sender = message(&Identity::generate());
        assert_ne!(other_sender.fingerprint(), fingerprint);

        let mut m = original.clone();
        m.message_type = b"other".to_vec();
        assert_ne!(m.fingerprint(), fingerprint);

        let mut m = original.clone();
        m.channel = b"other".to_vec();
        assert_ne!(m.fingerprint(), fingerprint);

        let mut m = original.clone();
        m.payload = b"payloae".to_vec();
        assert_ne!(m.fingerprint(), fingerprint);
    }

    #[test]
    fn test_fingerprint_fields_cannot_be_shifted() {
        let identity = Identity::generate();
        let a = NetworkMessage::signed(&identity, "ab", "c", b"x".to_vec()).unwrap();
        let b = NetworkMessage::signed(&identity, "a", "bc", b"x".to_vec()).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
