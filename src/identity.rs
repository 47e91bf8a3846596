//! Network identities.
//!
//! Each node owns exactly one secp256k1 key pair for its lifetime. The
//! compressed public key is the node's [`PeerId`]; anybody holding a peer id can
//! recover the public key and check signatures made by that peer.
use std::fmt;

use ecdsa::signature::{Signer, Verifier};
use elliptic_curve::sec1::ToEncodedPoint;
use k256::{
    ecdsa::{Signature, SigningKey, VerifyingKey},
    PublicKey,
};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// The length of a compressed SEC1 public key.
pub const PEER_ID_LEN: usize = 33;

/// The identifier of a peer on the network.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Parse a peer id from its byte representation.
    ///
    /// This fails if the bytes are not a valid compressed public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let public = PublicIdentity::from_bytes(bytes)?;
        Ok(public.peer_id())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Extract the public key behind this identifier.
    pub fn public_key(&self) -> Result<PublicIdentity, String> {
        PublicIdentity::from_bytes(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// The public half of an identity.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity(VerifyingKey);

impl PublicIdentity {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|e| format!("invalid public key: {e}"))
    }

    /// The compressed SEC1 encoding of the key.
    pub fn to_bytes(&self) -> Vec<u8> {
        PublicKey::from(&self.0)
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.to_bytes())
    }

    /// The account address of this key on the chain.
    ///
    /// That's the last 20 bytes of the Keccak-256 hash of the uncompressed
    /// point, leaving out its `0x04` tag.
    pub fn chain_address(&self) -> [u8; 20] {
        let point = PublicKey::from(&self.0).to_encoded_point(false);
        let hash = Keccak256::digest(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..]);
        address
    }

    /// Check a signature produced by [`Identity::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let signature = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.0.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", hex::encode(self.to_bytes()))
    }
}

/// A static key pair, owned by one node.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    public: PublicIdentity,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Load an identity from the 32 bytes of a private scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, String> {
        SigningKey::from_slice(bytes)
            .map(Self::from_signing_key)
            .map_err(|e| format!("invalid private key: {e}"))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public = PublicIdentity(signing_key.verifying_key().clone());
        Self {
            signing_key,
            public,
        }
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.public.peer_id()
    }

    /// Sign arbitrary bytes, returning the 64 byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}
