//! Signed, retransmitted and deduplicated messaging between peers.
//!
//! Protocol code talks to other peers through channels obtained from a
//! [`Provider`]. A [`BroadcastChannel`] reaches every peer subscribed to a
//! name, a [`UnicastChannel`] reaches exactly one remote peer. Both deliver
//! [`Message`]s, whose payloads get decoded by unmarshalers registered per
//! message type.
use std::{any::Any, fmt, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::BoxError,
    identity::PeerId,
    serde::{decode, encode},
};

mod channel;
pub mod envelope;
pub mod local;
mod provider;
pub mod retransmission;
pub mod transport;
mod unicast;

pub use channel::{BroadcastChannel, Filter};
pub use envelope::{Fingerprint, NetworkMessage};
pub use provider::{ConnectionManager, Provider};
pub use retransmission::{Backoff, Standard, Strategy};
pub use unicast::UnicastChannel;

/// A payload which knows its own type tag, and how to turn itself into bytes.
pub trait TaggedMarshaler {
    fn message_type(&self) -> &str;

    fn marshal(&self) -> Result<Vec<u8>, BoxError>;
}

/// A payload which can be reconstructed from bytes.
///
/// Registering a type with a channel lets that channel decode incoming
/// messages tagged with [`TaggedUnmarshaler::TYPE`].
pub trait TaggedUnmarshaler: Sized + Send + Sync + 'static {
    const TYPE: &'static str;

    fn unmarshal(bytes: &[u8]) -> Result<Self, BoxError>;
}

/// A payload using the crate's default MessagePack encoding.
///
/// Implementing this (and only this) is enough for a serde type to be sent
/// over and received from channels.
pub trait SerdeMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

impl<T: SerdeMessage> TaggedMarshaler for T {
    fn message_type(&self) -> &str {
        <T as SerdeMessage>::TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>, BoxError> {
        Ok(encode(self)?)
    }
}

impl<T: SerdeMessage> TaggedUnmarshaler for T {
    const TYPE: &'static str = <T as SerdeMessage>::TYPE;

    fn unmarshal(bytes: &[u8]) -> Result<Self, BoxError> {
        Ok(decode(bytes)?)
    }
}

/// A validated message, as delivered to receive handlers.
///
/// Cloning is cheap: the decoded payload is shared.
#[derive(Clone)]
pub struct Message {
    sender: PeerId,
    sender_public_key: Vec<u8>,
    payload: Arc<dyn Any + Send + Sync>,
    message_type: String,
    retransmission: u32,
    fingerprint: Fingerprint,
}

impl Message {
    pub(crate) fn new(
        sender: PeerId,
        payload: Arc<dyn Any + Send + Sync>,
        message_type: String,
        retransmission: u32,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            sender_public_key: sender.as_bytes().to_vec(),
            sender,
            payload,
            message_type,
            retransmission,
            fingerprint,
        }
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// The compressed public key of the sender, as used for membership checks.
    pub fn sender_public_key(&self) -> &[u8] {
        &self.sender_public_key
    }

    /// Try to view the payload as a given type.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Zero for an original send, and the copy number for retransmissions.
    pub fn retransmission(&self) -> u32 {
        self.retransmission
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.sender)
            .field("message_type", &self.message_type)
            .field("retransmission", &self.retransmission)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_messages {
    use serde::{Deserialize, Serialize};

    use super::SerdeMessage;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Ping {
        pub text: String,
    }

    impl SerdeMessage for Ping {
        const TYPE: &'static str = "test/ping";
    }

    impl Ping {
        pub fn new(text: impl Into<String>) -> Self {
            Self { text: text.into() }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Pong {
        pub counter: u64,
    }

    impl SerdeMessage for Pong {
        const TYPE: &'static str = "test/pong";
    }
}
