use std::{error, io};

use thiserror::Error;

/// The error type returned by protocol-supplied code.
///
/// States, payload codecs, block counters and firewalls live outside of this
/// crate, so we only require their errors to be thread safe.
pub type BoxError = Box<dyn error::Error + Send + Sync>;

/// Errors which can happen while authenticating a new connection.
///
/// All of these are fatal to the connection, and are never retried.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported protocol: [{0}]")]
    UnsupportedProtocol(String),

    #[error("unexpected responder's challenge")]
    UnexpectedResponderChallenge,

    #[error("unexpected initiator's challenge")]
    UnexpectedInitiatorChallenge,

    #[error("pinned identity [{pinned}] does not match sender identity [{actual}]")]
    IdentityMismatch { pinned: String, actual: String },

    #[error("invalid signature [0x{signature}] on message from sender [{sender}]")]
    InvalidSignature { signature: String, sender: String },

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("malformed handshake message: {0}")]
    Malformed(String),

    #[error("frame of [{size}] bytes exceeds maximum of [{max}] bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("could not generate a new nonce: [{0}]")]
    Nonce(rand_core::Error),

    #[error("remote peer rejected by firewall: [{0}]")]
    Firewall(BoxError),

    #[error("connection handshake failed: [{0}]")]
    Io(#[from] io::Error),
}

/// Errors raised by the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer [{0}]")]
    UnknownPeer(String),

    #[error("transport is closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

/// Errors surfaced by broadcast and unicast channels.
///
/// Only problems with the original transmission become errors; anything which
/// goes wrong with an incoming message is logged and the message dropped.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("type [{0}] already has an associated unmarshaler")]
    DuplicateUnmarshaler(String),

    #[error("could not marshal message of type [{message_type}]: [{source}]")]
    Marshal {
        message_type: String,
        source: BoxError,
    },

    #[error("could not encode network message: [{0}]")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("invalid peer identifier: [{0}]")]
    InvalidPeer(String),

    #[error("channel [{0}] is closed")]
    Closed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reasons why an incoming message was dropped by a channel.
///
/// These never reach the sender or the handlers, they exist to be logged.
#[derive(Debug, Error)]
pub(crate) enum DropReason {
    #[error("could not decode network message: [{0}]")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("outer layer sender [{outer}] does not match inner layer sender [{inner}]")]
    SenderMismatch { outer: String, inner: String },

    #[error("message for channel [{actual}] arrived on channel [{expected}]")]
    ChannelMismatch { expected: String, actual: String },

    #[error("invalid signature on message from sender [{0}]")]
    InvalidSignature(String),

    #[error("sender [{0}] rejected by channel filter")]
    Filtered(String),

    #[error("couldn't find unmarshaler for type {0}")]
    NoUnmarshaler(String),

    #[error("could not unmarshal payload of type [{message_type}]: [{source}]")]
    Unmarshal {
        message_type: String,
        source: BoxError,
    },

    #[error("invalid sender identity: [{0}]")]
    InvalidSender(String),
}

/// Errors terminating a protocol state machine execution.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("failed to initiate state [{state}]: [{source}]")]
    Initiate { state: String, source: BoxError },

    #[error("failed to complete state [{state}]: [{source}]")]
    Next { state: String, source: BoxError },

    #[error("block counter failure: [{0}]")]
    BlockCounter(BoxError),

    #[error("context cancelled")]
    Cancelled,
}

/// Errors loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: [{0}]")]
    Io(#[from] io::Error),

    #[error("could not parse config: [{0}]")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for [{field}]: {reason}")]
    Invalid { field: &'static str, reason: String },
}
