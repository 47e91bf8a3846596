//! Threshold-Net is the messaging and coordination layer for nodes running
//! threshold cryptography protocols together.
//!
//! The protocols themselves (key generation, signing, ...) are not part of
//! this crate. What it provides is everything such protocols need around
//! them, in three layers.
//!
//! # Authentication
//!
//! Every connection between two nodes starts with a 3-act handshake, in
//! [`handshake`], proving that each side owns the static key behind its
//! [`PeerId`]. Once done, a [`Firewall`] gets to decide whether the remote
//! node is allowed to stay connected.
//!
//! # Channels
//!
//! On top of authenticated connections, the [`net`] module provides two kinds
//! of channels, created through a [`Provider`]:
//!
//! - A [`BroadcastChannel`] reaches every node subscribed to the same name.
//! - A [`UnicastChannel`] reaches a single remote node.
//!
//! Every message is signed by its author, and retransmitted a few times, since
//! the network makes no delivery promise. Receivers check signatures, drop the
//! retransmitted copies they've already seen, and decode payloads with the
//! unmarshalers registered for their types:
//! ```ignore
//! let channel = provider.broadcast_channel_for("dkg-1")?;
//! channel.register_unmarshaler::<Commitment>()?;
//! channel.recv(&scope, |message| {
//!     let commitment = message.payload::<Commitment>();
//!     // ...
//! });
//! channel.send(&scope, &my_commitment)?;
//! ```
//!
//! # State machines
//!
//! A protocol is expressed as a chain of states, driven by the machines in
//! [`protocol`]. An [`AsyncMachine`] moves to the next state as soon as the
//! current one says it is ready, while a [`SyncMachine`] follows a block
//! height clock, so that a slow member can never hold the others back.
//!
//! # Shortcomings
//!
//! - Messages are authenticated, but not encrypted.
//! - There is no peer discovery: the overlay below [`net::transport::Transport`]
//!   is expected to take care of it.
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod net;
pub mod participants;
pub mod protocol;
pub mod scope;
mod serde;
#[cfg(test)]
mod test;

pub use config::Config;
pub use error::{BoxError, ChannelError, ConfigError, HandshakeError, MachineError, TransportError};
pub use handshake::{AllowAll, AuthenticatedConnection, Firewall};
pub use identity::{Identity, PeerId, PublicIdentity};
pub use net::{
    BroadcastChannel, Message, Provider, SerdeMessage, TaggedMarshaler, TaggedUnmarshaler,
    UnicastChannel,
};
pub use participants::{MemberIndex, MembershipValidator};
pub use protocol::{AsyncMachine, AsyncState, State, SyncMachine, SyncState};
pub use scope::Scope;
