//! The interface channels expect from the underlying peer-to-peer overlay.
//!
//! Connection management, routing and topic propagation all happen below this
//! trait. Channels only need to publish to topics, subscribe to them, and
//! exchange bytes directly with single, already authenticated, peers.
use smol::channel::Receiver;

use crate::{error::TransportError, identity::PeerId};

/// Bytes received from the overlay, along with the authenticated sender.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Something happening on a direct stream with another peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnicastEvent {
    /// The remote peer opened a stream with us.
    Opened(PeerId),
    /// The remote peer sent us some bytes.
    Message(PeerId, Vec<u8>),
    /// The stream with this peer is gone.
    Closed(PeerId),
}

pub trait Transport: Send + Sync + 'static {
    /// The identifier of this node on the overlay.
    fn local_id(&self) -> PeerId;

    /// Start receiving everything published on a topic.
    ///
    /// Messages published by this node itself are delivered too.
    fn subscribe(&self, topic: &str) -> Result<Receiver<RawMessage>, TransportError>;

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Open a direct stream with a peer.
    ///
    /// The remote side gets notified with [`UnicastEvent::Opened`] the first
    /// time only.
    fn open(&self, peer: &PeerId) -> Result<(), TransportError>;

    /// Send bytes over the direct stream with a peer, opening it if needed.
    fn send_to(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError>;

    /// The stream of direct stream events for this node.
    ///
    /// There is a single stream per transport: events are split between all
    /// the receivers handed out.
    fn unicast_events(&self) -> Receiver<UnicastEvent>;

    fn connected_peers(&self) -> Vec<PeerId>;

    /// The addresses this node can be reached at.
    fn addresses(&self) -> Vec<String>;

    fn disconnect(&self, peer: &PeerId) -> Result<(), TransportError>;
}
