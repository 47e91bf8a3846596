//! An in-memory overlay, connecting nodes living in the same process.
//!
//! Mostly useful for tests, and for running several protocol participants
//! inside one binary.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};

use crate::{
    error::TransportError,
    identity::{Identity, PeerId},
    net::transport::{RawMessage, Transport, UnicastEvent},
};

struct Node {
    events: Sender<UnicastEvent>,
    topics: HashMap<String, Vec<Sender<RawMessage>>>,
    links: HashSet<PeerId>,
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, Node>,
}

impl Hub {
    fn node(&self, peer: &PeerId) -> Result<&Node, TransportError> {
        self.nodes
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))
    }

    fn node_mut(&mut self, peer: &PeerId) -> Result<&mut Node, TransportError> {
        self.nodes
            .get_mut(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))
    }

    /// Link two nodes, notifying the remote one if this is a new link.
    fn link(&mut self, local: &PeerId, remote: &PeerId) -> Result<(), TransportError> {
        self.node(remote)?;
        if local == remote {
            return Ok(());
        }
        let is_new = self.node_mut(local)?.links.insert(remote.clone());
        let node = self.node_mut(remote)?;
        node.links.insert(local.clone());
        if is_new {
            let _ = node.events.try_send(UnicastEvent::Opened(local.clone()));
        }
        Ok(())
    }
}

/// A process-wide switchboard nodes can join.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network with an identity.
    ///
    /// Joining twice with the same identity replaces the previous node.
    pub fn connect(&self, identity: &Identity) -> Arc<LocalTransport> {
        let id = identity.peer_id();
        let (events_tx, events_rx) = channel::unbounded();
        self.hub.lock().nodes.insert(
            id.clone(),
            Node {
                events: events_tx,
                topics: HashMap::new(),
                links: HashSet::new(),
            },
        );
        tracing::debug!(peer = %id, "joined local network");
        Arc::new(LocalTransport {
            id,
            hub: self.hub.clone(),
            events: events_rx,
        })
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    id: PeerId,
    hub: Arc<Mutex<Hub>>,
    events: Receiver<UnicastEvent>,
}

impl Transport for LocalTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    fn subscribe(&self, topic: &str) -> Result<Receiver<RawMessage>, TransportError> {
        let (tx, rx) = channel::unbounded();
        let mut hub = self.hub.lock();
        hub.node_mut(&self.id)?
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        hub.node(&self.id)?;
        for node in hub.nodes.values_mut() {
            let Some(subscribers) = node.topics.get_mut(topic) else {
                continue;
            };
            subscribers.retain(|s| !s.is_closed());
            for subscriber in subscribers.iter() {
                let _ = subscriber.try_send(RawMessage {
                    from: self.id.clone(),
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }

    fn open(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.hub.lock().link(&self.id, peer)
    }

    fn send_to(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        hub.link(&self.id, peer)?;
        hub.node(peer)?
            .events
            .try_send(UnicastEvent::Message(self.id.clone(), data))
            .map_err(|_| TransportError::Closed)
    }

    fn unicast_events(&self) -> Receiver<UnicastEvent> {
        self.events.clone()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let hub = self.hub.lock();
        let mut peers: Vec<PeerId> = match hub.node(&self.id) {
            Ok(node) => node.links.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        peers.sort();
        peers
    }

    fn addresses(&self) -> Vec<String> {
        vec![format!("/local/{}", self.id)]
    }

    fn disconnect(&self, peer: &PeerId) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        let local = hub.node_mut(&self.id)?;
        if !local.links.remove(peer) {
            return Ok(());
        }
        let _ = local.events.try_send(UnicastEvent::Closed(peer.clone()));
        if let Ok(remote) = hub.node_mut(peer) {
            remote.links.remove(&self.id);
            let _ = remote.events.try_send(UnicastEvent::Closed(self.id.clone()));
        }
        tracing::debug!(peer = %self.id, remote = %peer, "disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber_including_self() {
        let network = LocalNetwork::new();
        let alice = network.connect(&Identity::generate());
        let bob = network.connect(&Identity::generate());

        let alice_rx = alice.subscribe("topic").unwrap();
        let bob_rx = bob.subscribe("topic").unwrap();
        let other_rx = bob.subscribe("other").unwrap();

        alice.publish("topic", b"hello".to_vec()).unwrap();

        for rx in [alice_rx, bob_rx] {
            let msg = rx.try_recv().unwrap();
            assert_eq!(msg.from, alice.local_id());
            assert_eq!(msg.data, b"hello");
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_only_first_open_notifies_remote() {
        let network = LocalNetwork::new();
        let alice = network.connect(&Identity::generate());
        let bob = network.connect(&Identity::generate());

        alice.open(&bob.local_id()).unwrap();
        alice.open(&bob.local_id()).unwrap();
        alice.send_to(&bob.local_id(), b"hi".to_vec()).unwrap();

        let events = bob.unicast_events();
        assert_eq!(
            events.try_recv().unwrap(),
            UnicastEvent::Opened(alice.local_id())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            UnicastEvent::Message(alice.local_id(), b"hi".to_vec())
        );
        assert!(events.try_recv().is_err());
        assert!(alice.unicast_events().try_recv().is_err());
        assert_eq!(alice.connected_peers(), vec![bob.local_id()]);
    }

    #[test]
    fn test_open_unknown_peer_fails() {
        let network = LocalNetwork::new();
        let alice = network.connect(&Identity::generate());
        let stranger = Identity::generate().peer_id();
        assert!(matches!(
            alice.open(&stranger),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_disconnect_notifies_both_sides() {
        let network = LocalNetwork::new();
        let alice = network.connect(&Identity::generate());
        let bob = network.connect(&Identity::generate());

        alice.open(&bob.local_id()).unwrap();
        let _ = bob.unicast_events().try_recv();
        alice.disconnect(&bob.local_id()).unwrap();

        assert_eq!(
            alice.unicast_events().try_recv().unwrap(),
            UnicastEvent::Closed(bob.local_id())
        );
        assert_eq!(
            bob.unicast_events().try_recv().unwrap(),
            UnicastEvent::Closed(alice.local_id())
        );
        assert!(alice.connected_peers().is_empty());
        assert!(bob.connected_peers().is_empty());
    }
}
