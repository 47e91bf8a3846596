use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    config::Config,
    error::ChannelError,
    identity::{Identity, PeerId, PublicIdentity},
    net::{
        channel::BroadcastChannel,
        transport::Transport,
        unicast::{UnicastChannel, UnicastChannelManager},
    },
    scope::Scope,
};

struct Inner {
    identity: Identity,
    transport: Arc<dyn Transport>,
    config: Config,
    scope: Scope,
    broadcast: Mutex<HashMap<String, BroadcastChannel>>,
    unicast: Arc<UnicastChannelManager>,
}

/// The entry point to the network for protocol code.
///
/// Cheap to clone; clones share the same channels.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<Inner>,
}

impl Provider {
    pub fn new(identity: Identity, transport: Arc<dyn Transport>, config: Config) -> Self {
        let scope = Scope::new();
        let unicast = UnicastChannelManager::start(
            identity.clone(),
            transport.clone(),
            config.clone(),
            scope.child(),
        );
        tracing::info!(peer = %identity.peer_id(), "network provider started");
        Self {
            inner: Arc::new(Inner {
                identity,
                transport,
                config,
                scope,
                broadcast: Mutex::new(HashMap::new()),
                unicast,
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    /// The broadcast channel with this name.
    ///
    /// Asking twice for the same name returns the same channel.
    pub fn broadcast_channel_for(&self, name: &str) -> Result<BroadcastChannel, ChannelError> {
        let mut channels = self.inner.broadcast.lock();
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }
        let channel = BroadcastChannel::open(
            name,
            self.inner.identity.clone(),
            self.inner.transport.clone(),
            self.inner.scope.child(),
            &self.inner.config,
        )?;
        channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// The unicast channel with a peer, opening one if needed.
    pub fn unicast_channel_with(&self, peer: &PeerId) -> Result<UnicastChannel, ChannelError> {
        self.inner.unicast.channel_with(peer)
    }

    /// Be told about unicast channels other peers open with us.
    pub fn on_unicast_channel_opened<F>(&self, scope: &Scope, handler: F)
    where
        F: Fn(UnicastChannel) + Send + Sync + 'static,
    {
        self.inner.unicast.on_channel_opened(scope, handler)
    }

    pub fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager {
            transport: self.inner.transport.clone(),
        }
    }

    /// Turn an operator's compressed public key into its network identifier.
    pub fn create_transport_identifier(&self, public_key: &[u8]) -> Result<PeerId, ChannelError> {
        PeerId::from_bytes(public_key).map_err(ChannelError::InvalidPeer)
    }

    /// Close every channel opened through this provider.
    pub fn shutdown(&self) {
        self.inner.scope.cancel();
        self.inner.broadcast.lock().clear();
        self.inner.unicast.close_all();
        tracing::info!(peer = %self.id(), "network provider stopped");
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Inspects and manages the connections of this node.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
}

impl ConnectionManager {
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.transport.connected_peers()
    }

    pub fn peer_public_key(&self, peer: &PeerId) -> Result<PublicIdentity, ChannelError> {
        peer.public_key().map_err(ChannelError::InvalidPeer)
    }

    pub fn disconnect_peer(&self, peer: &PeerId) -> Result<(), ChannelError> {
        Ok(self.transport.disconnect(peer)?)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.transport.addresses()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::net::{local::LocalNetwork, test_messages::Ping};

    fn provider(network: &LocalNetwork) -> (Identity, Provider) {
        let identity = Identity::generate();
        let provider = Provider::new(
            identity.clone(),
            network.connect(&identity),
            Config::default(),
        );
        (identity, provider)
    }

    #[test]
    fn test_broadcast_channels_are_cached() {
        let network = LocalNetwork::new();
        let (_, provider) = provider(&network);

        let first = provider.broadcast_channel_for("name").unwrap();
        first.register_unmarshaler::<Ping>().unwrap();
        let second = provider.broadcast_channel_for("name").unwrap();
        assert!(second.register_unmarshaler::<Ping>().is_err());

        let other = provider.broadcast_channel_for("other").unwrap();
        other.register_unmarshaler::<Ping>().unwrap();
    }

    #[test]
    fn test_transport_identifier_matches_peer_id() {
        let network = LocalNetwork::new();
        let (identity, provider) = provider(&network);

        let id = provider
            .create_transport_identifier(&identity.public().to_bytes())
            .unwrap();
        assert_eq!(id, provider.id());
        assert!(provider.create_transport_identifier(&[0u8; 5]).is_err());

        let key = provider.connection_manager().peer_public_key(&id).unwrap();
        assert_eq!(&key, identity.public());
    }

    #[test]
    fn test_connection_manager_tracks_peers() {
        let network = LocalNetwork::new();
        let (_, alice) = provider(&network);
        let (_, bob) = provider(&network);

        alice.unicast_channel_with(&bob.id()).unwrap();
        let manager = alice.connection_manager();
        assert_eq!(manager.connected_peers(), vec![bob.id()]);
        assert_eq!(manager.addresses().len(), 1);

        manager.disconnect_peer(&bob.id()).unwrap();
        assert!(manager.connected_peers().is_empty());
        assert!(bob.connection_manager().connected_peers().is_empty());
    }

    #[test]
    fn test_shutdown_closes_channels() {
        let network = LocalNetwork::new();
        let (_, alice) = provider(&network);
        let (_, bob) = provider(&network);

        let channel = alice.unicast_channel_with(&bob.id()).unwrap();
        alice.shutdown();
        assert!(channel.is_closed());

        // Handlers can't be registered on a closed channel.
        let broadcast = alice.broadcast_channel_for("name").unwrap();
        alice.shutdown();
        broadcast.recv(&Scope::new(), |_| {});
        smol::block_on(smol::Timer::after(Duration::from_millis(10)));
        assert_eq!(broadcast.handler_count(), 0);
    }
}
