use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    config::Config,
    error::ChannelError,
    identity::{Identity, PeerId},
    net::{
        channel::{ChannelCore, CoreParams, Route},
        retransmission::{Standard, Strategy},
        transport::{RawMessage, Transport, UnicastEvent},
        Message, TaggedMarshaler, TaggedUnmarshaler,
    },
    scope::Scope,
};

/// A channel with exactly one remote peer.
///
/// Messages from anybody else than the remote peer are dropped.
#[derive(Clone)]
pub struct UnicastChannel {
    remote: PeerId,
    core: Arc<ChannelCore>,
}

impl UnicastChannel {
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub fn register_unmarshaler<T: TaggedUnmarshaler>(&self) -> Result<(), ChannelError> {
        self.core.register_unmarshaler::<T>()
    }

    pub fn send<M: TaggedMarshaler + ?Sized>(
        &self,
        scope: &Scope,
        message: &M,
    ) -> Result<(), ChannelError> {
        self.core.send(scope, message, Some(Box::new(Standard)))
    }

    pub fn send_with_strategy<M: TaggedMarshaler + ?Sized>(
        &self,
        scope: &Scope,
        message: &M,
        strategy: Box<dyn Strategy>,
    ) -> Result<(), ChannelError> {
        self.core.send(scope, message, Some(strategy))
    }

    pub fn send_once<M: TaggedMarshaler + ?Sized>(&self, message: &M) -> Result<(), ChannelError> {
        self.core.send(&Scope::new(), message, None)
    }

    pub fn recv<F>(&self, scope: &Scope, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.core.recv(scope, handler)
    }

    /// Whether the session behind this channel was torn down.
    pub fn is_closed(&self) -> bool {
        self.core.scope().is_cancelled()
    }
}

impl std::fmt::Debug for UnicastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnicastChannel")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

type Observer = Arc<dyn Fn(UnicastChannel) + Send + Sync>;

/// Keeps one session per remote peer.
pub(crate) struct UnicastChannelManager {
    identity: Identity,
    transport: Arc<dyn Transport>,
    config: Config,
    scope: Scope,
    sessions: Mutex<HashMap<PeerId, UnicastChannel>>,
    observers: Mutex<Vec<(Scope, Observer)>>,
}

impl UnicastChannelManager {
    /// Create the manager, and start listening to direct stream events.
    pub(crate) fn start(
        identity: Identity,
        transport: Arc<dyn Transport>,
        config: Config,
        scope: Scope,
    ) -> Arc<Self> {
        let events = transport.unicast_events();
        let manager = Arc::new(Self {
            identity,
            transport,
            config,
            scope,
            sessions: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&manager);
        let scope = manager.scope.clone();
        smol::spawn(async move {
            loop {
                let event = smol::future::or(async { events.recv().await.ok() }, async {
                    scope.cancelled().await;
                    None
                })
                .await;
                let (Some(event), Some(manager)) = (event, weak.upgrade()) else {
                    break;
                };
                manager.handle(event);
            }
        })
        .detach();

        manager
    }

    fn handle(&self, event: UnicastEvent) {
        match event {
            UnicastEvent::Opened(peer) => {
                self.session_for(&peer);
            }
            UnicastEvent::Message(peer, data) => {
                let channel = self.session_for(&peer);
                channel.core.feed(RawMessage { from: peer, data });
            }
            UnicastEvent::Closed(peer) => {
                if let Some(channel) = self.sessions.lock().remove(&peer) {
                    channel.core.close();
                    tracing::debug!(remote = %peer, "unicast session closed");
                }
            }
        }
    }

    /// The session for a peer which contacted us, creating it if needed.
    fn session_for(&self, peer: &PeerId) -> UnicastChannel {
        let (channel, created) = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer) {
                Some(channel) => (channel.clone(), false),
                None => {
                    let channel = self.new_session(peer);
                    sessions.insert(peer.clone(), channel.clone());
                    (channel, true)
                }
            }
        };
        if created {
            tracing::debug!(remote = %peer, "unicast session opened by remote peer");
            self.notify(&channel);
        }
        channel
    }

    fn new_session(&self, remote: &PeerId) -> UnicastChannel {
        let core = ChannelCore::start(
            CoreParams {
                identity: self.identity.clone(),
                transport: self.transport.clone(),
                route: Route::Peer(remote.clone()),
                outgoing: remote.to_string(),
                incoming: self.identity.peer_id().to_string(),
                remote: Some(remote.clone()),
                scope: self.scope.child(),
            },
            &self.config,
        );
        UnicastChannel {
            remote: remote.clone(),
            core,
        }
    }

    fn notify(&self, channel: &UnicastChannel) {
        let observers: Vec<Observer> = {
            let mut observers = self.observers.lock();
            observers.retain(|(scope, _)| !scope.is_cancelled());
            observers.iter().map(|(_, o)| o.clone()).collect()
        };
        for observer in observers {
            let channel = channel.clone();
            smol::unblock(move || observer(channel)).detach();
        }
    }

    /// Get the channel with a peer, opening a session if there is none.
    ///
    /// Only the remote peer gets notified of a new session.
    pub(crate) fn channel_with(&self, peer: &PeerId) -> Result<UnicastChannel, ChannelError> {
        let channel = {
            let mut sessions = self.sessions.lock();
            if let Some(channel) = sessions.get(peer) {
                return Ok(channel.clone());
            }
            let channel = self.new_session(peer);
            sessions.insert(peer.clone(), channel.clone());
            channel
        };

        if let Err(e) = self.transport.open(peer) {
            self.sessions.lock().remove(peer);
            channel.core.close();
            return Err(e.into());
        }
        tracing::debug!(remote = %peer, "opened unicast session");
        Ok(channel)
    }

    /// Run `handler` for every session opened by a remote peer, while `scope` lives.
    pub(crate) fn on_channel_opened<F>(&self, scope: &Scope, handler: F)
    where
        F: Fn(UnicastChannel) + Send + Sync + 'static,
    {
        self.observers.lock().push((scope.clone(), Arc::new(handler)));
    }

    pub(crate) fn close_all(&self) {
        for (_, channel) in self.sessions.lock().drain() {
            channel.core.close();
        }
    }
}
