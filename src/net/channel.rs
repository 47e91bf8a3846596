use std::{
    any::Any,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender, TrySendError};

use crate::{
    config::Config,
    error::{BoxError, ChannelError, DropReason},
    identity::{Identity, PeerId, PublicIdentity},
    net::{
        retransmission::{schedule_retransmissions, Deduplicator, Standard, Strategy},
        transport::{RawMessage, Transport},
        Message, NetworkMessage, TaggedMarshaler, TaggedUnmarshaler,
    },
    scope::Scope,
    serde::{decode, encode},
};

/// Decides whether messages authored by some peer are accepted.
pub type Filter = Arc<dyn Fn(&PublicIdentity) -> bool + Send + Sync>;

type Unmarshaler =
    Arc<dyn Fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>, BoxError> + Send + Sync>;

/// Where outgoing envelopes of a channel go.
pub(crate) enum Route {
    Topic(String),
    Peer(PeerId),
}

struct HandlerSlot {
    id: u64,
    queue: Sender<Message>,
    // Kept to be able to drop the oldest entry when the queue is full.
    oldest: Receiver<Message>,
}

/// The machinery shared by broadcast and unicast channels.
pub(crate) struct ChannelCore {
    identity: Identity,
    transport: Arc<dyn Transport>,
    route: Route,
    /// The channel name we put on outgoing envelopes.
    outgoing: String,
    /// The channel name incoming envelopes must carry.
    incoming: String,
    remote: Option<PeerId>,
    scope: Scope,
    handler_buffer: usize,
    interval: Duration,
    cycles: u32,
    incoming_queue: Sender<RawMessage>,
    unmarshalers: Mutex<HashMap<String, Unmarshaler>>,
    handlers: Mutex<Vec<HandlerSlot>>,
    next_handler: AtomicU64,
    filter: Mutex<Option<Filter>>,
    dedup: Deduplicator,
}

pub(crate) struct CoreParams {
    pub identity: Identity,
    pub transport: Arc<dyn Transport>,
    pub route: Route,
    pub outgoing: String,
    pub incoming: String,
    pub remote: Option<PeerId>,
    pub scope: Scope,
}

impl ChannelCore {
    /// Create the core, and start validating whatever gets fed into it.
    pub(crate) fn start(params: CoreParams, config: &Config) -> Arc<Self> {
        let (tx, rx) = channel::bounded(config.channel.incoming_queue);
        let core = Arc::new(Self {
            identity: params.identity,
            transport: params.transport,
            route: params.route,
            outgoing: params.outgoing,
            incoming: params.incoming,
            remote: params.remote,
            scope: params.scope,
            handler_buffer: config.channel.handler_buffer,
            interval: config.retransmission.interval(),
            cycles: config.retransmission.cycles,
            incoming_queue: tx,
            unmarshalers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(0),
            filter: Mutex::new(None),
            dedup: Deduplicator::new(config.channel.dedup_window()),
        });

        let weak = Arc::downgrade(&core);
        let scope = core.scope.clone();
        smol::spawn(async move {
            loop {
                let raw = smol::future::or(async { rx.recv().await.ok() }, async {
                    scope.cancelled().await;
                    None
                })
                .await;
                let (Some(raw), Some(core)) = (raw, weak.upgrade()) else {
                    break;
                };
                core.handle(raw);
            }
        })
        .detach();

        core
    }

    pub(crate) fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Queue raw bytes from the transport for validation.
    pub(crate) fn feed(&self, raw: RawMessage) {
        match self.incoming_queue.try_send(raw) {
            Ok(()) => {}
            Err(TrySendError::Full(raw)) => {
                tracing::warn!(
                    channel = %self.incoming,
                    sender = %raw.from,
                    "incoming message queue is full, dropping message"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn register_unmarshaler<T: TaggedUnmarshaler>(&self) -> Result<(), ChannelError> {
        let message_type = <T as TaggedUnmarshaler>::TYPE;
        let mut unmarshalers = self.unmarshalers.lock();
        if unmarshalers.contains_key(message_type) {
            return Err(ChannelError::DuplicateUnmarshaler(message_type.to_string()));
        }
        unmarshalers.insert(
            message_type.to_string(),
            Arc::new(|bytes: &[u8]| -> Result<Arc<dyn Any + Send + Sync>, BoxError> {
                let payload: Arc<dyn Any + Send + Sync> = Arc::new(T::unmarshal(bytes)?);
                Ok(payload)
            }),
        );
        Ok(())
    }

    pub(crate) fn set_filter(&self, filter: Filter) {
        *self.filter.lock() = Some(filter);
    }

    pub(crate) fn send<M: TaggedMarshaler + ?Sized>(
        self: &Arc<Self>,
        scope: &Scope,
        message: &M,
        strategy: Option<Box<dyn Strategy>>,
    ) -> Result<(), ChannelError> {
        let message_type = message.message_type();
        let payload = message.marshal().map_err(|source| ChannelError::Marshal {
            message_type: message_type.to_string(),
            source,
        })?;
        let envelope =
            NetworkMessage::signed(&self.identity, &self.outgoing, message_type, payload)?;
        self.transmit(encode(&envelope)?)?;
        tracing::trace!(channel = %self.outgoing, message_type, "sent message");

        if let Some(strategy) = strategy {
            let core = self.clone();
            // Copies stop with the caller's scope, or when the channel closes.
            schedule_retransmissions(
                &scope.joined(&self.scope),
                self.interval,
                self.cycles,
                strategy,
                move |n| -> Result<(), ChannelError> {
                    let copy = envelope.retransmitted(&core.identity, n)?;
                    core.transmit(encode(&copy)?)
                },
            );
        }
        Ok(())
    }

    fn transmit(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.scope.is_cancelled() {
            return Err(ChannelError::Closed(self.outgoing.clone()));
        }
        match &self.route {
            Route::Topic(topic) => self.transport.publish(topic, bytes)?,
            Route::Peer(peer) => self.transport.send_to(peer, bytes)?,
        }
        Ok(())
    }

    pub(crate) fn recv<F>(self: &Arc<Self>, scope: &Scope, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let scope = scope.clone();
        if scope.is_cancelled() || self.scope.is_cancelled() {
            return;
        }

        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::bounded(self.handler_buffer);
        self.handlers.lock().push(HandlerSlot {
            id,
            queue: tx,
            oldest: rx.clone(),
        });

        // One blocking worker per handler, living as long as the handler does.
        // It exits once the slot goes away, which closes the queue.
        let worker_scope = scope.clone();
        smol::unblock(move || {
            while let Ok(message) = smol::block_on(rx.recv()) {
                if worker_scope.is_cancelled() {
                    break;
                }
                handler(message);
            }
        })
        .detach();

        let core: Weak<Self> = Arc::downgrade(self);
        let closed = self.scope.clone();
        smol::spawn(async move {
            smol::future::or(scope.cancelled(), closed.cancelled()).await;
            if let Some(core) = core.upgrade() {
                core.handlers.lock().retain(|slot| slot.id != id);
                tracing::trace!(channel = %core.incoming, handler = id, "handler unregistered");
            }
        })
        .detach();
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    fn handle(&self, raw: RawMessage) {
        let from = raw.from.clone();
        let message = match self.validate(raw) {
            Ok(message) => message,
            Err(reason) => {
                tracing::warn!(channel = %self.incoming, sender = %from, "dropping message: {}", reason);
                return;
            }
        };
        if !self
            .dedup
            .should_deliver(*message.fingerprint(), message.retransmission())
        {
            tracing::trace!(
                channel = %self.incoming,
                fingerprint = ?message.fingerprint(),
                "dropping duplicate message"
            );
            return;
        }
        self.deliver(message);
    }

    fn validate(&self, raw: RawMessage) -> Result<Message, DropReason> {
        let envelope: NetworkMessage = decode(&raw.data)?;

        let sender = PeerId::from_bytes(&envelope.sender).map_err(DropReason::InvalidSender)?;
        if sender != raw.from {
            return Err(DropReason::SenderMismatch {
                outer: raw.from.to_string(),
                inner: sender.to_string(),
            });
        }
        if let Some(remote) = &self.remote {
            if &sender != remote {
                return Err(DropReason::SenderMismatch {
                    outer: remote.to_string(),
                    inner: sender.to_string(),
                });
            }
        }
        if envelope.channel != self.incoming.as_bytes() {
            return Err(DropReason::ChannelMismatch {
                expected: self.incoming.clone(),
                actual: String::from_utf8_lossy(&envelope.channel).into_owned(),
            });
        }

        let public = sender.public_key().map_err(DropReason::InvalidSender)?;
        if !envelope.verify(&public) {
            return Err(DropReason::InvalidSignature(sender.to_string()));
        }
        let filter = self.filter.lock().clone();
        if let Some(filter) = filter {
            if !filter(&public) {
                return Err(DropReason::Filtered(sender.to_string()));
            }
        }

        let message_type = String::from_utf8_lossy(&envelope.message_type).into_owned();
        let unmarshaler = self
            .unmarshalers
            .lock()
            .get(&message_type)
            .cloned()
            .ok_or_else(|| DropReason::NoUnmarshaler(message_type.clone()))?;
        let payload = unmarshaler(&envelope.payload).map_err(|source| DropReason::Unmarshal {
            message_type: message_type.clone(),
            source,
        })?;

        let fingerprint = envelope.fingerprint();
        Ok(Message::new(
            sender,
            payload,
            message_type,
            envelope.retransmission,
            fingerprint,
        ))
    }

    fn deliver(&self, message: Message) {
        let handlers = self.handlers.lock();
        for slot in handlers.iter() {
            match slot.queue.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    let _ = slot.oldest.try_recv();
                    tracing::warn!(
                        channel = %self.incoming,
                        handler = slot.id,
                        "handler queue is full, dropping oldest message"
                    );
                    let _ = slot.queue.try_send(message);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Stop validating messages and drop every handler.
    pub(crate) fn close(&self) {
        self.scope.cancel();
        self.handlers.lock().clear();
    }
}

/// A channel reaching every peer subscribed to the same name.
///
/// Clones share the same registry, handlers and deduplication state.
#[derive(Clone)]
pub struct BroadcastChannel {
    name: String,
    core: Arc<ChannelCore>,
}

impl BroadcastChannel {
    pub(crate) fn open(
        name: &str,
        identity: Identity,
        transport: Arc<dyn Transport>,
        scope: Scope,
        config: &Config,
    ) -> Result<Self, ChannelError> {
        let subscription = transport.subscribe(name)?;
        let core = ChannelCore::start(
            CoreParams {
                identity,
                transport,
                route: Route::Topic(name.to_string()),
                outgoing: name.to_string(),
                incoming: name.to_string(),
                remote: None,
                scope,
            },
            config,
        );

        let weak = Arc::downgrade(&core);
        let scope = core.scope().clone();
        smol::spawn(async move {
            loop {
                let raw = smol::future::or(async { subscription.recv().await.ok() }, async {
                    scope.cancelled().await;
                    None
                })
                .await;
                let (Some(raw), Some(core)) = (raw, weak.upgrade()) else {
                    break;
                };
                core.feed(raw);
            }
        })
        .detach();

        tracing::debug!(channel = name, "opened broadcast channel");
        Ok(Self {
            name: name.to_string(),
            core,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make this channel able to decode payloads of some type.
    ///
    /// Messages of unregistered types are dropped on arrival.
    pub fn register_unmarshaler<T: TaggedUnmarshaler>(&self) -> Result<(), ChannelError> {
        self.core.register_unmarshaler::<T>()
    }

    /// Send a message, retransmitting it on every tick while `scope` lives.
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

    /// Send a message without any retransmission.
    pub fn send_once<M: TaggedMarshaler + ?Sized>(&self, message: &M) -> Result<(), ChannelError> {
        self.core.send(&Scope::new(), message, None)
    }

    /// Run `handler` on every message received, until `scope` is cancelled.
    ///
    /// Each handler runs on its own, so a slow handler only delays itself.
    pub fn recv<F>(&self, scope: &Scope, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.core.recv(scope, handler)
    }

    /// Only accept messages whose author passes the filter.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&PublicIdentity) -> bool + Send + Sync + 'static,
    {
        self.core.set_filter(Arc::new(filter))
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.core.handler_count()
    }
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
