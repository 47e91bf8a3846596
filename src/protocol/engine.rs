use std::future::Future;

use smol::channel::{self, Receiver};

use crate::{
    config::MachineConfig,
    error::MachineError,
    net::{BroadcastChannel, Message},
    protocol::State,
    scope::Scope,
};

/// What a machine wakes up for.
pub(crate) enum Event<T> {
    Message(Message),
    Gate(T),
    Cancelled,
}

/// The machinery shared by both kinds of machines.
///
/// The engine queues every message from the channel, runs initiations off
/// the executor, and feeds queued messages to the current state in between.
/// A state is never initiated and fed messages at the same time.
pub(crate) struct Engine {
    scope: Scope,
    subscription: Scope,
    queue: Receiver<Message>,
}

impl Engine {
    /// Start queueing messages from a channel.
    ///
    /// This has to happen before the first state gets initiated, otherwise
    /// messages from faster members could get lost.
    pub(crate) fn subscribe(channel: &BroadcastChannel, scope: &Scope, config: &MachineConfig) -> Self {
        let (tx, rx) = channel::bounded(config.receive_buffer);
        let subscription = scope.child();
        channel.recv(&subscription, move |message| {
            // Handlers run on their own thread, so waiting for space is fine.
            if smol::block_on(tx.send(message)).is_err() {
                tracing::trace!("machine is gone, dropping message");
            }
        });
        Self {
            scope: scope.clone(),
            subscription,
            queue: rx,
        }
    }

    pub(crate) async fn initiate<S>(&self, state: Box<S>) -> Result<Box<S>, MachineError>
    where
        S: State + ?Sized,
        Box<S>: Send,
    {
        let name = state.name();
        tracing::debug!(state = name, member = %state.member_index(), "initiating state");

        let scope = self.scope.clone();
        let initiated = smol::future::or(
            async {
                let mut state = state;
                Some(
                    smol::unblock(move || {
                        let result = state.initiate(&scope);
                        (state, result)
                    })
                    .await,
                )
            },
            async {
                self.scope.cancelled().await;
                None
            },
        )
        .await;

        match initiated {
            None => Err(MachineError::Cancelled),
            Some((_, Err(source))) => Err(MachineError::Initiate {
                state: name.to_string(),
                source,
            }),
            Some((state, Ok(()))) => Ok(state),
        }
    }

    pub(crate) fn deliver<S: State + ?Sized>(&self, state: &mut S, message: Message) {
        if let Err(e) = state.receive(message) {
            tracing::warn!(state = state.name(), "could not receive message: [{}]", e);
        }
    }

    /// Feed the messages queued so far to the state.
    ///
    /// Messages arriving meanwhile wait for the next round.
    pub(crate) fn drain<S: State + ?Sized>(&self, state: &mut S) {
        for _ in 0..self.queue.len() {
            match self.queue.try_recv() {
                Ok(message) => self.deliver(state, message),
                Err(_) => break,
            }
        }
    }

    /// Wait for a message, for the gate to open, or for cancellation.
    ///
    /// Cancellation wins over everything else, and the gate over messages,
    /// so a busy channel cannot hold a transition back.
    pub(crate) async fn next_event<G: Future>(&self, gate: G) -> Event<G::Output> {
        smol::future::or(
            async {
                self.scope.cancelled().await;
                Event::Cancelled
            },
            smol::future::or(async { Event::Gate(gate.await) }, async {
                match self.queue.recv().await {
                    Ok(message) => Event::Message(message),
                    Err(_) => smol::future::pending().await,
                }
            }),
        )
        .await
    }

    /// Wait for some future, unless the machine gets cancelled first.
    pub(crate) async fn or_cancelled<F: Future>(&self, future: F) -> Result<F::Output, MachineError> {
        smol::future::or(async { Ok(future.await) }, async {
            self.scope.cancelled().await;
            Err(MachineError::Cancelled)
        })
        .await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        config::Config,
        identity::Identity,
        net::{local::LocalNetwork, test_messages::Ping, Provider},
    };

    fn engine(scope: &Scope) -> (Engine, BroadcastChannel) {
        let network = LocalNetwork::new();
        let identity = Identity::generate();
        let provider =
            Provider::new(identity.clone(), network.connect(&identity), Config::default());
        let channel = provider.broadcast_channel_for("engine").unwrap();
        channel.register_unmarshaler::<Ping>().unwrap();
        (Engine::subscribe(&channel, scope, &MachineConfig::default()), channel)
    }

    fn wait_for_queue(engine: &Engine, len: usize) {
        let started = Instant::now();
        while engine.queue.len() < len && started.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.queue.len(), len);
    }

    #[test]
    fn test_open_gate_wins_over_queued_messages() {
        let scope = Scope::new();
        let (engine, channel) = engine(&scope);
        for i in 0..5 {
            channel.send_once(&Ping::new(i.to_string())).unwrap();
        }
        wait_for_queue(&engine, 5);

        let event = smol::block_on(engine.next_event(async { 7 }));
        assert!(matches!(event, Event::Gate(7)));

        let event = smol::block_on(engine.next_event(smol::future::pending::<()>()));
        assert!(matches!(event, Event::Message(_)));
        assert_eq!(engine.queue.len(), 4);

        scope.cancel();
        let event = smol::block_on(engine.next_event(async { 7 }));
        assert!(matches!(event, Event::Cancelled));
    }

    struct Counting(usize);

    impl State for Counting {
        fn initiate(&mut self, _: &Scope) -> Result<(), crate::error::BoxError> {
            Ok(())
        }

        fn receive(&mut self, _: Message) -> Result<(), crate::error::BoxError> {
            self.0 += 1;
            Ok(())
        }

        fn member_index(&self) -> crate::participants::MemberIndex {
            crate::participants::MemberIndex::new(1).unwrap()
        }
    }

    #[test]
    fn test_drain_feeds_every_queued_message() {
        let scope = Scope::new();
        let (engine, channel) = engine(&scope);
        for i in 0..3 {
            channel.send_once(&Ping::new(i.to_string())).unwrap();
        }
        wait_for_queue(&engine, 3);

        let mut state = Counting(0);
        engine.drain(&mut state);
        assert_eq!(state.0, 3);
        assert!(engine.queue.is_empty());
    }
}
