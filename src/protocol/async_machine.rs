use std::time::{Duration, Instant};

use crate::{
    config::MachineConfig,
    error::MachineError,
    net::BroadcastChannel,
    protocol::{
        engine::{Engine, Event},
        AsyncState,
    },
    scope::Scope,
};

/// Drives a chain of [`AsyncState`]s.
///
/// The current state is asked whether it can transition every
/// `transition_check_interval`, once its initiation is done.
pub struct AsyncMachine {
    engine: Engine,
    initial: Box<dyn AsyncState>,
    check_interval: Duration,
}

impl AsyncMachine {
    /// Create a machine, and start listening on the channel right away.
    pub fn new(
        channel: &BroadcastChannel,
        scope: &Scope,
        initial: Box<dyn AsyncState>,
        config: &MachineConfig,
    ) -> Self {
        Self {
            engine: Engine::subscribe(channel, scope, config),
            initial,
            check_interval: config.transition_check_interval(),
        }
    }

    /// Run every state, returning the last one.
    ///
    /// Cancelling the machine's scope makes this fail with
    /// [`MachineError::Cancelled`].
    pub async fn execute(self) -> Result<Box<dyn AsyncState>, MachineError> {
        let Self {
            engine,
            initial,
            check_interval,
        } = self;

        let mut state = engine.initiate(initial).await?;
        let mut next_check = Instant::now() + check_interval;
        loop {
            let event = engine.next_event(smol::Timer::at(next_check)).await;
            match event {
                Event::Cancelled => return Err(MachineError::Cancelled),
                Event::Message(message) => engine.deliver(state.as_mut(), message),
                Event::Gate(_) => {
                    next_check = Instant::now() + check_interval;
                    engine.drain(state.as_mut());
                    if !state.can_transition() {
                        continue;
                    }

                    let name = state.name();
                    tracing::debug!(state = name, member = %state.member_index(), "state done");
                    let next = state.next().map_err(|source| MachineError::Next {
                        state: name.to_string(),
                        source,
                    })?;
                    match next {
                        None => return Ok(state),
                        Some(next) => {
                            state = engine.initiate(next).await?;
                            next_check = Instant::now() + check_interval;
                        }
                    }
                }
            }
        }
    }
}
