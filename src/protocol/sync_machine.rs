use std::sync::Arc;

use smol::channel::Receiver;

use crate::{
    config::MachineConfig,
    error::MachineError,
    net::BroadcastChannel,
    protocol::{
        block::{wait_for_block_height, BlockCounter},
        engine::{Engine, Event},
        SyncState,
    },
    scope::Scope,
};

/// Drives a chain of [`SyncState`]s against a block height clock.
///
/// For each state, the machine waits `delay_blocks` after the end of the
/// previous state, initiates it, then keeps it open for `active_blocks`.
/// Transitions happen on schedule, whether or not every member is done.
pub struct SyncMachine {
    engine: Engine,
    initial: Box<dyn SyncState>,
    counter: Arc<dyn BlockCounter>,
}

impl SyncMachine {
    pub fn new(
        channel: &BroadcastChannel,
        scope: &Scope,
        initial: Box<dyn SyncState>,
        counter: Arc<dyn BlockCounter>,
        config: &MachineConfig,
    ) -> Self {
        Self {
            engine: Engine::subscribe(channel, scope, config),
            initial,
            counter,
        }
    }

    /// Run every state, starting the schedule at `start_block`.
    ///
    /// Returns the last state, along with the block at which it ended.
    pub async fn execute(
        self,
        start_block: u64,
    ) -> Result<(Box<dyn SyncState>, u64), MachineError> {
        let Self {
            engine,
            initial,
            counter,
        } = self;

        let mut last_end = start_block;
        let (mut state, mut end) = enter(&engine, counter.as_ref(), initial, last_end).await?;
        loop {
            let event = engine.next_event(end.recv()).await;
            match event {
                Event::Cancelled => return Err(MachineError::Cancelled),
                Event::Message(message) => engine.deliver(state.as_mut(), message),
                Event::Gate(height) => {
                    last_end = height.map_err(|e| MachineError::BlockCounter(Box::new(e)))?;
                    engine.drain(state.as_mut());

                    let name = state.name();
                    tracing::debug!(state = name, block = last_end, "state done");
                    let next = state.next().map_err(|source| MachineError::Next {
                        state: name.to_string(),
                        source,
                    })?;
                    match next {
                        None => return Ok((state, last_end)),
                        Some(next) => {
                            (state, end) = enter(&engine, counter.as_ref(), next, last_end).await?;
                        }
                    }
                }
            }
        }
    }
}

/// Wait for the delay of a state, initiate it, and start its active window.
async fn enter(
    engine: &Engine,
    counter: &dyn BlockCounter,
    state: Box<dyn SyncState>,
    last_end: u64,
) -> Result<(Box<dyn SyncState>, Receiver<u64>), MachineError> {
    let start = last_end + state.delay_blocks();
    engine
        .or_cancelled(wait_for_block_height(counter, start))
        .await?
        .map_err(MachineError::BlockCounter)?;

    let state = engine.initiate(state).await?;

    let current = counter.current_block().map_err(MachineError::BlockCounter)?;
    let until = current + state.active_blocks();
    let end = counter
        .block_height_waiter(until)
        .map_err(MachineError::BlockCounter)?;
    tracing::debug!(state = state.name(), block = current, until, "state active");
    Ok((state, end))
}
