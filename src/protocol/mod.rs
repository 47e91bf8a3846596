//! This module provides abstractions for running multi-party protocols.
//!
//! A protocol is written as a chain of states. Each state does some
//! computation when it gets initiated, usually sending messages to the other
//! members, then accumulates the messages it receives. A machine drives the
//! chain: it feeds messages from a channel into the current state, and
//! moves on to the next state when the time has come.
//!
//! There are two kinds of machines, which differ in how they decide that time:
//!
//! - An [`AsyncMachine`] asks the state itself, through
//!   [`AsyncState::can_transition`], typically once it has heard from every
//!   other member.
//! - A [`SyncMachine`] follows a block height clock: each [`SyncState`] is
//!   open for a fixed number of blocks, after which the machine moves on no
//!   matter what. A straggling member can't block the group this way.
use std::any::Any;

use crate::{error::BoxError, net::Message, participants::MemberIndex, scope::Scope};

mod async_machine;
pub mod block;
mod engine;
mod history;
mod sync_machine;

pub use async_machine::AsyncMachine;
pub use block::{wait_for_block_height, BlockCounter, LocalBlockCounter};
pub use history::MessageHistory;
pub use sync_machine::SyncMachine;

/// Allows states to be inspected once a machine is done with them.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// What every protocol state can do.
pub trait State: AsAny + Send + 'static {
    /// Perform the computation of this state, sending out its messages.
    ///
    /// The scope spans the whole machine execution, and not just this state,
    /// so that retransmissions keep going after the machine moved on.
    fn initiate(&mut self, scope: &Scope) -> Result<(), BoxError>;

    /// Handle a message from the channel, including our own.
    ///
    /// This is where the sender's membership should get checked. A state must
    /// keep messages meant for future states around, see [`MessageHistory`].
    /// Errors are only logged.
    fn receive(&mut self, message: Message) -> Result<(), BoxError>;

    /// The index of the member running this state. It never changes.
    fn member_index(&self) -> MemberIndex;

    /// A name identifying this state in errors and logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A state which decides on its own when it is done.
pub trait AsyncState: State {
    /// Whether the state has everything it needs to move on.
    ///
    /// This is never called before [`State::initiate`] has completed.
    fn can_transition(&self) -> bool;

    /// The following state, or None if this was the last one.
    fn next(&mut self) -> Result<Option<Box<dyn AsyncState>>, BoxError>;
}

/// A state open for a fixed window of blocks.
pub trait SyncState: State {
    /// Blocks to wait, after the end of the previous state, before initiating.
    fn delay_blocks(&self) -> u64;

    /// Blocks this state stays open for, after it was initiated.
    fn active_blocks(&self) -> u64;

    /// The following state, or None if this was the last one.
    fn next(&mut self) -> Result<Option<Box<dyn SyncState>>, BoxError>;
}

impl dyn AsyncState {
    pub fn downcast_ref<T: AsyncState>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

impl dyn SyncState {
    pub fn downcast_ref<T: SyncState>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}
