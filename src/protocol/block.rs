//! Block height clocks, used to schedule synchronous states.
use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};

use crate::error::BoxError;

/// A source of monotonically increasing block heights.
pub trait BlockCounter: Send + Sync {
    fn current_block(&self) -> Result<u64, BoxError>;

    /// A receiver yielding the height once it is at least `height`.
    fn block_height_waiter(&self, height: u64) -> Result<Receiver<u64>, BoxError>;
}

/// Wait until the counter reaches some height, returning the height seen.
pub async fn wait_for_block_height(
    counter: &dyn BlockCounter,
    height: u64,
) -> Result<u64, BoxError> {
    let waiter = counter.block_height_waiter(height)?;
    Ok(waiter.recv().await?)
}

#[derive(Default)]
struct Chain {
    height: u64,
    waiters: Vec<(u64, Sender<u64>)>,
}

/// A block counter advanced by hand, or on a timer.
#[derive(Default)]
pub struct LocalBlockCounter {
    chain: Mutex<Chain>,
}

impl LocalBlockCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A counter mining a new block every `interval`, until it gets dropped.
    pub fn ticking(interval: Duration) -> Arc<Self> {
        let counter = Arc::new(Self::new());
        let weak = Arc::downgrade(&counter);
        smol::spawn(async move {
            loop {
                smol::Timer::after(interval).await;
                match weak.upgrade() {
                    Some(counter) => {
                        counter.advance();
                    }
                    None => break,
                }
            }
        })
        .detach();
        counter
    }

    /// Mine one block, returning the new height.
    pub fn advance(&self) -> u64 {
        let mut chain = self.chain.lock();
        chain.height += 1;
        let height = chain.height;
        Self::notify(&mut chain);
        height
    }

    /// Mine blocks until `height` is reached.
    pub fn advance_to(&self, height: u64) {
        let mut chain = self.chain.lock();
        if height > chain.height {
            chain.height = height;
            Self::notify(&mut chain);
        }
    }

    pub fn height(&self) -> u64 {
        self.chain.lock().height
    }

    fn notify(chain: &mut Chain) {
        let height = chain.height;
        chain.waiters.retain(|(target, tx)| {
            if *target > height {
                return true;
            }
            let _ = tx.try_send(height);
            false
        });
    }
}

impl BlockCounter for LocalBlockCounter {
    fn current_block(&self) -> Result<u64, BoxError> {
        Ok(self.height())
    }

    fn block_height_waiter(&self, height: u64) -> Result<Receiver<u64>, BoxError> {
        let (tx, rx) = channel::bounded(1);
        let mut chain = self.chain.lock();
        if height <= chain.height {
            let _ = tx.try_send(chain.height);
        } else {
            chain.waiters.push((height, tx));
        }
        Ok(rx)
    }
}
