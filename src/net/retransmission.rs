//! Retransmission of outgoing messages, and deduplication of incoming ones.
//!
//! The network gives no delivery guarantee, so every message a channel sends
//! gets retransmitted a few times in the background. Receivers filter the
//! extra copies out by fingerprint.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{net::Fingerprint, scope::Scope};

/// Decides, tick after tick, whether a retransmission should happen.
pub trait Strategy: Send {
    /// Called once per tick. Returns true if a copy should be sent now.
    fn tick(&mut self) -> bool;
}

/// Retransmit on every single tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct Standard;

impl Strategy for Standard {
    fn tick(&mut self) -> bool {
        true
    }
}

/// Retransmit with an exponentially growing gap between copies.
///
/// Copies go out on ticks 1, 3, 6, 11, 20, 37, 70, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    tick: u64,
    next: u64,
    delay: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            tick: 0,
            next: 1,
            delay: 1,
        }
    }
}

impl Strategy for Backoff {
    fn tick(&mut self) -> bool {
        self.tick += 1;
        if self.tick != self.next {
            return false;
        }
        self.next += self.delay + 1;
        self.delay *= 2;
        true
    }
}

/// Run `retransmit` in the background according to a strategy.
///
/// Every `interval`, for `cycles` ticks, the strategy is consulted; each time
/// it agrees, `retransmit` is called with the number of the copy, starting at
/// 1. Failures are only logged. The schedule stops early, and silently, once
/// `scope` is cancelled.
pub fn schedule_retransmissions<F, E>(
    scope: &Scope,
    interval: Duration,
    cycles: u32,
    mut strategy: Box<dyn Strategy>,
    retransmit: F,
) where
    F: Fn(u32) -> Result<(), E> + Send + 'static,
    E: fmt::Display,
{
    if cycles == 0 {
        return;
    }
    let scope = scope.clone();
    smol::spawn(async move {
        let mut counter = 0u32;
        for _ in 0..cycles {
            let elapsed = smol::future::or(
                async {
                    smol::Timer::after(interval).await;
                    true
                },
                async {
                    scope.cancelled().await;
                    false
                },
            )
            .await;
            if !elapsed || scope.is_cancelled() {
                return;
            }
            if !strategy.tick() {
                continue;
            }
            counter += 1;
            if let Err(e) = retransmit(counter) {
                tracing::warn!(retransmission = counter, "could not retransmit message: [{}]", e);
            }
        }
    })
    .detach();
}

/// A set of fingerprints, each forgotten some time after it was inserted.
///
/// Expired entries are swept from the front of an insertion ordered queue,
/// so an insert only touches what actually expired.
#[derive(Debug)]
pub struct TimeCache {
    ttl: Duration,
    entries: HashMap<Fingerprint, Instant>,
    order: VecDeque<(Fingerprint, Instant)>,
}

impl TimeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert a fingerprint, returning whether it was already present.
    ///
    /// A fingerprint already present keeps its original insertion time.
    pub fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        let now = Instant::now();
        self.sweep(now);
        if self.entries.contains_key(&fingerprint) {
            return true;
        }
        self.entries.insert(fingerprint, now);
        self.order.push_back((fingerprint, now));
        false
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        match self.entries.get(fingerprint) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self, now: Instant) {
        while let Some((fingerprint, at)) = self.order.front().copied() {
            if now.saturating_duration_since(at) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&fingerprint);
        }
    }
}

/// Filters out retransmitted copies of already delivered messages.
#[derive(Debug)]
pub struct Deduplicator {
    seen: Mutex<TimeCache>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Mutex::new(TimeCache::new(window)),
        }
    }

    /// Whether a message with this fingerprint should reach the handlers.
    ///
    /// An original send (counter 0) is always delivered, even if an identical
    /// payload was seen before. A copy is only delivered if nothing with the
    /// same fingerprint was seen within the window.
    pub fn should_deliver(&self, fingerprint: Fingerprint, retransmission: u32) -> bool {
        let known = self.seen.lock().insert(fingerprint);
        retransmission == 0 || !known
    }
}
