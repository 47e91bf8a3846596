//! Cancellable lifetimes.
//!
//! Every long-lived activity in this crate (a receive handler, a retransmission
//! schedule, a state machine execution) is bound to a [`Scope`]. Cancelling a
//! scope cancels all of its children as well.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use event_listener::Event;
use parking_lot::Mutex;

struct Inner {
    cancelled: AtomicBool,
    event: Event,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            event: Event::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.event.notify(usize::MAX);

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// A cancellable lifetime, cheap to clone.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// Create a new root scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Create a scope which gets cancelled whenever this one is.
    ///
    /// The child can also be cancelled on its own, without affecting the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        self.adopt(&child);
        child
    }

    /// Create a scope which gets cancelled as soon as either this scope or
    /// `other` is.
    pub fn joined(&self, other: &Scope) -> Self {
        let child = self.child();
        other.adopt(&child);
        child
    }

    fn adopt(&self, child: &Scope) {
        let mut children = self.inner.children.lock();
        // The parent might have been cancelled in the meantime; checking under
        // the lock guarantees the child cannot miss the cancellation.
        if self.is_cancelled() {
            drop(children);
            child.cancel();
            return;
        }
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
    }

    /// Create a child scope which cancels itself after some time.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let timed = child.clone();
        smol::spawn(async move {
            smol::future::or(
                async {
                    smol::Timer::after(timeout).await;
                },
                timed.cancelled(),
            )
            .await;
            timed.cancel();
        })
        .detach();
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until this scope gets cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let listener = self.inner.event.listen();
            if self.is_cancelled() {
                return;
            }
            listener.await;
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
