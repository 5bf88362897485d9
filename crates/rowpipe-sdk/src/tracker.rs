//! Outstanding-work accounting
//!
//! Every unit of in-flight work holds a [`WorkGuard`]. The counter is
//! decremented when the guard drops, so each increment is matched by exactly
//! one decrement on every exit path, including panics and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Counters {
    outstanding: AtomicUsize,
    started: AtomicUsize,
    drained: AtomicUsize,
    idle: Notify,
}

/// Counts outstanding work and wakes waiters when it drains to zero
#[derive(Debug, Clone, Default)]
pub struct WorkTracker {
    counters: Arc<Counters>,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of work
    pub fn start(&self) -> WorkGuard {
        self.counters.outstanding.fetch_add(1, Ordering::AcqRel);
        self.counters.started.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            counters: self.counters.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::Acquire)
    }

    /// Total guards ever handed out
    pub fn started(&self) -> usize {
        self.counters.started.load(Ordering::Acquire)
    }

    /// Number of times the counter has fallen to zero
    pub fn drained(&self) -> usize {
        self.counters.drained.load(Ordering::Acquire)
    }

    /// Wait until no work is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent drain cannot be missed
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One unit of outstanding work
#[must_use = "work is marked complete as soon as the guard is dropped"]
#[derive(Debug)]
pub struct WorkGuard {
    counters: Arc<Counters>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.counters.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counters.drained.fetch_add(1, Ordering::AcqRel);
            self.counters.idle.notify_waiters();
        }
    }
}
