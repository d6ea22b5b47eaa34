//! In-flight admission counter.
//!
//! Bounds the number of requests outstanding between the Coordinator and the
//! dispatcher. Incremented right before a request is handed over, decremented
//! when its response is observed.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shared in-flight counter with a fixed capacity.
#[derive(Debug)]
pub struct AdmissionCounter {
    in_flight: AtomicUsize,
    capacity: usize,
    released: Notify,
}

impl AdmissionCounter {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            capacity,
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether another request may be claimed
    pub fn has_budget(&self) -> bool {
        self.in_flight() < self.capacity
    }

    /// Count a request handed to the dispatcher. Returns the new count.
    pub fn increment(&self) -> usize {
        self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a response observed. Returns the new count.
    ///
    /// Never goes below zero; a release without a matching increment is
    /// ignored.
    pub fn release(&self) -> usize {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        self.released.notify_waiters();
        previous.saturating_sub(1)
    }

    /// Wait until there is budget.
    ///
    /// Returns `false` if `shutdown` fired first.
    pub async fn wait_for_budget(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed
            released.as_mut().enable();

            if self.has_budget() {
                return true;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = &mut released => {}
            }
        }
    }
}
