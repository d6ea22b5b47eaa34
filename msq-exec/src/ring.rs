//! Round-robin handoff onto a ring of workers.
//!
//! A worker is idle only while it is parked in [`WorkerQueue::recv`]. Handoff
//! walks the ring for a bounded number of attempts, giving the item to the
//! first idle worker and yielding after every full cycle. When every attempt
//! finds a busy worker it waits for the next worker in ring order to become
//! idle.
//!
//! Every send claims the target's idle flag first, so a worker never has an
//! item queued behind the one it is running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};

// =============================================================================
// RoundRobin
// =============================================================================

/// Rotating cursor over `len` slots.
#[derive(Debug)]
pub struct RoundRobin {
    counter: AtomicUsize,
    len: usize,
}

impl RoundRobin {
    /// Create a cursor over `len` slots (`len` must be > 0)
    pub fn new(len: usize) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            len: len.max(1),
        }
    }

    /// Next slot index
    pub fn next(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.len
    }
}

// =============================================================================
// Worker slot
// =============================================================================

#[derive(Debug, Default)]
struct Slot {
    idle: AtomicBool,
    ready: Notify,
}

impl Slot {
    fn mark_idle(&self) {
        self.idle.store(true, Ordering::SeqCst);
        self.ready.notify_one();
    }

    fn mark_busy(&self) {
        self.idle.store(false, Ordering::SeqCst);
    }

    /// Take the idle worker for one item
    fn claim(&self) -> bool {
        self.idle
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Clears the idle flag when a parked `recv` ends, including by cancellation.
struct Parked<'a>(&'a Slot);

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.mark_busy();
    }
}

/// Receiving end of one worker.
pub struct WorkerQueue<T> {
    rx: mpsc::Receiver<T>,
    slot: Arc<Slot>,
}

impl<T> WorkerQueue<T> {
    /// Wait for the next item, advertising the worker as idle meanwhile.
    ///
    /// Returns `None` once the ring is dropped. Cancel safe: a dropped call
    /// leaves the worker busy, and an item handed off just before is
    /// returned by the next call.
    pub async fn recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => return Some(item),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {},
        }

        self.slot.mark_idle();
        let _parked = Parked(&self.slot);
        self.rx.recv().await
    }
}

impl<T> Drop for WorkerQueue<T> {
    fn drop(&mut self) {
        self.rx.close();
        self.slot.mark_busy();
        // Wake a handoff waiting on this worker so it sees the closed queue
        self.slot.ready.notify_one();
    }
}

// =============================================================================
// WorkerRing
// =============================================================================

/// How an item reached its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Accepted by an idle worker after `attempts` tries
    Immediate {
        /// Worker index
        worker: usize,
        /// Number of workers tried
        attempts: usize,
    },
    /// Every attempt found a busy worker; waited for this one
    Blocking {
        /// Worker index
        worker: usize,
    },
}

/// Senders for a fixed pool of workers.
pub struct WorkerRing<T> {
    senders: Vec<mpsc::Sender<T>>,
    slots: Vec<Arc<Slot>>,
    cursor: RoundRobin,
    max_attempts: usize,
}

impl<T> WorkerRing<T> {
    /// Create a ring of `workers` workers.
    ///
    /// Returns the ring and the worker queues, in worker order.
    pub fn with_capacity(workers: usize, max_attempts: usize) -> (Self, Vec<WorkerQueue<T>>) {
        let mut senders = Vec::with_capacity(workers);
        let mut slots = Vec::with_capacity(workers);
        let mut queues = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(1);
            let slot = Arc::new(Slot::default());
            senders.push(tx);
            slots.push(Arc::clone(&slot));
            queues.push(WorkerQueue { rx, slot });
        }

        let ring = Self {
            cursor: RoundRobin::new(workers),
            senders,
            slots,
            max_attempts: max_attempts.max(1),
        };
        (ring, queues)
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether the ring has no workers
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Hand `item` to a worker.
    ///
    /// # Errors
    /// Gives the item back if the worker chosen for the blocking fallback is
    /// gone.
    pub async fn handoff(&self, item: T) -> Result<Handoff, T> {
        let len = self.len();
        if len == 0 {
            return Err(item);
        }

        let mut item = item;
        for attempt in 1..=self.max_attempts {
            let worker = self.cursor.next();
            if self.slots[worker].claim() {
                match self.senders[worker].try_send(item) {
                    Ok(()) => return Ok(Handoff::Immediate { worker, attempts: attempt }),
                    Err(TrySendError::Full(back)) | Err(TrySendError::Closed(back)) => item = back,
                }
            }
            if attempt % len == 0 {
                tokio::task::yield_now().await;
            }
        }

        let worker = self.cursor.next();
        let slot = &self.slots[worker];
        loop {
            let ready = slot.ready.notified();
            if slot.claim() {
                return self.senders[worker]
                    .send(item)
                    .await
                    .map(|_| Handoff::Blocking { worker })
                    .map_err(|e| e.0);
            }
            if self.senders[worker].is_closed() {
                return Err(item);
            }
            ready.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
