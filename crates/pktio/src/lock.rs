//! Per-queue locks.
//!
//! Each input and output queue index has its own ticket lock, so contended
//! callers are served in arrival order and different queues of the same
//! interface never block each other.

use spin::mutex::{TicketMutex, TicketMutexGuard};

/// Guard held while a queue is being polled or fed
pub type QueueGuard<'a> = TicketMutexGuard<'a, ()>;

/// Receive and transmit locks of one interface
pub struct QueueLocks {
    rx: Box<[TicketMutex<()>]>,
    tx: Box<[TicketMutex<()>]>,
}

impl QueueLocks {
    /// Locks for up to `max_queues` queues in each direction
    pub fn new(max_queues: usize) -> Self {
        Self {
            rx: (0..max_queues).map(|_| TicketMutex::new(())).collect(),
            tx: (0..max_queues).map(|_| TicketMutex::new(())).collect(),
        }
    }

    /// Block until input queue `queue` is free
    pub fn lock_rx(&self, queue: usize) -> Option<QueueGuard<'_>> {
        self.rx.get(queue).map(TicketMutex::lock)
    }

    /// Block until output queue `queue` is free
    pub fn lock_tx(&self, queue: usize) -> Option<QueueGuard<'_>> {
        self.tx.get(queue).map(TicketMutex::lock)
    }

    /// Take output queue `queue` only if nobody holds or waits for it
    pub fn try_lock_tx(&self, queue: usize) -> Option<QueueGuard<'_>> {
        self.tx.get(queue).and_then(TicketMutex::try_lock)
    }

    /// Number of lockable queues per direction
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if no queue can be locked
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl std::fmt::Debug for QueueLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLocks")
            .field("queues", &self.rx.len())
            .finish()
    }
}
