//! Concurrency slots. Each slot pairs a semaphore permit with the pacers of
//! the worker occupying it, so pacing state survives from one chain to the
//! next chain run in the same slot.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;

use crate::fetch::WorkerPacer;

/// Pacers owned by one slot.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) direct: WorkerPacer,
    pub(crate) mirror: WorkerPacer,
}

impl WorkerSlot {
    fn new(delay: Duration, mirror_delay: Duration) -> Self {
        Self {
            direct: WorkerPacer::new(delay),
            mirror: WorkerPacer::new(mirror_delay),
        }
    }
}

/// Idle slots, one per permit not currently held.
#[derive(Debug)]
pub(super) struct SlotPool {
    delay: Duration,
    mirror_delay: Duration,
    idle: Arc<Mutex<Vec<Arc<WorkerSlot>>>>,
}

impl SlotPool {
    pub(super) fn new(size: usize, delay: Duration, mirror_delay: Duration) -> Self {
        let idle = (0..size)
            .map(|_| Arc::new(WorkerSlot::new(delay, mirror_delay)))
            .collect();
        Self {
            delay,
            mirror_delay,
            idle: Arc::new(Mutex::new(idle)),
        }
    }

    /// Binds an idle slot to `permit`. The slot goes back to the pool before
    /// the permit is released.
    pub(super) fn lease(&self, permit: OwnedSemaphorePermit) -> SlotLease {
        let slot = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Arc::new(WorkerSlot::new(self.delay, self.mirror_delay)));
        SlotLease {
            slot,
            idle: Arc::clone(&self.idle),
            _permit: permit,
        }
    }
}

/// A held slot. Field order matters: the permit drops after `Drop::drop`
/// has returned the slot.
#[derive(Debug)]
pub(super) struct SlotLease {
    slot: Arc<WorkerSlot>,
    idle: Arc<Mutex<Vec<Arc<WorkerSlot>>>>,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub(super) fn slot(&self) -> &WorkerSlot {
        &self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&self.slot));
    }
}
