//! Process-wide native memory accounting.
//!
//! Every byte of native memory held by the cache or a training job is first
//! reserved here. A [`Reservation`] gives its bytes back when dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{KnnError, Result};

#[derive(Debug)]
pub struct NativeMemoryBudget {
    capacity: u64,
    committed: AtomicU64,
}

impl NativeMemoryBudget {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            committed: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.committed())
    }

    /// Claims `bytes`, or fails with `CapacityExceeded` without claiming
    /// anything.
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation> {
        let mut current = self.committed.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|&n| n <= self.capacity)
                .ok_or(KnnError::CapacityExceeded {
                    requested: bytes as usize,
                    available: self.capacity.saturating_sub(current) as usize,
                    capacity: self.capacity as usize,
                })?;
            match self.committed.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Reservation {
                        budget: Arc::clone(self),
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: u64) {
        let prev = self.committed.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "released more than was reserved");
    }
}

/// Bytes claimed from a [`NativeMemoryBudget`], released on drop.
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<NativeMemoryBudget>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}
