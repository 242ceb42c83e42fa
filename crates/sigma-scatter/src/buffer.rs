//! Memory-bounded buffers.
//!
//! A [`MemoryBudget`] is a shared byte counter with a hard ceiling. Every
//! working buffer of the scatter pipeline is accounted against it, and the
//! accounting is released when the lease drops, on every exit path.
//!
//! An operation that needs several buffers at once takes them all as one
//! [`WorkingSet`] and carves them locally. Waiting on the shared budget while
//! already holding part of it is what lets concurrent operations starve each
//! other, so only the first reservation of an operation ever waits.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sigma_core::{SigmaError, SigmaResult};
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Debug, Default)]
struct BudgetState {
    in_use: usize,
    peak: usize,
}

#[derive(Debug)]
pub struct MemoryBudget {
    ceiling: usize,
    state: Mutex<BudgetState>,
    released: Condvar,
}

impl MemoryBudget {
    pub fn new(ceiling: usize) -> Arc<Self> {
        Arc::new(Self {
            ceiling,
            state: Mutex::new(BudgetState::default()),
            released: Condvar::new(),
        })
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Highest `in_use` observed since creation or the last reset.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    pub fn reset_peak(&self) {
        let mut state = self.lock();
        state.peak = state.in_use;
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        // Poisoning cannot leave the two counters torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refused(&self, requested: usize, in_use: usize) -> SigmaError {
        SigmaError::Allocation {
            requested,
            in_use,
            ceiling: self.ceiling,
        }
    }

    /// Account `bytes` without allocating. Fails instead of exceeding the ceiling.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> SigmaResult<Reservation> {
        let mut state = self.lock();
        if state.in_use.saturating_add(bytes) > self.ceiling {
            return Err(self.refused(bytes, state.in_use));
        }
        Ok(self.grant(&mut state, bytes))
    }

    /// Like [`reserve`](Self::reserve), but waits up to `timeout` for other
    /// leases to be released first.
    pub fn reserve_with_backpressure(
        self: &Arc<Self>,
        bytes: usize,
        timeout: Duration,
    ) -> SigmaResult<Reservation> {
        if bytes > self.ceiling {
            return Err(self.refused(bytes, self.in_use()));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.in_use.saturating_add(bytes) > self.ceiling {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.refused(bytes, state.in_use));
            }
            debug!(requested = bytes, in_use = state.in_use, "memory budget backpressure");
            let (guard, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        Ok(self.grant(&mut state, bytes))
    }

    /// Allocate a zeroed buffer of `bytes`.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> SigmaResult<BufferLease> {
        let reservation = self.reserve(bytes)?;
        Ok(BufferLease::new(reservation, bytes))
    }

    pub fn allocate_with_backpressure(
        self: &Arc<Self>,
        bytes: usize,
        timeout: Duration,
    ) -> SigmaResult<BufferLease> {
        let reservation = self.reserve_with_backpressure(bytes, timeout)?;
        Ok(BufferLease::new(reservation, bytes))
    }

    /// Reserve `bytes` for one whole operation, waiting up to `timeout`.
    pub fn working_set(self: &Arc<Self>, bytes: usize, timeout: Duration) -> SigmaResult<WorkingSet> {
        let held = self.reserve_with_backpressure(bytes, timeout)?;
        Ok(WorkingSet {
            local: MemoryBudget::new(bytes),
            _held: held,
        })
    }

    fn grant(self: &Arc<Self>, state: &mut BudgetState, bytes: usize) -> Reservation {
        state.in_use += bytes;
        state.peak = state.peak.max(state.in_use);
        Reservation {
            budget: Arc::clone(self),
            bytes,
        }
    }

    fn release(&self, bytes: usize) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(bytes);
        drop(state);
        self.released.notify_all();
    }
}

/// Accounted bytes; released on drop.
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

/// Memory held against the shared budget for the length of one operation.
///
/// Buffers are carved from it without touching the shared budget again, and
/// a carve that does not fit fails at once instead of waiting. Carved buffers
/// must not outlive the set.
#[derive(Debug)]
pub struct WorkingSet {
    local: Arc<MemoryBudget>,
    _held: Reservation,
}

impl WorkingSet {
    pub fn capacity(&self) -> usize {
        self.local.ceiling()
    }

    /// Local accounting for buffers carved from this set.
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.local
    }

    pub fn reserve(&self, bytes: usize) -> SigmaResult<Reservation> {
        self.local.reserve(bytes)
    }

    pub fn allocate(&self, bytes: usize) -> SigmaResult<BufferLease> {
        self.local.allocate(bytes)
    }
}

/// A zeroed buffer backed by a reservation. Contents are wiped on drop.
pub struct BufferLease {
    reservation: Reservation,
    buf: Zeroizing<Vec<u8>>,
}

impl BufferLease {
    fn new(reservation: Reservation, bytes: usize) -> Self {
        Self {
            reservation,
            buf: Zeroizing::new(vec![0u8; bytes]),
        }
    }

    /// Shorten the visible buffer. The reservation keeps its original size.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Accounted size, independent of truncation.
    pub fn reserved(&self) -> usize {
        self.reservation.bytes
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("len", &self.buf.len())
            .field("reserved", &self.reservation.bytes)
            .finish()
    }
}
