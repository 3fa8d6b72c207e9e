//! Signals: the atomic value cell agents and queues synchronize on.
//!
//! A signal's value lives in ordinary addressable memory allocated from
//! a [`MemoryRegion`], and the signal's own handle *is* that address —
//! there is no separate handle-to-object indirection for signals the way
//! there is for every other object kind, because a CPU agent needs
//! `hsa_signal_t::handle` to be directly dereferenceable by compiled
//! kernels. `wait` is a spin loop with a timeout, plus a spin/yield
//! backoff tunable via [`RuntimeConfig`] so a queue of idle waiters
//! doesn't pin a core on an oversubscribed CPU agent.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::handle::Handle;
use crate::memory::{AtomicCellI64, MemoryOrder, MemoryRegion};

/// Sentinel timeout meaning "wait forever" (`UINT64_MAX` nanoseconds in
/// the C API).
pub const WAIT_FOREVER: u64 = u64::MAX;

/// A signal condition, mirroring `hsa_signal_condition_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq(i64),
    Ne(i64),
    Lt(i64),
    Gte(i64),
}

impl Condition {
    fn test(self, value: i64) -> bool {
        match self {
            Condition::Eq(v) => value == v,
            Condition::Ne(v) => value != v,
            Condition::Lt(v) => value < v,
            Condition::Gte(v) => value >= v,
        }
    }
}

/// A signal's value cell, allocated from a `MemoryRegion` it owns for its
/// own lifetime and freed on `Drop`.
pub struct Signal {
    cell: NonNull<AtomicCellI64>,
    region: Arc<MemoryRegion>,
}

// SAFETY: the cell is a plain atomic; concurrent access from multiple
// threads is exactly what it's for.
unsafe impl Send for Signal {}
unsafe impl Sync for Signal {}

impl Signal {
    /// Allocates a new signal's value cell from `region` and seeds it
    /// with `initial_value`. The signal's handle equals the cell's
    /// address, per `GCCBuiltinSignal`'s mapping function.
    pub fn new(initial_value: i64, region: Arc<MemoryRegion>) -> Option<Self> {
        let raw = region.allocate(std::mem::size_of::<AtomicCellI64>(), std::mem::align_of::<AtomicCellI64>())?;
        let cell = raw.cast::<AtomicCellI64>();
        unsafe { cell.as_ptr().write(AtomicCellI64::new(initial_value)) };
        Some(Signal { cell, region })
    }

    /// The handle that names this signal: the value cell's own address.
    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.cell.as_ptr() as u64)
    }

    fn cell(&self) -> &AtomicCellI64 {
        unsafe { self.cell.as_ref() }
    }

    pub fn load(&self, mo: MemoryOrder) -> i64 {
        self.cell().load(mo)
    }

    pub fn store(&self, value: i64, mo: MemoryOrder) {
        self.cell().store(value, mo)
    }

    pub fn exchange(&self, value: i64, mo: MemoryOrder) -> i64 {
        self.cell().exchange(value, mo)
    }

    pub fn compare_exchange(&self, expected: i64, value: i64, mo: MemoryOrder) -> i64 {
        self.cell().compare_exchange(expected, value, mo).unwrap_or_else(|prev| prev)
    }

    pub fn add(&self, value: i64, mo: MemoryOrder) {
        self.cell().add(value, mo);
    }

    pub fn subtract(&self, value: i64, mo: MemoryOrder) {
        self.cell().sub(value, mo);
    }

    pub fn and(&self, value: i64, mo: MemoryOrder) {
        self.cell().and(value, mo);
    }

    pub fn or(&self, value: i64, mo: MemoryOrder) {
        self.cell().or(value, mo);
    }

    pub fn xor(&self, value: i64, mo: MemoryOrder) {
        self.cell().xor(value, mo);
    }

    /// Blocks until `condition` holds against the signal's value, or
    /// `timeout_ns` elapses (`WAIT_FOREVER` disables the deadline). Spins
    /// for `cfg.wait_spin_iterations` iterations first, then backs off to
    /// sleeping for `cfg.wait_yield_poll_interval` between polls.
    ///
    /// Best-effort: a condition that becomes briefly true and false again
    /// between polls can be missed (ABA).
    pub fn wait(&self, condition: Condition, timeout_ns: u64, mo: MemoryOrder, cfg: &RuntimeConfig) -> i64 {
        let deadline = if timeout_ns == WAIT_FOREVER {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_ns))
        };

        let mut spins = 0u32;
        loop {
            let value = self.load(mo);
            if condition.test(value) {
                return value;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return value;
                }
            }
            if spins < cfg.wait_spin_iterations {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(cfg.wait_yield_poll_interval);
            }
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.region.free(self.cell.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{RegionFlags, SegmentKind};

    fn region() -> Arc<MemoryRegion> {
        Arc::new(MemoryRegion::host(SegmentKind::Global, RegionFlags::empty()))
    }

    #[test]
    fn handle_equals_cell_address() {
        let s = Signal::new(5, region()).unwrap();
        assert_eq!(s.handle().0, s.cell.as_ptr() as u64);
    }

    #[test]
    fn wait_returns_immediately_when_condition_already_true() {
        let s = Signal::new(0, region()).unwrap();
        let v = s.wait(Condition::Eq(0), WAIT_FOREVER, MemoryOrder::Acquire, &RuntimeConfig::default());
        assert_eq!(v, 0);
    }

    #[test]
    fn wait_times_out_without_satisfying_condition() {
        let s = Signal::new(0, region()).unwrap();
        let v = s.wait(Condition::Eq(1), 1, MemoryOrder::Acquire, &RuntimeConfig::default());
        assert_eq!(v, 0);
    }

    #[test]
    fn rmw_ops_match_expected_results() {
        let s = Signal::new(10, region()).unwrap();
        s.add(5, MemoryOrder::Relaxed);
        assert_eq!(s.load(MemoryOrder::Relaxed), 15);
        s.subtract(3, MemoryOrder::Relaxed);
        assert_eq!(s.load(MemoryOrder::Relaxed), 12);
        let prev = s.compare_exchange(12, 100, MemoryOrder::AcquireRelease);
        assert_eq!(prev, 12);
        assert_eq!(s.load(MemoryOrder::Acquire), 100);
    }

    #[test]
    fn wait_woken_by_concurrent_store() {
        let s = Arc::new(Signal::new(0, region()).unwrap());
        let s2 = s.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            s2.store(1, MemoryOrder::Release);
        });
        let v = s.wait(Condition::Eq(1), WAIT_FOREVER, MemoryOrder::Acquire, &RuntimeConfig::default());
        assert_eq!(v, 1);
        t.join().unwrap();
    }
}
