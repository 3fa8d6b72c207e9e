//! HSA memory-order mapping and typed atomic helpers.
//!
//! HSA exposes six memory orders (`relaxed`, `consume` — folded into
//! acquire, as `std::atomic` does for `memory_order_consume` — `acquire`,
//! `release`, `acq_rel`, `seq_cst`), mapped here onto
//! `core::sync::atomic::Ordering`, one enum narrower since Rust has no
//! separate `Consume`.

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOrder {
    Relaxed,
    Acquire,
    Release,
    AcquireRelease,
    SequentiallyConsistent,
}

impl MemoryOrder {
    pub fn to_ordering(self) -> Ordering {
        match self {
            MemoryOrder::Relaxed => Ordering::Relaxed,
            MemoryOrder::Acquire => Ordering::Acquire,
            MemoryOrder::Release => Ordering::Release,
            MemoryOrder::AcquireRelease => Ordering::AcqRel,
            MemoryOrder::SequentiallyConsistent => Ordering::SeqCst,
        }
    }

    /// The failure order HSA mandates for `compare_exchange`: relaxed
    /// unless the success order demands acquire semantics on failure too.
    pub fn compare_exchange_failure(self) -> Ordering {
        match self.to_ordering() {
            Ordering::Acquire | Ordering::AcqRel | Ordering::SeqCst => Ordering::Acquire,
            _ => Ordering::Relaxed,
        }
    }
}

/// A 32-bit atomic cell with the full HSA RMW surface, used by packet
/// bookkeeping (e.g. the queue's `packet_processed` bitmap backing store).
pub struct AtomicCell32(AtomicU32);

impl AtomicCell32 {
    pub const fn new(v: u32) -> Self {
        AtomicCell32(AtomicU32::new(v))
    }
    pub fn load(&self, mo: MemoryOrder) -> u32 {
        self.0.load(mo.to_ordering())
    }
    pub fn store(&self, v: u32, mo: MemoryOrder) {
        self.0.store(v, mo.to_ordering())
    }
    pub fn add(&self, v: u32, mo: MemoryOrder) -> u32 {
        self.0.fetch_add(v, mo.to_ordering())
    }
    pub fn compare_exchange(&self, expected: u32, desired: u32, mo: MemoryOrder) -> Result<u32, u32> {
        self.0
            .compare_exchange(expected, desired, mo.to_ordering(), mo.compare_exchange_failure())
    }
}

/// A 64-bit atomic cell with the full HSA RMW surface. `Queue::read_index`
/// / `write_index` and `Signal`'s value cell are both built on this.
pub struct AtomicCell64(AtomicU64);

impl AtomicCell64 {
    pub const fn new(v: u64) -> Self {
        AtomicCell64(AtomicU64::new(v))
    }
    pub fn load(&self, mo: MemoryOrder) -> u64 {
        self.0.load(mo.to_ordering())
    }
    pub fn store(&self, v: u64, mo: MemoryOrder) {
        self.0.store(v, mo.to_ordering())
    }
    pub fn exchange(&self, v: u64, mo: MemoryOrder) -> u64 {
        self.0.swap(v, mo.to_ordering())
    }
    pub fn add(&self, v: u64, mo: MemoryOrder) -> u64 {
        self.0.fetch_add(v, mo.to_ordering())
    }
    pub fn sub(&self, v: u64, mo: MemoryOrder) -> u64 {
        self.0.fetch_sub(v, mo.to_ordering())
    }
    pub fn and(&self, v: u64, mo: MemoryOrder) -> u64 {
        self.0.fetch_and(v, mo.to_ordering())
    }
    pub fn or(&self, v: u64, mo: MemoryOrder) -> u64 {
        self.0.fetch_or(v, mo.to_ordering())
    }
    pub fn xor(&self, v: u64, mo: MemoryOrder) -> u64 {
        self.0.fetch_xor(v, mo.to_ordering())
    }
    /// Strong compare-exchange; failure order is derived from `mo` per the
    /// HSA contract rather than left to the caller.
    pub fn compare_exchange(&self, expected: u64, desired: u64, mo: MemoryOrder) -> Result<u64, u64> {
        self.0
            .compare_exchange(expected, desired, mo.to_ordering(), mo.compare_exchange_failure())
    }
}

/// A signed 64-bit atomic cell. `Signal`'s value is logically a signed
/// 64-bit integer per the HSA spec (negative values are used as error
/// sentinels by some conformance tests), so the value cell itself is
/// `AtomicI64` rather than `AtomicU64`.
pub struct AtomicCellI64(AtomicI64);

impl AtomicCellI64 {
    pub const fn new(v: i64) -> Self {
        AtomicCellI64(AtomicI64::new(v))
    }
    pub fn load(&self, mo: MemoryOrder) -> i64 {
        self.0.load(mo.to_ordering())
    }
    pub fn store(&self, v: i64, mo: MemoryOrder) {
        self.0.store(v, mo.to_ordering())
    }
    pub fn exchange(&self, v: i64, mo: MemoryOrder) -> i64 {
        self.0.swap(v, mo.to_ordering())
    }
    pub fn add(&self, v: i64, mo: MemoryOrder) -> i64 {
        self.0.fetch_add(v, mo.to_ordering())
    }
    pub fn sub(&self, v: i64, mo: MemoryOrder) -> i64 {
        self.0.fetch_sub(v, mo.to_ordering())
    }
    pub fn and(&self, v: i64, mo: MemoryOrder) -> i64 {
        self.0.fetch_and(v, mo.to_ordering())
    }
    pub fn or(&self, v: i64, mo: MemoryOrder) -> i64 {
        self.0.fetch_or(v, mo.to_ordering())
    }
    pub fn xor(&self, v: i64, mo: MemoryOrder) -> i64 {
        self.0.fetch_xor(v, mo.to_ordering())
    }
    pub fn compare_exchange(&self, expected: i64, desired: i64, mo: MemoryOrder) -> Result<i64, i64> {
        self.0
            .compare_exchange(expected, desired, mo.to_ordering(), mo.compare_exchange_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_exchange_failure_order_downgrades_release() {
        assert_eq!(
            MemoryOrder::Release.compare_exchange_failure(),
            Ordering::Relaxed
        );
        assert_eq!(
            MemoryOrder::AcquireRelease.compare_exchange_failure(),
            Ordering::Acquire
        );
    }

    #[test]
    fn cell64_rmw() {
        let c = AtomicCell64::new(10);
        assert_eq!(c.add(5, MemoryOrder::Relaxed), 10);
        assert_eq!(c.load(MemoryOrder::Relaxed), 15);
        assert_eq!(
            c.compare_exchange(15, 20, MemoryOrder::AcquireRelease),
            Ok(15)
        );
        assert_eq!(c.load(MemoryOrder::Acquire), 20);
    }
}
