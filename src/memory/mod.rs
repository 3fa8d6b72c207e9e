//! Atomics and memory regions: the two pieces shared by every other
//! component that needs to read/write agent-visible memory with a
//! specific ordering or allocate from a specific segment.

mod atomics;
mod region;

pub use atomics::{AtomicCell32, AtomicCell64, AtomicCellI64, MemoryOrder};
pub use region::{MemoryRegion, RegionFlags, SegmentKind};
