//! Memory regions: the allocators backing queues, kernarg buffers, group
//! memory and signal value cells.
//!
//! Two allocation policies, matching spec §3/§9:
//!
//! - [`AllocationPolicy::Host`] hands out memory straight from the
//!   process heap (`std::alloc`) — used for segments with no addressing
//!   constraints.
//! - [`AllocationPolicy::Fixed`] carves allocations out of one
//!   reserved, contiguous arena, tracked by a sorted chunk-start→size map
//!   exactly as `FixedMemoryRegion::allocate` does: try to grow from the
//!   end of the arena first, and only fall back to an O(N) linear scan
//!   for a fitting gap between existing chunks. The Design Notes call
//!   this out explicitly as acceptable only for small N (hundreds of
//!   live allocations) — replace with a free-list/buddy scheme if
//!   profiling a workload with heavier group-memory churn demands it.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::{Result, Status};

/// Which AQL segment this region backs. Matters only for bookkeeping and
/// diagnostics here — the CPU agent treats every segment as equally
/// addressable host memory (fine-grained coherent, per the Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Global,
    Group,
    Private,
    Kernarg,
    ReadOnly,
}

bitflags::bitflags! {
    /// Mirrors `hsa_region_global_flag_t`: whether kernarg/fine-grained/
    /// coarse-grained access is permitted for a `Global` region.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct RegionFlags: u32 {
        const KERNARG = 1 << 0;
        const FINE_GRAINED = 1 << 1;
        const COARSE_GRAINED = 1 << 2;
    }
}

enum AllocationPolicy {
    /// Hands out memory straight from the process allocator; each
    /// allocation remembers its `Layout` so it can be freed correctly.
    Host(Mutex<BTreeMap<usize, Layout>>),
    /// A single reserved arena, sub-allocated by address range.
    Fixed(Mutex<FixedArena>),
}

struct FixedArena {
    base: usize,
    end: usize,
    free_space_start: usize,
    /// chunk start -> chunk size, for every live allocation.
    allocations: BTreeMap<usize, usize>,
    backing: NonNull<u8>,
    backing_layout: Layout,
}

// SAFETY: the arena owns its backing allocation exclusively and all
// access is serialized through the enclosing Mutex.
unsafe impl Send for FixedArena {}

impl FixedArena {
    fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), 4096).map_err(|_| Status::InvalidAllocation)?;
        let backing = unsafe { NonNull::new(alloc(layout)).ok_or(Status::OutOfResources)? };
        let base = backing.as_ptr() as usize;
        Ok(FixedArena {
            base,
            end: base + size,
            free_space_start: base,
            allocations: BTreeMap::new(),
            backing,
            backing_layout: layout,
        })
    }

    /// Port of `FixedMemoryRegion::allocate`: bump from the end of the
    /// highest existing chunk first, else linear-scan the gaps between
    /// sorted chunks for the first one that fits.
    fn allocate(&mut self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align > 0);

        if let Some((&last_start, &last_size)) = self.allocations.iter().next_back() {
            self.free_space_start = last_start + last_size;
        }

        let mut addr = 0usize;
        let aligned_free_start = align_up(self.free_space_start, align);
        if aligned_free_start.checked_add(size).map(|e| e <= self.end) == Some(true) {
            addr = aligned_free_start;
            self.free_space_start = addr + size;
        }

        if addr == 0 && !self.allocations.is_empty() {
            let mut iter = self.allocations.iter().peekable();
            while let Some((&chunk_start, &chunk_size)) = iter.next() {
                if let Some(&(&next_start, _)) = iter.peek() {
                    let chunk_end = chunk_start + chunk_size;
                    let aligned = align_up(chunk_end, align);
                    if aligned + size <= next_start {
                        addr = aligned;
                        break;
                    }
                }
            }
        }

        if addr == 0 {
            return None;
        }

        debug_assert_eq!(addr % align, 0);
        self.allocations.insert(addr, size);
        Some(addr)
    }

    fn free(&mut self, addr: usize) -> bool {
        self.allocations.remove(&addr).is_some()
    }
}

impl Drop for FixedArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.backing.as_ptr(), self.backing_layout) };
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// A memory region: one allocation policy plus the segment metadata HSA
/// clients query it for.
pub struct MemoryRegion {
    pub kind: SegmentKind,
    pub flags: RegionFlags,
    pub size: usize,
    policy: AllocationPolicy,
}

impl MemoryRegion {
    /// A region backed directly by the host heap — used for `GLOBAL`/
    /// `KERNARG` regions where no fixed-address contract is needed.
    pub fn host(kind: SegmentKind, flags: RegionFlags) -> Self {
        MemoryRegion {
            kind,
            flags,
            size: usize::MAX,
            policy: AllocationPolicy::Host(Mutex::new(BTreeMap::new())),
        }
    }

    /// A region backed by one reserved arena of `size` bytes — used for
    /// `GROUP` memory, where dispatch-time allocations must come from a
    /// bounded pool so `group_segment_size` exhaustion is observable as
    /// `Status::InvalidAllocation` rather than silently falling back to
    /// the host heap.
    pub fn fixed(kind: SegmentKind, flags: RegionFlags, size: usize) -> Result<Self> {
        Ok(MemoryRegion {
            kind,
            flags,
            size,
            policy: AllocationPolicy::Fixed(Mutex::new(FixedArena::new(size)?)),
        })
    }

    /// Allocates `size` bytes aligned to `align`. A `size` of zero is
    /// legal and returns `None` without touching the allocator, matching
    /// the dispatch engine's "no group memory requested" fast path.
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        match &self.policy {
            AllocationPolicy::Host(log) => {
                let layout = Layout::from_size_align(size, align.max(1)).ok()?;
                let ptr = unsafe { alloc_zeroed(layout) };
                let ptr = NonNull::new(ptr)?;
                log.lock().unwrap().insert(ptr.as_ptr() as usize, layout);
                Some(ptr)
            }
            AllocationPolicy::Fixed(arena) => {
                let mut arena = arena.lock().unwrap();
                let addr = arena.allocate(size, align.max(1))?;
                Some(unsafe { NonNull::new_unchecked(addr as *mut u8) })
            }
        }
    }

    /// Frees a pointer previously returned by `allocate`. Returns whether
    /// the pointer was recognised.
    pub fn free(&self, ptr: NonNull<u8>) -> bool {
        match &self.policy {
            AllocationPolicy::Host(log) => {
                let mut log = log.lock().unwrap();
                if let Some(layout) = log.remove(&(ptr.as_ptr() as usize)) {
                    unsafe { dealloc(ptr.as_ptr(), layout) };
                    true
                } else {
                    false
                }
            }
            AllocationPolicy::Fixed(arena) => arena.lock().unwrap().free(ptr.as_ptr() as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_region_rejects_oversize() {
        let region = MemoryRegion::fixed(SegmentKind::Group, RegionFlags::empty(), 64).unwrap();
        assert!(region.allocate(128, 16).is_none());
    }

    #[test]
    fn fixed_region_reuses_freed_gap() {
        let region = MemoryRegion::fixed(SegmentKind::Group, RegionFlags::empty(), 256).unwrap();
        let a = region.allocate(32, 16).unwrap();
        let b = region.allocate(32, 16).unwrap();
        assert!(region.free(a));
        let c = region.allocate(32, 16).unwrap();
        // The freed gap or the bump area can satisfy this; what matters is
        // that allocation still succeeds and stays within the arena.
        assert_ne!(b, c);
    }

    #[test]
    fn zero_size_allocation_is_none() {
        let region = MemoryRegion::host(SegmentKind::Global, RegionFlags::empty());
        assert!(region.allocate(0, 8).is_none());
    }

    #[test]
    fn host_region_roundtrip() {
        let region = MemoryRegion::host(SegmentKind::Kernarg, RegionFlags::KERNARG);
        let p = region.allocate(64, 16).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert!(region.free(p));
    }
}
