//! AQL packets and the ring-buffer queue.
//!
//! Grounded on `include/Queue.hh` and `Devices/CPU/UserModeQueue.{hh,cc}`:
//! a queue owns a power-of-two ring of 64-byte packets, a doorbell
//! signal, and engine-private bookkeeping (`last_handled_doorbell`, the
//! `packet_processed` bitmap) the producer never sees.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as StdOrdering};
use std::sync::{Arc, Mutex, RwLock};

use crate::handle::Handle;
use crate::memory::{AtomicCell64, MemoryOrder, MemoryRegion};
use crate::signal::Signal;

pub const HEADER_TYPE_SHIFT: u16 = 8;

/// AQL packet type, packed into the high byte of the 16-bit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Invalid = 0,
    KernelDispatch = 1,
    AgentDispatch = 2,
    BarrierAnd = 3,
    BarrierOr = 4,
}

impl PacketType {
    pub fn from_header(header: u16) -> Option<PacketType> {
        match (header >> HEADER_TYPE_SHIFT) & 0xff {
            0 => Some(PacketType::Invalid),
            1 => Some(PacketType::KernelDispatch),
            2 => Some(PacketType::AgentDispatch),
            3 => Some(PacketType::BarrierAnd),
            4 => Some(PacketType::BarrierOr),
            _ => None,
        }
    }

    /// True for any type strictly between `INVALID` and past `BARRIER_OR`,
    /// per `CPUKernelAgent::IsPacketTypeValid`.
    pub fn is_valid_header(header: u16) -> bool {
        let raw = (header >> HEADER_TYPE_SHIFT) & 0xff;
        raw > PacketType::Invalid as u16 && raw <= PacketType::BarrierOr as u16
    }
}

/// A kernel-dispatch packet. Field layout and sizes follow the HSA AQL
/// wire format exactly: this struct must stay 64 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: Handle,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: Handle,
}

const _: () = assert!(std::mem::size_of::<KernelDispatchPacket>() == 64);

/// Shared layout of `BARRIER_AND`/`BARRIER_OR` packets: header plus five
/// dependency signal handles and one completion signal.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BarrierPacket {
    pub header: u16,
    pub reserved0: u16,
    pub reserved1: u32,
    pub dep_signal: [Handle; 5],
    pub reserved2: u64,
    pub completion_signal: Handle,
}

const _: () = assert!(std::mem::size_of::<BarrierPacket>() == 64);

/// A raw 64-byte packet slot. `header()` can always be read regardless
/// of the packet's concrete type, since every variant starts with the
/// same 16-bit header field.
#[derive(Clone, Copy)]
#[repr(C)]
pub union AqlPacket {
    pub raw: [u8; 64],
    pub kernel_dispatch: KernelDispatchPacket,
    pub barrier: BarrierPacket,
}

const _: () = assert!(std::mem::size_of::<AqlPacket>() == 64);

impl AqlPacket {
    pub fn invalid() -> AqlPacket {
        AqlPacket { raw: [0u8; 64] }
    }

    pub fn header(&self) -> u16 {
        unsafe { self.kernel_dispatch.header }
    }

    pub fn set_header(&mut self, header: u16) {
        unsafe {
            self.kernel_dispatch.header = header;
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_header(self.header())
    }
}

/// HSA queue type: whether the ring may have more than one producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Single,
    Multi,
}

pub type QueueCallback = Arc<dyn Fn(crate::error::Status, Handle) + Send + Sync>;

/// A ring-buffer user-mode queue.
///
/// `base` is allocated from a `MemoryRegion` sized `size * 64` bytes and
/// freed with the queue. Access to individual packet slots goes through
/// raw pointers rather than a `Vec`/slice because the ring is written to
/// concurrently by producer threads outside any lock the queue itself
/// holds — only `read_index`/`write_index` and the header field of each
/// slot are the synchronisation points, per §5.
pub struct Queue {
    pub size: u32,
    pub queue_type: QueueType,
    base: *mut AqlPacket,
    region: Arc<MemoryRegion>,
    pub doorbell: Arc<Signal>,
    doorbell_owned: bool,
    read_index: AtomicCell64,
    write_index: AtomicCell64,
    last_handled_doorbell: AtomicU64,
    packet_processed: Mutex<Vec<bool>>,
    destroyed: AtomicBool,
    inactivated: AtomicBool,
    pub owner_agent: Handle,
    callback: RwLock<Option<QueueCallback>>,
}

// SAFETY: the raw pointer only ever addresses the queue's own region
// allocation, valid for the queue's lifetime; all indexed access is
// through the atomics above.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    pub fn new(
        size: u32,
        queue_type: QueueType,
        region: Arc<MemoryRegion>,
        owner_agent: Handle,
        doorbell: Option<Arc<Signal>>,
        callback: Option<QueueCallback>,
    ) -> Option<Self> {
        assert!(size.is_power_of_two(), "queue size must be a power of two");
        let bytes = size as usize * std::mem::size_of::<AqlPacket>();
        let base = region
            .allocate(bytes, std::mem::align_of::<AqlPacket>())?
            .cast::<AqlPacket>();
        for i in 0..size as usize {
            unsafe { base.as_ptr().add(i).write(AqlPacket::invalid()) };
        }

        let doorbell_owned = doorbell.is_none();
        let doorbell = match doorbell {
            Some(d) => d,
            None => Arc::new(Signal::new(i64::MAX, region.clone())?),
        };

        Some(Queue {
            size,
            queue_type,
            base: base.as_ptr(),
            region,
            doorbell,
            doorbell_owned,
            read_index: AtomicCell64::new(0),
            write_index: AtomicCell64::new(0),
            last_handled_doorbell: AtomicU64::new(u64::MAX),
            packet_processed: Mutex::new(vec![false; size as usize]),
            destroyed: AtomicBool::new(false),
            inactivated: AtomicBool::new(false),
            owner_agent,
            callback: RwLock::new(callback),
        })
    }

    pub fn load_read_index(&self, mo: MemoryOrder) -> u64 {
        self.read_index.load(mo)
    }
    pub fn store_read_index(&self, v: u64, mo: MemoryOrder) {
        self.read_index.store(v, mo)
    }
    pub fn load_write_index(&self, mo: MemoryOrder) -> u64 {
        self.write_index.load(mo)
    }
    pub fn store_write_index(&self, v: u64, mo: MemoryOrder) {
        self.write_index.store(v, mo)
    }
    pub fn add_write_index(&self, increment: u64, mo: MemoryOrder) -> u64 {
        self.write_index.add(increment, mo)
    }
    pub fn compare_exchange_write_index(&self, expected: u64, value: u64, mo: MemoryOrder) -> u64 {
        self.write_index.compare_exchange(expected, value, mo).unwrap_or_else(|prev| prev)
    }

    /// Slot `index mod size`, as a raw pointer valid for the queue's
    /// lifetime. Safe to dereference only while synchronised by the
    /// header-as-commit-marker protocol described in §5.
    pub fn slot(&self, index: u64) -> *mut AqlPacket {
        let slot = (index % self.size as u64) as usize;
        unsafe { self.base.add(slot) }
    }

    pub fn last_handled_doorbell(&self) -> u64 {
        self.last_handled_doorbell.load(StdOrdering::Relaxed)
    }
    pub fn set_last_handled_doorbell(&self, v: u64) {
        self.last_handled_doorbell.store(v, StdOrdering::Relaxed)
    }

    pub fn is_packet_processed(&self, slot: usize) -> bool {
        self.packet_processed.lock().unwrap()[slot]
    }
    pub fn set_packet_processed(&self, slot: usize, flag: bool) {
        self.packet_processed.lock().unwrap()[slot] = flag;
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, StdOrdering::Relaxed);
    }
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(StdOrdering::Relaxed)
    }
    pub fn mark_inactivated(&self) {
        self.inactivated.store(true, StdOrdering::Relaxed);
    }
    pub fn is_inactivated(&self) -> bool {
        self.inactivated.load(StdOrdering::Relaxed)
    }

    pub fn set_callback(&self, cb: Option<QueueCallback>) {
        *self.callback.write().unwrap() = cb;
    }

    /// Surfaces a packet-processing error to the producer-registered
    /// callback. Packet errors are never returned from the dispatch loop
    /// itself — this is the only channel for them, per §4.5.
    pub fn execute_callback(&self, status: crate::error::Status) {
        if let Some(cb) = self.callback.read().unwrap().as_ref() {
            cb(status, self.owner_agent);
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let bytes = self.size as usize * std::mem::size_of::<AqlPacket>();
        let _ = bytes;
        if let Some(p) = std::ptr::NonNull::new(self.base as *mut u8) {
            self.region.free(p);
        }
        let _ = self.doorbell_owned;
    }
}
