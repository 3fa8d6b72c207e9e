//! End-to-end coverage of the dispatch loop: packets submitted through a
//! real `Queue`, drained by a real agent worker thread, against kernel
//! entry points that are ordinary Rust `extern "C" fn`s standing in for
//! finalized code.

mod support;

use std::ffi::c_void;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use phsa_rt::dispatch::KernelLaunchData;
use phsa_rt::error::Status;
use phsa_rt::executable::Executable;
use phsa_rt::handle::Handle;
use phsa_rt::loader::{ControlDirectives, MockImage, Profile};
use phsa_rt::memory::{MemoryOrder, MemoryRegion, RegionFlags, SegmentKind};
use phsa_rt::queue::{HEADER_TYPE_SHIFT, BarrierPacket, KernelDispatchPacket, PacketType, QueueType};
use phsa_rt::runtime::Runtime;
use phsa_rt::signal::{Condition, Signal, WAIT_FOREVER};

unsafe extern "C" fn increment_kernel(_launch: *mut KernelLaunchData, _group: *mut c_void, kernarg: *mut c_void) {
    let counter = kernarg as *mut i64;
    *counter += 1;
}

unsafe extern "C" fn spin_until_interrupted(launch: *mut KernelLaunchData, _group: *mut c_void, kernarg: *mut c_void) {
    let flag = (*launch).interrupt_requested;
    let counter = kernarg as *mut i64;
    loop {
        if (*flag).load(Ordering::Relaxed) {
            break;
        }
        std::hint::spin_loop();
    }
    *counter = 1;
}

fn global_region() -> Arc<MemoryRegion> {
    Arc::new(MemoryRegion::host(SegmentKind::Global, RegionFlags::empty()))
}

fn kernarg_region() -> Arc<MemoryRegion> {
    Arc::new(MemoryRegion::host(SegmentKind::Kernarg, RegionFlags::KERNARG))
}

/// E1: a KERNEL_DISPATCH packet executes the resolved kernel and retires
/// its completion signal to zero.
#[test]
fn e1_basic_kernel_dispatch_runs_and_completes() {
    let image = Arc::new(MockImage::new());
    image.register_symbol("phsa_kernel.increment", increment_kernel as usize as u64);

    let elf = support::ElfBuilder::new()
        .add_kernel("increment", Some(support::kernel_descriptor(8, true)))
        .build();

    let executable = Executable::new(Profile::Base);
    executable.load_code_object(&elf, image.as_ref(), None, None).unwrap();
    executable.freeze().unwrap();

    let rt = Runtime::new_isolated();
    let agent = rt.create_agent(image.clone());
    let kernel_handle = executable.kernel_handle(rt.registry(), "&phsa_kernel.increment").unwrap();

    // Kernarg alignment is floored to 16 bytes regardless of what the
    // descriptor requests (see `Executable::load_code_object`), so the
    // buffer must be 16-aligned too or the dispatch loop relocates the
    // kernel's view of it into a scratch buffer it never copies back out.
    let kernarg = kernarg_region().allocate(8, 16).unwrap();
    unsafe { (kernarg.as_ptr() as *mut i64).write(41) };

    let completion = Signal::new(1, global_region()).unwrap();
    let queue = agent.create_queue(4, QueueType::Single, global_region(), None, None).unwrap();

    let packet = KernelDispatchPacket {
        header: (PacketType::KernelDispatch as u16) << HEADER_TYPE_SHIFT,
        setup: 1,
        workgroup_size_x: 1,
        workgroup_size_y: 1,
        workgroup_size_z: 1,
        reserved0: 0,
        grid_size_x: 1,
        grid_size_y: 1,
        grid_size_z: 1,
        private_segment_size: 0,
        group_segment_size: 0,
        kernel_object: kernel_handle,
        kernarg_address: kernarg.as_ptr() as u64,
        reserved2: 0,
        completion_signal: completion.handle(),
    };
    unsafe { (*queue.slot(0)).kernel_dispatch = packet };
    queue.add_write_index(1, MemoryOrder::AcquireRelease);
    queue.doorbell.store(0, MemoryOrder::Release);

    let result = completion.wait(Condition::Eq(0), Duration::from_secs(5).as_nanos() as u64, MemoryOrder::Acquire, rt.config());
    assert_eq!(result, 0, "completion signal never retired");

    let value = unsafe { *(kernarg.as_ptr() as *const i64) };
    assert_eq!(value, 42);

    agent.shut_down();
}

/// E2: a BARRIER_AND packet blocks while any dependency is nonzero and
/// releases once every dependency reaches zero.
#[test]
fn e2_barrier_and_blocks_then_releases() {
    let image = Arc::new(MockImage::new());
    let rt = Runtime::new_isolated();
    let agent = rt.create_agent(image);

    let dep1 = Signal::new(1, global_region()).unwrap();
    let dep2 = Signal::new(1, global_region()).unwrap();
    let completion = Signal::new(1, global_region()).unwrap();
    let queue = agent.create_queue(4, QueueType::Single, global_region(), None, None).unwrap();

    let packet = BarrierPacket {
        header: (PacketType::BarrierAnd as u16) << HEADER_TYPE_SHIFT,
        reserved0: 0,
        reserved1: 0,
        dep_signal: [dep1.handle(), dep2.handle(), Handle::NULL, Handle::NULL, Handle::NULL],
        reserved2: 0,
        completion_signal: completion.handle(),
    };
    unsafe { (*queue.slot(0)).barrier = packet };
    queue.add_write_index(1, MemoryOrder::AcquireRelease);
    queue.doorbell.store(0, MemoryOrder::Release);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(completion.load(MemoryOrder::Acquire), 1, "barrier released before both deps cleared");

    dep1.store(0, MemoryOrder::Release);
    dep2.store(0, MemoryOrder::Release);

    let result = completion.wait(Condition::Eq(0), Duration::from_secs(5).as_nanos() as u64, MemoryOrder::Acquire, rt.config());
    assert_eq!(result, 0);

    agent.shut_down();
}

/// E3: a BARRIER_OR packet releases as soon as any one dependency is zero.
#[test]
fn e3_barrier_or_releases_on_any_zero() {
    let image = Arc::new(MockImage::new());
    let rt = Runtime::new_isolated();
    let agent = rt.create_agent(image);

    let dep1 = Signal::new(0, global_region()).unwrap();
    let dep2 = Signal::new(1, global_region()).unwrap();
    let completion = Signal::new(1, global_region()).unwrap();
    let queue = agent.create_queue(4, QueueType::Single, global_region(), None, None).unwrap();

    let packet = BarrierPacket {
        header: (PacketType::BarrierOr as u16) << HEADER_TYPE_SHIFT,
        reserved0: 0,
        reserved1: 0,
        dep_signal: [dep1.handle(), dep2.handle(), Handle::NULL, Handle::NULL, Handle::NULL],
        reserved2: 0,
        completion_signal: completion.handle(),
    };
    unsafe { (*queue.slot(0)).barrier = packet };
    queue.add_write_index(1, MemoryOrder::AcquireRelease);
    queue.doorbell.store(0, MemoryOrder::Release);

    let result = completion.wait(Condition::Eq(0), WAIT_FOREVER, MemoryOrder::Acquire, rt.config());
    assert_eq!(result, 0);

    agent.shut_down();
}

/// E4: `Agent::terminate_queue` interrupts a long-running kernel that
/// cooperatively polls `KernelLaunchData::interrupt_requested`.
#[test]
fn e4_terminate_queue_interrupts_a_spinning_kernel() {
    let image = Arc::new(MockImage::new());
    image.register_symbol("phsa_kernel.spin", spin_until_interrupted as usize as u64);

    let elf = support::ElfBuilder::new()
        .add_kernel("spin", Some(support::kernel_descriptor(8, true)))
        .build();

    let executable = Executable::new(Profile::Base);
    executable.load_code_object(&elf, image.as_ref(), None, None).unwrap();
    executable.freeze().unwrap();

    let rt = Runtime::new_isolated();
    let agent = rt.create_agent(image.clone());
    let kernel_handle = executable.kernel_handle(rt.registry(), "&phsa_kernel.spin").unwrap();

    let kernarg = kernarg_region().allocate(8, 16).unwrap();
    unsafe { (kernarg.as_ptr() as *mut i64).write(0) };

    let completion = Signal::new(1, global_region()).unwrap();
    let queue = agent.create_queue(4, QueueType::Single, global_region(), None, None).unwrap();

    let packet = KernelDispatchPacket {
        header: (PacketType::KernelDispatch as u16) << HEADER_TYPE_SHIFT,
        setup: 1,
        workgroup_size_x: 1,
        workgroup_size_y: 1,
        workgroup_size_z: 1,
        reserved0: 0,
        grid_size_x: 1,
        grid_size_y: 1,
        grid_size_z: 1,
        private_segment_size: 0,
        group_segment_size: 0,
        kernel_object: kernel_handle,
        kernarg_address: kernarg.as_ptr() as u64,
        reserved2: 0,
        completion_signal: completion.handle(),
    };
    unsafe { (*queue.slot(0)).kernel_dispatch = packet };
    queue.add_write_index(1, MemoryOrder::AcquireRelease);
    queue.doorbell.store(0, MemoryOrder::Release);

    // Give the worker time to pick the packet up and enter the kernel's
    // spin loop before requesting termination.
    std::thread::sleep(Duration::from_millis(50));
    agent.terminate_queue(&queue);

    let result = completion.wait(Condition::Eq(0), Duration::from_secs(5).as_nanos() as u64, MemoryOrder::Acquire, rt.config());
    assert_eq!(result, 0, "kernel never completed after interruption");

    let value = unsafe { *(kernarg.as_ptr() as *const i64) };
    assert_eq!(value, 1, "kernel body did not observe the interrupt flag");

    agent.shut_down();
}

/// E5: a control directive that widens an already-bounded descriptor
/// field is rejected rather than silently applied.
#[test]
fn e5_widening_control_directive_is_rejected() {
    let image = Arc::new(MockImage::new());
    image.register_symbol("phsa_kernel.bounded", increment_kernel as usize as u64);

    let mut descriptor = support::kernel_descriptor(8, true);
    descriptor.max_flat_workgroup_size = 128;
    let elf = support::ElfBuilder::new().add_kernel("bounded", Some(descriptor)).build();

    let executable = Executable::new(Profile::Base);
    let directives = ControlDirectives { max_flat_workgroup_size: 256, ..Default::default() };

    let result = executable.load_code_object(&elf, image.as_ref(), Some(&directives), None);
    assert_eq!(result.unwrap_err(), Status::DirectiveMismatch);
}

/// E6: a host-defined global registered on the executable is patched into
/// the loaded image's `__phsa.host_def.` cell at load time.
#[test]
fn e6_host_defined_global_is_patched_on_load() {
    let mut cell: u64 = 0;
    let image = MockImage::new();
    image.register_host_def_cell("my_global", &mut cell as *mut u64);
    image.register_symbol("my_data_global", 0x1);
    let image = Arc::new(image);

    let executable = Executable::new(Profile::Base);
    executable.define_global_symbol_address("my_global", 0xdead_beef).unwrap();

    let elf = support::ElfBuilder::new().add_variable("my_data_global").build();
    executable.load_code_object(&elf, image.as_ref(), None, None).unwrap();

    assert_eq!(cell, 0xdead_beef);
}

/// Supplemented feature: an agent-scoped host-defined global is only
/// patched into loads performed against that agent's handle.
#[test]
fn agent_scoped_global_only_patches_matching_agent() {
    let mut cell_a: u64 = 0;
    let mut cell_b: u64 = 0;
    let image_a = MockImage::new();
    image_a.register_host_def_cell("per_agent_global", &mut cell_a as *mut u64);
    image_a.register_symbol("my_data_global", 0x1);
    let image_a = Arc::new(image_a);

    let image_b = MockImage::new();
    image_b.register_host_def_cell("per_agent_global", &mut cell_b as *mut u64);
    image_b.register_symbol("my_data_global", 0x1);
    let image_b = Arc::new(image_b);

    let rt = Runtime::new_isolated();
    let agent_a = rt.create_agent(image_a.clone());
    let agent_b = rt.create_agent(image_b.clone());

    let executable = Executable::new(Profile::Base);
    executable.define_agent_global_symbol_address(agent_a.handle(), "per_agent_global", 0x1234).unwrap();

    let elf = support::ElfBuilder::new().add_variable("my_data_global").build();
    executable.load_code_object(&elf, image_a.as_ref(), None, Some(agent_a.handle())).unwrap();
    executable.load_code_object(&elf, image_b.as_ref(), None, Some(agent_b.handle())).unwrap();

    assert_eq!(cell_a, 0x1234, "agent A's cell should have been patched");
    assert_eq!(cell_b, 0, "agent B's cell must not see agent A's global");

    agent_a.shut_down();
    agent_b.shut_down();
}
