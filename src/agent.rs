//! `Agent`: a CPU capable of executing dispatches. Owns a set of `Queue`s
//! and the single worker thread that drains them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::RuntimeConfig;
use crate::dispatch;
use crate::error::{Result, Status};
use crate::handle::{Handle, HandleRegistry};
use crate::loader::DynamicImage;
use crate::memory::MemoryRegion;
use crate::queue::{Queue, QueueCallback, QueueType};
use crate::signal::Signal;

/// Device kind an agent reports through `device_type`. Only `Cpu` is ever
/// produced by this crate; the variant exists because callers inspect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRoundingMode {
    Near,
    Zero,
}

/// Fixed capability table for the one kind of agent this runtime produces.
/// Mirrors the getters `CPUKernelAgent` overrides from its base class,
/// trimmed to the ones a caller can actually observe through dispatch.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: &'static str,
    pub vendor: &'static str,
    pub isa: String,
    pub device_type: DeviceType,
    pub queues_max: u32,
    pub queue_min_size: u32,
    pub queue_max_size: u32,
    pub default_queue_type: QueueType,
    pub wavefront_size: u32,
    pub fbarrier_max_size: u32,
}

impl Default for AgentInfo {
    fn default() -> Self {
        AgentInfo {
            name: "phsa generic CPU agent",
            vendor: "UNKNOWN",
            isa: "host-isa".to_string(),
            device_type: DeviceType::Cpu,
            queues_max: 1024,
            queue_min_size: 1,
            queue_max_size: 16,
            default_queue_type: QueueType::Multi,
            wavefront_size: 1,
            fbarrier_max_size: 32,
        }
    }
}

/// Shared state the worker thread and the controlling `Agent` handle both
/// touch: the queue list, the currently-running queue, and the
/// cooperative-interruption flags described in the dispatch engine design.
pub(crate) struct Shared {
    pub queues: RwLock<Vec<Arc<Queue>>>,
    pub running_queue: Mutex<Option<Arc<Queue>>>,
    pub interrupting: AtomicBool,
    pub shutdown: AtomicBool,
    pub interrupt_requested: AtomicBool,
    pub group_region: Arc<MemoryRegion>,
    pub registry: Arc<HandleRegistry>,
    pub image: Arc<dyn DynamicImage>,
    pub config: RuntimeConfig,
}

/// A CPU agent: queue factory, queue owner, and the thread that drains
/// them. One worker thread is spawned per agent at construction and joined
/// on `shut_down`.
pub struct Agent {
    pub info: AgentInfo,
    handle: Handle,
    pub(crate) shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Spawns the worker thread immediately, matching
    /// `CPUKernelAgent::CPUKernelAgent`'s member-initializer-list thread
    /// start.
    pub fn new(
        handle: Handle,
        registry: Arc<HandleRegistry>,
        group_region: Arc<MemoryRegion>,
        image: Arc<dyn DynamicImage>,
        config: RuntimeConfig,
    ) -> Arc<Agent> {
        let shared = Arc::new(Shared {
            queues: RwLock::new(Vec::new()),
            running_queue: Mutex::new(None),
            interrupting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            interrupt_requested: AtomicBool::new(false),
            group_region,
            registry,
            image,
            config,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("phsa-agent-worker".to_string())
            .spawn(move || dispatch::run(worker_shared))
            .unwrap_or_else(|e| {
                log::error!("failed to spawn agent worker thread: {e}");
                std::process::abort();
            });

        Arc::new(Agent {
            info: AgentInfo::default(),
            handle,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn float_rounding_mode(&self) -> FloatRoundingMode {
        FloatRoundingMode::Near
    }

    /// Creates a queue of `size` slots (must be a power of two within the
    /// agent's min/max bounds) and registers it for the worker to drain.
    pub fn create_queue(
        &self,
        size: u32,
        queue_type: QueueType,
        region: Arc<MemoryRegion>,
        doorbell: Option<Arc<Signal>>,
        callback: Option<QueueCallback>,
    ) -> Result<Arc<Queue>> {
        if size < self.info.queue_min_size || size > self.info.queue_max_size || !size.is_power_of_two() {
            return Err(Status::InvalidQueueCreation);
        }
        let queue = Arc::new(
            Queue::new(size, queue_type, region, self.handle, doorbell, callback)
                .ok_or(Status::OutOfResources)?,
        );
        self.shared.queues.write().expect("queue list poisoned").push(queue.clone());
        Ok(queue)
    }

    /// Drops a queue from the agent's drain list. The worker will simply
    /// stop seeing it on its next outer-loop snapshot; callers that need
    /// the stronger "stop touching it now" guarantee should call
    /// `terminate_queue` first.
    pub fn destroy_queue(&self, queue: &Arc<Queue>) {
        queue.mark_destroyed();
        self.shared
            .queues
            .write()
            .expect("queue list poisoned")
            .retain(|q| !Arc::ptr_eq(q, queue));
    }

    /// Inactivates and interrupts `queue`'s processing, matching
    /// `CPUKernelAgent::terminateQueue`: sets `interrupting`, and if the
    /// worker is currently on this queue, requests cooperative preemption
    /// and spins until the worker has moved off it.
    pub fn terminate_queue(&self, queue: &Arc<Queue>) {
        queue.mark_inactivated();
        self.shared.interrupting.store(true, Ordering::SeqCst);

        let is_running = self
            .shared
            .running_queue
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(running, queue));

        if is_running {
            self.shared.interrupt_requested.store(true, Ordering::SeqCst);
            loop {
                let still_running = self
                    .shared
                    .running_queue
                    .lock()
                    .unwrap()
                    .as_ref()
                    .is_some_and(|running| Arc::ptr_eq(running, queue));
                if !still_running {
                    break;
                }
                std::hint::spin_loop();
            }
            self.shared.interrupt_requested.store(false, Ordering::SeqCst);
        }

        self.shared.interrupting.store(false, Ordering::SeqCst);
    }

    /// Signals the worker to stop after its current outer-loop iteration
    /// and blocks until it has joined.
    pub fn shut_down(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::image::MockImage;
    use crate::memory::{MemoryRegion, SegmentKind};

    fn make_agent() -> Arc<Agent> {
        let registry = Arc::new(HandleRegistry::new());
        let group_region = Arc::new(MemoryRegion::host(SegmentKind::Group, Default::default()));
        let image = Arc::new(MockImage::new());
        Agent::new(Handle::from_raw(1), registry, group_region, image, RuntimeConfig::default())
    }

    #[test]
    fn agent_defaults_match_cpu_profile() {
        let agent = make_agent();
        assert_eq!(agent.info.wavefront_size, 1);
        assert_eq!(agent.info.device_type, DeviceType::Cpu);
        agent.shut_down();
    }

    #[test]
    fn create_queue_rejects_non_power_of_two() {
        let agent = make_agent();
        let region = Arc::new(MemoryRegion::host(SegmentKind::Kernarg, Default::default()));
        let result = agent.create_queue(3, QueueType::Single, region, None, None);
        assert_eq!(result.unwrap_err(), Status::InvalidQueueCreation);
        agent.shut_down();
    }

    #[test]
    fn shut_down_joins_worker() {
        let agent = make_agent();
        agent.shut_down();
    }
}
