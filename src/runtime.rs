//! The process-wide runtime singleton: one `HandleRegistry`, the set of
//! `Agent`s, and the reference count gating construction/teardown.
//!
//! Grounded on `include/HSAObjectMapping.hh`'s static registries,
//! generalized per the Design Notes into a single `Runtime`-owned
//! registry built on `init` and torn down on `shut_down`, which also lets
//! tests construct independent instances instead of sharing process
//! statics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::agent::Agent;
use crate::config::RuntimeConfig;
use crate::error::{Result, Status};
use crate::handle::{Handle, HandleRegistry};
use crate::loader::{DlopenImage, DynamicImage};
use crate::memory::{MemoryRegion, RegionFlags, SegmentKind};

struct RuntimeInner {
    registry: Arc<HandleRegistry>,
    agents: Mutex<Vec<Arc<Agent>>>,
    config: RuntimeConfig,
    ref_count: AtomicU32,
}

/// Handle onto the process-wide runtime. Cloning is cheap (an `Arc`
/// bump); every clone shares the same registry/agent set and the same
/// reference count, so `shut_down` on any clone is the one that matters.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static INSTANCE: OnceLock<Mutex<Option<Arc<RuntimeInner>>>> = OnceLock::new();

impl Runtime {
    /// `hsa_init`'s analogue: bumps the process-wide reference count,
    /// constructing the singleton on the first call. Each successful call
    /// must be matched by one `shut_down` call.
    pub fn init() -> Result<Runtime> {
        crate::init_logging();
        let slot = INSTANCE.get_or_init(|| Mutex::new(None));
        let mut guard = slot.lock().expect("runtime instance lock poisoned");

        if let Some(inner) = guard.as_ref() {
            let previous = inner.ref_count.fetch_add(1, Ordering::SeqCst);
            if previous == u32::MAX {
                inner.ref_count.fetch_sub(1, Ordering::SeqCst);
                return Err(Status::RefCountOverflow);
            }
            log::debug!("Runtime::init: ref_count -> {}", previous + 1);
            return Ok(Runtime { inner: inner.clone() });
        }

        let config = RuntimeConfig::load();
        let inner = Arc::new(RuntimeInner {
            registry: Arc::new(HandleRegistry::new()),
            agents: Mutex::new(Vec::new()),
            config,
            ref_count: AtomicU32::new(1),
        });
        *guard = Some(inner.clone());
        log::info!("Runtime::init: constructed singleton (target={})", env!("TARGET"));
        Ok(Runtime { inner })
    }

    /// Constructs an independent runtime instance bypassing the process
    /// singleton entirely, for tests that need isolation from whatever
    /// else in the same process called `init`.
    pub fn new_isolated() -> Runtime {
        Runtime {
            inner: Arc::new(RuntimeInner {
                registry: Arc::new(HandleRegistry::new()),
                agents: Mutex::new(Vec::new()),
                config: RuntimeConfig::default(),
                ref_count: AtomicU32::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.inner.registry
    }

    /// Creates a CPU `Agent`, registers it in the handle registry, and
    /// starts its worker thread. The agent's dlopen seam defaults to a
    /// `DlopenImage`-free `MockImage`-less configuration: callers load
    /// code objects into a concrete `DynamicImage` of their own choosing
    /// via `Executable::load_code_object`, so the agent itself only needs
    /// one to resolve `kernel_object` handles it was handed.
    pub fn create_agent(&self, image: Arc<dyn DynamicImage>) -> Arc<Agent> {
        let handle = self.inner.registry.insert(());
        let group_region = Arc::new(MemoryRegion::host(SegmentKind::Group, RegionFlags::empty()));
        let agent = Agent::new(handle, self.inner.registry.clone(), group_region, image, self.inner.config.clone());
        self.inner.agents.lock().expect("agent list poisoned").push(agent.clone());
        agent
    }

    /// Convenience wrapper: builds a `DlopenImage`-backed agent, i.e. one
    /// that resolves kernels dlopen'd from a real finalized ELF object
    /// rather than a test double.
    pub fn create_agent_with_code_object(&self, elf_bytes: &[u8]) -> Result<Arc<Agent>> {
        let image = DlopenImage::load(elf_bytes, self.inner.config.debug_mode)?;
        Ok(self.create_agent(Arc::new(image)))
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.inner.agents.lock().expect("agent list poisoned").clone()
    }

    pub fn agent_handle(&self, agent: &Agent) -> Handle {
        agent.handle()
    }

    /// `hsa_shut_down`'s analogue: decrements the reference count, and on
    /// reaching zero joins every agent worker and clears the registry.
    /// Blocking here (agent `shut_down` blocks until its worker joins) is
    /// the documented behaviour from §5.
    pub fn shut_down(&self) -> Result<()> {
        let slot = match INSTANCE.get() {
            Some(slot) => slot,
            None => return Err(Status::NotInitialized),
        };
        let mut guard = slot.lock().expect("runtime instance lock poisoned");

        let Some(inner) = guard.as_ref() else {
            return Err(Status::NotInitialized);
        };
        if !Arc::ptr_eq(inner, &self.inner) {
            // A previously shut-down-to-zero singleton was replaced by a
            // fresh `init()` call; this handle is stale.
            return Err(Status::NotInitialized);
        }

        let remaining = inner.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("Runtime::shut_down: ref_count -> {remaining}");
        if remaining > 0 {
            return Ok(());
        }

        for agent in inner.agents.lock().expect("agent list poisoned").drain(..) {
            agent.shut_down();
        }
        inner.registry.garbage_collect();
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::image::MockImage;

    #[test]
    fn isolated_runtime_creates_agent_and_tears_down() {
        let rt = Runtime::new_isolated();
        let agent = rt.create_agent(Arc::new(MockImage::new()));
        assert_eq!(rt.agents().len(), 1);
        agent.shut_down();
    }

    #[test]
    fn singleton_init_ref_counts_and_tears_down_at_zero() {
        let a = Runtime::init().unwrap();
        let b = Runtime::init().unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        a.shut_down().unwrap();
        b.shut_down().unwrap();
        // Fully torn down: a fresh init() builds a new instance.
        let c = Runtime::init().unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        c.shut_down().unwrap();
    }
}
