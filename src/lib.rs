//! Portable HSA runtime core.
//!
//! This crate implements the kernel-dispatch engine of a CPU-only HSA
//! runtime: AQL ring-buffer queues, the signal primitive, the ELF
//! code-object loader, the executable/symbol registry, and the dispatch
//! worker that ties them together. The public C ABI, BRIG finalisation,
//! and the image/sampler/profiling extensions are external collaborators
//! and are not part of this crate (see [`abi`] for the thin shim that
//! would sit in front of it).

pub mod abi;
pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executable;
pub mod handle;
pub mod loader;
pub mod memory;
pub mod queue;
pub mod runtime;
pub mod signal;
pub mod symbol;

pub use error::{Result, Status};
pub use handle::Handle;
pub use runtime::Runtime;

/// Initializes the `log` backend once for the whole process.
///
/// Harmless to call more than once; only the first call installs a logger.
/// Applications embedding this crate may install their own `log::Log`
/// implementation instead and skip calling this at all.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
