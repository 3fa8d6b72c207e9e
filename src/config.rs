//! Runtime configuration.
//!
//! Configuration loading, logging setup and CLI packaging live outside
//! this crate's core dispatch/signal/loader surface, but every component
//! that needs a tunable reads it from here instead of hard-coding a
//! constant.

use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Env vars consumed directly by the core (the rest, `PHSA_COMPILER_*`,
/// `LDFLAGS`, etc., belong to the external finalizer and are not read here).
const DEBUG_MODE_VAR: &str = "PHSA_DEBUG_MODE";
const CONFIG_PATH_VAR: &str = "PHSA_RUNTIME_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DispatchConfig {
    default_queue_size: u32,
    wait_spin_iterations: u32,
    wait_yield_poll_interval_ms: u64,
}

/// Compile-time fallback for `default_queue_size`, baked in by `build.rs`
/// from `phsa.toml`'s `[dispatch]` table so a deployment can pin it without
/// shipping a `phsa.toml` alongside the binary. `phsa.toml` read at
/// `RuntimeConfig::load()` time still takes precedence when present.
fn builtin_default_queue_size() -> u32 {
    option_env!("PHSA_DEFAULT_QUEUE_SIZE")
        .and_then(|s| s.parse().ok())
        .unwrap_or(64)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            default_queue_size: builtin_default_queue_size(),
            wait_spin_iterations: 1000,
            wait_yield_poll_interval_ms: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    dispatch: DispatchConfig,
}

/// Resolved, process-wide runtime tunables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default `Queue` capacity used when a caller requests size 0.
    pub default_queue_size: u32,
    /// How many `core::hint::spin_loop` iterations `Signal::wait` performs
    /// before falling back to yielding the thread.
    pub wait_spin_iterations: u32,
    /// Sleep granularity once a `Signal::wait` has exhausted its spin budget.
    pub wait_yield_poll_interval: Duration,
    /// Whether temporary files backing a deserialized code object are kept
    /// on disk and tracing is made more verbose. Mirrors `PHSA_DEBUG_MODE`.
    pub debug_mode: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let d = DispatchConfig::default();
        RuntimeConfig {
            default_queue_size: d.default_queue_size,
            wait_spin_iterations: d.wait_spin_iterations,
            wait_yield_poll_interval: Duration::from_millis(d.wait_yield_poll_interval_ms),
            debug_mode: false,
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from `PHSA_RUNTIME_CONFIG` if set, else from
    /// `phsa.toml` in the current directory, else returns built-in
    /// defaults. Parse errors are logged and fall back to defaults rather
    /// than failing `Runtime::init`.
    pub fn load() -> Self {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "phsa.toml".to_string());
        let raw = Self::read(Path::new(&path)).unwrap_or_default();

        let mut cfg = RuntimeConfig {
            default_queue_size: raw.dispatch.default_queue_size,
            wait_spin_iterations: raw.dispatch.wait_spin_iterations,
            wait_yield_poll_interval: Duration::from_millis(
                raw.dispatch.wait_yield_poll_interval_ms,
            ),
            debug_mode: false,
        };

        // `phsa_debug_mode` is set by `build.rs` when `PHSA_DEBUG_MODE=1` at
        // build time; the env var still lets a release build opt in at
        // runtime without a rebuild.
        cfg.debug_mode = cfg!(phsa_debug_mode) || env::var(DEBUG_MODE_VAR).as_deref() == Ok("1");
        if cfg.debug_mode {
            log::info!("PHSA_DEBUG_MODE=1: retaining temp files, verbose tracing enabled");
        }
        cfg
    }

    fn read(path: &Path) -> Option<RawConfig> {
        let text = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&text) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                log::warn!("failed to parse {}: {e}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.default_queue_size.is_power_of_two());
        assert!(cfg.wait_spin_iterations > 0);
    }
}
