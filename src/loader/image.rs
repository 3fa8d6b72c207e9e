//! The loaded-code-object seam: `DynamicImage` plays the role of
//! `DLFinalizedProgram`'s `dlhandle()`/`symbolAddress()`/
//! `defineGlobalSymbolAddress()` trio, but as a trait so dispatch-loop
//! and loader tests can substitute a [`MockImage`] made of real Rust
//! function pointers instead of needing an actual dlopen-able `.so`
//! built by an external BRIG compiler.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hashbrown::HashMap;
use libloading::{Library, Symbol};

use crate::error::{Result, Status};
use crate::loader::elf::HOST_DEF_PREFIX;

/// Resolves symbol addresses in, and patches host-defined globals into,
/// one loaded code object.
pub trait DynamicImage: Send + Sync {
    /// The in-memory address of `name` once loaded, or `None` if the
    /// image has no such symbol. An unresolved symbol is surfaced to the
    /// caller as `Status::InvalidCodeObject` rather than aborting the
    /// process.
    fn symbol_address(&self, name: &str) -> Option<u64>;

    /// Patches `addr` into the image's `__phsa.host_def.<name>` cell, if
    /// present. Returns whether the cell existed; a missing cell is not
    /// an error, since link-time dead-code elimination may have removed it.
    fn define_host_symbol(&self, name: &str, addr: u64) -> bool;
}

/// Strips the leading `&` GCC-mangled kernel names carry.
fn strip_leading_amp(name: &str) -> &str {
    name.strip_prefix('&').unwrap_or(name)
}

/// Loads an ELF blob into the process via `dlopen` (through `libloading`),
/// writing it to a temp file first since `dlopen` needs a path.
pub struct DlopenImage {
    _library: Library,
    path: PathBuf,
    keep_temp_file: bool,
}

impl DlopenImage {
    /// `keep_temp_file` mirrors debug-mode behavior elsewhere in this
    /// crate: the temp file backing the dlopen'd library is unlinked on
    /// drop unless the caller asked to keep it around for inspection.
    pub fn load(elf_bytes: &[u8], keep_temp_file: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("phsa-finalized-program-")
            .tempdir()
            .map_err(|_| Status::OutOfResources)?;
        let path = dir.path().join("temp.elf");
        std::fs::write(&path, elf_bytes).map_err(|_| Status::OutOfResources)?;
        // Detach the directory from its drop-guard: it must stay on disk
        // for as long as the dlopen'd library is mapped, which can
        // outlive any scoped lifetime we could give `dir` here.
        let _dir_path = dir.keep();

        let library = unsafe { Library::new(&path) }.map_err(|_| Status::InvalidCodeObject)?;
        Ok(DlopenImage { _library: library, path, keep_temp_file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DynamicImage for DlopenImage {
    fn symbol_address(&self, name: &str) -> Option<u64> {
        let name = strip_leading_amp(name);
        let cname = to_cstr_bytes(name);
        let sym: Symbol<*const ()> = unsafe { self._library.get(&cname).ok()? };
        Some(*sym as u64)
    }

    fn define_host_symbol(&self, name: &str, addr: u64) -> bool {
        let name = strip_leading_amp(name);
        let full_name = format!("{HOST_DEF_PREFIX}{name}");
        let cname = to_cstr_bytes(&full_name);
        let sym: Symbol<*mut u64> = match unsafe { self._library.get(&cname) } {
            Ok(s) => s,
            Err(_) => return false,
        };
        unsafe { **sym = addr };
        true
    }
}

impl Drop for DlopenImage {
    fn drop(&mut self) {
        if !self.keep_temp_file {
            let _ = std::fs::remove_file(&self.path);
            if let Some(parent) = self.path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
        }
    }
}

fn to_cstr_bytes(name: &str) -> Vec<u8> {
    let mut v = name.as_bytes().to_vec();
    v.push(0);
    v
}

/// A test double standing in for a dlopen'd image: real Rust function
/// pointers and host-def cells registered directly instead of resolved
/// through the dynamic linker.
#[derive(Default)]
pub struct MockImage {
    symbols: Mutex<HashMap<String, u64>>,
    host_defs: Mutex<HashMap<String, *mut u64>>,
}

// SAFETY: the raw pointers registered into `host_defs` are test-owned
// and outlive the MockImage in every test that uses one.
unsafe impl Send for MockImage {}
unsafe impl Sync for MockImage {}

impl MockImage {
    pub fn new() -> Self {
        MockImage::default()
    }

    pub fn register_symbol(&self, name: impl Into<String>, addr: u64) {
        self.symbols.lock().unwrap().insert(name.into(), addr);
    }

    pub fn register_host_def_cell(&self, name: impl Into<String>, cell: *mut u64) {
        self.host_defs.lock().unwrap().insert(name.into(), cell);
    }
}

impl DynamicImage for MockImage {
    fn symbol_address(&self, name: &str) -> Option<u64> {
        let name = strip_leading_amp(name);
        self.symbols.lock().unwrap().get(name).copied()
    }

    fn define_host_symbol(&self, name: &str, addr: u64) -> bool {
        let name = strip_leading_amp(name);
        match self.host_defs.lock().unwrap().get(name) {
            Some(&cell) => {
                unsafe { *cell = addr };
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_image_strips_leading_amp() {
        let img = MockImage::new();
        img.register_symbol("my_kernel", 0xdead_beef);
        assert_eq!(img.symbol_address("&my_kernel"), Some(0xdead_beef));
    }

    #[test]
    fn mock_image_host_def_roundtrip() {
        let mut cell: u64 = 0;
        let img = MockImage::new();
        img.register_host_def_cell("some_global", &mut cell as *mut u64);
        assert!(img.define_host_symbol("some_global", 0x1234));
        assert_eq!(cell, 0x1234);
    }

    #[test]
    fn missing_host_def_cell_is_tolerated() {
        let img = MockImage::new();
        assert!(!img.define_host_symbol("nonexistent", 1));
    }
}
