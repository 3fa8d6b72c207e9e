//! Executables: the symbol table built by loading one or more code
//! objects, and the `UNFROZEN -> FROZEN` state machine gating when that
//! table may still change.
//!
//! The symbol table is a `Vec<Symbol>` plus a `HashMap<String, usize>`
//! name index and a separate host-address map for symbols defined by the
//! embedder rather than by a loaded code object — insertion-ordered
//! iteration plus O(1) name lookup, nothing more.

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Result, Status};
use crate::handle::Handle;
use crate::loader::{
    self, ControlDirectives, DynamicImage, FunctionDescriptor, Profile, RawSymbolClass,
};
use crate::symbol::{IndirectFunctionSymbol, KernelSymbol, Symbol, SymbolKind, SymbolLinkage, VariableSegment, VariableSymbol};

const MIN_KERNARG_ALIGNMENT: u32 = 16;

struct Inner {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
    defined_symbols: HashMap<String, u64>,
    agent_defined_symbols: HashMap<(Handle, String), u64>,
    frozen: bool,
    descriptors: HashMap<String, FunctionDescriptor>,
    kernel_handles: HashMap<String, Handle>,
}

/// A loaded program: one symbol table, built up across however many
/// `load_code_object` calls happen before `freeze()`.
pub struct Executable {
    pub profile: Profile,
    inner: Mutex<Inner>,
}

impl Executable {
    pub fn new(profile: Profile) -> Self {
        Executable {
            profile,
            inner: Mutex::new(Inner {
                symbols: Vec::new(),
                by_name: HashMap::new(),
                defined_symbols: HashMap::new(),
                agent_defined_symbols: HashMap::new(),
                frozen: false,
                descriptors: HashMap::new(),
                kernel_handles: HashMap::new(),
            }),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().unwrap().frozen
    }

    /// One-way transition. Calling this on an already-frozen executable
    /// is an error rather than a silent no-op.
    pub fn freeze(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen {
            return Err(Status::FrozenExecutable);
        }
        inner.frozen = true;
        Ok(())
    }

    /// Records a host-variable address to be patched into code objects
    /// loaded from now on, and into any image already loaded that still
    /// carries the matching `__phsa.host_def.` cell.
    pub fn define_global_symbol_address(&self, name: impl Into<String>, addr: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen {
            return Err(Status::FrozenExecutable);
        }
        inner.defined_symbols.insert(name.into(), addr);
        Ok(())
    }

    /// Agent-scoped variant of `define_global_symbol_address`: the
    /// address is visible only when resolving host-defined globals for
    /// code objects loaded against `agent`, layered on the same map with
    /// an agent-qualified key.
    pub fn define_agent_global_symbol_address(&self, agent: Handle, name: impl Into<String>, addr: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen {
            return Err(Status::FrozenExecutable);
        }
        inner.agent_defined_symbols.insert((agent, name.into()), addr);
        Ok(())
    }

    pub fn get_symbol(&self, name: &str) -> Option<Symbol> {
        let normalized = loader::normalize_symbol_name(name);
        let inner = self.inner.lock().unwrap();
        let idx = inner.by_name.get(&normalized).copied()?;
        Some(inner.symbols[idx].clone())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.inner.lock().unwrap().symbols.clone()
    }

    /// Resolves `name` to the `Handle` a `KERNEL_DISPATCH` packet's
    /// `kernel_object` field should carry, registering the symbol in
    /// `registry` on first use and memoizing the handle for later calls.
    pub fn kernel_handle(&self, registry: &crate::handle::HandleRegistry, name: &str) -> Option<Handle> {
        let normalized = loader::normalize_symbol_name(name);
        let mut inner = self.inner.lock().unwrap();
        if let Some(&handle) = inner.kernel_handles.get(&normalized) {
            return Some(handle);
        }
        let idx = *inner.by_name.get(&normalized)?;
        let symbol = inner.symbols[idx].clone();
        let handle = registry.insert(symbol);
        inner.kernel_handles.insert(normalized, handle);
        Some(handle)
    }

    /// Parses `elf_bytes`, resolves every kept symbol's address against
    /// `image`, patches host-defined globals, and registers the
    /// resulting `Symbol`s. Legal only while unfrozen.
    pub fn load_code_object(
        &self,
        elf_bytes: &[u8],
        image: &dyn DynamicImage,
        control_directives: Option<&ControlDirectives>,
        agent: Option<Handle>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen {
            return Err(Status::FrozenExecutable);
        }

        let parsed = loader::parse_code_object(elf_bytes)?;

        let mut descriptors = parsed.descriptors;
        if let Some(directives) = control_directives {
            for descriptor in descriptors.values_mut() {
                loader::merge_control_directives(descriptor, directives)?;
            }
        }

        for (name, addr) in inner.defined_symbols.iter() {
            image.define_host_symbol(name, *addr);
        }
        if let Some(agent) = agent {
            for ((sym_agent, name), addr) in inner.agent_defined_symbols.iter() {
                if *sym_agent == agent {
                    image.define_host_symbol(name, *addr);
                }
            }
        }

        for raw in parsed.symbols {
            let address = image.symbol_address(&raw.name).ok_or(Status::InvalidCodeObject)?;
            let symbol = match raw.class {
                RawSymbolClass::DescribedKernel(descriptor) => Symbol {
                    name: format!("&{}", raw.name),
                    module_name: String::new(),
                    agent: None,
                    linkage: SymbolLinkage::Program,
                    is_definition: true,
                    kind: SymbolKind::Kernel(KernelSymbol {
                        address,
                        kernarg_segment_size: descriptor.kernarg_segment_size,
                        kernarg_segment_alignment: (descriptor.kernarg_max_align as u32).max(MIN_KERNARG_ALIGNMENT),
                        group_segment_size: descriptor.group_segment_size,
                        private_segment_size: descriptor.private_segment_size,
                        dynamic_call_stack: false,
                    }),
                },
                RawSymbolClass::PhsaKernel => Symbol {
                    name: format!("&{}", raw.name),
                    module_name: String::new(),
                    agent: None,
                    linkage: SymbolLinkage::Program,
                    is_definition: true,
                    kind: SymbolKind::Kernel(KernelSymbol {
                        address,
                        kernarg_segment_size: 2048,
                        kernarg_segment_alignment: 1,
                        group_segment_size: 0,
                        private_segment_size: 0,
                        dynamic_call_stack: false,
                    }),
                },
                RawSymbolClass::Variable => Symbol {
                    name: format!("&{}", raw.name),
                    module_name: String::new(),
                    agent: None,
                    linkage: SymbolLinkage::Program,
                    is_definition: true,
                    kind: SymbolKind::Variable(VariableSymbol {
                        address,
                        segment: VariableSegment::Global,
                        alignment: 0,
                        size: 0,
                        is_const: false,
                    }),
                },
            };

            let idx = inner.symbols.len();
            inner.by_name.entry(symbol.name.clone()).or_insert(idx);
            inner.symbols.push(symbol);
        }

        inner.descriptors.extend(descriptors);
        Ok(())
    }

    /// Registers an `IndirectFunctionCall` symbol directly — used by
    /// agents that expose function pointers not backed by an ELF symbol
    /// (e.g. built-in intrinsics), rather than through `load_code_object`,
    /// which only ever classifies kernels and variables.
    pub fn define_indirect_function(
        &self,
        name: impl Into<String>,
        function_object: u64,
        call_convention: u32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen {
            return Err(Status::FrozenExecutable);
        }
        let symbol = Symbol {
            name: name.into(),
            module_name: String::new(),
            agent: None,
            linkage: SymbolLinkage::Program,
            is_definition: true,
            kind: SymbolKind::IndirectFunctionCall(IndirectFunctionSymbol { function_object, call_convention }),
        };
        let idx = inner.symbols.len();
        inner.by_name.entry(symbol.name.clone()).or_insert(idx);
        inner.symbols.push(symbol);
        Ok(())
    }
}

/// Resolves `kernel_object` handles dispatched in a `KERNEL_DISPATCH`
/// packet back to the `Symbol` that owns them. Kernel handles are minted
/// through the runtime's `HandleRegistry` rather than being their own
/// address (unlike signals), so this is a thin registry lookup.
pub fn resolve_kernel(registry: &crate::handle::HandleRegistry, handle: Handle) -> Option<Arc<Symbol>> {
    registry.get::<Symbol>(handle)
}
