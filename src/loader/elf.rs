//! ELF64 parsing: `.phsa.desc.<name>` descriptor sections and the
//! symbol-table walk that classifies each entry as a kernel, a variable,
//! or something to be skipped.
//!
//! Grounded on `FinalizedProgram::FinalizedProgram` (descriptor section
//! harvesting) and `ELFExecutable::LoadCodeObject` (the symbol-table
//! classification rules), ported from libelf's section-by-section walk
//! onto the `object` crate's `File`/`Symbol` API.

use hashbrown::HashMap;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind as ObjSymbolKind};

use crate::error::{Result, Status};
use crate::loader::descriptor::FunctionDescriptor;

pub const DESC_SECTION_PREFIX: &str = ".phsa.desc.";
pub const KERNEL_PREFIX: &str = "phsa_kernel.";
pub const GCCBRIG_PREFIX: &str = "gccbrig.";
pub const HOST_DEF_PREFIX: &str = "__phsa.host_def.";

const SKIPPED_EXACT: &[&str] = &[
    "frame_dummy",
    "__do_global_dtors_aux_fini_array_entry",
    "__frame_dummy_init_array_entry",
    "__FRAME_END__",
    "__dso_handle",
    "_DYNAMIC",
    "__TMC_END__",
    "_GLOBAL_OFFSET_TABLE_",
    "register_tm_clones",
    "deregister_tm_clones",
];

/// Whether a symbol name should be skipped entirely, per
/// `ELFExecutable::LoadCodeObject`'s filter: empty names, the fixed
/// compiler-internal set, and dotted/"anonymous" names that are neither
/// a `phsa_kernel.` kernel nor a `gccbrig.`-prefixed mangled name.
pub fn should_skip_symbol(name: &str, is_phsa_kernel: bool) -> bool {
    if name.is_empty() {
        return true;
    }
    if SKIPPED_EXACT.contains(&name) {
        return true;
    }
    if !is_phsa_kernel && name.len() > 7 && !name.starts_with(GCCBRIG_PREFIX) && name.contains('.') {
        return true;
    }
    false
}

pub fn is_phsa_kernel(name: &str) -> bool {
    name.len() > KERNEL_PREFIX.len() && name.starts_with(KERNEL_PREFIX)
}

/// Raw classification of one ELF symbol table entry, before it is
/// turned into a `Symbol` (which additionally needs the loaded image's
/// resolved address, supplied by the `DynamicImage`).
#[derive(Debug, Clone)]
pub enum RawSymbolClass {
    /// A compiler-recognised kernel, with its matching descriptor.
    DescribedKernel(FunctionDescriptor),
    /// A `phsa_kernel.`-prefixed kernel with no emitted descriptor.
    PhsaKernel,
    /// A data object (`STT_OBJECT`).
    Variable,
}

#[derive(Debug, Clone)]
pub struct RawSymbol {
    pub name: String,
    pub class: RawSymbolClass,
}

pub struct ParsedCodeObject {
    pub descriptors: HashMap<String, FunctionDescriptor>,
    pub symbols: Vec<RawSymbol>,
}

/// Parses `elf_bytes` into descriptor sections plus the classified
/// symbol-table walk. Does not resolve addresses — that happens against
/// a `DynamicImage` once the code object has actually been loaded.
pub fn parse_code_object(elf_bytes: &[u8]) -> Result<ParsedCodeObject> {
    let file = object::File::parse(elf_bytes).map_err(|_| Status::InvalidCodeObject)?;

    let mut descriptors = HashMap::new();
    for section in file.sections() {
        let name = match section.name() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if let Some(func_name) = name.strip_prefix(DESC_SECTION_PREFIX) {
            let data = section.data().map_err(|_| Status::InvalidCodeObject)?;
            let descriptor = FunctionDescriptor::from_bytes(data)?;
            descriptors.insert(func_name.to_string(), descriptor);
        }
    }

    let mut symbols = Vec::new();
    for symbol in file.symbols() {
        let name = match symbol.name() {
            Ok(n) if !n.is_empty() => n,
            _ => continue,
        };

        let phsa_kernel = is_phsa_kernel(name);
        if should_skip_symbol(name, phsa_kernel) {
            continue;
        }

        let descriptor = descriptors.get(name).copied();
        let class = if let Some(d) = descriptor.filter(|d| d.is_kernel != 0) {
            RawSymbolClass::DescribedKernel(d)
        } else if phsa_kernel {
            RawSymbolClass::PhsaKernel
        } else if symbol.kind() == ObjSymbolKind::Data {
            RawSymbolClass::Variable
        } else {
            continue;
        };

        log::trace!("kept code-object symbol {}", demangle_for_log(name));
        symbols.push(RawSymbol { name: name.to_string(), class });
    }

    Ok(ParsedCodeObject { descriptors, symbols })
}

/// Best-effort demangling for trace logging only: never surfaces an
/// error, falls back to the raw name when `rustc_demangle` can't parse it.
fn demangle_for_log(name: &str) -> String {
    let demangled = rustc_demangle::demangle(name).to_string();
    if demangled == name {
        name.to_string()
    } else {
        demangled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_empty_and_internal_names() {
        assert!(should_skip_symbol("", false));
        assert!(should_skip_symbol("_DYNAMIC", false));
        assert!(should_skip_symbol("frame_dummy", false));
    }

    #[test]
    fn skips_dotted_non_gccbrig_non_kernel_names() {
        assert!(should_skip_symbol("some.internal.compilerthing", false));
    }

    #[test]
    fn keeps_gccbrig_prefixed_names() {
        assert!(!should_skip_symbol("gccbrig.module.kernel_impl", false));
    }

    #[test]
    fn keeps_phsa_kernel_names_even_if_dotted() {
        assert!(!should_skip_symbol("phsa_kernel.my.kernel", true));
    }

    #[test]
    fn detects_phsa_kernel_prefix() {
        assert!(is_phsa_kernel("phsa_kernel.foo"));
        assert!(!is_phsa_kernel("foo"));
    }

    #[test]
    fn rejects_bare_prefix_with_no_name() {
        assert!(!is_phsa_kernel(KERNEL_PREFIX));
    }
}
