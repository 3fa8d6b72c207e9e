//! Synthetic ELF fixtures for loader/executable integration tests, built
//! with `object::write` instead of depending on an external BRIG
//! compiler to produce real finalized code objects.

use std::mem;
use std::slice;

use object::write::{Object, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};

use phsa_rt::loader::FunctionDescriptor;

const KERNEL_PREFIX: &str = "phsa_kernel.";

fn descriptor_bytes(d: &FunctionDescriptor) -> Vec<u8> {
    let ptr = d as *const FunctionDescriptor as *const u8;
    unsafe { slice::from_raw_parts(ptr, mem::size_of::<FunctionDescriptor>()) }.to_vec()
}

/// Accumulates kernel/variable symbols into one synthetic ELF object.
/// Symbol addresses recorded in the object itself are never read by the
/// loader — they're resolved against whatever `DynamicImage` the test
/// registers instead — so the section contents here are just filler.
pub struct ElfBuilder {
    obj: Object<'static>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        ElfBuilder {
            obj: Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little),
        }
    }

    /// Adds a `phsa_kernel.<name>` text symbol, optionally with a matching
    /// `.phsa.desc.<symbol>` descriptor section.
    pub fn add_kernel(mut self, name: &str, descriptor: Option<FunctionDescriptor>) -> Self {
        let full_name = format!("{KERNEL_PREFIX}{name}");

        let text_segment = self.obj.segment_name(object::write::StandardSegment::Text).to_vec();
        let text = self.obj.add_section(text_segment, b".text".to_vec(), SectionKind::Text);
        let offset = self.obj.append_section_data(text, &[0u8; 4], 1);

        self.obj.add_symbol(Symbol {
            name: full_name.clone().into_bytes(),
            value: offset,
            size: 4,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });

        if let Some(desc) = descriptor {
            let desc_name = format!(".phsa.desc.{full_name}");
            let desc_section = self.obj.add_section(Vec::new(), desc_name.into_bytes(), SectionKind::Data);
            self.obj.append_section_data(desc_section, &descriptor_bytes(&desc), 1);
        }

        self
    }

    /// Adds a plain `STT_OBJECT` data symbol named `name`.
    pub fn add_variable(mut self, name: &str) -> Self {
        let data_segment = self.obj.segment_name(object::write::StandardSegment::Data).to_vec();
        let data = self.obj.add_section(data_segment, b".data".to_vec(), SectionKind::Data);
        let offset = self.obj.append_section_data(data, &[0u8; 8], 8);

        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: 8,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(data),
            flags: SymbolFlags::None,
        });

        self
    }

    pub fn build(self) -> Vec<u8> {
        self.obj.write().expect("synthetic ELF object must serialize")
    }
}

/// A descriptor with every bound field zero (unset) except the ones the
/// caller asks for, matching the "0 means unconstrained" convention
/// `merge_control_directives` relies on.
pub fn kernel_descriptor(kernarg_segment_size: u32, is_kernel: bool) -> FunctionDescriptor {
    FunctionDescriptor {
        is_kernel: is_kernel as u32,
        kernarg_segment_size,
        kernarg_max_align: 8,
        group_segment_size: 0,
        private_segment_size: 0,
        max_dynamic_group_size: 0,
        max_flat_grid_size: 0,
        max_flat_workgroup_size: 0,
        required_grid_size: [0; 3],
        required_workgroup_size: [0; 3],
        required_dim: 0,
    }
}
