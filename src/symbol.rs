//! Symbol table entries produced by the loader and held by an
//! `Executable`: a `Symbol`/`Variable`/`Kernel`/`IndirectFunctionCall`
//! hierarchy flattened into one tagged enum, since Rust favours an enum
//! over a class hierarchy with a per-kind registry mixin.

use crate::handle::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLinkage {
    Module,
    Program,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSegment {
    Global,
    Readonly,
    Private,
    Group,
}

#[derive(Debug, Clone)]
pub struct KernelSymbol {
    pub address: u64,
    pub kernarg_segment_size: u32,
    pub kernarg_segment_alignment: u32,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
    pub dynamic_call_stack: bool,
}

#[derive(Debug, Clone)]
pub struct VariableSymbol {
    pub address: u64,
    pub segment: VariableSegment,
    pub alignment: u32,
    pub size: u32,
    pub is_const: bool,
}

#[derive(Debug, Clone)]
pub struct IndirectFunctionSymbol {
    pub function_object: u64,
    pub call_convention: u32,
}

#[derive(Debug, Clone)]
pub enum SymbolKind {
    Kernel(KernelSymbol),
    Variable(VariableSymbol),
    IndirectFunctionCall(IndirectFunctionSymbol),
}

/// One entry of an `Executable`'s symbol table.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub module_name: String,
    pub agent: Option<Handle>,
    pub linkage: SymbolLinkage,
    pub is_definition: bool,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn kernel(&self) -> Option<&KernelSymbol> {
        match &self.kind {
            SymbolKind::Kernel(k) => Some(k),
            _ => None,
        }
    }

    pub fn variable(&self) -> Option<&VariableSymbol> {
        match &self.kind {
            SymbolKind::Variable(v) => Some(v),
            _ => None,
        }
    }
}
