//! Code-object loading: ELF parsing, the dynamic-image seam, and the
//! finalized-program container that ties the two together for
//! `Executable::load_code_object`.

pub mod descriptor;
pub mod elf;
pub mod image;

pub use descriptor::{merge_control_directives, ControlDirectives, FunctionDescriptor};
pub use elf::{parse_code_object, ParsedCodeObject, RawSymbol, RawSymbolClass};
pub use image::{DlopenImage, DynamicImage, MockImage};

use crate::error::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineModel {
    Small,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    Near,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Base,
    Full,
}

/// A code object: the serialisable unit clients hand to
/// `Executable::load_code_object` — an ELF blob plus the ISA/profile/
/// rounding/machine-model metadata it was finalized for. Mirrors
/// `FinalizedProgram`'s constructor arguments.
pub struct CodeObject {
    pub elf_bytes: Vec<u8>,
    pub isa: String,
    pub machine_model: MachineModel,
    pub profile: Profile,
    pub rounding_mode: RoundingMode,
}

impl CodeObject {
    /// `(size, elf_bytes, isa, rounding, profile, machine_model)` as a
    /// flat byte stream, per `DLFinalizedProgram::serializeTo`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.elf_bytes.len() + 64);
        buf.extend_from_slice(&(self.elf_bytes.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.elf_bytes);

        let isa_bytes = self.isa.as_bytes();
        buf.extend_from_slice(&(isa_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(isa_bytes);

        buf.push(match self.rounding_mode {
            RoundingMode::Near => 0,
            RoundingMode::Zero => 1,
        });
        buf.push(match self.profile {
            Profile::Base => 0,
            Profile::Full => 1,
        });
        buf.push(match self.machine_model {
            MachineModel::Small => 0,
            MachineModel::Large => 1,
        });
        buf
    }

    /// Rematerialises a `CodeObject` previously produced by
    /// [`CodeObject::serialize`]. The ELF bytes are handed back as an
    /// owned buffer; actually loading them into the process happens
    /// separately via [`DlopenImage::load`], which needs them on disk.
    pub fn deserialize(buf: &[u8]) -> Result<CodeObject> {
        let mut cursor = buf;
        let elf_len = take_u64(&mut cursor)? as usize;
        if cursor.len() < elf_len {
            return Err(Status::InvalidCodeObject);
        }
        let elf_bytes = cursor[..elf_len].to_vec();
        cursor = &cursor[elf_len..];

        let isa_len = take_u32(&mut cursor)? as usize;
        if cursor.len() < isa_len {
            return Err(Status::InvalidCodeObject);
        }
        let isa = String::from_utf8(cursor[..isa_len].to_vec()).map_err(|_| Status::InvalidCodeObject)?;
        cursor = &cursor[isa_len..];

        if cursor.len() < 3 {
            return Err(Status::InvalidCodeObject);
        }
        let rounding_mode = match cursor[0] {
            0 => RoundingMode::Near,
            1 => RoundingMode::Zero,
            _ => return Err(Status::InvalidCodeObject),
        };
        let profile = match cursor[1] {
            0 => Profile::Base,
            1 => Profile::Full,
            _ => return Err(Status::InvalidCodeObject),
        };
        let machine_model = match cursor[2] {
            0 => MachineModel::Small,
            1 => MachineModel::Large,
            _ => return Err(Status::InvalidCodeObject),
        };

        Ok(CodeObject { elf_bytes, isa, machine_model, profile, rounding_mode })
    }
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64> {
    if cursor.len() < 8 {
        return Err(Status::InvalidCodeObject);
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Status::InvalidCodeObject);
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

/// Normalises a symbol name the way `FinalizedProgram::findSymbol` does:
/// `::` becomes `.`, every `&` but the first is dropped, and a
/// module-qualified name gets `gccbrig.` inserted right after the
/// leading `&`.
pub fn normalize_symbol_name(name: &str) -> String {
    let has_module = name.contains("::");
    let mut normalized = name.replace("::", ".");

    if let Some(first_amp) = normalized.find('&') {
        let (before, after) = normalized.split_at(first_amp + 1);
        let after_stripped: String = after.chars().filter(|&c| c != '&').collect();
        normalized = format!("{before}{after_stripped}");
    }

    if has_module {
        let insert_at = if normalized.starts_with('&') { 1 } else { 0 };
        normalized.insert_str(insert_at, GCCBRIG_INSERT);
    }
    normalized
}

const GCCBRIG_INSERT: &str = "gccbrig.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_replaces_double_colon_with_dot() {
        assert_eq!(normalize_symbol_name("&foo::bar"), "&gccbrig.foo.bar");
    }

    #[test]
    fn normalize_strips_extra_ampersands() {
        assert_eq!(normalize_symbol_name("&foo&bar"), "&foobar");
    }

    #[test]
    fn normalize_leaves_plain_names_alone() {
        assert_eq!(normalize_symbol_name("&plain_kernel"), "&plain_kernel");
    }

    #[test]
    fn code_object_roundtrips_through_serialize() {
        let obj = CodeObject {
            elf_bytes: vec![0x7f, b'E', b'L', b'F', 1, 2, 3],
            isa: "host-isa".to_string(),
            machine_model: MachineModel::Large,
            profile: Profile::Full,
            rounding_mode: RoundingMode::Near,
        };
        let bytes = obj.serialize();
        let back = CodeObject::deserialize(&bytes).unwrap();
        assert_eq!(back.elf_bytes, obj.elf_bytes);
        assert_eq!(back.isa, obj.isa);
        assert_eq!(back.machine_model, obj.machine_model);
        assert_eq!(back.profile, obj.profile);
        assert_eq!(back.rounding_mode, obj.rounding_mode);
    }
}
