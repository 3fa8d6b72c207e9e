//! The packed per-kernel descriptor struct emitted into `.phsa.desc.<name>`
//! ELF sections, and the control-directive merge logic that patches it.
//!
//! Field set and merge semantics are taken from `FinalizedProgram::`
//! `loadAndCheckControlDirectives`: every field is "unset" at zero, and
//! a caller-supplied control directive either tightens an unset/non-
//! conflicting field or is rejected as a directive mismatch.

use crate::error::{Result, Status};

/// Mirrors the compiler-emitted `phsa_descriptor` C struct. `repr(C)`
/// because it is read directly out of raw section bytes via
/// `bytemuck`-free `ptr::read_unaligned`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FunctionDescriptor {
    pub is_kernel: u32,
    pub kernarg_segment_size: u32,
    pub kernarg_max_align: u16,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
    pub max_dynamic_group_size: u32,
    pub max_flat_grid_size: u64,
    pub max_flat_workgroup_size: u32,
    pub required_grid_size: [u64; 3],
    pub required_workgroup_size: [u32; 3],
    pub required_dim: u32,
}

impl FunctionDescriptor {
    /// Reads a descriptor out of a section's raw bytes. The section is
    /// required to hold at least `size_of::<FunctionDescriptor>()` bytes;
    /// anything shorter is an invalid code object.
    pub fn from_bytes(bytes: &[u8]) -> Result<FunctionDescriptor> {
        if bytes.len() < std::mem::size_of::<FunctionDescriptor>() {
            return Err(Status::InvalidCodeObject);
        }
        // SAFETY: length checked above; FunctionDescriptor has no
        // padding-sensitive invariants (all-integer fields).
        Ok(unsafe { (bytes.as_ptr() as *const FunctionDescriptor).read_unaligned() })
    }
}

/// A subset of `hsa_ext_control_directives_t`'s numeric fields — the ones
/// that get merged into kernel descriptors. Non-zero means "the caller is
/// constraining this field."
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlDirectives {
    pub max_dynamic_group_size: u32,
    pub max_flat_grid_size: u64,
    pub max_flat_workgroup_size: u32,
    pub required_grid_size: [u64; 3],
    pub required_workgroup_size: [u32; 3],
    pub required_dim: u32,
}

macro_rules! merge_bound {
    ($desc:expr, $dir:expr, $field:ident) => {
        if $dir.$field > 0 {
            if $desc.$field > 0 && $desc.$field < $dir.$field {
                return Err(Status::DirectiveMismatch);
            }
            $desc.$field = $dir.$field;
        }
    };
}

macro_rules! merge_exact {
    ($desc:expr, $dir:expr, $field:ident) => {
        if $dir.$field > 0 {
            if $desc.$field > 0 && $desc.$field != $dir.$field {
                return Err(Status::DirectiveMismatch);
            }
            $desc.$field = $dir.$field;
        }
    };
}

/// Merges `directives` into `descriptor` in place, per-field, using `<`
/// for bound fields and `!=` for exact-match fields. Fails the whole
/// merge on the first conflicting field.
pub fn merge_control_directives(descriptor: &mut FunctionDescriptor, directives: &ControlDirectives) -> Result<()> {
    merge_bound!(descriptor, directives, max_dynamic_group_size);
    merge_bound!(descriptor, directives, max_flat_grid_size);
    merge_bound!(descriptor, directives, max_flat_workgroup_size);
    for i in 0..3 {
        if directives.required_grid_size[i] > 0 {
            if descriptor.required_grid_size[i] > 0
                && descriptor.required_grid_size[i] != directives.required_grid_size[i]
            {
                return Err(Status::DirectiveMismatch);
            }
            descriptor.required_grid_size[i] = directives.required_grid_size[i];
        }
        if directives.required_workgroup_size[i] > 0 {
            if descriptor.required_workgroup_size[i] > 0
                && descriptor.required_workgroup_size[i] != directives.required_workgroup_size[i]
            {
                return Err(Status::DirectiveMismatch);
            }
            descriptor.required_workgroup_size[i] = directives.required_workgroup_size[i];
        }
    }
    merge_exact!(descriptor, directives, required_dim);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accepts_tightening_bound() {
        let mut d = FunctionDescriptor { max_flat_workgroup_size: 256, ..Default::default() };
        let dirs = ControlDirectives { max_flat_workgroup_size: 128, ..Default::default() };
        assert!(merge_control_directives(&mut d, &dirs).is_ok());
        assert_eq!(d.max_flat_workgroup_size, 128);
    }

    #[test]
    fn merge_rejects_widening_bound() {
        let mut d = FunctionDescriptor { max_flat_workgroup_size: 128, ..Default::default() };
        let dirs = ControlDirectives { max_flat_workgroup_size: 256, ..Default::default() };
        assert_eq!(merge_control_directives(&mut d, &dirs), Err(Status::DirectiveMismatch));
    }

    #[test]
    fn merge_rejects_conflicting_exact_match() {
        let mut d = FunctionDescriptor { required_dim: 2, ..Default::default() };
        let dirs = ControlDirectives { required_dim: 3, ..Default::default() };
        assert_eq!(merge_control_directives(&mut d, &dirs), Err(Status::DirectiveMismatch));
    }

    #[test]
    fn descriptor_from_bytes_rejects_short_slice() {
        assert_eq!(FunctionDescriptor::from_bytes(&[0u8; 4]).unwrap_err(), Status::InvalidCodeObject);
    }
}
