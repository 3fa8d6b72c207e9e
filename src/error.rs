//! Runtime status codes.
//!
//! `Status` plays the role of `hsa_status_t`: every
//! validation and lifecycle failure the core can observe is represented as
//! a variant here and returned synchronously. Packet-processing failures
//! are *not* propagated through this type — they are delivered to the
//! producer-registered queue callback (see [`crate::queue::Queue::execute_callback`],
//! registered via [`crate::queue::Queue::set_callback`]).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Status>;

/// The kinds of failure the core must distinguish, per the error-handling
/// design: lifecycle, validation, packet-processing and finalisation
/// errors each have their own propagation policy even though they share
/// this one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error("runtime reference count overflowed")]
    RefCountOverflow,
    #[error("operation not permitted on a frozen executable")]
    FrozenExecutable,

    #[error("invalid agent handle")]
    InvalidAgent,
    #[error("invalid queue handle")]
    InvalidQueue,
    #[error("invalid signal handle")]
    InvalidSignal,
    #[error("invalid memory region handle")]
    InvalidRegion,
    #[error("invalid executable handle")]
    InvalidExecutable,
    #[error("invalid code object")]
    InvalidCodeObject,
    #[error("invalid ISA")]
    InvalidIsa,
    #[error("invalid symbol name")]
    InvalidSymbolName,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid index")]
    InvalidIndex,
    #[error("invalid allocation")]
    InvalidAllocation,
    #[error("out of resources")]
    OutOfResources,
    #[error("invalid queue creation arguments")]
    InvalidQueueCreation,

    #[error("invalid packet format")]
    InvalidPacketFormat,
    #[error("incompatible arguments")]
    IncompatibleArguments,

    #[error("invalid program")]
    InvalidProgram,
    #[error("invalid or incompatible module")]
    InvalidModule,
    #[error("module already included")]
    ModuleAlreadyIncluded,
    #[error("symbol mismatch")]
    SymbolMismatch,
    #[error("control directive mismatch")]
    DirectiveMismatch,
    #[error("finalisation failed")]
    FinalizationFailed,
}

impl Status {
    /// Whether this status represents success. There is no `Success`
    /// variant in this enum — absence of an `Err` is success — but the
    /// ABI shim needs a numeric code for the "all good" case too.
    pub const SUCCESS: i32 = 0;

    /// Stable numeric encoding for the C ABI shim. Never renumber an
    /// existing variant; only append.
    pub fn code(self) -> i32 {
        match self {
            Status::NotInitialized => 1,
            Status::RefCountOverflow => 2,
            Status::FrozenExecutable => 3,
            Status::InvalidAgent => 4,
            Status::InvalidQueue => 5,
            Status::InvalidSignal => 6,
            Status::InvalidRegion => 7,
            Status::InvalidExecutable => 8,
            Status::InvalidCodeObject => 9,
            Status::InvalidIsa => 10,
            Status::InvalidSymbolName => 11,
            Status::InvalidArgument => 12,
            Status::InvalidIndex => 13,
            Status::InvalidAllocation => 14,
            Status::OutOfResources => 15,
            Status::InvalidQueueCreation => 16,
            Status::InvalidPacketFormat => 17,
            Status::IncompatibleArguments => 18,
            Status::InvalidProgram => 19,
            Status::InvalidModule => 20,
            Status::ModuleAlreadyIncluded => 21,
            Status::SymbolMismatch => 22,
            Status::DirectiveMismatch => 23,
            Status::FinalizationFailed => 24,
        }
    }
}
