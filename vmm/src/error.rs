//! The module containing the crate-wide error type.
//!
//! Every fallible operation in the core returns [`Result`]. Exit handlers
//! propagate errors up to the run loop, which marks the VM as `Error` and
//! stops its cores; nothing in this crate unwinds across the VM-entry
//! boundary.

use thiserror_no_std::Error;

/// Errors surfaced by the VMM core.
///
/// The variants fall into the four classes the design distinguishes:
/// guest-faulted conditions that were not recoverable, host resource
/// exhaustion, contract violations inside the VMM, and configuration errors
/// rejected before the VM ever runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmmError {
    /// A guest physical address had no backing region.
    #[error("guest physical address {0:#x} is not mapped")]
    NotMapped(u64),

    /// A region insert would overlap an existing region visible to the same
    /// core.
    #[error("memory region overlaps an existing region")]
    RegionOverlap,

    /// A region with `guest_end <= guest_start` or a base-region flag was
    /// passed to the dynamic region interface.
    #[error("invalid memory region")]
    InvalidRegion,

    /// The host could not satisfy a page allocation.
    #[error("host page allocation failed")]
    OutOfHostMemory,

    /// A page-table page (or a mapped host frame) crossed the 4 GiB boundary
    /// while building 32-bit non-PAE tables.
    #[error("address {0:#x} unusable for 32bit page tables")]
    Above4G(u64),

    /// The LAPIC IRQ submission queue is at capacity.
    #[error("IRQ submission queue is full, dropping vector {0}")]
    QueueFull(u32),

    /// A vector outside the range valid for the operation was used.
    #[error("invalid interrupt vector {0}")]
    InvalidVector(u32),

    /// An IPI named a physical APIC id that is not registered.
    #[error("no LAPIC with id {0}")]
    UnknownApicId(u32),

    /// SMI or a reserved IPI delivery mode was requested.
    #[error("unsupported IPI delivery mode {0}")]
    UnsupportedIpi(u32),

    /// A hooked MSR rejected the access.
    #[error("MSR {0:#x} access rejected")]
    MsrAccess(u32),

    /// The guest triggered a VM exit the dispatcher does not handle.
    #[error("unhandled VM exit {0:#x}")]
    UnhandledExit(u64),

    /// The intercepted instruction could not be decoded.
    #[error("could not decode intercepted instruction")]
    DecodeFailed,

    /// The guest entered the shutdown state (triple fault).
    #[error("guest entered shutdown state")]
    GuestShutdown,

    /// An internal invariant check fired. The VM is no longer trustworthy.
    #[error("invariant violated: {0}")]
    Contract(&'static str),

    /// The machine description was rejected at VM creation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// The operation is not valid in the VM's current run state.
    #[error("operation invalid in current run state")]
    BadRunState,

    /// A device model failed.
    #[error("device error: {0}")]
    Device(&'static str),

    /// A checkpoint stream failed validation.
    #[error("malformed checkpoint stream")]
    BadCheckpoint,
}

/// A type alias for `Result<T, VmmError>`.
pub type Result<T> = core::result::Result<T, VmmError>;
