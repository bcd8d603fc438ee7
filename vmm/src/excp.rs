//! The module containing the per-vCPU exception state.
//!
//! Exceptions raised by exit handlers (and NMIs raised by other cores via
//! the LAPIC) are parked here until the injection sequencer consumes them at
//! the next VM entry. The bitmaps are atomics so a remote core can deliver
//! an NMI without taking the target's vCPU lock.

use crate::error::{Result, VmmError};
use core::sync::atomic::{AtomicU32, Ordering};
use log::error;

/// Vector numbers for the exceptions the VMM raises itself.
pub const DE_EXCEPTION: u32 = 0x00;
pub const DB_EXCEPTION: u32 = 0x01;
pub const NMI_EXCEPTION: u32 = 0x02;
pub const BP_EXCEPTION: u32 = 0x03;
pub const UD_EXCEPTION: u32 = 0x06;
pub const NM_EXCEPTION: u32 = 0x07;
pub const DF_EXCEPTION: u32 = 0x08;
pub const GPF_EXCEPTION: u32 = 0x0d;
pub const PF_EXCEPTION: u32 = 0x0e;
pub const MC_EXCEPTION: u32 = 0x12;

/// Pending-exception bitmaps plus one error code slot per vector.
///
/// Invariant: a bit set in `pending` is consumed by the injection sequencer
/// before the next VM entry completes.
#[derive(Debug)]
pub struct ExcpState {
    pending: AtomicU32,
    has_error: AtomicU32,
    error_codes: [AtomicU32; 32],
}

impl ExcpState {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            has_error: AtomicU32::new(0),
            error_codes: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Marks an exception pending for the next entry.
    pub fn raise_exception(&self, vector: u32) -> Result<()> {
        self.raise(vector, None)
    }

    /// Marks an exception with an error code pending for the next entry.
    pub fn raise_exception_with_error(&self, vector: u32, error_code: u32) -> Result<()> {
        self.raise(vector, Some(error_code))
    }

    /// Raises a non-maskable interrupt. NMIs ride the exception bitmap on
    /// vector 2 but are injected with their own hardware event type.
    pub fn raise_nmi(&self) -> Result<()> {
        self.raise(NMI_EXCEPTION, None)
    }

    fn raise(&self, vector: u32, error_code: Option<u32>) -> Result<()> {
        if vector >= 32 {
            return Err(VmmError::InvalidVector(vector));
        }

        let bit = 1u32 << vector;
        if self.pending.load(Ordering::Acquire) & bit != 0 {
            // Exception stacking is not modeled; the second raise is lost,
            // which matches an interrupt controller dropping a coalesced
            // event, but is worth a complaint.
            error!("exception {vector} raised while already pending");
            return Err(VmmError::Contract("exception already pending"));
        }

        if let Some(code) = error_code {
            self.error_codes[vector as usize].store(code, Ordering::Relaxed);
            let _ = self.has_error.fetch_or(bit, Ordering::AcqRel);
        }
        let _ = self.pending.fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    /// Whether any exception awaits injection.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// The lowest pending vector. Lower vector numbers win; this is the
    /// order the sequencer consumes them in.
    #[must_use]
    pub fn next_pending(&self) -> Option<u32> {
        let map = self.pending.load(Ordering::Acquire);
        if map == 0 {
            None
        } else {
            Some(map.trailing_zeros())
        }
    }

    /// Whether the pending vector carries an error code.
    #[must_use]
    pub fn has_error(&self, vector: u32) -> bool {
        self.has_error.load(Ordering::Acquire) & (1 << vector) != 0
    }

    /// The error code recorded for `vector`.
    #[must_use]
    pub fn error_code(&self, vector: u32) -> u32 {
        self.error_codes[(vector & 31) as usize].load(Ordering::Relaxed)
    }

    /// Consumes `vector` once the sequencer has placed it in the hardware
    /// injection field.
    pub fn consume(&self, vector: u32) {
        let bit = !(1u32 << vector);
        let _ = self.pending.fetch_and(bit, Ordering::AcqRel);
        let _ = self.has_error.fetch_and(bit, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_consume() {
        let state = ExcpState::new();
        assert!(!state.pending());

        state.raise_exception_with_error(GPF_EXCEPTION, 0).unwrap();
        assert!(state.pending());
        assert_eq!(state.next_pending(), Some(GPF_EXCEPTION));
        assert!(state.has_error(GPF_EXCEPTION));

        state.consume(GPF_EXCEPTION);
        assert!(!state.pending());
        assert!(!state.has_error(GPF_EXCEPTION));
    }

    #[test]
    fn lowest_vector_first() {
        let state = ExcpState::new();
        state.raise_exception(PF_EXCEPTION).unwrap();
        state.raise_nmi().unwrap();
        assert_eq!(state.next_pending(), Some(NMI_EXCEPTION));
        state.consume(NMI_EXCEPTION);
        assert_eq!(state.next_pending(), Some(PF_EXCEPTION));
    }

    #[test]
    fn double_raise_is_rejected() {
        let state = ExcpState::new();
        state.raise_exception(UD_EXCEPTION).unwrap();
        assert!(state.raise_exception(UD_EXCEPTION).is_err());
    }

    #[test]
    fn error_code_round_trips() {
        let state = ExcpState::new();
        state.raise_exception_with_error(PF_EXCEPTION, 0b10).unwrap();
        assert_eq!(state.error_code(PF_EXCEPTION), 0b10);
        assert!(!state.has_error(NMI_EXCEPTION));
    }
}
