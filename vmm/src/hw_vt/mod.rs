//! The module containing the seam between the mode-independent VMM core and
//! the hardware virtualization extension.
//!
//! Everything that must execute a privileged instruction lives behind
//! [`HardwareVt`]: enabling the extension, the VMRUN round trip, masking host
//! interrupts around it, FPU image moves and the cycle counter. The rest of
//! the VMM manipulates in-memory state only, which is what makes the
//! entry/exit machinery testable with the scripted [`mock::MockVt`] backend.

pub mod svm;

#[cfg(test)]
pub(crate) mod mock;

use crate::{cpu::GuestRegs, error::Result, fpu::FpuArch, vmcb::Vmcb};
use core::any::Any;

/// The interface to the hardware virtualization extension for one vCPU.
pub trait HardwareVt: Send {
    /// Enables the extension on the calling physical CPU and claims the
    /// host state-save area. Must be called on the pCPU that will run this
    /// vCPU, before the first [`HardwareVt::launch`].
    fn enable(&mut self) -> Result<()>;

    /// Runs the guest described by `vmcb` until #VMEXIT. GPRs not managed
    /// by the control block are loaded from and stored back to `regs`.
    fn launch(&mut self, vmcb: &mut Vmcb, regs: &mut GuestRegs);

    /// Disables host interrupt delivery (the entry-critical section).
    fn disable_host_interrupts(&self);

    /// Re-enables host interrupt delivery after exit processing.
    fn enable_host_interrupts(&self);

    /// Reads the host timestamp counter.
    fn read_tsc(&self) -> u64;

    /// Stores the live FPU/SSE state into `area`.
    fn fpu_save(&self, area: &mut FpuArch);

    /// Loads the FPU/SSE state from `area` onto hardware.
    fn fpu_restore(&self, area: &FpuArch);

    /// Test support: allows downcasting to a concrete backend.
    fn as_any(&self) -> &dyn Any;
}
