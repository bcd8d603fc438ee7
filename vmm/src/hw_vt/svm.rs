//! The module containing the [`Svm`] backend, which drives AMD-V hardware.
//!
//! See: 15.5 VMRUN Instruction

use super::HardwareVt;
use crate::{
    cpu::GuestRegs,
    error::{Result, VmmError},
    fpu::FpuArch,
    vmcb::Vmcb,
};
use alloc::boxed::Box;
use core::any::Any;
use log::trace;

const EFER_SVME: u64 = 1 << 12;
const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;
const CPUID_EXT_FEATURE_FN: u32 = 0x8000_0001;
const CPUID_ECX_SVM: u32 = 1 << 2;

/// The AMD-V backend for one vCPU. Owns the host state-save area the
/// processor fills on VMRUN, plus a scratch VMCB used to VMSAVE the host
/// segment state that VMRUN does not preserve.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Svm {
    #[derivative(Debug = "ignore")]
    host_state: Box<HostStateArea>,
    #[derivative(Debug = "ignore")]
    host_vmcb: Box<Vmcb>,
}

impl Svm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            host_state: Box::new(HostStateArea::default()),
            host_vmcb: Box::new(Vmcb::default()),
        }
    }

    /// Whether the current processor advertises SVM.
    #[must_use]
    pub fn is_supported() -> bool {
        x86::cpuid::cpuid!(CPUID_EXT_FEATURE_FN).ecx & CPUID_ECX_SVM != 0
    }
}

impl Default for Svm {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareVt for Svm {
    /// Enables SVM on the current processor and points VM_HSAVE_PA at this
    /// vCPU's host state-save area.
    ///
    /// See: 15.4 Enabling SVM
    fn enable(&mut self) -> Result<()> {
        if !Self::is_supported() {
            return Err(VmmError::Config("processor does not support SVM"));
        }

        // Safety: CPL0, and the MSRs exist on any SVM-capable part.
        unsafe {
            x86::msr::wrmsr(
                x86::msr::IA32_EFER,
                x86::msr::rdmsr(x86::msr::IA32_EFER) | EFER_SVME,
            );
            x86::msr::wrmsr(
                SVM_MSR_VM_HSAVE_PA,
                core::ptr::addr_of!(*self.host_state) as u64,
            );
        }
        trace!("SVM enabled on current processor");
        Ok(())
    }

    fn launch(&mut self, vmcb: &mut Vmcb, regs: &mut GuestRegs) {
        // The host runs identity-mapped, so the VMCB's virtual address is
        // also the physical address VMRUN wants.
        //
        // Safety: the VMCB is initialized, SVME is set, and GIF is clear
        // around the call (the run loop brackets this with clgi/stgi).
        unsafe {
            run_vm_svm(
                regs,
                core::ptr::addr_of_mut!(*vmcb),
                core::ptr::addr_of_mut!(*self.host_vmcb),
            );
        }
    }

    fn disable_host_interrupts(&self) {
        // Safety: CPL0 with SVME set.
        unsafe { core::arch::asm!("clgi", options(nomem, nostack)) };
    }

    fn enable_host_interrupts(&self) {
        // Safety: CPL0 with SVME set.
        unsafe { core::arch::asm!("stgi", options(nomem, nostack)) };
    }

    fn read_tsc(&self) -> u64 {
        // Safety: RDTSC is unprivileged here.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn fpu_save(&self, area: &mut FpuArch) {
        // Safety: the buffer is 64-byte aligned and 512 bytes of it are
        // writable, which is all FXSAVE64 requires.
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) area.fxstate.as_mut_ptr(), options(nostack));
        }
    }

    fn fpu_restore(&self, area: &FpuArch) {
        // Safety: same layout contract as `fpu_save`.
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) area.fxstate.as_ptr(), options(nostack));
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 4KB block of memory where the host state is saved to on VMRUN and loaded
/// from on #VMEXIT.
///
/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
#[repr(C, align(4096))]
struct HostStateArea([u8; 0x1000]);
const _: () = assert!(core::mem::size_of::<HostStateArea>() == 0x1000);

impl Default for HostStateArea {
    fn default() -> Self {
        Self([0; 4096])
    }
}

extern "C" {
    /// Runs the guest until #VMEXIT occurs. `regs` supplies and receives the
    /// GPRs the VMCB does not manage; `host_vmcb` is scratch space for the
    /// host segment state VMRUN does not preserve.
    fn run_vm_svm(regs: &mut GuestRegs, guest_vmcb: *mut Vmcb, host_vmcb: *mut Vmcb);
}
core::arch::global_asm!(include_str!("svm_run_vm.S"));
