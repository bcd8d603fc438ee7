//! The module containing the lazy FPU save/restore machinery.
//!
//! The guest FPU image is only loaded onto hardware once the guest actually
//! touches the FPU. On entry, hardware CR0.TS is kept set while the guest
//! image is not loaded, so the first FPU instruction takes #NM and exits.
//! That exit swaps the host and guest arch buffers, clears the hardware TS
//! bit and re-enters; the instruction then completes without another exit.

use crate::{cpu::Vcpu, error::Result, excp::GPF_EXCEPTION};

/// The architectural x87/SSE state as FXSAVE writes it, plus the XSAVE
/// header for potential future use.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct FpuArch {
    pub fxstate: [u8; 512],
    pub xsave_hdr: [u8; 64],
}

impl Default for FpuArch {
    fn default() -> Self {
        Self {
            fxstate: [0; 512],
            xsave_hdr: [0; 64],
        }
    }
}

impl core::fmt::Debug for FpuArch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FpuArch { .. }")
    }
}

/// x87 and extended-state initialization value for XCR0.
pub const XCR0_INIT_STATE: u64 = 0x1;

const CR0_TS: u64 = 1 << 3;
const NM_INTERCEPT_BIT: u32 = 1 << 7;

/// Per-vCPU FPU state: the guest's architectural buffer, a slot for the host
/// state displaced while the guest image is live, and the activation flags.
#[derive(Debug, Default)]
pub struct FpuState {
    pub guest_xcr0: u64,
    pub host_xcr0: u64,

    /// Set while the guest FPU image is loaded on hardware.
    pub fpu_activated: bool,
    /// The TS value the guest last wrote; what CR0 reads must reflect.
    pub guest_ts: bool,

    pub arch_state: FpuArch,
    host_state: FpuArch,
}

impl FpuState {
    pub(crate) fn new() -> Self {
        Self {
            guest_xcr0: XCR0_INIT_STATE,
            ..Self::default()
        }
    }
}

/// Initializes the FPU trap state for a fresh core. The guest starts with
/// no FPU image loaded, so the #NM trap is armed.
pub fn fpu_init(core: &mut Vcpu) {
    core.fpu.guest_xcr0 = XCR0_INIT_STATE;
    core.fpu.fpu_activated = false;
    core.fpu.guest_ts = core.ctrl_regs.cr0 & CR0_TS != 0;
}

/// Called immediately before every VM entry, after host interrupts are
/// disabled and before the register image is serialized to the VMCB.
pub fn fpu_on_entry(core: &mut Vcpu) {
    if core.fpu.fpu_activated {
        // Guest image is live; the guest sees its own TS semantics.
        if core.fpu.guest_ts {
            core.ctrl_regs.cr0 |= CR0_TS;
        } else {
            core.ctrl_regs.cr0 &= !CR0_TS;
        }
        core.vmcb.control.intercept_exception &= !NM_INTERCEPT_BIT;
    } else {
        // Arm the #NM trap: any guest FPU use must exit so we can load the
        // guest image first.
        core.ctrl_regs.cr0 |= CR0_TS;
        core.vmcb.control.intercept_exception |= NM_INTERCEPT_BIT;
    }
}

/// Loads the guest FPU image onto hardware, displacing the host state.
pub fn fpu_activate(core: &mut Vcpu) {
    if core.fpu.fpu_activated {
        return;
    }

    core.vt.fpu_save(&mut core.fpu.host_state);
    core.vt.fpu_restore(&core.fpu.arch_state);
    core.fpu.fpu_activated = true;

    // The trap served its purpose; the faulting instruction re-executes
    // with TS clear (unless the guest itself holds TS).
    if !core.fpu.guest_ts {
        core.ctrl_regs.cr0 &= !CR0_TS;
    }
    core.vmcb.control.intercept_exception &= !NM_INTERCEPT_BIT;
}

/// Saves the guest FPU image back to its buffer and restores the host state.
pub fn fpu_deactivate(core: &mut Vcpu) {
    if !core.fpu.fpu_activated {
        return;
    }

    core.vt.fpu_save(&mut core.fpu.arch_state);
    core.vt.fpu_restore(&core.fpu.host_state);
    core.fpu.fpu_activated = false;
}

/// Handles the #NM exit the armed trap produces: activate and re-execute.
pub fn handle_nm_exit(core: &mut Vcpu) {
    fpu_activate(core);
}

/// Handles the XSETBV exit. Only XCR0 exists; anything else is a #GP the
/// guest earned.
pub fn handle_xsetbv(core: &mut Vcpu) -> Result<()> {
    const XSETBV_LEN: u64 = 3;

    if core.regs.rcx & 0xffff_ffff != 0 {
        core.shared.excp.raise_exception_with_error(GPF_EXCEPTION, 0)?;
        return Ok(());
    }

    let value = (core.regs.rdx << 32) | (core.regs.rax & 0xffff_ffff);
    if value & XCR0_INIT_STATE == 0 {
        // x87 state can never be cleared.
        core.shared.excp.raise_exception_with_error(GPF_EXCEPTION, 0)?;
        return Ok(());
    }

    core.fpu.guest_xcr0 = value;
    let nrip = core.vmcb.control.nrip;
    core.rip = if nrip != 0 { nrip } else { core.rip + XSETBV_LEN };
    Ok(())
}

/// Tells the FPU machinery about a guest-visible TS change (CR0 writes and
/// CLTS funnel through here).
pub fn set_guest_ts(core: &mut Vcpu, ts: bool) -> Result<()> {
    core.fpu.guest_ts = ts;
    if !ts {
        // CLTS semantics: the guest expects to use the FPU now.
        fpu_activate(core);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{PagingMode, Vcpu};
    use crate::hw_vt::mock::MockVt;
    use alloc::boxed::Box;

    fn test_vcpu() -> Vcpu {
        Vcpu::new(0, 0, 0, PagingMode::Nested, Box::new(MockVt::new()))
    }

    #[test]
    fn first_entry_arms_nm_trap() {
        let mut core = test_vcpu();
        fpu_init(&mut core);
        fpu_on_entry(&mut core);
        assert_ne!(core.ctrl_regs.cr0 & CR0_TS, 0);
        assert_ne!(core.vmcb.control.intercept_exception & NM_INTERCEPT_BIT, 0);
    }

    #[test]
    fn nm_exit_activates_and_disarms() {
        let mut core = test_vcpu();
        fpu_init(&mut core);
        fpu_on_entry(&mut core);

        core.fpu.arch_state.fxstate[0] = 0xaa;
        handle_nm_exit(&mut core);

        assert!(core.fpu.fpu_activated);
        assert_eq!(core.ctrl_regs.cr0 & CR0_TS, 0);
        assert_eq!(core.vmcb.control.intercept_exception & NM_INTERCEPT_BIT, 0);
        // The mock backend models hardware FPU load/store; the guest image
        // must now be the live one.
        let vt: &MockVt = core.vt.as_any().downcast_ref().unwrap();
        assert_eq!(vt.live_fpu()[0], 0xaa);

        // The subsequent entry must not re-arm the trap.
        fpu_on_entry(&mut core);
        assert_eq!(core.ctrl_regs.cr0 & CR0_TS, 0);
        assert_eq!(core.vmcb.control.intercept_exception & NM_INTERCEPT_BIT, 0);
    }

    #[test]
    fn deactivate_writes_guest_image_back() {
        let mut core = test_vcpu();
        fpu_init(&mut core);
        handle_nm_exit(&mut core);

        // Guest modifies FPU state while running.
        let vt: &MockVt = core.vt.as_any().downcast_ref().unwrap();
        vt.set_live_fpu(0, 0x55);

        fpu_deactivate(&mut core);
        assert!(!core.fpu.fpu_activated);
        assert_eq!(core.fpu.arch_state.fxstate[0], 0x55);
    }

    #[test]
    fn xsetbv_requires_xcr0_and_x87_bit() {
        let mut core = test_vcpu();
        core.regs.rcx = 0;
        core.regs.rax = 0x3;
        core.regs.rdx = 0;
        core.rip = 0x1000;
        handle_xsetbv(&mut core).unwrap();
        assert_eq!(core.fpu.guest_xcr0, 0x3);
        assert_eq!(core.rip, 0x1003);

        core.regs.rax = 0x2; // x87 bit clear
        handle_xsetbv(&mut core).unwrap();
        assert!(core.shared.excp.pending());
    }
}
