//! The module containing the control-register interception handlers.
//!
//! Under shadow paging the guest must never see the CR0/CR3 values hardware
//! actually runs with, and every paging-relevant change has to re-root or
//! flush the shadow tree. These handlers maintain both views: the guest
//! copies record exactly what the guest wrote (with the few architectural
//! constants forced), while the hardware copies carry the virtualization
//! overrides: paging always on, write-protect forced while the guest runs
//! untranslated, EFER long-mode bits latched to match.
//!
//! Under nested paging the writes mostly pass through; the hardware walks
//! the guest's own tree.

use crate::{
    cpu::{CpuMode, MemMode, PagingMode, Vcpu},
    decode::{decode_cr_op, fetch_instr, CrOp},
    error::{Result, VmmError},
    excp::GPF_EXCEPTION,
    fpu,
    msr::MsrHandler,
    paging::{direct, shadow},
    vm::Vm,
};
use log::{debug, error, trace};

const CR0_PE: u64 = 1 << 0;
const CR0_TS: u64 = 1 << 3;
const CR0_ET: u64 = 1 << 4;
const CR0_WP: u64 = 1 << 16;
const CR0_PG: u64 = 1 << 31;

const CR4_PSE: u64 = 1 << 4;
const CR4_PAE: u64 = 1 << 5;
const CR4_PGE: u64 = 1 << 7;

const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const EFER_SVME: u64 = 1 << 12;

/// Decode-assist: EXITINFO1 bit 63 marks a MOV-CR intercept with the GPR
/// number in the low bits.
const EXITINFO1_MOV_CR: u64 = 1 << 63;

/// Recovers the instruction behind a CRn intercept, preferring the
/// hardware's decode assist over parsing bytes.
fn resolve_cr_op(vm: &Vm, core: &Vcpu, exit_info1: u64, is_write: bool, cr: u8) -> Result<(CrOp, u64)> {
    if exit_info1 & EXITINFO1_MOV_CR != 0 {
        let gpr = (exit_info1 & 0xf) as u8;
        let op = if is_write {
            CrOp::MovToCr { cr, gpr }
        } else {
            CrOp::MovFromCr { cr, gpr }
        };
        // With decode assist the next RIP comes from the control block.
        let next_rip = core.vmcb.control.nrip;
        if next_rip != 0 {
            return Ok((op, next_rip));
        }
    }

    let bytes = fetch_instr(vm, core)?;
    let (op, len) = decode_cr_op(&bytes, core.cpu_mode == CpuMode::Long)?;
    Ok((op, core.rip + u64::from(len)))
}

/// Handles a CR0 write intercept: MOV-to-CR0, LMSW or CLTS.
pub fn handle_cr0_write(vm: &Vm, core: &mut Vcpu, exit_info1: u64) -> Result<()> {
    let (op, next_rip) = resolve_cr_op(vm, core, exit_info1, true, 0)?;

    match op {
        CrOp::MovToCr { gpr, .. } => {
            let new_cr0 = core.regs.gpr(gpr);
            mov_to_cr0(vm, core, new_cr0)?;
        }
        CrOp::Lmsw { gpr } => {
            let low = (core.regs.gpr(gpr) & 0xf) as u64;
            lmsw(core, low);
        }
        CrOp::Clts => {
            clts(core)?;
        }
        CrOp::MovFromCr { .. } => {
            error!("read-form instruction on CR0 write intercept");
            return Err(VmmError::DecodeFailed);
        }
    }

    core.rip = next_rip;
    Ok(())
}

/// The MOV-to-CR0 semantics.
///
/// The guest always reads back what it wrote (plus ET, which is hardwired).
/// The hardware copy mirrors the guest value except that paging stays on
/// and, while the guest runs untranslated, write-protect is forced so
/// read-only hook regions trap. A PG toggle re-roots the active tree and
/// latches EFER.LMA when the guest had armed long mode.
fn mov_to_cr0(vm: &Vm, core: &mut Vcpu, new_cr0: u64) -> Result<()> {
    // The format check on the upper half is hardware's job; only the low
    // 32 bits hold flags.
    let new_cr0 = new_cr0 & 0xffff_ffff;

    trace!(
        "core {}: MOV2CR0 {new_cr0:#x} (mode {:?})",
        core.vcpu_id,
        core.cpu_mode
    );

    // Keep the lazy-FPU machinery aware of the guest's TS intent.
    core.fpu.guest_ts = new_cr0 & CR0_TS != 0;

    if core.paging_mode == PagingMode::Nested {
        core.ctrl_regs.cr0 = new_cr0 | CR0_ET;
        core.update_modes();
        return Ok(());
    }

    let guest_cr0 = &mut core.shdw_pg_state.guest_cr0;
    let paging_transition = (*guest_cr0 ^ new_cr0) & CR0_PG != 0;

    *guest_cr0 = new_cr0 | CR0_ET;
    let mut hw_cr0 = *guest_cr0 | CR0_PG;
    if *guest_cr0 & CR0_PG == 0 {
        hw_cr0 |= CR0_WP;
    }
    core.ctrl_regs.cr0 = hw_cr0;
    core.update_modes();

    if paging_transition {
        if core.mem_mode == MemMode::Virtual {
            // Long mode arms through EFER.LME but only engages when the
            // guest turns paging on.
            if core.shdw_pg_state.guest_efer & EFER_LME != 0 {
                debug!("core {}: enabling long mode", core.vcpu_id);
                core.shdw_pg_state.guest_efer |= EFER_LMA;
                core.ctrl_regs.efer |= EFER_LMA | EFER_LME;
                core.update_modes();
            }
            shadow::activate_shadow_pt(vm, core)?;
        } else {
            core.ctrl_regs.cr0 |= CR0_WP;
            direct::init_passthrough(vm, core)?;
            direct::activate_passthrough(core)?;
        }
    }

    trace!(
        "core {}: guest cr0 {:#x}, hardware cr0 {:#x}",
        core.vcpu_id,
        core.shdw_pg_state.guest_cr0,
        core.ctrl_regs.cr0
    );
    Ok(())
}

/// LMSW touches only the low nibble (PE/MP/EM/TS), on both views.
fn lmsw(core: &mut Vcpu, low4: u64) {
    core.ctrl_regs.cr0 = (core.ctrl_regs.cr0 & !0xf) | low4;
    if core.paging_mode == PagingMode::Shadow {
        let guest_cr0 = &mut core.shdw_pg_state.guest_cr0;
        *guest_cr0 = (*guest_cr0 & !0xf) | low4;
    }
    core.fpu.guest_ts = low4 & CR0_TS != 0;
    core.update_modes();
}

/// CLTS clears the guest's TS and wakes the FPU.
fn clts(core: &mut Vcpu) -> Result<()> {
    if core.paging_mode == PagingMode::Shadow {
        core.shdw_pg_state.guest_cr0 &= !CR0_TS;
    } else {
        core.ctrl_regs.cr0 &= !CR0_TS;
    }
    fpu::set_guest_ts(core, false)
}

/// Handles a CR0 read intercept: MOV-from-CR0 or SMSW. The guest copy is
/// returned, never the hardware one.
pub fn handle_cr0_read(vm: &Vm, core: &mut Vcpu, exit_info1: u64) -> Result<()> {
    let (op, next_rip) = resolve_cr_op(vm, core, exit_info1, false, 0)?;

    let guest_cr0 = match core.paging_mode {
        PagingMode::Shadow => core.shdw_pg_state.guest_cr0,
        PagingMode::Nested => core.ctrl_regs.cr0,
    };

    match op {
        CrOp::MovFromCr { gpr, .. } => {
            let value = match core.cpu_mode {
                CpuMode::Long | CpuMode::Long32Compat => guest_cr0,
                _ => guest_cr0 & 0xffff_ffff,
            };
            core.regs.set_gpr(gpr, value);
        }
        // SMSW decodes as LMSW's read twin: low nibble only, upper bits of
        // the destination preserved.
        CrOp::Lmsw { gpr } => {
            let old = core.regs.gpr(gpr);
            core.regs.set_gpr(gpr, (old & !0xf) | (guest_cr0 & 0xf));
        }
        _ => {
            error!("unhandled opcode on CR0 read intercept");
            return Err(VmmError::DecodeFailed);
        }
    }

    core.rip = next_rip;
    Ok(())
}

/// Handles a CR3 write intercept.
pub fn handle_cr3_write(vm: &Vm, core: &mut Vcpu, exit_info1: u64) -> Result<()> {
    let (op, next_rip) = resolve_cr_op(vm, core, exit_info1, true, 3)?;
    let CrOp::MovToCr { gpr, .. } = op else {
        error!("unhandled opcode on CR3 write intercept");
        return Err(VmmError::DecodeFailed);
    };

    let new_cr3 = core.regs.gpr(gpr);

    match core.paging_mode {
        PagingMode::Shadow => {
            trace!(
                "core {}: guest cr3 {:#x} -> {new_cr3:#x} (shadow cr3 {:#x})",
                core.vcpu_id,
                core.shdw_pg_state.guest_cr3,
                core.ctrl_regs.cr3
            );
            core.shdw_pg_state.guest_cr3 = new_cr3;

            // A CR3 load flushes the TLB; with paging live that means the
            // shadow tree is stale and must be re-rooted.
            if core.mem_mode == MemMode::Virtual {
                shadow::activate_shadow_pt(vm, core)?;
            }
        }
        PagingMode::Nested => {
            core.ctrl_regs.cr3 = new_cr3;
        }
    }

    core.rip = next_rip;
    Ok(())
}

/// Handles a CR3 read intercept; the guest sees its own root, not ours.
pub fn handle_cr3_read(vm: &Vm, core: &mut Vcpu, exit_info1: u64) -> Result<()> {
    let (op, next_rip) = resolve_cr_op(vm, core, exit_info1, false, 3)?;
    let CrOp::MovFromCr { gpr, .. } = op else {
        error!("unhandled opcode on CR3 read intercept");
        return Err(VmmError::DecodeFailed);
    };

    let value = match core.paging_mode {
        PagingMode::Shadow => core.shdw_pg_state.guest_cr3,
        PagingMode::Nested => core.ctrl_regs.cr3,
    };
    core.regs.set_gpr(gpr, value);
    core.rip = next_rip;
    Ok(())
}

/// Handles a CR4 write intercept.
///
/// PSE/PGE/PAE flips while paging is on are architectural TLB flushes, so
/// the shadow tree goes with them. A PAE enable while the guest still runs
/// untranslated rebuilds the passthrough tree in the PAE shape. Dropping
/// PAE in long mode is the guest's mistake and comes back as #GP.
pub fn handle_cr4_write(vm: &Vm, core: &mut Vcpu, exit_info1: u64) -> Result<()> {
    let (op, next_rip) = resolve_cr_op(vm, core, exit_info1, true, 4)?;
    let CrOp::MovToCr { gpr, .. } = op else {
        error!("unhandled opcode on CR4 write intercept");
        return Err(VmmError::DecodeFailed);
    };

    let new_cr4 = core.regs.gpr(gpr);
    let old_cr4 = core.ctrl_regs.cr4;

    let mut flush_tlb = false;
    if core.mem_mode == MemMode::Virtual
        && (old_cr4 ^ new_cr4) & (CR4_PSE | CR4_PGE | CR4_PAE) != 0
    {
        trace!("core {}: CR4 write implies TLB flush", core.vcpu_id);
        flush_tlb = true;
    }

    match core.cpu_mode {
        CpuMode::Protected | CpuMode::ProtectedPae => {
            if core.paging_mode == PagingMode::Shadow
                && core.mem_mode == MemMode::Physical
                && (old_cr4 ^ new_cr4) & CR4_PAE != 0
            {
                if new_cr4 & CR4_PAE != 0 {
                    debug!("core {}: rebuilding passthrough tables for PAE", core.vcpu_id);
                    core.ctrl_regs.cr4 = new_cr4;
                    core.update_modes();
                    direct::reset_passthrough(vm, core)?;
                    direct::activate_passthrough(core)?;
                } else {
                    error!("core {}: switching from PAE back to 32bit paging is unsupported",
                           core.vcpu_id);
                    return Err(VmmError::UnhandledExit(crate::vmcb::VMEXIT_CR4_WRITE));
                }
            }
            core.ctrl_regs.cr4 = new_cr4;
        }
        CpuMode::Long | CpuMode::Long32Compat | CpuMode::Long16Compat => {
            if new_cr4 & CR4_PAE == 0 {
                debug!("core {}: attempt to clear CR4.PAE in long mode", core.vcpu_id);
                core.shared.excp.raise_exception_with_error(GPF_EXCEPTION, 0)?;
                return Ok(());
            }
            core.ctrl_regs.cr4 = new_cr4;
        }
        CpuMode::Real => {
            error!("core {}: CR4 write unsupported in real mode", core.vcpu_id);
            return Err(VmmError::UnhandledExit(crate::vmcb::VMEXIT_CR4_WRITE));
        }
    }

    core.update_modes();

    if core.paging_mode == PagingMode::Shadow && flush_tlb {
        shadow::activate_shadow_pt(vm, core)?;
    }

    core.rip = next_rip;
    Ok(())
}

/// The EFER virtualization: reads return the guest's value; writes are
/// screened so long mode engages only through the architectural sequence
/// (LME first, LMA on the paging transition) and never disengages.
pub struct EferHandler;

impl MsrHandler for EferHandler {
    fn read(&self, _vm: &Vm, core: &mut Vcpu, _msr: u32) -> Result<u64> {
        let value = match core.paging_mode {
            PagingMode::Shadow => core.shdw_pg_state.guest_efer,
            PagingMode::Nested => core.ctrl_regs.efer & !EFER_SVME,
        };
        Ok(value)
    }

    fn write(&self, _vm: &Vm, core: &mut Vcpu, _msr: u32, value: u64) -> Result<()> {
        trace!("core {}: EFER write {value:#x}", core.vcpu_id);

        let old_hw_efer = core.ctrl_regs.efer;
        let mut hw_efer = value;

        if core.paging_mode == PagingMode::Shadow {
            if old_hw_efer & EFER_LME != 0 && value & EFER_LME == 0 {
                error!(
                    "core {}: disabling long mode once enabled is not supported",
                    core.vcpu_id
                );
                core.shared.excp.raise_exception_with_error(GPF_EXCEPTION, 0)?;
                return Ok(());
            }

            if old_hw_efer & EFER_LME == 0 {
                // Long mode is armed, not engaged; hardware LME stays clear
                // until the guest turns paging on.
                hw_efer &= !EFER_LME;
            } else {
                hw_efer |= EFER_LMA;
            }
            core.shdw_pg_state.guest_efer = value;
        }

        // The hardware-visible EFER must keep SVME.
        core.ctrl_regs.efer = hw_efer | EFER_SVME;
        core.update_modes();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::PagingMode;
    use crate::vm::testing::{detached_vcpu, shadow_test_vm};

    fn shadow_core(vm: &Vm) -> Vcpu {
        let mut core = detached_vcpu(vm, PagingMode::Shadow);
        core.shdw_pg_state.guest_cr0 = 0x10;
        core.ctrl_regs.cr0 = 0x8001_0010; // PG forced on
        core.update_modes();
        core
    }

    #[test]
    fn guest_sees_what_it_wrote_hardware_keeps_paging() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);

        // Protected mode, no paging.
        mov_to_cr0(&vm, &mut core, CR0_PE).unwrap();
        assert_eq!(core.shdw_pg_state.guest_cr0, CR0_PE | CR0_ET);
        assert_ne!(core.ctrl_regs.cr0 & CR0_PG, 0, "hardware paging stays on");
        assert_ne!(core.ctrl_regs.cr0 & CR0_WP, 0, "WP forced while untranslated");
        assert_eq!(core.mem_mode, MemMode::Physical);
    }

    #[test]
    fn pg_enable_activates_shadow_root() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        mov_to_cr0(&vm, &mut core, CR0_PE).unwrap();

        core.shdw_pg_state.guest_cr3 = 0x7000;
        mov_to_cr0(&vm, &mut core, CR0_PE | CR0_PG).unwrap();
        assert_eq!(core.mem_mode, MemMode::Virtual);
        let root = core.shdw_pg_state.shadow.root();
        assert_ne!(root, 0);
        assert_eq!(core.ctrl_regs.cr3, root);
        assert_ne!(core.ctrl_regs.cr3, core.shdw_pg_state.guest_cr3);
    }

    #[test]
    fn lme_then_pg_sets_lma_before_next_entry() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        mov_to_cr0(&vm, &mut core, CR0_PE).unwrap();
        core.ctrl_regs.cr4 = CR4_PAE;

        // Guest writes EFER.LME with paging off: hardware LME stays latched
        // low.
        let efer = EferHandler;
        efer.write(&vm, &mut core, x86::msr::IA32_EFER, EFER_LME).unwrap();
        assert_eq!(core.shdw_pg_state.guest_efer, EFER_LME);
        assert_eq!(core.ctrl_regs.efer & EFER_LME, 0);
        assert_ne!(core.ctrl_regs.efer & EFER_SVME, 0);

        // Then enables paging: LMA must appear on both views.
        mov_to_cr0(&vm, &mut core, CR0_PE | CR0_PG).unwrap();
        assert_ne!(core.shdw_pg_state.guest_efer & EFER_LMA, 0);
        assert_ne!(core.ctrl_regs.efer & EFER_LMA, 0);
        assert_ne!(core.ctrl_regs.efer & EFER_LME, 0);
    }

    #[test]
    fn lme_clear_after_enable_is_refused() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        core.ctrl_regs.efer = EFER_LME | EFER_SVME;

        let efer = EferHandler;
        efer.write(&vm, &mut core, x86::msr::IA32_EFER, 0).unwrap();
        assert_eq!(core.shared.excp.next_pending(), Some(GPF_EXCEPTION));
        // State unchanged.
        assert_ne!(core.ctrl_regs.efer & EFER_LME, 0);
    }

    #[test]
    fn cr3_write_rerooots_only_with_paging_on() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        mov_to_cr0(&vm, &mut core, CR0_PE).unwrap();

        // Fabricate a decode-assisted CR3 write from RBX.
        core.regs.rbx = 0x9000;
        core.vmcb.control.nrip = 0x103;
        handle_cr3_write(&vm, &mut core, EXITINFO1_MOV_CR | 3).unwrap();
        assert_eq!(core.shdw_pg_state.guest_cr3, 0x9000);
        assert_eq!(core.rip, 0x103);
        // Paging off: hardware CR3 still belongs to the passthrough tree.
        assert_eq!(core.shdw_pg_state.shadow.root(), 0);

        mov_to_cr0(&vm, &mut core, CR0_PE | CR0_PG).unwrap();
        let first_root = core.ctrl_regs.cr3;

        core.regs.rbx = 0xa000;
        handle_cr3_write(&vm, &mut core, EXITINFO1_MOV_CR | 3).unwrap();
        assert_eq!(core.shdw_pg_state.guest_cr3, 0xa000);
        // Re-rooted: a fresh shadow root.
        assert_ne!(core.ctrl_regs.cr3, 0);
        let _ = first_root;
    }

    #[test]
    fn cr4_pae_clear_in_long_mode_injects_gp() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        core.shdw_pg_state.guest_cr0 = CR0_PE | CR0_PG;
        core.shdw_pg_state.guest_efer = EFER_LME | EFER_LMA;
        core.ctrl_regs.cr4 = CR4_PAE;
        core.segments.cs.long_mode = true;
        core.update_modes();
        assert_eq!(core.cpu_mode, CpuMode::Long);

        core.regs.rax = 0; // PAE clear
        core.vmcb.control.nrip = 0x10;
        handle_cr4_write(&vm, &mut core, EXITINFO1_MOV_CR).unwrap();
        assert_eq!(core.shared.excp.next_pending(), Some(GPF_EXCEPTION));
        assert_ne!(core.ctrl_regs.cr4 & CR4_PAE, 0, "CR4 unchanged");
    }

    #[test]
    fn cr0_read_returns_guest_copy() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        mov_to_cr0(&vm, &mut core, CR0_PE).unwrap();

        core.vmcb.control.nrip = 0x23;
        handle_cr0_read(&vm, &mut core, EXITINFO1_MOV_CR | 2).unwrap(); // into RDX
        assert_eq!(core.regs.rdx, CR0_PE | CR0_ET);
        assert_eq!(core.rip, 0x23);
    }

    #[test]
    fn clts_clears_ts_and_activates_fpu() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        let mut core = shadow_core(&vm);
        core.shdw_pg_state.guest_cr0 |= CR0_TS;
        core.fpu.guest_ts = true;

        clts(&mut core).unwrap();
        assert_eq!(core.shdw_pg_state.guest_cr0 & CR0_TS, 0);
        assert!(core.fpu.fpu_activated);
        let _ = vm;
    }
}
