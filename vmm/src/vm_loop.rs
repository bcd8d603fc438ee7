//! The module containing the per-vCPU entry/exit loop.
//!
//! Each vCPU runs this loop on its own pinned host thread: synchronize the
//! in-memory register image into the control block, sequence any pending
//! event injection, run the guest, read the image back, bookkeep the
//! interrupt-acknowledge cycle and dispatch the exit to its handler. The
//! only suspension points are inside the guest and at the yields placed
//! right before entry and right after exit; between masking host
//! interrupts and the exit-side unmask the sequence is preemption-free.
//!
//! Exit handlers return errors only for conditions the VM cannot continue
//! from; the loop then marks the VM `Error`, parks the core and leaves the
//! machine inspectable.

use crate::{
    config,
    cpu::{CoreRunState, Vcpu},
    cpuid, ctrl_regs,
    error::{Result, VmmError},
    excp::NMI_EXCEPTION,
    fpu, hypercall, intr,
    intr::IntrType,
    io,
    mem::PfError,
    msr,
    paging::{direct, shadow},
    time,
    vm::{Vm, VmRunState},
    vmcb::*,
};
use alloc::sync::Arc;
use log::{debug, error, info, trace};

/// What the dispatched exit asks of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitAction {
    Resume,
    /// Spin (with the core unlocked) until an interrupt is deliverable.
    Halt,
}

/// The body of one vCPU's host thread. Returns when the VM stops or dies.
pub fn start_core(vm: &Arc<Vm>, vcpu_id: u32) -> Result<()> {
    let cell = vm.core(vcpu_id);

    info!(
        "core {vcpu_id}: thread started on pcpu {}",
        cell.shared.pcpu_id()
    );

    // The BSP self-starts; APs park here until INIT/SIPI brings them up.
    if cell.shared.run_state() == CoreRunState::Stopped {
        let is_bsp = cell.vcpu.lock().is_bsp();
        if is_bsp {
            cell.shared.set_run_state(CoreRunState::Running);
        } else if !wait_for_startup(vm, vcpu_id) {
            return Ok(());
        }
        start_core_clock(vm, vcpu_id);
    }

    loop {
        match vm.run_state() {
            VmRunState::Stopped | VmRunState::Error | VmRunState::Invalid => {
                cell.shared.set_run_state(CoreRunState::Stopped);
                break;
            }
            VmRunState::Running | VmRunState::Paused => {}
        }

        // An INIT landed: park until the SIPI reshapes and restarts us.
        if cell.shared.run_state() == CoreRunState::Stopped {
            if !wait_for_startup(vm, vcpu_id) {
                return Ok(());
            }
            continue;
        }

        let action = {
            let mut core = cell.vcpu.lock();
            svm_enter(vm, &mut core)
        };

        match action {
            Ok(ExitAction::Resume) => {}
            Ok(ExitAction::Halt) => halt_wait(vm, vcpu_id),
            Err(e) => {
                let core = cell.vcpu.lock();
                error!("core {vcpu_id}: fatal exit handling error: {e}");
                error!("core {vcpu_id}: {:#x?}", &*core);
                drop(core);
                vm.set_run_state(VmRunState::Error);
                cell.shared.set_run_state(CoreRunState::Stopped);
                break;
            }
        }

        vm.barrier().wait(vm, vcpu_id);

        if vm.run_state() == VmRunState::Stopped {
            cell.shared.set_run_state(CoreRunState::Stopped);
            break;
        }
    }

    info!("core {vcpu_id}: stopped");
    Ok(())
}

/// Parks an AP until SIPI starts it. Returns false when the VM went away
/// first.
fn wait_for_startup(vm: &Vm, vcpu_id: u32) -> bool {
    debug!("core {vcpu_id}: waiting for startup");
    while vm.core(vcpu_id).shared.run_state() == CoreRunState::Stopped {
        match vm.run_state() {
            VmRunState::Stopped | VmRunState::Error | VmRunState::Invalid => return false,
            _ => {}
        }
        vm.host().yield_cpu();
    }
    // Be paranoid about racing a barrier raised around our own startup.
    vm.barrier().wait(vm, vcpu_id);

    let core = vm.core(vcpu_id).vcpu.lock();
    debug!(
        "core {vcpu_id}: starting at {:#x}:{:#x} (base {:#x})",
        core.segments.cs.selector, core.rip, core.segments.cs.base
    );
    true
}

fn start_core_clock(vm: &Vm, vcpu_id: u32) {
    let khz = vm.host().cpu_khz();
    let mut core = vm.core(vcpu_id).vcpu.lock();
    time::start_time(&mut core, khz);
}

/// Yields the host thread if this core's time slice has expired.
fn yield_cond(vm: &Vm, core: &mut Vcpu) {
    let now = core.vt.read_tsc();
    if now.wrapping_sub(core.yield_start_cycle) > config::YIELD_CYCLE_PERIOD {
        vm.host().yield_cpu();
        core.yield_start_cycle = core.vt.read_tsc();
    }
}

/// One VM entry and the handling of its exit.
///
/// The control block must not be touched between the interrupt mask and
/// unmask other than from this sequence.
fn svm_enter(vm: &Vm, core: &mut Vcpu) -> Result<ExitAction> {
    // Conditionally yield the CPU if the timeslice has expired.
    yield_cond(vm, core);

    // Tick timers before the IRQ update so anything they raise is seen by
    // this entry.
    time::update_timers(core);

    // Entry-critical section.
    core.vt.disable_host_interrupts();

    // FPU bookkeeping must precede serialization; it edits CR0.TS.
    fpu::fpu_on_entry(core);

    // Synchronize the guest state into the control block.
    core.vmcb.save.cr0 = core.ctrl_regs.cr0;
    core.vmcb.save.cr2 = core.ctrl_regs.cr2;
    core.vmcb.save.cr3 = core.ctrl_regs.cr3;
    core.vmcb.save.cr4 = core.ctrl_regs.cr4;
    core.vmcb.save.dr6 = core.dbg_regs.dr6;
    core.vmcb.save.dr7 = core.dbg_regs.dr7;
    core.vmcb.control.vintr.set_v_tpr((core.ctrl_regs.cr8 & 0xff) as u8);
    core.vmcb.save.rflags = core.ctrl_regs.rflags;
    core.vmcb.save.efer = core.ctrl_regs.efer;

    core.vmcb.save.star = core.msrs.star;
    core.vmcb.save.lstar = core.msrs.lstar;
    core.vmcb.save.cstar = core.msrs.cstar;
    core.vmcb.save.sf_mask = core.msrs.sfmask;
    core.vmcb.save.kernel_gs_base = core.msrs.kern_gs_base;
    core.vmcb.save.sysenter_cs = core.msrs.sysenter_cs;
    core.vmcb.save.sysenter_esp = core.msrs.sysenter_esp;
    core.vmcb.save.sysenter_eip = core.msrs.sysenter_eip;
    core.vmcb.save.gpat = core.msrs.pat;

    core.vmcb.save.cpl = core.cpl;
    core.vmcb.set_segments(&core.segments);

    core.vmcb.save.rax = core.regs.rax;
    core.vmcb.save.rip = core.rip;
    core.vmcb.save.rsp = core.regs.rsp;

    update_irq_entry_state(core);

    configure_tsc_virtualization(core);

    let entry_tsc;
    let exit_tsc;
    {
        entry_tsc = core.vt.read_tsc();
        core.vt.launch(&mut core.vmcb, &mut core.regs);
        exit_tsc = core.vt.read_tsc();
    }

    let guest_cycles = exit_tsc.wrapping_sub(entry_tsc);
    core.time.time_in_guest += guest_cycles;
    core.time.time_in_host += entry_tsc.wrapping_sub(core.time.tsc_at_last_exit);
    core.time.tsc_at_last_entry = entry_tsc;
    core.time.tsc_at_last_exit = exit_tsc;
    core.num_exits += 1;

    // Read the guest state back out of the control block.
    core.rip = core.vmcb.save.rip;
    core.regs.rsp = core.vmcb.save.rsp;
    core.regs.rax = core.vmcb.save.rax;
    core.cpl = core.vmcb.save.cpl;

    core.ctrl_regs.cr0 = core.vmcb.save.cr0;
    core.ctrl_regs.cr2 = core.vmcb.save.cr2;
    core.ctrl_regs.cr3 = core.vmcb.save.cr3;
    core.ctrl_regs.cr4 = core.vmcb.save.cr4;
    core.dbg_regs.dr6 = core.vmcb.save.dr6;
    core.dbg_regs.dr7 = core.vmcb.save.dr7;
    core.ctrl_regs.cr8 = u64::from(core.vmcb.control.vintr.v_tpr());
    core.ctrl_regs.rflags = core.vmcb.save.rflags;
    core.ctrl_regs.efer = core.vmcb.save.efer;

    core.msrs.star = core.vmcb.save.star;
    core.msrs.lstar = core.vmcb.save.lstar;
    core.msrs.cstar = core.vmcb.save.cstar;
    core.msrs.sfmask = core.vmcb.save.sf_mask;
    core.msrs.kern_gs_base = core.vmcb.save.kernel_gs_base;
    core.msrs.sysenter_cs = core.vmcb.save.sysenter_cs;
    core.msrs.sysenter_esp = core.vmcb.save.sysenter_esp;
    core.msrs.sysenter_eip = core.vmcb.save.sysenter_eip;
    core.msrs.pat = core.vmcb.save.gpat;

    let mut segments = core.segments;
    core.vmcb.get_segments(&mut segments);
    core.segments = segments;

    core.update_modes();

    let exit_code = core.vmcb.control.exit_code;
    let exit_info1 = core.vmcb.control.exit_info1;
    let exit_info2 = core.vmcb.control.exit_info2;

    update_irq_exit_state(core);

    core.vt.enable_host_interrupts();

    // Conditionally yield again now that host interrupts can run.
    yield_cond(vm, core);
    time::update_timers(core);

    let action = handle_exit(vm, core, exit_code, exit_info1, exit_info2)?;

    if core.timeouts.active() {
        time::handle_timeouts(core);
    }

    Ok(action)
}

/// Sequences event injection for the next entry.
///
/// Exceptions outrank everything; a previously asserted-but-untaken IRQ is
/// re-asserted unchanged; otherwise the router stack is consulted for the
/// next external, software or virtual interrupt.
fn update_irq_entry_state(core: &mut Vcpu) {
    if !core.intr_state.irq_pending {
        core.vmcb.control.vintr.set_v_irq(false);
        core.vmcb.control.vintr.set_v_intr_vector(0);
    }

    if let Some(vector) = core.shared.excp.next_pending() {
        let mut inj = EventInj::default();
        if vector == NMI_EXCEPTION {
            inj.set_ev_type(EVENT_TYPE_NMI as u8);
        } else {
            inj.set_ev_type(EVENT_TYPE_EXCEPTION as u8);
            inj.set_vector(vector as u8);
        }
        if core.shared.excp.has_error(vector) {
            inj.set_error_code(core.shared.excp.error_code(vector));
            inj.set_ev(true);
        }
        inj.set_valid(true);
        core.vmcb.control.event_inj = inj;

        trace!(
            "core {}: injecting exception {vector} (cr2={:#x}, rip={:#x})",
            core.vcpu_id,
            core.ctrl_regs.cr2,
            core.rip
        );
        core.shared.excp.consume(vector);
    } else if core.intr_state.irq_started {
        // The interrupt-acknowledge cycle did not finish; assert the same
        // vector again.
        trace!("core {}: IRQ pending from previous injection", core.vcpu_id);
        let vector = core.intr_state.irq_vector;
        core.vmcb.control.vintr.set_v_irq(true);
        core.vmcb.control.vintr.set_v_intr_vector(vector);
        core.vmcb.control.vintr.set_v_ign_tpr(true);
        core.vmcb.control.vintr.set_v_intr_prio(0xf);
    } else {
        match intr::intr_pending(core) {
            IntrType::External => {
                let Some(irq) = intr::get_intr(core) else {
                    return;
                };
                core.vmcb.control.vintr.set_v_irq(true);
                core.vmcb.control.vintr.set_v_intr_vector(irq);
                core.vmcb.control.vintr.set_v_ign_tpr(true);
                core.vmcb.control.vintr.set_v_intr_prio(0xf);

                trace!(
                    "core {}: injecting interrupt {irq} (rip={:#x})",
                    core.vcpu_id,
                    core.rip
                );
                core.intr_state.irq_pending = true;
                core.intr_state.irq_vector = irq;
            }
            IntrType::Software => {
                let mut inj = EventInj::default();
                inj.set_ev_type(EVENT_TYPE_SOFT_INT as u8);
                inj.set_vector(core.intr_state.swintr_vector);
                inj.set_valid(true);
                core.vmcb.control.event_inj = inj;

                core.intr_state.swintr_posted = false;
                core.intr_state.swintr_vector = 0;
            }
            IntrType::Virtual => {
                // Virtual IRQs just assert the line; nothing tracks an
                // acknowledge cycle for them.
                if let Some(irq) = intr::get_intr(core) {
                    core.vmcb.control.vintr.set_v_irq(true);
                    core.vmcb.control.vintr.set_v_intr_vector(irq);
                }
            }
            IntrType::Invalid => {}
        }
    }
}

/// Completes the interrupt-acknowledge bookkeeping after an exit.
fn update_irq_exit_state(core: &mut Vcpu) {
    // EVENTINJ doubles as an internal cache on some emulators; never leave
    // it valid across entries.
    core.vmcb.control.event_inj.set_valid(false);

    if core.intr_state.irq_pending && !core.vmcb.control.vintr.v_irq() {
        // Hardware cleared V_IRQ: the INTAK cycle completed.
        trace!(
            "core {}: INTAK cycle completed for irq {}",
            core.vcpu_id,
            core.intr_state.irq_vector
        );
        core.intr_state.irq_started = true;
        core.intr_state.irq_pending = false;
        let vector = core.intr_state.irq_vector;
        intr::injecting_intr(core, vector, IntrType::External);
    }

    if core.intr_state.irq_started {
        if core.vmcb.control.exit_int_info.valid() {
            // The injection was interrupted mid-delivery; it will be
            // re-asserted next entry.
            trace!(
                "core {}: exit interrupted delivery of vector {}",
                core.vcpu_id,
                core.vmcb.control.exit_int_info.vector()
            );
        } else {
            // Taken fully vectored.
            core.intr_state.irq_started = false;
        }
    }
}

/// Programs TSC virtualization for the next entry: either trap the read
/// instructions or run offset (or raw) hardware time.
fn configure_tsc_virtualization(core: &mut Vcpu) {
    if core.time.flags.trap_rdtsc {
        core.vmcb.control.intercept_misc1 |= INTERCEPT_RDTSC;
        core.vmcb.control.intercept_misc2 |= INTERCEPT_RDTSCP;
    } else {
        core.vmcb.control.intercept_misc1 &= !INTERCEPT_RDTSC;
        core.vmcb.control.intercept_misc2 &= !INTERCEPT_RDTSCP;
        core.vmcb.control.tsc_offset = if core.time.flags.tsc_passthrough {
            0
        } else {
            core.time.tsc_offset as u64
        };
    }
}

fn next_rip_or(core: &Vcpu, fallback_len: u64) -> u64 {
    let nrip = core.vmcb.control.nrip;
    if nrip != 0 {
        nrip
    } else {
        core.rip + fallback_len
    }
}

/// Dispatches one exit to its handler.
fn handle_exit(
    vm: &Vm,
    core: &mut Vcpu,
    exit_code: u64,
    exit_info1: u64,
    exit_info2: u64,
) -> Result<ExitAction> {
    match exit_code {
        VMEXIT_CR0_WRITE | VMEXIT_CR0_SEL_WRITE => {
            ctrl_regs::handle_cr0_write(vm, core, exit_info1)?;
        }
        VMEXIT_CR0_READ => ctrl_regs::handle_cr0_read(vm, core, exit_info1)?,
        VMEXIT_CR3_WRITE => ctrl_regs::handle_cr3_write(vm, core, exit_info1)?,
        VMEXIT_CR3_READ => ctrl_regs::handle_cr3_read(vm, core, exit_info1)?,
        VMEXIT_CR4_WRITE => ctrl_regs::handle_cr4_write(vm, core, exit_info1)?,

        VMEXIT_EXCP_PF => {
            // exit_info2 carries the faulting address, exit_info1 the error
            // code.
            core.ctrl_regs.cr2 = exit_info2;
            shadow::handle_shadow_pagefault(vm, core, exit_info2, PfError(exit_info1 as u32))?;
        }
        VMEXIT_EXCP_NM => fpu::handle_nm_exit(core),
        VMEXIT_NPF => {
            direct::handle_direct_pagefault(vm, core, exit_info2, PfError(exit_info1 as u32))?;
        }

        VMEXIT_INVLPG => {
            // Dropping the whole shadow tree over-invalidates but is always
            // correct; INVLPG is rare outside of mapping churn.
            shadow::invalidate_shadow_pts(vm, core)?;
            core.rip = next_rip_or(core, 3);
        }

        VMEXIT_IOIO => io::handle_io_exit(vm, core, exit_info1, exit_info2)?,
        VMEXIT_MSR => msr::handle_msr_exit(vm, core, exit_info1 == 1)?,
        VMEXIT_CPUID => cpuid::handle_cpuid_exit(vm, core)?,
        VMEXIT_VMMCALL => hypercall::handle_hypercall(vm, core)?,

        VMEXIT_HLT => {
            trace!("core {}: guest halted", core.vcpu_id);
            core.rip = next_rip_or(core, 1);
            return Ok(ExitAction::Halt);
        }
        VMEXIT_PAUSE => {
            vm.host().yield_cpu();
            core.rip = next_rip_or(core, 2);
        }
        VMEXIT_RDTSC => {
            let tsc = core.time.guest_tsc(core.vt.read_tsc());
            core.regs.rax = tsc & 0xffff_ffff;
            core.regs.rdx = tsc >> 32;
            core.rip = next_rip_or(core, 2);
        }
        VMEXIT_XSETBV => fpu::handle_xsetbv(core)?,

        // The host consumed the physical event once GIF opened; nothing of
        // the guest's is involved.
        VMEXIT_INTR | VMEXIT_NMI | VMEXIT_SMI | VMEXIT_INIT | VMEXIT_VINTR => {}

        // The guest was told SVM is disabled; attempts to use it get #UD.
        VMEXIT_VMRUN | VMEXIT_VMLOAD | VMEXIT_VMSAVE | VMEXIT_STGI | VMEXIT_CLGI
        | VMEXIT_SKINIT | VMEXIT_INVLPGA => {
            debug!("core {}: SVM instruction attempted, injecting #UD", core.vcpu_id);
            core.shared.excp.raise_exception(crate::excp::UD_EXCEPTION)?;
        }

        VMEXIT_SHUTDOWN => {
            error!("core {}: guest entered shutdown (triple fault)", core.vcpu_id);
            return Err(VmmError::GuestShutdown);
        }
        VMEXIT_INVALID => {
            error!("core {}: VMRUN rejected the control block", core.vcpu_id);
            return Err(VmmError::UnhandledExit(exit_code));
        }

        _ => {
            error!(
                "core {}: unhandled VM exit {exit_code:#x} (info1={exit_info1:#x}, info2={exit_info2:#x}, rip={:#x})",
                core.vcpu_id, core.rip
            );
            return Err(VmmError::UnhandledExit(exit_code));
        }
    }
    Ok(ExitAction::Resume)
}

/// Spins (unlocked) until an interrupt is deliverable to the halted core,
/// honoring barriers and VM state transitions while parked.
fn halt_wait(vm: &Vm, vcpu_id: u32) {
    loop {
        {
            let mut core = vm.core(vcpu_id).vcpu.lock();
            time::update_timers(&mut core);
            if intr::intr_pending(&core) != IntrType::Invalid || core.shared.excp.pending() {
                return;
            }
        }
        if vm.run_state() != VmRunState::Running {
            return;
        }
        vm.barrier().wait(vm, vcpu_id);
        vm.host().yield_cpu();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apic::{DeliveryMode, Ipi, Shorthand};
    use crate::cfg::PagingCfg;
    use crate::cpu::{CoreRunState, Vcpu};
    use crate::hw_vt::mock::MockVt;
    use crate::intr::IntrController;
    use crate::mem::MemMap;
    use crate::paging::{table64, TableShape};
    use crate::vm::testing::{nested_test_vm, test_vm};
    use crate::vm::Vm;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn mock_of(core: &Vcpu) -> &MockVt {
        core.vt.as_any().downcast_ref().unwrap()
    }

    fn locked_mock(vm: &Vm, idx: u32, f: impl FnOnce(&MockVt)) {
        let core = vm.core(idx).vcpu.lock();
        f(mock_of(&core));
    }

    /// Runs one entry against the VM's own core 0.
    fn enter_core0(vm: &Arc<Vm>) -> Result<ExitAction> {
        let mut core = vm.core(0).vcpu.lock();
        svm_enter(vm, &mut core)
    }

    #[test]
    fn added_irq_is_asserted_on_next_entry() {
        let vm = test_vm(1 << 20, 1 << 20, 1, PagingCfg::Nested);
        vm.apic().add_irq(0, 0x21, false, None).unwrap();

        locked_mock(&vm, 0, |m| m.push_simple_exit(VMEXIT_INTR, 0, 0));
        enter_core0(&vm).unwrap();

        let core = vm.core(0).vcpu.lock();
        let records = mock_of(&core).entry_records();
        let vintr = crate::vmcb::VIntr(records[0].vintr);
        assert!(vintr.v_irq());
        assert_eq!(vintr.v_intr_vector(), 0x21);
        assert!(vintr.v_ign_tpr());
        assert!(core.intr_state.irq_pending);
    }

    #[test]
    fn pending_exception_outranks_external_irq() {
        let vm = test_vm(1 << 20, 1 << 20, 1, PagingCfg::Nested);
        vm.apic().add_irq(0, 0x21, false, None).unwrap();
        vm.core(0)
            .shared
            .excp
            .raise_exception_with_error(crate::excp::GPF_EXCEPTION, 0x11)
            .unwrap();

        locked_mock(&vm, 0, |m| m.push_simple_exit(VMEXIT_INTR, 0, 0));
        enter_core0(&vm).unwrap();

        let core = vm.core(0).vcpu.lock();
        let records = mock_of(&core).entry_records();
        let inj = crate::vmcb::EventInj(records[0].event_inj);
        assert!(inj.valid());
        assert_eq!(u64::from(inj.ev_type()), EVENT_TYPE_EXCEPTION);
        assert_eq!(inj.vector(), crate::excp::GPF_EXCEPTION as u8);
        assert!(inj.ev());
        assert_eq!(inj.error_code(), 0x11);
        // The exception is consumed; the IRQ waits its turn.
        assert!(!core.shared.excp.pending());
    }

    #[test]
    fn eoi_releases_the_queued_irq() {
        let vm = test_vm(1 << 20, 1 << 20, 1, PagingCfg::Nested);
        let acks = Arc::new(AtomicU32::new(0));
        let ack_of = |counter: &Arc<AtomicU32>| -> crate::intr::AckFn {
            let counter = counter.clone();
            Arc::new(move |_| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        vm.apic().add_irq(0, 32, false, Some(ack_of(&acks))).unwrap();

        // The guest takes the interrupt: hardware clears V_IRQ.
        locked_mock(&vm, 0, |m| {
            m.push_exit(Box::new(|vmcb, _| {
                vmcb.control.vintr.set_v_irq(false);
                vmcb.control.exit_code = VMEXIT_INTR;
            }));
        });
        enter_core0(&vm).unwrap();

        {
            let core = vm.core(0).vcpu.lock();
            assert!(!core.intr_state.irq_pending);
            assert!(!core.intr_state.irq_started, "taken fully vectored");
        }

        // A second vector-32 request queues behind the in-service one.
        vm.apic().add_irq(0, 32, false, Some(ack_of(&acks))).unwrap();
        {
            let core = vm.core(0).vcpu.lock();
            assert!(!vm.apic().intr_pending(&core));
        }

        // Guest writes EOI.
        {
            let mut core = vm.core(0).vcpu.lock();
            let base = vm.apic().base_addr(0);
            let core_ref = &mut *core;
            vm.apic()
                .apic_write(&vm, core_ref, base + 0xb0, &0u32.to_le_bytes())
                .unwrap();
        }
        assert_eq!(acks.load(Ordering::SeqCst), 1, "ack fired exactly once");

        // The queued vector is deliverable again and asserts on the next
        // entry.
        locked_mock(&vm, 0, |m| m.push_simple_exit(VMEXIT_INTR, 0, 0));
        enter_core0(&vm).unwrap();
        let core = vm.core(0).vcpu.lock();
        let records = mock_of(&core).entry_records();
        let vintr = crate::vmcb::VIntr(records[1].vintr);
        assert!(vintr.v_irq());
        assert_eq!(vintr.v_intr_vector(), 32);
    }

    #[test]
    fn interrupted_injection_is_reasserted() {
        let vm = test_vm(1 << 20, 1 << 20, 1, PagingCfg::Nested);
        vm.apic().add_irq(0, 0x40, false, None).unwrap();

        // Entry 1: injection starts (V_IRQ cleared by hardware) but the
        // exit reports it was interrupted mid-delivery.
        locked_mock(&vm, 0, |m| {
            m.push_exit(Box::new(|vmcb, _| {
                vmcb.control.vintr.set_v_irq(false);
                vmcb.control.exit_int_info.set_vector(0x40);
                vmcb.control.exit_int_info.set_valid(true);
                vmcb.control.exit_code = VMEXIT_INTR;
            }));
            // Entry 2 observes the re-assertion.
            m.push_exit(Box::new(|vmcb, _| {
                vmcb.control.exit_int_info.set_valid(false);
                vmcb.control.exit_code = VMEXIT_INTR;
            }));
        });

        enter_core0(&vm).unwrap();
        {
            let core = vm.core(0).vcpu.lock();
            assert!(core.intr_state.irq_started, "delivery did not complete");
        }

        enter_core0(&vm).unwrap();
        let core = vm.core(0).vcpu.lock();
        let records = mock_of(&core).entry_records();
        let vintr = crate::vmcb::VIntr(records[1].vintr);
        assert!(vintr.v_irq(), "same vector asserted again");
        assert_eq!(vintr.v_intr_vector(), 0x40);
    }

    #[test]
    fn nm_exit_completes_lazy_fpu_activation() {
        let vm = test_vm(1 << 20, 1 << 20, 1, PagingCfg::Nested);

        {
            let mut core = vm.core(0).vcpu.lock();
            core.fpu.arch_state.fxstate[0] = 0x42;
        }

        // Entry 1 exits with #NM (guest touched the FPU while TS armed).
        locked_mock(&vm, 0, |m| {
            m.push_simple_exit(VMEXIT_EXCP_NM, 0, 0);
            m.push_simple_exit(VMEXIT_INTR, 0, 0);
        });

        enter_core0(&vm).unwrap();
        {
            let core = vm.core(0).vcpu.lock();
            let records = mock_of(&core).entry_records();
            assert_ne!(records[0].cr0 & (1 << 3), 0, "TS armed on first entry");
            assert!(core.fpu.fpu_activated);
            assert_eq!(mock_of(&core).live_fpu()[0], 0x42, "guest image loaded");
        }

        // The second entry runs with TS clear so the instruction completes
        // without another exit.
        enter_core0(&vm).unwrap();
        let core = vm.core(0).vcpu.lock();
        let records = mock_of(&core).entry_records();
        assert_eq!(records[1].cr0 & (1 << 3), 0);
    }

    #[test]
    fn nested_fault_promotes_to_a_giant_page() {
        let (vm, mut core) = nested_test_vm(1 << 20, 1 << 20);

        // Eight fabricated 128 MiB blocks, host-contiguous from a 1 GiB
        // aligned base.
        let blocks: alloc::vec::Vec<u64> = (0..8u64)
            .map(|i| 0x8000_0000 + i * 0x800_0000)
            .collect();
        *vm.mem_map().write() =
            MemMap::testing_with_blocks(vm.host_arc(), 0x800_0000, &blocks);

        direct::handle_direct_pagefault(&vm, &mut core, 0x2000_0000, PfError(0)).unwrap();

        let host = vm.host();
        let pml4 = unsafe { table64(host, core.direct_map.root()) };
        assert!(pml4[0].present());
        let pdpt = unsafe { table64(host, pml4[0].addr()) };
        let leaf = pdpt[0];
        assert!(leaf.present());
        assert!(leaf.large_page(), "expected a 1 GiB leaf");
        assert_eq!(leaf.leaf_addr(0x4000_0000), 0x8000_0000);
        assert_eq!(core.direct_map.shape(), Some(TableShape::Long4));
    }

    #[test]
    fn bsp_ap_startup_handshake() {
        let (vm, ()) = crate::vm::testing::nested_test_vm_cores(1 << 20, 1 << 20, 2);

        // Keep both cores looping on benign exits once started.
        for i in 0..2u32 {
            locked_mock(&vm, i, |m| m.set_default_exit(VMEXIT_INTR));
        }

        // BSP starts at the top of the BIOS area.
        {
            let core = vm.core(0).vcpu.lock();
            assert_eq!(core.segments.cs.base, 0xf0000);
            assert_eq!(core.rip, 0xfff0);
        }

        vm.launch().unwrap();

        // The BSP self-starts and runs; the AP stays parked.
        while vm.core(0).vcpu.lock().num_exits == 0 {
            std::thread::yield_now();
        }
        assert_eq!(vm.core(1).shared.run_state(), CoreRunState::Stopped);

        // BSP sends INIT to core 1.
        let init = Ipi {
            vector: 0,
            mode: DeliveryMode::Init,
            logical: false,
            trigger_mode: false,
            shorthand: Shorthand::None,
            dst: 1,
            ack: None,
        };
        vm.apic().route_ipi(&vm, None, &init).unwrap();
        assert_eq!(vm.apic().ipi_state(1), crate::apic::IpiState::Sipi);
        assert_eq!(vm.core(1).shared.run_state(), CoreRunState::Stopped);

        // Then SIPI with vector 0x70: the AP starts at 0x7000:0.
        let sipi = Ipi {
            vector: 0x70,
            mode: DeliveryMode::Sipi,
            ..init
        };
        vm.apic().route_ipi(&vm, None, &sipi).unwrap();

        assert_eq!(vm.core(1).shared.run_state(), CoreRunState::Running);
        assert_eq!(vm.apic().ipi_state(1), crate::apic::IpiState::Started);
        while vm.core(1).vcpu.lock().num_exits == 0 {
            std::thread::yield_now();
        }
        {
            let core = vm.core(1).vcpu.lock();
            assert_eq!(core.segments.cs.selector, 0x7000);
            assert_eq!(core.segments.cs.base, 0x70000);
            let records = mock_of(&core).entry_records();
            assert_eq!(records[0].rip, 0, "AP executes from offset 0");
        }

        vm.stop();
        crate::vm::testing::join_test_host(&vm);
        assert_eq!(vm.core(0).shared.run_state(), CoreRunState::Stopped);
        assert_eq!(vm.core(1).shared.run_state(), CoreRunState::Stopped);
    }

    #[test]
    fn region_delete_quiesces_a_running_vm() {
        let (vm, ()) = crate::vm::testing::nested_test_vm_cores(1 << 20, 1 << 20, 1);
        locked_mock(&vm, 0, |m| m.set_default_exit(VMEXIT_INTR));

        let region = crate::mem::MemRegion::new(
            crate::cpu::CORE_ANY,
            crate::mem::RegionFlags::rwx_alloced(),
            0x4_0000,
            0x5_0000,
            0x9_0000,
        )
        .unwrap();

        vm.launch().unwrap();
        while vm.core(0).vcpu.lock().num_exits == 0 {
            std::thread::yield_now();
        }

        // Insert and delete against the running machine; both quiesce via
        // the barrier and return with the translation dropped.
        let id = vm.insert_region(region, None).unwrap();
        let exits_before = vm.core(0).vcpu.lock().num_exits;
        let _ = vm.delete_region(id, None).unwrap();
        assert!(!vm.barrier().active());

        // The guest keeps running afterwards.
        while vm.core(0).vcpu.lock().num_exits <= exits_before {
            std::thread::yield_now();
        }

        vm.stop();
        crate::vm::testing::join_test_host(&vm);
    }

    #[test]
    fn shutdown_marks_the_vm_error() {
        let (vm, ()) = crate::vm::testing::nested_test_vm_cores(1 << 20, 1 << 20, 1);
        // Default script is empty: the first entry reports shutdown.
        vm.launch().unwrap();
        crate::vm::testing::join_test_host(&vm);
        assert_eq!(vm.run_state(), crate::vm::VmRunState::Error);
        assert_eq!(vm.core(0).shared.run_state(), CoreRunState::Stopped);
    }

    #[test]
    fn guest_cr8_travels_through_v_tpr() {
        let vm = test_vm(1 << 20, 1 << 20, 1, PagingCfg::Nested);
        {
            let mut core = vm.core(0).vcpu.lock();
            core.ctrl_regs.cr8 = 0x5;
        }
        locked_mock(&vm, 0, |m| {
            m.push_exit(Box::new(|vmcb, _| {
                // Guest raised its TPR before exiting.
                vmcb.control.vintr.set_v_tpr(0x9);
                vmcb.control.exit_code = VMEXIT_INTR;
            }));
        });
        enter_core0(&vm).unwrap();

        let core = vm.core(0).vcpu.lock();
        let records = mock_of(&core).entry_records();
        assert_eq!(crate::vmcb::VIntr(records[0].vintr).v_tpr(), 0x5);
        assert_eq!(core.ctrl_regs.cr8, 0x9);
    }
}
