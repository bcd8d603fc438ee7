//! The module containing the hypercall dispatch map.
//!
//! The guest reaches the VMM with `vmmcall`, passing a 16-bit hypercall id
//! in RAX and arguments in the other GPRs. Handlers receive the full
//! register file through the vCPU and may mutate it before the guest
//! resumes. A handful of ids are reserved for the core's own services.

use crate::{
    cpu::Vcpu,
    error::{Result, VmmError},
    excp::UD_EXCEPTION,
    vm::Vm,
};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec};
use log::{error, info};
use spin::RwLock;

/// Reserved hypercall ids.
pub const TEST_HCALL: u16 = 0x0001;
pub const MEM_OFFSET_HCALL: u16 = 0x1000;
pub const VM_INFO_HCALL: u16 = 0x3000;
pub const DEBUG_CMD_HCALL: u16 = 0x3002;
pub const OS_DEBUG_HCALL: u16 = 0xc0c0;
pub const YIELD_TO_PID_HCALL: u16 = 0xd100;
pub const YIELD_TO_CORE_HCALL: u16 = 0xd101;

/// A hypercall handler.
pub type HcallFn = Arc<dyn Fn(&Vm, &mut Vcpu, u16) -> Result<()> + Send + Sync>;

/// The VM-wide hypercall map. Append-only while the VM is stopped.
#[derive(Default)]
pub struct HcallMap {
    hooks: RwLock<BTreeMap<u16, HcallFn>>,
}

impl HcallMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u16, handler: HcallFn) -> Result<()> {
        let mut hooks = self.hooks.write();
        if hooks.contains_key(&id) {
            return Err(VmmError::Config("hypercall id already registered"));
        }
        let _ = hooks.insert(id, handler);
        Ok(())
    }

    pub fn remove(&self, id: u16) {
        let _ = self.hooks.write().remove(&id);
    }

    fn lookup(&self, id: u16) -> Option<HcallFn> {
        self.hooks.read().get(&id).cloned()
    }
}

impl core::fmt::Debug for HcallMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HcallMap")
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

/// Handles a VMMCALL exit. Unknown ids earn the guest a #UD, as if the
/// instruction did not exist.
pub fn handle_hypercall(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    const VMMCALL_LEN: u64 = 3;

    let id = core.regs.rax as u16;
    let Some(handler) = vm.hcall_map().lookup(id) else {
        error!("core {}: unknown hypercall {id:#x}", core.vcpu_id);
        core.shared.excp.raise_exception(UD_EXCEPTION)?;
        return Ok(());
    };

    handler(vm, core, id)?;

    let nrip = core.vmcb.control.nrip;
    core.rip = if nrip != 0 { nrip } else { core.rip + VMMCALL_LEN };
    Ok(())
}

/// Registers the core's reserved hypercalls.
pub(crate) fn init_hypercalls(vm: &Vm) -> Result<()> {
    // MEM_OFFSET: report where the first base block landed in host memory.
    vm.hcall_map().register(
        MEM_OFFSET_HCALL,
        Arc::new(|vm, core, _id| {
            let map = vm.mem_map().read();
            let base = map
                .base_regions()
                .first()
                .map(|r| r.host_addr)
                .ok_or(VmmError::Contract("VM has no base memory"))?;
            core.regs.rbx = base;
            Ok(())
        }),
    )?;

    // VM_INFO: dump the core's state to the host log.
    vm.hcall_map().register(
        VM_INFO_HCALL,
        Arc::new(|_vm, core, _id| {
            info!("{core:#x?}");
            Ok(())
        }),
    )?;

    // DEBUG_CMD: log the guest-supplied debug command word.
    vm.hcall_map().register(
        DEBUG_CMD_HCALL,
        Arc::new(|_vm, core, _id| {
            info!("core {}: guest debug command {:#x}", core.vcpu_id, core.regs.rbx);
            Ok(())
        }),
    )?;

    // OS_DEBUG: print a guest-resident message buffer (RBX = gpa,
    // RCX = length).
    vm.hcall_map().register(
        OS_DEBUG_HCALL,
        Arc::new(|vm, core, _id| {
            const MAX_DEBUG_LEN: usize = 1024;

            let gpa = core.regs.rbx;
            let len = (core.regs.rcx as usize).min(MAX_DEBUG_LEN);
            let mut buf = vec![0u8; len];
            vm.mem_map().read().read_gpa(core.vcpu_id as u16, gpa, &mut buf)?;
            let msg = String::from_utf8_lossy(&buf);
            info!("core {} guest: {}", core.vcpu_id, msg.trim_end());
            Ok(())
        }),
    )?;

    // YIELD_TO_PID: directed host yield (RBX = pid, RCX = tid).
    vm.hcall_map().register(
        YIELD_TO_PID_HCALL,
        Arc::new(|vm, core, _id| {
            vm.host().yield_to_pid(core.regs.rbx as u32, core.regs.rcx as u32);
            Ok(())
        }),
    )?;

    // YIELD_TO_CORE: yield in favor of another vCPU (RBX = vcpu id).
    vm.hcall_map().register(
        YIELD_TO_CORE_HCALL,
        Arc::new(|vm, core, _id| {
            let target = core.regs.rbx as u32;
            if target >= vm.num_cores() {
                error!("core {}: yield to invalid core {target}", core.vcpu_id);
                return Err(VmmError::InvalidVector(target));
            }
            vm.host().yield_cpu();
            Ok(())
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::nested_test_vm;

    #[test]
    fn mem_offset_returns_base_block() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        init_hypercalls(&vm).unwrap();

        core.regs.rax = u64::from(MEM_OFFSET_HCALL);
        core.rip = 0x100;
        handle_hypercall(&vm, &mut core).unwrap();

        let base = vm.mem_map().read().base_regions()[0].host_addr;
        assert_eq!(core.regs.rbx, base);
        assert_eq!(core.rip, 0x103);
    }

    #[test]
    fn unknown_hypercall_injects_ud() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        init_hypercalls(&vm).unwrap();

        core.regs.rax = 0xbeef;
        handle_hypercall(&vm, &mut core).unwrap();
        assert_eq!(core.shared.excp.next_pending(), Some(UD_EXCEPTION));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        init_hypercalls(&vm).unwrap();
        assert!(vm
            .hcall_map()
            .register(MEM_OFFSET_HCALL, Arc::new(|_, _, _| Ok(())))
            .is_err());
    }

    #[test]
    fn os_debug_reads_guest_buffer() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        init_hypercalls(&vm).unwrap();

        vm.mem_map().read().write_gpa(0, 0x2000, b"hello from the guest").unwrap();
        core.regs.rax = u64::from(OS_DEBUG_HCALL);
        core.regs.rbx = 0x2000;
        core.regs.rcx = 20;
        handle_hypercall(&vm, &mut core).unwrap();
    }
}
