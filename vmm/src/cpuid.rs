//! The module containing the CPUID hook map.
//!
//! CPUID is always intercepted. Unhooked leaves execute the host's CPUID;
//! the VMM then registers hooks that sanitize what the guest may learn:
//! the SVM feature bit disappears (matching the VM_CR story that firmware
//! disabled it) and the hypervisor-present bit is raised.

use crate::{cpu::Vcpu, error::Result, vm::Vm};
use alloc::{collections::BTreeMap, sync::Arc};
use spin::RwLock;

/// A hook for one CPUID leaf.
pub trait CpuidHandler: Send + Sync {
    /// Returns (eax, ebx, ecx, edx) for the leaf/subleaf.
    fn cpuid(&self, vm: &Vm, core: &mut Vcpu, leaf: u32, subleaf: u32) -> Result<[u32; 4]>;
}

/// The VM-wide CPUID hook map. Append-only while the VM is stopped.
#[derive(Default)]
pub struct CpuidMap {
    hooks: RwLock<BTreeMap<u32, Arc<dyn CpuidHandler>>>,
}

impl CpuidMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self, leaf: u32, handler: Arc<dyn CpuidHandler>) {
        let _ = self.hooks.write().insert(leaf, handler);
    }

    fn lookup(&self, leaf: u32) -> Option<Arc<dyn CpuidHandler>> {
        self.hooks.read().get(&leaf).cloned()
    }
}

impl core::fmt::Debug for CpuidMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuidMap")
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

/// Executes the host CPUID for the guest's leaf.
fn host_cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
    let res = x86::cpuid::cpuid!(leaf, subleaf);
    [res.eax, res.ebx, res.ecx, res.edx]
}

/// Handles a CPUID exit: hook, else host values.
pub fn handle_cpuid_exit(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    const CPUID_LEN: u64 = 2;

    let leaf = core.regs.rax as u32;
    let subleaf = core.regs.rcx as u32;

    let regs = match vm.cpuid_map().lookup(leaf) {
        Some(handler) => handler.cpuid(vm, core, leaf, subleaf)?,
        None => host_cpuid(leaf, subleaf),
    };

    core.regs.rax = u64::from(regs[0]);
    core.regs.rbx = u64::from(regs[1]);
    core.regs.rcx = u64::from(regs[2]);
    core.regs.rdx = u64::from(regs[3]);

    let nrip = core.vmcb.control.nrip;
    core.rip = if nrip != 0 { nrip } else { core.rip + CPUID_LEN };
    Ok(())
}

/// Hides the virtualization extension and advertises a hypervisor.
struct FeatureSanitizer;

impl CpuidHandler for FeatureSanitizer {
    fn cpuid(&self, _vm: &Vm, _core: &mut Vcpu, leaf: u32, subleaf: u32) -> Result<[u32; 4]> {
        const LEAF1_ECX_HYPERVISOR: u32 = 1 << 31;
        const EXT_LEAF1_ECX_SVM: u32 = 1 << 2;

        let mut regs = host_cpuid(leaf, subleaf);
        match leaf {
            0x0000_0001 => regs[2] |= LEAF1_ECX_HYPERVISOR,
            0x8000_0001 => regs[2] &= !EXT_LEAF1_ECX_SVM,
            _ => {}
        }
        Ok(regs)
    }
}

/// Installs the default leaf sanitizers.
pub(crate) fn init_cpuid_map(vm: &Vm) {
    let sanitizer = Arc::new(FeatureSanitizer);
    vm.cpuid_map().hook(0x0000_0001, sanitizer.clone());
    vm.cpuid_map().hook(0x8000_0001, sanitizer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::nested_test_vm;

    #[test]
    fn guest_never_sees_svm() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        init_cpuid_map(&vm);

        core.regs.rax = 0x8000_0001;
        core.rip = 0x100;
        handle_cpuid_exit(&vm, &mut core).unwrap();
        assert_eq!(core.regs.rcx & (1 << 2), 0);
        assert_eq!(core.rip, 0x102);

        core.regs.rax = 1;
        handle_cpuid_exit(&vm, &mut core).unwrap();
        assert_ne!(core.regs.rcx & (1 << 31), 0);
    }
}
