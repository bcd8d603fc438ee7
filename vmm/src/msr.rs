//! The module containing the hooked-MSR map.
//!
//! Every MSR the VMM cares about is registered here with a read and a write
//! policy. `Passthrough` leaves the corresponding permission-bitmap bits
//! clear so hardware handles the access against the VMCB-shadowed value;
//! `Handler` sets the intercept and routes the exit to the device or
//! control-register code that owns the MSR. Unregistered MSRs that somehow
//! exit anyway earn the guest a #GP, which is also what real hardware does
//! for nonexistent MSRs.

use crate::{
    cpu::Vcpu,
    error::{Result, VmmError},
    excp::GPF_EXCEPTION,
    host::{zero_pages, AllocZone, VmmHost},
    vm::Vm,
};
use alloc::{collections::BTreeMap, sync::Arc};
use log::warn;
use spin::RwLock;

/// MSR numbers not provided by the `x86` crate.
pub const SVM_VM_CR_MSR: u32 = 0xc001_0114;
pub const INT_PENDING_MSR: u32 = 0xc001_0055;

/// Handles one side of a hooked MSR.
pub trait MsrHandler: Send + Sync {
    fn read(&self, vm: &Vm, core: &mut Vcpu, msr: u32) -> Result<u64> {
        let _ = (vm, core);
        Err(VmmError::MsrAccess(msr))
    }

    fn write(&self, vm: &Vm, core: &mut Vcpu, msr: u32, value: u64) -> Result<()> {
        let _ = (vm, core, value);
        Err(VmmError::MsrAccess(msr))
    }
}

/// The access policy for one direction of one MSR.
#[derive(Clone)]
pub enum MsrAccess {
    /// No intercept; hardware uses the VMCB/state shadow.
    Passthrough,
    /// Intercept and call.
    Handler(Arc<dyn MsrHandler>),
}

impl MsrAccess {
    fn intercepted(&self) -> bool {
        matches!(self, Self::Handler(_))
    }
}

#[derive(Clone)]
struct MsrHook {
    read: MsrAccess,
    write: MsrAccess,
}

/// The VM-wide MSR hook map plus the hardware permission bitmap.
///
/// The map is append-only while the VM is stopped; runtime registration is
/// a configuration error.
pub struct MsrMap {
    host: Arc<dyn VmmHost>,
    hooks: RwLock<BTreeMap<u32, MsrHook>>,
    /// Two pages of MSR permission bits handed to the VMCB.
    msrpm_hpa: u64,
}

const MSRPM_PAGES: usize = 2;

impl MsrMap {
    pub(crate) fn new(host: &Arc<dyn VmmHost>) -> Result<Self> {
        let msrpm_hpa = host
            .alloc_pages(MSRPM_PAGES, AllocZone::Any, None)
            .ok_or(VmmError::OutOfHostMemory)?;
        zero_pages(host.as_ref(), msrpm_hpa, MSRPM_PAGES);
        Ok(Self {
            host: Arc::clone(host),
            hooks: RwLock::new(BTreeMap::new()),
            msrpm_hpa,
        })
    }

    /// The MSR permission map base for the VMCB.
    #[must_use]
    pub fn msrpm_base(&self) -> u64 {
        self.msrpm_hpa
    }

    /// Registers a hook for `msr`. The permission bitmap picks up an
    /// intercept for each handled direction.
    pub fn hook(&self, msr: u32, read: MsrAccess, write: MsrAccess) -> Result<()> {
        self.set_intercept(msr, read.intercepted(), write.intercepted())?;
        let _ = self
            .hooks
            .write()
            .insert(msr, MsrHook { read, write });
        Ok(())
    }

    /// Flips the permission-bitmap bits for one MSR.
    ///
    /// See: 15.11 MSR Intercepts
    fn set_intercept(&self, msr: u32, read: bool, write: bool) -> Result<()> {
        let base = match msr {
            0x0000_0000..=0x0000_1fff => 0usize,
            0xc000_0000..=0xc000_1fff => 0x800,
            0xc001_0000..=0xc001_1fff => 0x1000,
            _ => return Err(VmmError::Config("MSR outside permission map ranges")),
        };
        let index = (msr & 0x1fff) as usize;
        let byte = base + index / 4;
        let shift = (index % 4) * 2;

        let ptr = self.host.hpa_to_hva(self.msrpm_hpa);
        // Safety: `byte` is within the two bitmap pages allocated above.
        unsafe {
            let p = ptr.add(byte);
            let mut val = p.read();
            val &= !(0b11 << shift);
            val |= u8::from(read) << shift;
            val |= u8::from(write) << (shift + 1);
            p.write(val);
        }
        Ok(())
    }

    fn lookup(&self, msr: u32) -> Option<MsrHook> {
        self.hooks.read().get(&msr).cloned()
    }
}

impl Drop for MsrMap {
    fn drop(&mut self) {
        self.host.free_pages(self.msrpm_hpa, MSRPM_PAGES);
    }
}

impl core::fmt::Debug for MsrMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MsrMap")
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

/// Dispatches an MSR-intercept exit. `is_write` comes from exit info.
pub fn handle_msr_exit(vm: &Vm, core: &mut Vcpu, is_write: bool) -> Result<()> {
    const WRMSR_LEN: u64 = 2;

    let msr = core.regs.rcx as u32;
    let hook = vm.msr_map().lookup(msr);

    let access = hook.map(|h| if is_write { h.write } else { h.read });
    match access {
        Some(MsrAccess::Handler(handler)) => {
            if is_write {
                let value = (core.regs.rdx << 32) | (core.regs.rax & 0xffff_ffff);
                handler.write(vm, core, msr, value)?;
            } else {
                let value = handler.read(vm, core, msr)?;
                core.regs.rax = value & 0xffff_ffff;
                core.regs.rdx = value >> 32;
            }
        }
        Some(MsrAccess::Passthrough) | None => {
            // Either the bitmap and map disagree or the guest touched an
            // MSR nothing claims. Both earn #GP.
            warn!(
                "core {}: unhandled {} of MSR {msr:#x}",
                core.vcpu_id,
                if is_write { "write" } else { "read" }
            );
            core.shared.excp.raise_exception_with_error(GPF_EXCEPTION, 0)?;
            return Ok(());
        }
    }

    let nrip = core.vmcb.control.nrip;
    core.rip = if nrip != 0 { nrip } else { core.rip + WRMSR_LEN };
    Ok(())
}

/// The VM_CR virtualization: SVM is reported locked off by firmware so the
/// guest does not try to nest.
pub struct VmCrHandler;

impl MsrHandler for VmCrHandler {
    fn read(&self, _vm: &Vm, _core: &mut Vcpu, _msr: u32) -> Result<u64> {
        const VM_CR_LOCK: u64 = 1 << 3;
        const VM_CR_SVMDIS: u64 = 1 << 4;
        Ok(VM_CR_LOCK | VM_CR_SVMDIS)
    }

    fn write(&self, _vm: &Vm, _core: &mut Vcpu, _msr: u32, value: u64) -> Result<()> {
        const VM_CR_LOCK: u64 = 1 << 3;
        const VM_CR_SVMDIS: u64 = 1 << 4;
        // LOCK and SVMDIS writes are silently ignored; anything else is
        // unsupported.
        if value & !(VM_CR_LOCK | VM_CR_SVMDIS) != 0 {
            return Err(VmmError::MsrAccess(SVM_VM_CR_MSR));
        }
        Ok(())
    }
}

/// Write-rejecting hook for MSRs whose reads may pass through.
pub struct RejectWrites;

impl MsrHandler for RejectWrites {
    fn write(&self, _vm: &Vm, core: &mut Vcpu, msr: u32, value: u64) -> Result<()> {
        warn!(
            "core {}: ignoring write of {value:#x} to MSR {msr:#x}",
            core.vcpu_id
        );
        Ok(())
    }
}
