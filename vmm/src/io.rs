//! The module containing the port IO hook map and the IOIO exit handler.
//!
//! Every port is intercepted (the IO permission bitmap is all ones, as the
//! device models are the only thing behind the port space). Hooked ports
//! dispatch to their device; unhooked ports behave like an empty bus
//! (reads float high, writes vanish) with a log line so a missing device
//! model is visible.

use crate::{
    cpu::{Vcpu, CpuMode},
    error::{Result, VmmError},
    host::{AllocZone, VmmHost},
    paging::shadow::{read_gva, write_gva},
    vm::Vm,
};
use alloc::{collections::BTreeMap, sync::Arc};
use log::warn;
use spin::RwLock;

/// A device handling one or more IO ports.
pub trait IoHandler: Send + Sync {
    fn io_read(&self, vm: &Vm, core: &mut Vcpu, port: u16, data: &mut [u8]) -> Result<()>;
    fn io_write(&self, vm: &Vm, core: &mut Vcpu, port: u16, data: &[u8]) -> Result<()>;
}

/// The VM-wide port hook map plus the hardware IO permission bitmap.
pub struct IoMap {
    host: Arc<dyn VmmHost>,
    hooks: RwLock<BTreeMap<u16, Arc<dyn IoHandler>>>,
    iopm_hpa: u64,
}

const IOPM_PAGES: usize = 3;

impl IoMap {
    pub(crate) fn new(host: &Arc<dyn VmmHost>) -> Result<Self> {
        let iopm_hpa = host
            .alloc_pages(IOPM_PAGES, AllocZone::Any, None)
            .ok_or(VmmError::OutOfHostMemory)?;
        // Intercept the whole port space.
        let ptr = host.hpa_to_hva(iopm_hpa);
        // Safety: the three bitmap pages were just allocated.
        unsafe { core::ptr::write_bytes(ptr, 0xff, IOPM_PAGES * 0x1000) };
        Ok(Self {
            host: Arc::clone(host),
            hooks: RwLock::new(BTreeMap::new()),
            iopm_hpa,
        })
    }

    /// The IO permission map base for the VMCB.
    #[must_use]
    pub fn iopm_base(&self) -> u64 {
        self.iopm_hpa
    }

    /// Hooks one port. Append-only while the VM is stopped.
    pub fn hook(&self, port: u16, handler: Arc<dyn IoHandler>) -> Result<()> {
        let mut hooks = self.hooks.write();
        if hooks.contains_key(&port) {
            return Err(VmmError::Config("IO port already hooked"));
        }
        let _ = hooks.insert(port, handler);
        Ok(())
    }

    fn lookup(&self, port: u16) -> Option<Arc<dyn IoHandler>> {
        self.hooks.read().get(&port).cloned()
    }
}

impl Drop for IoMap {
    fn drop(&mut self) {
        self.host.free_pages(self.iopm_hpa, IOPM_PAGES);
    }
}

impl core::fmt::Debug for IoMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoMap")
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

/// The decoded IOIO exit information word.
///
/// See: 15.10.2 IN and OUT Behavior
#[derive(Debug, Clone, Copy)]
struct IoInfo {
    port: u16,
    is_in: bool,
    string: bool,
    rep: bool,
    size: usize,
    addr_size: usize,
}

impl IoInfo {
    fn parse(info1: u64) -> Self {
        Self {
            port: (info1 >> 16) as u16,
            is_in: info1 & 1 != 0,
            string: info1 & (1 << 2) != 0,
            rep: info1 & (1 << 3) != 0,
            size: if info1 & (1 << 4) != 0 {
                1
            } else if info1 & (1 << 5) != 0 {
                2
            } else {
                4
            },
            addr_size: if info1 & (1 << 7) != 0 {
                2
            } else if info1 & (1 << 8) != 0 {
                4
            } else {
                8
            },
        }
    }
}

fn do_io_read(vm: &Vm, core: &mut Vcpu, port: u16, data: &mut [u8]) -> Result<()> {
    if let Some(handler) = vm.io_map().lookup(port) {
        handler.io_read(vm, core, port, data)
    } else {
        warn!("core {}: read from unhooked IO port {port:#x}", core.vcpu_id);
        data.fill(0xff);
        Ok(())
    }
}

fn do_io_write(vm: &Vm, core: &mut Vcpu, port: u16, data: &[u8]) -> Result<()> {
    if let Some(handler) = vm.io_map().lookup(port) {
        handler.io_write(vm, core, port, data)
    } else {
        warn!("core {}: write to unhooked IO port {port:#x}", core.vcpu_id);
        Ok(())
    }
}

fn mask_to(addr: u64, size: usize) -> u64 {
    match size {
        2 => addr & 0xffff,
        4 => addr & 0xffff_ffff,
        _ => addr,
    }
}

/// Handles an IOIO exit. `info2` carries the RIP of the next instruction.
pub fn handle_io_exit(vm: &Vm, core: &mut Vcpu, info1: u64, info2: u64) -> Result<()> {
    let io = IoInfo::parse(info1);
    let mut buf = [0u8; 4];
    let data = &mut buf[..io.size];

    if io.string {
        handle_string_io(vm, core, &io)?;
    } else if io.is_in {
        do_io_read(vm, core, io.port, data)?;
        // IN zero-extends into EAX for 32-bit, merges for narrower widths.
        let value = u64::from(u32::from_le_bytes(buf)) & ((1 << (io.size * 8)) - 1);
        core.regs.rax = match io.size {
            4 => value,
            2 => (core.regs.rax & !0xffff) | value,
            _ => (core.regs.rax & !0xff) | value,
        };
    } else {
        let bytes = core.regs.rax.to_le_bytes();
        data.copy_from_slice(&bytes[..io.size]);
        do_io_write(vm, core, io.port, data)?;
    }

    core.rip = info2;
    Ok(())
}

/// INS/OUTS move through guest memory at RSI/RDI, honoring REP and the
/// direction flag.
fn handle_string_io(vm: &Vm, core: &mut Vcpu, io: &IoInfo) -> Result<()> {
    const RFLAGS_DF: u64 = 1 << 10;

    let df_down = core.ctrl_regs.rflags & RFLAGS_DF != 0;
    let step = io.size as u64;
    let mut count = if io.rep {
        mask_to(core.regs.rcx, io.addr_size)
    } else {
        1
    };

    // ES:RDI for INS, DS:RSI for OUTS. Real-mode segmentation is honored
    // through the cached bases.
    let (seg_base, mut index) = if io.is_in {
        (core.segments.es.base, mask_to(core.regs.rdi, io.addr_size))
    } else {
        (core.segments.ds.base, mask_to(core.regs.rsi, io.addr_size))
    };

    let physical = core.cpu_mode == CpuMode::Real || core.mem_mode == crate::cpu::MemMode::Physical;

    while count > 0 {
        let mut buf = [0u8; 4];
        let data = &mut buf[..io.size];
        let gva = seg_base.wrapping_add(index);

        if io.is_in {
            do_io_read(vm, core, io.port, data)?;
            if physical {
                vm.mem_map().read().write_gpa(core.vcpu_id as u16, gva, data)?;
            } else {
                write_gva(vm, core, gva, data)?;
            }
        } else {
            if physical {
                vm.mem_map().read().read_gpa(core.vcpu_id as u16, gva, data)?;
            } else {
                read_gva(vm, core, gva, data)?;
            }
            do_io_write(vm, core, io.port, data)?;
        }

        index = if df_down {
            index.wrapping_sub(step)
        } else {
            index.wrapping_add(step)
        };
        count -= 1;
    }

    // Write the advanced index and count back.
    if io.is_in {
        core.regs.rdi = index;
    } else {
        core.regs.rsi = index;
    }
    if io.rep {
        core.regs.rcx = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::nested_test_vm;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct Latch {
        last_write: AtomicU32,
        read_value: u32,
    }

    impl IoHandler for Latch {
        fn io_read(&self, _vm: &Vm, _core: &mut Vcpu, _port: u16, data: &mut [u8]) -> Result<()> {
            let bytes = self.read_value.to_le_bytes();
            data.copy_from_slice(&bytes[..data.len()]);
            Ok(())
        }

        fn io_write(&self, _vm: &Vm, _core: &mut Vcpu, _port: u16, data: &[u8]) -> Result<()> {
            let mut buf = [0u8; 4];
            buf[..data.len()].copy_from_slice(data);
            self.last_write.store(u32::from_le_bytes(buf), Ordering::SeqCst);
            Ok(())
        }
    }

    fn io_info(port: u16, is_in: bool, size: usize) -> u64 {
        let size_bit = match size {
            1 => 1 << 4,
            2 => 1 << 5,
            _ => 1 << 6,
        };
        (u64::from(port) << 16) | u64::from(is_in) | size_bit
    }

    #[test]
    fn out_reaches_the_hook_and_advances_rip() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        let latch = Arc::new(Latch {
            last_write: AtomicU32::new(0),
            read_value: 0,
        });
        vm.io_map().hook(0x510, latch.clone()).unwrap();

        core.regs.rax = 0x1122_3344;
        handle_io_exit(&vm, &mut core, io_info(0x510, false, 2), 0x4002).unwrap();

        assert_eq!(latch.last_write.load(Ordering::SeqCst), 0x3344);
        assert_eq!(core.rip, 0x4002);
    }

    #[test]
    fn in_merges_by_width() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        let latch = Arc::new(Latch {
            last_write: AtomicU32::new(0),
            read_value: 0xa1b2_c3d4,
        });
        vm.io_map().hook(0x71, latch).unwrap();

        core.regs.rax = 0xffff_ffff_ffff_ffff;
        handle_io_exit(&vm, &mut core, io_info(0x71, true, 1), 0x10).unwrap();
        assert_eq!(core.regs.rax, 0xffff_ffff_ffff_ffd4);

        handle_io_exit(&vm, &mut core, io_info(0x71, true, 4), 0x12).unwrap();
        assert_eq!(core.regs.rax, 0xa1b2_c3d4);
    }

    #[test]
    fn unhooked_port_floats_high() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        core.regs.rax = 0;
        handle_io_exit(&vm, &mut core, io_info(0x80, true, 4), 0x10).unwrap();
        assert_eq!(core.regs.rax, 0xffff_ffff);
    }
}
