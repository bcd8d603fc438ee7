//! A scriptable [`HardwareVt`] backend for tests.
//!
//! Each queued script step plays the role of the processor for one VMRUN:
//! it sees the VMCB exactly as hardware would at entry and fabricates the
//! exit state (exit code, exit info, register mutations). When the script
//! runs dry the mock reports a shutdown exit, which terminates the run loop.

use super::HardwareVt;
use crate::{
    cpu::GuestRegs,
    error::Result,
    fpu::FpuArch,
    vmcb::{Vmcb, VMEXIT_SHUTDOWN},
};
use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

type ExitScript = Box<dyn FnMut(&mut Vmcb, &mut GuestRegs) + Send>;

/// What the "hardware" observed at one VM entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryRecord {
    pub vintr: u64,
    pub event_inj: u64,
    pub rip: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub tsc_offset: u64,
    pub intercept_misc1: u32,
}

pub(crate) struct MockVt {
    script: Mutex<VecDeque<ExitScript>>,
    entries: Mutex<Vec<EntryRecord>>,
    live_fpu: Mutex<[u8; 512]>,
    tsc: AtomicU64,
    /// Exit code reported when the script runs dry; shutdown by default.
    default_exit: AtomicU64,
}

impl MockVt {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            entries: Mutex::new(Vec::new()),
            live_fpu: Mutex::new([0; 512]),
            tsc: AtomicU64::new(0),
            default_exit: AtomicU64::new(VMEXIT_SHUTDOWN),
        }
    }

    /// Makes an empty script produce an endless stream of `code` exits
    /// instead of shutting the guest down.
    pub(crate) fn set_default_exit(&self, code: u64) {
        self.default_exit.store(code, Ordering::SeqCst);
    }

    /// Queues one fabricated exit.
    pub(crate) fn push_exit(&self, step: ExitScript) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Queues a trivial exit with the given code and info words.
    pub(crate) fn push_simple_exit(&self, code: u64, info1: u64, info2: u64) {
        self.push_exit(Box::new(move |vmcb, _| {
            vmcb.control.exit_code = code;
            vmcb.control.exit_info1 = info1;
            vmcb.control.exit_info2 = info2;
        }));
    }

    /// The per-entry hardware observations, oldest first.
    pub(crate) fn entry_records(&self) -> Vec<EntryRecord> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn live_fpu(&self) -> [u8; 512] {
        *self.live_fpu.lock().unwrap()
    }

    pub(crate) fn set_live_fpu(&self, index: usize, value: u8) {
        self.live_fpu.lock().unwrap()[index] = value;
    }
}

impl HardwareVt for MockVt {
    fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    fn launch(&mut self, vmcb: &mut Vmcb, regs: &mut GuestRegs) {
        self.entries.lock().unwrap().push(EntryRecord {
            vintr: vmcb.control.vintr.0,
            event_inj: vmcb.control.event_inj.0,
            rip: vmcb.save.rip,
            cr0: vmcb.save.cr0,
            cr3: vmcb.save.cr3,
            tsc_offset: vmcb.control.tsc_offset,
            intercept_misc1: vmcb.control.intercept_misc1,
        });

        let step = self.script.lock().unwrap().pop_front();
        if let Some(mut step) = step {
            step(vmcb, regs);
        } else {
            vmcb.control.exit_code = self.default_exit.load(Ordering::SeqCst);
            vmcb.control.exit_info1 = 0;
            vmcb.control.exit_info2 = 0;
        }
    }

    fn disable_host_interrupts(&self) {}

    fn enable_host_interrupts(&self) {}

    fn read_tsc(&self) -> u64 {
        self.tsc.fetch_add(10_000, Ordering::SeqCst)
    }

    fn fpu_save(&self, area: &mut FpuArch) {
        area.fxstate.copy_from_slice(&*self.live_fpu.lock().unwrap());
    }

    fn fpu_restore(&self, area: &FpuArch) {
        self.live_fpu.lock().unwrap().copy_from_slice(&area.fxstate);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
