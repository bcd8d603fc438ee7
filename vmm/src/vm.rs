//! The module containing the [`Vm`] container and its control-plane API.
//!
//! A VM owns everything about one guest: the core table, the physical
//! memory map, the hook maps for IO ports, MSRs, CPUID leaves and
//! hypercalls, the interrupt routers and LAPIC cluster, the device
//! registry, the checkpoint registry and the rendezvous barrier. Cores and
//! devices never hold owning references back; cross-core work always goes
//! through the VM.
//!
//! Lifecycle: created stopped, launched onto one pinned host thread per
//! core, pausable and resumable through the barrier, stopped cooperatively,
//! and marked `Error` if an exit handler fails, after which the cores park
//! themselves and the VM stays inspectable.

use crate::{
    apic::ApicDev,
    barrier::Barrier,
    cfg::VmConfig,
    chkpt::{ChkptOps, ChkptRegistry, RecordReader, RecordWriter},
    cpu::{CoreShared, PagingMode, Segment, Vcpu},
    cpuid::{init_cpuid_map, CpuidMap},
    ctrl_regs::EferHandler,
    dev::DevMgr,
    error::{Result, VmmError},
    fpu,
    host::VmmHost,
    hypercall::{init_hypercalls, HcallMap},
    intr::IntrRouters,
    io::IoMap,
    mem::{FullHookRegion, MemMap, MemRegion, RegionFlags, RegionId, PAGE_SIZE_4KB},
    msr::{MsrAccess, MsrMap, RejectWrites, VmCrHandler, INT_PENDING_MSR, SVM_VM_CR_MSR},
    paging::{direct, shadow},
    vmcb,
};
use alloc::{boxed::Box, format, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};
use log::{error, info};
use spin::{Mutex, RwLock};

/// MSR numbers for the always-hooked set.
const APIC_BASE_MSR: u32 = 0x0000_001b;
const SYSENTER_CS_MSR: u32 = 0x0000_0174;
const SYSENTER_ESP_MSR: u32 = 0x0000_0175;
const SYSENTER_EIP_MSR: u32 = 0x0000_0176;
const STAR_MSR: u32 = 0xc000_0081;
const LSTAR_MSR: u32 = 0xc000_0082;
const CSTAR_MSR: u32 = 0xc000_0083;
const SFMASK_MSR: u32 = 0xc000_0084;
const FS_BASE_MSR: u32 = 0xc000_0100;
const GS_BASE_MSR: u32 = 0xc000_0101;
const KERNEL_GS_BASE_MSR: u32 = 0xc000_0102;

/// The lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmRunState {
    Invalid = 0,
    Stopped = 1,
    Running = 2,
    Paused = 3,
    Error = 4,
}

impl From<u32> for VmRunState {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Stopped,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Error,
            _ => Self::Invalid,
        }
    }
}

/// One slot of the core table: the lock-free shared face plus the vCPU
/// image, which only the owning thread (or a quiesced-state mutator) locks.
pub struct CoreCell {
    pub shared: Arc<CoreShared>,
    pub vcpu: Mutex<Vcpu>,
}

/// Builds the hardware backend for one core.
pub type VtFactory = dyn Fn(u32) -> Box<dyn crate::hw_vt::HardwareVt> + Send + Sync;

pub struct Vm {
    name: String,
    host: Arc<dyn VmmHost>,
    config: VmConfig,
    run_state: AtomicU32,
    paging_mode: PagingMode,

    mem_map: RwLock<MemMap>,
    io_map: IoMap,
    msr_map: MsrMap,
    cpuid_map: CpuidMap,
    hcall_map: HcallMap,
    intr_routers: IntrRouters,
    dev_mgr: DevMgr,
    chkpt: ChkptRegistry,
    barrier: Barrier,
    apic: Arc<ApicDev>,

    cores: Vec<CoreCell>,
}

impl Vm {
    /// Creates a stopped VM from a machine description, driving real SVM
    /// hardware.
    pub fn create(config: VmConfig, host: Arc<dyn VmmHost>) -> Result<Arc<Self>> {
        Self::create_with(config, host, &|_| Box::new(crate::hw_vt::svm::Svm::new()))
    }

    /// Creates a stopped VM with a caller-chosen hardware backend.
    pub fn create_with(
        config: VmConfig,
        host: Arc<dyn VmmHost>,
        vt_factory: &VtFactory,
    ) -> Result<Arc<Self>> {
        let paging_mode = match config.paging {
            crate::cfg::PagingCfg::Shadow => PagingMode::Shadow,
            crate::cfg::PagingCfg::Nested => PagingMode::Nested,
        };

        let mem_map = MemMap::init(
            &host,
            config.mem_bytes(),
            config.memory.block_size,
            |gpa| config.numa_node_of(gpa),
        )?;

        let num_cores = config.cores.count;
        let apic = ApicDev::new(num_cores);

        let mut cores = Vec::with_capacity(num_cores as usize);
        for i in 0..num_cores {
            let vcpu = Vcpu::new(i, 0, config.pcpu_of(i), paging_mode, vt_factory(i));
            cores.push(CoreCell {
                shared: Arc::clone(&vcpu.shared),
                vcpu: Mutex::new(vcpu),
            });
        }

        let vm = Arc::new(Self {
            name: config.name.clone(),
            host: Arc::clone(&host),
            io_map: IoMap::new(&host)?,
            msr_map: MsrMap::new(&host)?,
            cpuid_map: CpuidMap::new(),
            hcall_map: HcallMap::new(),
            intr_routers: IntrRouters::new(),
            dev_mgr: DevMgr::new(),
            chkpt: ChkptRegistry::new(),
            barrier: Barrier::new(),
            apic,
            config,
            run_state: AtomicU32::new(VmRunState::Stopped as u32),
            paging_mode,
            mem_map: RwLock::new(mem_map),
            cores,
        });

        vm.late_init()?;
        info!("created VM {:?} ({num_cores} cores)", vm.name);
        Ok(vm)
    }

    /// Everything that needs the finished container: per-core machine
    /// state, hooks, checkpoint contributors and devices.
    fn late_init(self: &Arc<Self>) -> Result<()> {
        // Per-core machine state.
        for i in 0..self.num_cores() {
            let mut core = self.cores[i as usize].vcpu.lock();
            core.use_large_pages = self.config.large_pages;
            core.use_giant_pages = self.config.giant_pages;

            self.init_core_vmcb(&mut core);
            core.reset_to_bios();
            fpu::fpu_init(&mut core);

            match self.paging_mode {
                PagingMode::Shadow => {
                    // The guest starts with paging architecturally off, but
                    // hardware always translates; the passthrough tree is
                    // the one hardware walks until the guest enables paging.
                    core.shdw_pg_state.guest_cr0 = 0x10;
                    core.ctrl_regs.cr0 |= 1 << 31;
                    direct::init_passthrough(self, &mut core)?;
                    direct::activate_passthrough(&mut core)?;
                }
                PagingMode::Nested => {
                    direct::init_nested(self, &mut core)?;
                    core.vmcb.control.ncr3 = core.direct_map.root();
                }
            }

            core.intr_state.register_controller(self.apic.clone());
            core.time.register_timer(self.apic.clone());
        }

        // The LAPIC MMIO window, one per core.
        for i in 0..self.num_cores() {
            let base = self.apic.base_addr(i as usize);
            let region = MemRegion::new(i as u16, RegionFlags::hook(), base, base + 0x1000, 0)?
                .with_handler(Arc::new(FullHookRegion::new(self.apic.clone())));
            let _ = self.mem_map.write().insert_region(region)?;
        }

        // The always-hooked MSR set.
        let efer = Arc::new(EferHandler);
        self.msr_map.hook(
            x86::msr::IA32_EFER,
            MsrAccess::Handler(efer.clone()),
            MsrAccess::Handler(efer),
        )?;
        let vm_cr = Arc::new(VmCrHandler);
        self.msr_map.hook(
            SVM_VM_CR_MSR,
            MsrAccess::Handler(vm_cr.clone()),
            MsrAccess::Handler(vm_cr),
        )?;
        let apic_msr = self.apic.clone();
        self.msr_map.hook(
            APIC_BASE_MSR,
            MsrAccess::Handler(apic_msr.clone()),
            MsrAccess::Handler(apic_msr),
        )?;
        for msr in [
            STAR_MSR,
            LSTAR_MSR,
            CSTAR_MSR,
            SFMASK_MSR,
            KERNEL_GS_BASE_MSR,
            SYSENTER_CS_MSR,
            SYSENTER_ESP_MSR,
            SYSENTER_EIP_MSR,
            FS_BASE_MSR,
            GS_BASE_MSR,
        ] {
            self.msr_map
                .hook(msr, MsrAccess::Passthrough, MsrAccess::Passthrough)?;
        }
        self.msr_map.hook(
            INT_PENDING_MSR,
            MsrAccess::Passthrough,
            MsrAccess::Handler(Arc::new(RejectWrites)),
        )?;

        init_cpuid_map(self);
        init_hypercalls(self)?;

        // Checkpoint contributors: CPU and interrupt state per core, the
        // LAPIC register files, and the raw RAM blocks.
        for i in 0..self.num_cores() {
            self.chkpt
                .register(&format!("core-{i}"), Arc::new(CoreChkpt { vcpu_id: i }))?;
            self.chkpt.register(
                &format!("core-{i}-INTR"),
                Arc::new(IntrChkpt { vcpu_id: i }),
            )?;
            self.chkpt
                .register(&format!("APIC-{i}"), Arc::new(ApicChkpt { idx: i as usize }))?;
        }
        {
            let map = self.mem_map.read();
            for (i, reg) in map.base_regions().iter().enumerate() {
                self.chkpt.register_nocopy(
                    &format!("mem-region-{i}"),
                    reg.host_addr,
                    (reg.guest_end - reg.guest_start) as usize,
                )?;
            }
        }

        // Devices named by the machine description.
        for dev_cfg in self.config.devices.clone() {
            self.dev_mgr.create_device(self, &dev_cfg)?;
        }

        Ok(())
    }

    /// The intercept configuration every core starts with.
    fn init_core_vmcb(&self, core: &mut Vcpu) {
        use crate::vmcb::*;

        let c = &mut core.vmcb.control;

        c.intercept_misc1 = INTERCEPT_INTR
            | INTERCEPT_NMI
            | INTERCEPT_INIT
            | INTERCEPT_CPUID
            | INTERCEPT_HLT
            | INTERCEPT_INVLPGA
            | INTERCEPT_IOIO_PROT
            | INTERCEPT_MSR_PROT
            | INTERCEPT_SHUTDOWN;
        c.intercept_misc2 = INTERCEPT_VMRUN
            | INTERCEPT_VMMCALL
            | INTERCEPT_VMLOAD
            | INTERCEPT_VMSAVE
            | INTERCEPT_STGI
            | INTERCEPT_CLGI
            | INTERCEPT_SKINIT
            | INTERCEPT_ICEBP
            | INTERCEPT_WBINVD
            | INTERCEPT_MONITOR
            | INTERCEPT_MWAIT
            | INTERCEPT_MWAIT_ARMED
            | INTERCEPT_XSETBV;

        // One guest per ASID; flush on entry keeps the shadow/nested
        // rebuild paths simple.
        c.guest_asid = 1;
        c.tlb_control = 1;

        // Physical interrupts stay with the host; the guest sees only what
        // the injection sequencer asserts.
        c.vintr.set_v_intr_masking(true);

        c.iopm_base_pa = self.io_map.iopm_base();
        c.msrpm_base_pa = self.msr_map.msrpm_base();

        match self.paging_mode {
            PagingMode::Shadow => {
                c.intercept_cr_read = (1 << 0) | (1 << 3);
                c.intercept_cr_write = (1 << 0) | (1 << 3) | (1 << 4);
                c.intercept_exception = 1 << 14; // #PF
                c.intercept_misc1 |= INTERCEPT_INVLPG;
            }
            PagingMode::Nested => {
                c.np_enable = 1;
            }
        }
    }

    // Accessors. Subsystems reach each other exclusively through these.

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn host(&self) -> &dyn VmmHost {
        self.host.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn host_arc(&self) -> &Arc<dyn VmmHost> {
        &self.host
    }

    #[must_use]
    pub fn mem_map(&self) -> &RwLock<MemMap> {
        &self.mem_map
    }

    #[must_use]
    pub fn io_map(&self) -> &IoMap {
        &self.io_map
    }

    #[must_use]
    pub fn msr_map(&self) -> &MsrMap {
        &self.msr_map
    }

    #[must_use]
    pub fn cpuid_map(&self) -> &CpuidMap {
        &self.cpuid_map
    }

    #[must_use]
    pub fn hcall_map(&self) -> &HcallMap {
        &self.hcall_map
    }

    #[must_use]
    pub fn intr_routers(&self) -> &IntrRouters {
        &self.intr_routers
    }

    #[must_use]
    pub fn dev_mgr(&self) -> &DevMgr {
        &self.dev_mgr
    }

    #[must_use]
    pub fn chkpt(&self) -> &ChkptRegistry {
        &self.chkpt
    }

    #[must_use]
    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    #[must_use]
    pub fn apic(&self) -> &Arc<ApicDev> {
        &self.apic
    }

    #[must_use]
    pub fn num_cores(&self) -> u32 {
        self.cores.len() as u32
    }

    #[must_use]
    pub fn core(&self, vcpu_id: u32) -> &CoreCell {
        &self.cores[vcpu_id as usize]
    }

    #[must_use]
    pub fn paging_mode(&self) -> PagingMode {
        self.paging_mode
    }

    #[must_use]
    pub fn run_state(&self) -> VmRunState {
        VmRunState::from(self.run_state.load(Ordering::Acquire))
    }

    pub fn set_run_state(&self, state: VmRunState) {
        self.run_state.store(state as u32, Ordering::Release);
    }

    /// Starts one pinned host thread per core. The BSP begins executing;
    /// APs park until their INIT/SIPI arrives.
    pub fn launch(self: &Arc<Self>) -> Result<()> {
        if self.run_state() != VmRunState::Stopped {
            return Err(VmmError::BadRunState);
        }
        self.set_run_state(VmRunState::Running);
        info!("launching VM {:?}", self.name);

        for i in 0..self.num_cores() {
            let pcpu = self.core(i).shared.pcpu_id();
            self.host.start_core_thread(self, i, pcpu)?;
        }
        Ok(())
    }

    /// Requests a cooperative stop; cores notice at their next loop
    /// checkpoint.
    pub fn stop(&self) {
        info!("stopping VM {:?}", self.name);
        let was_paused = self.run_state() == VmRunState::Paused;
        self.set_run_state(VmRunState::Stopped);
        if was_paused {
            self.barrier.lower();
        }
    }

    /// Parks every core at the barrier.
    pub fn pause(&self) -> Result<()> {
        if self.run_state() != VmRunState::Running {
            return Err(VmmError::BadRunState);
        }
        self.barrier.raise(self, None);
        self.set_run_state(VmRunState::Paused);
        Ok(())
    }

    /// Releases cores parked by [`Vm::pause`].
    pub fn continue_run(&self) -> Result<()> {
        if self.run_state() != VmRunState::Paused {
            return Err(VmmError::BadRunState);
        }
        self.set_run_state(VmRunState::Running);
        self.barrier.lower();
        Ok(())
    }

    /// Dumps one core's guest state to the host log. Usable in any run
    /// state; the snapshot may be torn if the core is executing.
    pub fn debug_core(&self, vcpu_id: u32) -> Result<()> {
        if vcpu_id >= self.num_cores() {
            return Err(VmmError::Config("vcpu id out of range"));
        }
        let core = self.core(vcpu_id).vcpu.lock();
        info!("{:#x?}", &*core);
        Ok(())
    }

    /// Re-pins a vCPU to another physical CPU.
    pub fn move_core(self: &Arc<Self>, vcpu_id: u32, target_pcpu: u32) -> Result<()> {
        if vcpu_id >= self.num_cores() {
            return Err(VmmError::Config("vcpu id out of range"));
        }
        self.core(vcpu_id).shared.set_pcpu_id(target_pcpu);
        self.host.move_core_thread(self, vcpu_id, target_pcpu)
    }

    /// Serializes the whole guest. Only valid stopped or paused.
    pub fn save(&self) -> Result<Vec<u8>> {
        match self.run_state() {
            VmRunState::Stopped | VmRunState::Paused => self.chkpt.save(self),
            _ => Err(VmmError::BadRunState),
        }
    }

    /// Restores a stream produced by [`Vm::save`]. Only valid stopped or
    /// paused.
    pub fn load(&self, data: &[u8]) -> Result<()> {
        match self.run_state() {
            VmRunState::Stopped | VmRunState::Paused => self.chkpt.load(self, data),
            _ => Err(VmmError::BadRunState),
        }
    }

    /// Inserts an overlay region, quiescing the VM if it runs and dropping
    /// every affected cached translation before guests resume.
    ///
    /// `current` names the calling vCPU when the mutation originates from
    /// an exit handler (whose core is already borrowed).
    pub fn insert_region(
        &self,
        region: MemRegion,
        mut current: Option<&mut Vcpu>,
    ) -> Result<RegionId> {
        let running = self.run_state() == VmRunState::Running;
        if running {
            self.barrier
                .raise(self, current.as_ref().map(|c| c.vcpu_id));
        }

        let result = self.mem_map.write().insert_region(region);
        if let Ok(id) = result {
            if let Some(region) = self.mem_map.read().region_by_id(id).cloned() {
                self.invalidate_all_cores(region.guest_start, region.guest_end, current.as_deref_mut());
            }
        }

        if running {
            self.barrier.lower();
        }
        result
    }

    /// Deletes an overlay region with the same quiesce-and-invalidate
    /// contract as [`Vm::insert_region`].
    pub fn delete_region(
        &self,
        id: RegionId,
        mut current: Option<&mut Vcpu>,
    ) -> Result<MemRegion> {
        let running = self.run_state() == VmRunState::Running;
        if running {
            self.barrier
                .raise(self, current.as_ref().map(|c| c.vcpu_id));
        }

        let removed = self.mem_map.write().remove_region(id);
        if let Some(region) = &removed {
            self.invalidate_all_cores(region.guest_start, region.guest_end, current.as_deref_mut());
        }

        if running {
            self.barrier.lower();
        }
        removed.ok_or(VmmError::InvalidRegion)
    }

    /// Drops cached translations of `[start, end)` on every core: per-page
    /// for passthrough and nested trees, wholesale for live shadow trees.
    fn invalidate_all_cores(&self, start: u64, end: u64, mut current: Option<&mut Vcpu>) {
        for i in 0..self.num_cores() {
            if let Some(cur) = current.as_deref_mut() {
                if cur.vcpu_id == i {
                    self.invalidate_core(cur, start, end);
                    continue;
                }
            }
            let mut core = self.cores[i as usize].vcpu.lock();
            self.invalidate_core(&mut core, start, end);
        }
    }

    fn invalidate_core(&self, core: &mut Vcpu, start: u64, end: u64) {
        use crate::cpu::MemMode;

        if core.paging_mode == PagingMode::Shadow && core.mem_mode == MemMode::Virtual {
            if let Err(e) = shadow::invalidate_shadow_pts(self, core) {
                error!("core {}: shadow invalidation failed: {e}", core.vcpu_id);
            }
            return;
        }

        let mut gpa = start;
        while gpa < end {
            if let Err(e) = direct::invalidate_direct_addr(self, core, gpa) {
                error!("core {}: invalidation failed at {gpa:#x}: {e}", core.vcpu_id);
                return;
            }
            gpa += PAGE_SIZE_4KB;
        }
    }

    /// Moves a core's LAPIC MMIO hook to a new base (APIC_BASE rewrite).
    pub(crate) fn rehook_apic_page(
        &self,
        core: &mut Vcpu,
        old_base: u64,
        new_base: u64,
    ) -> Result<()> {
        let core_id = core.vcpu_id as u16;
        let _ = self.delete_region(
            RegionId {
                guest_end: old_base + 0x1000,
                core_id,
            },
            Some(core),
        )?;
        let region = MemRegion::new(core_id, RegionFlags::hook(), new_base, new_base + 0x1000, 0)?
            .with_handler(Arc::new(FullHookRegion::new(self.apic.clone())));
        let _ = self.insert_region(region, Some(core))?;
        Ok(())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.dev_mgr.free_all(self);
        for cell in &self.cores {
            let mut core = cell.vcpu.lock();
            core.direct_map.free_all(self.host.as_ref());
            core.shdw_pg_state.shadow.free_all(self.host.as_ref());
        }
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("name", &self.name)
            .field("run_state", &self.run_state())
            .field("cores", &self.cores.len())
            .field("paging_mode", &self.paging_mode)
            .finish_non_exhaustive()
    }
}

/// The per-core CPU checkpoint record.
struct CoreChkpt {
    vcpu_id: u32,
}

fn write_segment(w: &mut RecordWriter, seg: &Segment) {
    let _ = w.u16(seg.selector);
    let _ = w.u16(vmcb::pack_attrib(seg));
    let _ = w.u32(seg.limit);
    let _ = w.u64(seg.base);
}

fn read_segment(r: &mut RecordReader<'_>) -> Result<Segment> {
    let mut seg = Segment {
        selector: r.u16()?,
        ..Segment::default()
    };
    let attrib = r.u16()?;
    seg.limit = r.u32()?;
    seg.base = r.u64()?;
    vmcb::unpack_attrib(attrib, &mut seg);
    Ok(seg)
}

impl ChkptOps for CoreChkpt {
    fn save(&self, vm: &Vm, buf: &mut Vec<u8>) -> Result<()> {
        let core = vm.core(self.vcpu_id).vcpu.lock();
        let mut w = RecordWriter::new();

        let _ = w.u64(core.rip).u8(core.cpl);
        let c = &core.ctrl_regs;
        let _ = w.u64(c.cr0).u64(c.cr2).u64(c.cr3).u64(c.cr4).u64(c.cr8);
        let _ = w.u64(c.rflags).u64(c.efer);

        let g = &core.regs;
        for v in [
            g.rax, g.rbx, g.rcx, g.rdx, g.rdi, g.rsi, g.rbp, g.r8, g.r9, g.r10, g.r11, g.r12,
            g.r13, g.r14, g.r15, g.rsp,
        ] {
            let _ = w.u64(v);
        }

        let _ = w.u64(core.dbg_regs.dr6).u64(core.dbg_regs.dr7);

        let s = &core.segments;
        for seg in [&s.cs, &s.ds, &s.es, &s.fs, &s.gs, &s.ss, &s.gdtr, &s.idtr, &s.ldtr, &s.tr] {
            write_segment(&mut w, seg);
        }

        let _ = w
            .u64(core.shdw_pg_state.guest_cr3)
            .u64(core.shdw_pg_state.guest_cr0)
            .u64(core.shdw_pg_state.guest_efer);

        let m = &core.msrs;
        for v in [
            m.star,
            m.lstar,
            m.cstar,
            m.sfmask,
            m.kern_gs_base,
            m.sysenter_cs,
            m.sysenter_esp,
            m.sysenter_eip,
            m.pat,
        ] {
            let _ = w.u64(v);
        }

        buf.extend_from_slice(&w.finish());
        Ok(())
    }

    fn load(&self, vm: &Vm, buf: &[u8]) -> Result<()> {
        let mut core = vm.core(self.vcpu_id).vcpu.lock();
        let mut r = RecordReader::new(buf);

        core.rip = r.u64()?;
        core.cpl = r.u8()?;
        core.ctrl_regs.cr0 = r.u64()?;
        core.ctrl_regs.cr2 = r.u64()?;
        core.ctrl_regs.cr3 = r.u64()?;
        core.ctrl_regs.cr4 = r.u64()?;
        core.ctrl_regs.cr8 = r.u64()?;
        core.ctrl_regs.rflags = r.u64()?;
        core.ctrl_regs.efer = r.u64()?;

        core.regs.rax = r.u64()?;
        core.regs.rbx = r.u64()?;
        core.regs.rcx = r.u64()?;
        core.regs.rdx = r.u64()?;
        core.regs.rdi = r.u64()?;
        core.regs.rsi = r.u64()?;
        core.regs.rbp = r.u64()?;
        core.regs.r8 = r.u64()?;
        core.regs.r9 = r.u64()?;
        core.regs.r10 = r.u64()?;
        core.regs.r11 = r.u64()?;
        core.regs.r12 = r.u64()?;
        core.regs.r13 = r.u64()?;
        core.regs.r14 = r.u64()?;
        core.regs.r15 = r.u64()?;
        core.regs.rsp = r.u64()?;

        core.dbg_regs.dr6 = r.u64()?;
        core.dbg_regs.dr7 = r.u64()?;

        core.segments.cs = read_segment(&mut r)?;
        core.segments.ds = read_segment(&mut r)?;
        core.segments.es = read_segment(&mut r)?;
        core.segments.fs = read_segment(&mut r)?;
        core.segments.gs = read_segment(&mut r)?;
        core.segments.ss = read_segment(&mut r)?;
        core.segments.gdtr = read_segment(&mut r)?;
        core.segments.idtr = read_segment(&mut r)?;
        core.segments.ldtr = read_segment(&mut r)?;
        core.segments.tr = read_segment(&mut r)?;

        core.shdw_pg_state.guest_cr3 = r.u64()?;
        core.shdw_pg_state.guest_cr0 = r.u64()?;
        core.shdw_pg_state.guest_efer = r.u64()?;

        core.msrs.star = r.u64()?;
        core.msrs.lstar = r.u64()?;
        core.msrs.cstar = r.u64()?;
        core.msrs.sfmask = r.u64()?;
        core.msrs.kern_gs_base = r.u64()?;
        core.msrs.sysenter_cs = r.u64()?;
        core.msrs.sysenter_esp = r.u64()?;
        core.msrs.sysenter_eip = r.u64()?;
        core.msrs.pat = r.u64()?;

        core.update_modes();

        // The restored translation roots belong to the saved machine; the
        // active trees are rebuilt for this one.
        if core.paging_mode == PagingMode::Shadow {
            if core.mem_mode == crate::cpu::MemMode::Virtual {
                shadow::activate_shadow_pt(vm, &mut core)?;
            } else {
                direct::reset_passthrough(vm, &mut core)?;
                direct::activate_passthrough(&mut core)?;
            }
        } else {
            core.direct_map.free_all(vm.host());
            direct::init_nested(vm, &mut core)?;
            core.vmcb.control.ncr3 = core.direct_map.root();
        }

        core.shared.set_run_state(crate::cpu::CoreRunState::Running);
        Ok(())
    }
}

/// The per-core interrupt-state checkpoint record.
struct IntrChkpt {
    vcpu_id: u32,
}

impl ChkptOps for IntrChkpt {
    fn save(&self, vm: &Vm, buf: &mut Vec<u8>) -> Result<()> {
        let core = vm.core(self.vcpu_id).vcpu.lock();
        let s = &core.intr_state;
        let mut w = RecordWriter::new();
        let _ = w
            .u8(u8::from(s.irq_pending))
            .u8(u8::from(s.irq_started))
            .u8(s.irq_vector)
            .u8(u8::from(s.swintr_posted))
            .u8(s.swintr_vector);
        buf.extend_from_slice(&w.finish());
        Ok(())
    }

    fn load(&self, vm: &Vm, buf: &[u8]) -> Result<()> {
        let mut core = vm.core(self.vcpu_id).vcpu.lock();
        let mut r = RecordReader::new(buf);
        core.intr_state.irq_pending = r.u8()? != 0;
        core.intr_state.irq_started = r.u8()? != 0;
        core.intr_state.irq_vector = r.u8()?;
        core.intr_state.swintr_posted = r.u8()? != 0;
        core.intr_state.swintr_vector = r.u8()?;
        Ok(())
    }
}

/// The per-core LAPIC checkpoint record.
struct ApicChkpt {
    idx: usize,
}

impl ChkptOps for ApicChkpt {
    fn save(&self, vm: &Vm, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&vm.apic().save_record(self.idx));
        Ok(())
    }

    fn load(&self, vm: &Vm, buf: &[u8]) -> Result<()> {
        vm.apic().load_record(self.idx, buf)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cfg::{CoresConfig, MemoryConfig, PagingCfg, VmConfig};
    use crate::host::testing::TestHost;
    use crate::hw_vt::mock::MockVt;

    fn config(mem_size: u64, block_size: u64, cores: u32, paging: PagingCfg) -> VmConfig {
        VmConfig {
            name: String::from("test-vm"),
            memory: MemoryConfig {
                size_mb: 0, // mem_bytes overridden through block math below
                regions: Vec::new(),
                block_size: Some(block_size),
            },
            cores: CoresConfig {
                count: cores,
                pinning: Vec::new(),
            },
            paging,
            large_pages: true,
            giant_pages: true,
            devices: Vec::new(),
        }
        .with_mem_bytes(mem_size)
    }

    impl VmConfig {
        /// Test helper: express memory in raw bytes instead of MiB.
        fn with_mem_bytes(mut self, bytes: u64) -> Self {
            // Stored as a pseudo-MiB count so `mem_bytes` reproduces it.
            assert_eq!(bytes % (1024 * 1024), 0, "use MiB multiples in tests");
            self.memory.size_mb = bytes / (1024 * 1024);
            self
        }
    }

    /// A fully initialized VM on the test host with mock hardware.
    pub(crate) fn test_vm(
        mem_size: u64,
        block_size: u64,
        cores: u32,
        paging: PagingCfg,
    ) -> Arc<Vm> {
        let host: Arc<dyn VmmHost> =
            Arc::new(TestHost::new((mem_size + (4 << 20)) as usize));
        let cfg = config(mem_size, block_size, cores, paging);
        Vm::create_with(cfg, host, &|_| Box::new(MockVt::new())).unwrap()
    }

    /// A vCPU not wired into any VM's core table, for handler-level tests.
    pub(crate) fn detached_vcpu(vm: &Vm, paging: PagingMode) -> Vcpu {
        let mut core = Vcpu::new(0, 0, 0, paging, Box::new(MockVt::new()));
        core.use_large_pages = true;
        core.use_giant_pages = true;
        let _ = vm;
        core
    }

    pub(crate) fn nested_test_vm(mem_size: u64, block_size: u64) -> (Arc<Vm>, Vcpu) {
        let vm = test_vm(round_mb(mem_size), block_size, 1, PagingCfg::Nested);
        let core = detached_vcpu(&vm, PagingMode::Nested);
        (vm, core)
    }

    pub(crate) fn shadow_test_vm(mem_size: u64, block_size: u64) -> (Arc<Vm>, Vcpu) {
        let vm = test_vm(round_mb(mem_size), block_size, 1, PagingCfg::Shadow);
        let core = detached_vcpu(&vm, PagingMode::Shadow);
        (vm, core)
    }

    pub(crate) fn nested_test_vm_cores(
        mem_size: u64,
        block_size: u64,
        cores: u32,
    ) -> (Arc<Vm>, ()) {
        (test_vm(round_mb(mem_size), block_size, cores, PagingCfg::Nested), ())
    }

    fn round_mb(bytes: u64) -> u64 {
        bytes.next_multiple_of(1024 * 1024)
    }

    /// Joins every core thread the test host spawned for this VM.
    pub(crate) fn join_test_host(vm: &Vm) {
        vm.host()
            .as_any()
            .downcast_ref::<TestHost>()
            .expect("test host")
            .join_cores();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::nested_test_vm;
    use super::*;
    use crate::cpu::CORE_ANY;
    use crate::mem::RegionFlags;

    #[test]
    fn creation_wires_the_core_state() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        assert_eq!(vm.run_state(), VmRunState::Stopped);
        assert_eq!(vm.num_cores(), 1);

        let core = vm.core(0).vcpu.lock();
        assert_eq!(core.rip, 0xfff0);
        assert_eq!(core.segments.cs.base, 0xf0000);
        assert_ne!(core.vmcb.control.np_enable, 0);
        assert_ne!(core.vmcb.control.ncr3, 0);
        assert_ne!(core.vmcb.control.iopm_base_pa, 0);
        assert_ne!(core.vmcb.control.msrpm_base_pa, 0);
    }

    #[test]
    fn apic_page_is_hooked_per_core() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        let map = vm.mem_map().read();
        let region = map.get_region(0, crate::apic::DEFAULT_BASE_ADDR).unwrap();
        assert!(!region.flags.alloced());
        assert!(region.handler.is_some());
    }

    #[test]
    fn insert_then_delete_restores_lookups() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);

        let before = vm.mem_map().read().gpa_to_hpa(0, 0x2000).unwrap();
        let region = MemRegion::new(
            CORE_ANY,
            RegionFlags::rwx_alloced(),
            0x2000,
            0x3000,
            0x5000,
        )
        .unwrap();
        let id = vm.insert_region(region, None).unwrap();
        assert_eq!(vm.mem_map().read().gpa_to_hpa(0, 0x2000).unwrap(), 0x5000);

        let _ = vm.delete_region(id, None).unwrap();
        assert_eq!(vm.mem_map().read().gpa_to_hpa(0, 0x2000).unwrap(), before);
    }

    #[test]
    fn lifecycle_transitions_are_gated() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        assert_eq!(vm.continue_run(), Err(VmmError::BadRunState));
        assert_eq!(vm.pause(), Err(VmmError::BadRunState));

        // Running state reached without threads for this check.
        vm.set_run_state(VmRunState::Running);
        vm.pause().unwrap();
        assert_eq!(vm.run_state(), VmRunState::Paused);
        assert!(vm.barrier().active());
        vm.continue_run().unwrap();
        assert!(!vm.barrier().active());

        vm.stop();
        assert_eq!(vm.run_state(), VmRunState::Stopped);
    }

    #[test]
    fn save_load_round_trips_cpu_and_ram() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);

        {
            let mut core = vm.core(0).vcpu.lock();
            core.rip = 0x1234;
            core.regs.rbx = 0xdead_beef;
            core.segments.cs.base = 0x5000;
            core.msrs.lstar = 0xffff_8000_0000_0000;
        }
        vm.mem_map().read().write_gpa(0, 0x800, &[0x77, 0x88]).unwrap();

        let stream = vm.save().unwrap();

        {
            let mut core = vm.core(0).vcpu.lock();
            core.rip = 0;
            core.regs.rbx = 0;
            core.segments.cs.base = 0;
            core.msrs.lstar = 0;
        }
        vm.mem_map().read().write_gpa(0, 0x800, &[0, 0]).unwrap();

        vm.load(&stream).unwrap();

        let core = vm.core(0).vcpu.lock();
        assert_eq!(core.rip, 0x1234);
        assert_eq!(core.regs.rbx, 0xdead_beef);
        assert_eq!(core.segments.cs.base, 0x5000);
        assert_eq!(core.msrs.lstar, 0xffff_8000_0000_0000);
        drop(core);

        let mut ram = [0u8; 2];
        vm.mem_map().read().read_gpa(0, 0x800, &mut ram).unwrap();
        assert_eq!(ram, [0x77, 0x88]);
    }

    #[test]
    fn save_refused_while_running() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        vm.set_run_state(VmRunState::Running);
        assert_eq!(vm.save(), Err(VmmError::BadRunState));
    }
}
