//! The module containing the per-vCPU register file and CPU mode derivation.
//!
//! A [`Vcpu`] is the in-memory image of one virtual processor: general
//! purpose registers, control and debug registers, the segment descriptor
//! cache, the hooked-MSR shadow, FPU state, paging-engine state and the
//! interrupt/exception machinery. The run loop serializes this image into
//! the hardware control block before every VM entry and deserializes it on
//! exit; everything else in the VMM operates on the in-memory image only.

use crate::{
    excp::ExcpState,
    fpu::FpuState,
    hw_vt::HardwareVt,
    intr::IntrCoreState,
    paging::{DirectMap, ShadowPgState},
    time::{CoreTime, Timeouts},
    vmcb::Vmcb,
};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicU32, Ordering};

/// The id a region or operation uses to address every core at once.
pub const CORE_ANY: u16 = 0xffff;

/// The derived CPU operating mode.
///
/// Authoritative for instruction decoding and page-table shapes throughout
/// the VMM. Derived from CR0.PE, CR4.PAE, EFER.LME and CS.L.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    ProtectedPae,
    Long,
    Long32Compat,
    Long16Compat,
}

/// Whether guest addresses are translated through guest page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMode {
    Physical,
    Virtual,
}

/// Which page-table engine backs this vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Shadow,
    Nested,
}

/// Run state of a single core, stored as an atomic so other cores (INIT/SIPI
/// delivery) and the control plane can transition it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreRunState {
    Stopped = 0,
    Running = 1,
}

/// Per-core state that must be reachable without holding the core's lock:
/// run state, current physical CPU, and the exception bitmaps (which remote
/// cores update when delivering NMIs).
#[derive(Debug)]
pub struct CoreShared {
    run_state: AtomicU32,
    pcpu_id: AtomicU32,
    /// Pending exception state; remote cores raise NMIs here.
    pub excp: ExcpState,
}

impl CoreShared {
    pub(crate) fn new(pcpu_id: u32) -> Self {
        Self {
            run_state: AtomicU32::new(CoreRunState::Stopped as u32),
            pcpu_id: AtomicU32::new(pcpu_id),
            excp: ExcpState::new(),
        }
    }

    pub fn run_state(&self) -> CoreRunState {
        if self.run_state.load(Ordering::Acquire) == CoreRunState::Running as u32 {
            CoreRunState::Running
        } else {
            CoreRunState::Stopped
        }
    }

    pub fn set_run_state(&self, state: CoreRunState) {
        self.run_state.store(state as u32, Ordering::Release);
    }

    pub fn pcpu_id(&self) -> u32 {
        self.pcpu_id.load(Ordering::Relaxed)
    }

    pub fn set_pcpu_id(&self, pcpu: u32) {
        self.pcpu_id.store(pcpu, Ordering::Relaxed);
    }
}

/// The guest general purpose registers.
///
/// RAX and RSP are also held in the VMCB state-save area; the run loop keeps
/// both copies coherent around VM entries. RSP sits at the end so the VMRUN
/// assembly, which only moves the registers hardware does not manage, can
/// ignore it.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GuestRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
}

impl GuestRegs {
    /// Reads a GPR by its hardware encoding (0 = RAX .. 15 = R15).
    #[must_use]
    pub fn gpr(&self, index: u8) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a GPR by its hardware encoding.
    pub fn set_gpr(&mut self, index: u8, value: u64) {
        match index & 0xf {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

/// The guest control registers as the guest last wrote them (modulo the
/// virtualized bits the control-register handlers force). RFLAGS rides along
/// here as in the hardware state-save image.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct CtrlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub rflags: u64,
    pub efer: u64,
}

/// The guest debug registers that are not handled by hardware save/restore.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct DbgRegs {
    pub dr6: u64,
    pub dr7: u64,
}

/// The hooked-MSR shadow. These values are serialized into the VMCB on
/// entry and read back on exit.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct MsrShadow {
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kern_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
}

/// One entry of the segment descriptor cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub seg_type: u8,
    pub system: bool,
    pub dpl: u8,
    pub present: bool,
    pub avail: bool,
    pub long_mode: bool,
    pub db: bool,
    pub granularity: bool,
}

/// The six segment registers plus the descriptor-table registers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Segments {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub gdtr: Segment,
    pub idtr: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
}

/// One virtual processor.
pub struct Vcpu {
    pub vcpu_id: u32,
    pub numa_id: u32,

    /// Cross-core visible state; the same `Arc` is stored in the VM's core
    /// table.
    pub shared: Arc<CoreShared>,

    pub rip: u64,
    pub cpl: u8,

    pub regs: GuestRegs,
    pub ctrl_regs: CtrlRegs,
    pub dbg_regs: DbgRegs,
    pub segments: Segments,
    pub msrs: MsrShadow,
    pub fpu: FpuState,

    pub paging_mode: PagingMode,
    /// Guest-visible CR0/CR3/EFER copies and the shadow tree, used only
    /// under shadow paging.
    pub shdw_pg_state: ShadowPgState,
    /// The passthrough (shadow mode, guest paging off) or nested page-table
    /// root.
    pub direct_map: DirectMap,

    pub intr_state: IntrCoreState,

    pub cpu_mode: CpuMode,
    pub mem_mode: MemMode,

    pub use_large_pages: bool,
    pub use_giant_pages: bool,

    pub time: CoreTime,
    pub timeouts: Timeouts,

    pub vmcb: Box<Vmcb>,
    pub vt: Box<dyn HardwareVt>,

    pub num_exits: u64,
    pub yield_start_cycle: u64,
}

impl Vcpu {
    pub(crate) fn new(
        vcpu_id: u32,
        numa_id: u32,
        pcpu_id: u32,
        paging_mode: PagingMode,
        vt: Box<dyn HardwareVt>,
    ) -> Self {
        Self {
            vcpu_id,
            numa_id,
            shared: Arc::new(CoreShared::new(pcpu_id)),
            rip: 0,
            cpl: 0,
            regs: GuestRegs::default(),
            ctrl_regs: CtrlRegs::default(),
            dbg_regs: DbgRegs::default(),
            segments: Segments::default(),
            msrs: MsrShadow::default(),
            fpu: FpuState::new(),
            paging_mode,
            shdw_pg_state: ShadowPgState::default(),
            direct_map: DirectMap::default(),
            intr_state: IntrCoreState::new(),
            cpu_mode: CpuMode::Real,
            mem_mode: MemMode::Physical,
            use_large_pages: false,
            use_giant_pages: false,
            time: CoreTime::default(),
            timeouts: Timeouts::default(),
            vmcb: Box::new(Vmcb::default()),
            vt,
            num_exits: 0,
            yield_start_cycle: 0,
        }
    }

    /// The CR0/EFER pair that reflects what the guest believes. Under shadow
    /// paging the hardware copies carry forced bits, so guest intent lives in
    /// the shadow-paging state instead.
    fn guest_cr0_efer(&self) -> (u64, u64) {
        match self.paging_mode {
            PagingMode::Shadow => (self.shdw_pg_state.guest_cr0, self.shdw_pg_state.guest_efer),
            PagingMode::Nested => (self.ctrl_regs.cr0, self.ctrl_regs.efer),
        }
    }

    /// Derives the CPU operating mode.
    #[must_use]
    pub fn cpu_mode(&self) -> CpuMode {
        const CR0_PE: u64 = 1 << 0;
        const CR4_PAE: u64 = 1 << 5;
        const EFER_LME: u64 = 1 << 8;

        let (cr0, efer) = self.guest_cr0_efer();
        let cr4 = self.ctrl_regs.cr4;

        if cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if (cr4 & CR4_PAE == 0) && (efer & EFER_LME == 0) {
            CpuMode::Protected
        } else if efer & EFER_LME == 0 {
            CpuMode::ProtectedPae
        } else if self.segments.cs.long_mode {
            CpuMode::Long
        } else {
            CpuMode::Long32Compat
        }
    }

    /// Derives whether guest addresses go through guest page tables.
    #[must_use]
    pub fn mem_mode(&self) -> MemMode {
        const CR0_PG: u64 = 1 << 31;

        let (cr0, _) = self.guest_cr0_efer();
        if cr0 & CR0_PG == 0 {
            MemMode::Physical
        } else {
            MemMode::Virtual
        }
    }

    /// The effective address width in bytes.
    #[must_use]
    pub fn addr_width(&self) -> u32 {
        match self.cpu_mode() {
            CpuMode::Real => 2,
            CpuMode::Long => 8,
            _ => 4,
        }
    }

    /// Re-derives and caches the mode switches. Called after every VM exit
    /// and after control-register updates.
    pub fn update_modes(&mut self) {
        self.cpu_mode = self.cpu_mode();
        self.mem_mode = self.mem_mode();
    }

    /// Whether this core is the bootstrap processor.
    #[must_use]
    pub fn is_bsp(&self) -> bool {
        self.vcpu_id == 0
    }

    /// Puts the core into the machine state a PC expects out of reset, with
    /// execution starting at the top of the BIOS area (f000:fff0).
    pub fn reset_to_bios(&mut self) {
        const RFLAGS_RSVD1: u64 = 1 << 1;

        self.rip = 0xfff0;
        self.cpl = 0;
        self.regs = GuestRegs {
            // Family/model/stepping hint the firmware expects in DX.
            rdx: 0x0000_0f00,
            ..GuestRegs::default()
        };
        self.ctrl_regs.rflags = RFLAGS_RSVD1;
        // ET is hardwired; NW/CD start set, paging and protection off.
        self.ctrl_regs.cr0 = 0x6001_0010;

        self.segments.cs = Segment {
            selector: 0xf000,
            base: 0x000f_0000,
            limit: 0xffff,
            seg_type: 0x3,
            system: true,
            dpl: 0x3,
            present: true,
            ..Segment::default()
        };

        for seg in [
            &mut self.segments.ss,
            &mut self.segments.ds,
            &mut self.segments.es,
            &mut self.segments.fs,
            &mut self.segments.gs,
        ] {
            *seg = Segment {
                selector: 0,
                base: 0,
                limit: !0,
                seg_type: 0x3,
                system: true,
                dpl: 0x3,
                present: true,
                ..Segment::default()
            };
        }

        for seg in [
            &mut self.segments.gdtr,
            &mut self.segments.idtr,
            &mut self.segments.ldtr,
            &mut self.segments.tr,
        ] {
            *seg = Segment {
                limit: 0xffff,
                ..Segment::default()
            };
        }

        self.dbg_regs.dr6 = 0x0000_0000_ffff_0ff0;
        self.dbg_regs.dr7 = 0x0000_0000_0000_0400;
        self.msrs.pat = 0x0007_0406_0007_0406;

        self.update_modes();
    }

    /// Applies the SIPI startup vector: execution resumes at `vector << 12`
    /// with a fresh CS. Everything else is assumed already valid from the
    /// preceding INIT.
    pub fn reset_from_sipi(&mut self, vector: u8) {
        self.rip = 0;
        self.segments.cs.selector = u16::from(vector) << 8;
        self.segments.cs.base = u64::from(vector) << 12;
        self.segments.cs.limit = 0xffff;
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("vcpu_id", &self.vcpu_id)
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("cpu_mode", &self.cpu_mode)
            .field("mem_mode", &self.mem_mode)
            .field("regs", &self.regs)
            .field("ctrl_regs", &self.ctrl_regs)
            .field("num_exits", &self.num_exits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_vt::mock::MockVt;

    fn test_vcpu(paging: PagingMode) -> Vcpu {
        Vcpu::new(0, 0, 0, paging, Box::new(MockVt::new()))
    }

    #[test]
    fn mode_derivation_follows_control_bits() {
        let mut core = test_vcpu(PagingMode::Nested);
        core.ctrl_regs.cr0 = 0; // PE clear
        assert_eq!(core.cpu_mode(), CpuMode::Real);
        assert_eq!(core.addr_width(), 2);

        core.ctrl_regs.cr0 = 1; // PE
        assert_eq!(core.cpu_mode(), CpuMode::Protected);

        core.ctrl_regs.cr4 = 1 << 5; // PAE
        assert_eq!(core.cpu_mode(), CpuMode::ProtectedPae);

        core.ctrl_regs.efer = 1 << 8; // LME
        core.segments.cs.long_mode = true;
        assert_eq!(core.cpu_mode(), CpuMode::Long);
        assert_eq!(core.addr_width(), 8);

        core.segments.cs.long_mode = false;
        assert_eq!(core.cpu_mode(), CpuMode::Long32Compat);
    }

    #[test]
    fn shadow_mode_reads_guest_copies() {
        let mut core = test_vcpu(PagingMode::Shadow);
        // Hardware copies claim paging is on; the guest has not enabled it.
        core.ctrl_regs.cr0 = (1 << 31) | 1;
        core.shdw_pg_state.guest_cr0 = 1;
        assert_eq!(core.mem_mode(), MemMode::Physical);
        assert_eq!(core.cpu_mode(), CpuMode::Protected);
    }

    #[test]
    fn bios_reset_state() {
        let mut core = test_vcpu(PagingMode::Nested);
        core.reset_to_bios();
        assert_eq!(core.rip, 0xfff0);
        assert_eq!(core.segments.cs.selector, 0xf000);
        assert_eq!(core.segments.cs.base, 0xf0000);
        assert_eq!(core.ctrl_regs.rflags, 0x2);
        assert_eq!(core.regs.rdx, 0xf00);
        assert_eq!(core.cpu_mode(), CpuMode::Real);
    }

    #[test]
    fn sipi_reset_reshapes_cs_only() {
        let mut core = test_vcpu(PagingMode::Nested);
        core.reset_to_bios();
        core.reset_from_sipi(0x70);
        assert_eq!(core.rip, 0);
        assert_eq!(core.segments.cs.selector, 0x7000);
        assert_eq!(core.segments.cs.base, 0x70000);
    }

    #[test]
    fn gpr_indexing_round_trips() {
        let mut regs = GuestRegs::default();
        for i in 0..16 {
            regs.set_gpr(i, 0x100 + u64::from(i));
        }
        assert_eq!(regs.rax, 0x100);
        assert_eq!(regs.rsp, 0x104);
        assert_eq!(regs.r15, 0x10f);
        assert_eq!(regs.gpr(7), regs.rdi);
    }
}
