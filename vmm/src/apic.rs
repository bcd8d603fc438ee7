//! The module containing the local APIC cluster.
//!
//! One LAPIC per vCPU, plus the VM-wide routing state machine that carries
//! inter-processor interrupts between them: fixed/lowest-priority delivery
//! into the per-LAPIC IRQ queues, NMI, and the INIT/SIPI handshake that
//! starts application processors. Each LAPIC also owns the virtual timer
//! fed from the per-core time subsystem and registers itself as the core's
//! interrupt controller.
//!
//! Locking: each LAPIC has two locks (the IRQ submission queue's and the
//! register block's) and the cluster has one more guarding addressability
//! (LDR/DFR) and lowest-priority arbitration. Neither per-LAPIC lock is
//! ever held while acquiring the other; routing never holds a source
//! register lock while taking a destination's. Cross-core run-state
//! changes (INIT) additionally take the VM barrier.

use crate::{
    config::MAX_IRQ_QUEUE_SIZE,
    cpu::{CoreRunState, Vcpu},
    error::{Result, VmmError},
    intr::{AckFn, IntrController},
    mem::MmioHook,
    msr::MsrHandler,
    time::CoreTimer,
    vm::Vm,
};
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use bitfield::bitfield;
use log::{debug, error, trace, warn};
use spin::Mutex;

/// The architectural default base of the LAPIC MMIO page.
pub const DEFAULT_BASE_ADDR: u64 = 0xfee0_0000;

// Register offsets within the LAPIC page.
const APIC_ID_OFFSET: u64 = 0x020;
const APIC_VERSION_OFFSET: u64 = 0x030;
const TPR_OFFSET: u64 = 0x080;
const APR_OFFSET: u64 = 0x090;
const PPR_OFFSET: u64 = 0x0a0;
const EOI_OFFSET: u64 = 0x0b0;
const REMOTE_READ_OFFSET: u64 = 0x0c0;
const LDR_OFFSET: u64 = 0x0d0;
const DFR_OFFSET: u64 = 0x0e0;
const SPURIOUS_INT_VEC_OFFSET: u64 = 0x0f0;
const ISR_OFFSET: u64 = 0x100; // 0x100 - 0x170
const TRIG_OFFSET: u64 = 0x180; // 0x180 - 0x1f0
const IRR_OFFSET: u64 = 0x200; // 0x200 - 0x270
const ESR_OFFSET: u64 = 0x280;
const INT_CMD_LO_OFFSET: u64 = 0x300;
const INT_CMD_HI_OFFSET: u64 = 0x310;
const TMR_LOC_VEC_TBL_OFFSET: u64 = 0x320;
const THERM_LOC_VEC_TBL_OFFSET: u64 = 0x330;
const PERF_CTR_LOC_VEC_TBL_OFFSET: u64 = 0x340;
const LINT0_VEC_TBL_OFFSET: u64 = 0x350;
const LINT1_VEC_TBL_OFFSET: u64 = 0x360;
const ERR_VEC_TBL_OFFSET: u64 = 0x370;
const TMR_INIT_CNT_OFFSET: u64 = 0x380;
const TMR_CUR_CNT_OFFSET: u64 = 0x390;
const TMR_DIV_CFG_OFFSET: u64 = 0x3e0;
const EXT_APIC_FEATURE_OFFSET: u64 = 0x400;
const EXT_APIC_CMD_OFFSET: u64 = 0x410;
const SEOI_OFFSET: u64 = 0x420;
const IER_OFFSET: u64 = 0x480; // 0x480 - 0x4f0
const EXT_INT_LOC_VEC_TBL_OFFSET: u64 = 0x500; // 0x500 - 0x530

bitfield! {
    /// A local vector table entry.
    #[derive(Clone, Copy, Default)]
    pub struct Lvt(u32);
    impl Debug;
    pub u8, vec, set_vec: 7, 0;
    pub u8, msg_type, set_msg_type: 10, 8;
    pub del_status, _: 12;
    pub polarity, set_polarity: 13;
    pub rem_irr, set_rem_irr: 14;
    pub trig_mode, set_trig_mode: 15;
    pub mask, set_mask: 16;
    /// Periodic (1) vs one-shot (0); timer LVT only.
    pub tmr_mode, set_tmr_mode: 17;
}

bitfield! {
    /// The interrupt command register (both halves).
    #[derive(Clone, Copy, Default)]
    pub struct IntCmd(u64);
    impl Debug;
    pub u8, vec, set_vec: 7, 0;
    pub u8, del_mode, set_del_mode: 10, 8;
    pub dst_mode, set_dst_mode: 11;
    pub del_status, _: 12;
    pub level, set_level: 14;
    pub trig_mode, set_trig_mode: 15;
    pub u8, dst_shorthand, set_dst_shorthand: 19, 18;
    pub u8, dst, set_dst: 63, 56;
}

bitfield! {
    /// The logical destination register.
    #[derive(Clone, Copy, Default)]
    pub struct LogDst(u32);
    impl Debug;
    pub u8, dst_log_id, set_dst_log_id: 31, 24;
}

bitfield! {
    /// The destination format register. Model 0xf = flat, 0x0 = cluster.
    #[derive(Clone, Copy)]
    pub struct DstFmt(u32);
    impl Debug;
    pub u8, model, set_model: 31, 28;
}

bitfield! {
    /// The APIC_BASE MSR image.
    #[derive(Clone, Copy, Default)]
    pub struct ApicBaseMsr(u64);
    impl Debug;
    pub bootstrap_cpu, set_bootstrap_cpu: 8;
    pub apic_enable, set_apic_enable: 11;
    pub u64, base_addr, set_base_addr: 51, 12;
}

/// IPI delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed,
    LowestPrio,
    Smi,
    Reserved,
    Nmi,
    Init,
    Sipi,
    ExtInt,
}

impl From<u8> for DeliveryMode {
    fn from(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Self::Fixed,
            1 => Self::LowestPrio,
            2 => Self::Smi,
            4 => Self::Nmi,
            5 => Self::Init,
            6 => Self::Sipi,
            7 => Self::ExtInt,
            _ => Self::Reserved,
        }
    }
}

/// ICR destination shorthands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shorthand {
    None,
    SelfOnly,
    All,
    AllButMe,
}

impl From<u8> for Shorthand {
    fn from(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::None,
            1 => Self::SelfOnly,
            2 => Self::All,
            _ => Self::AllButMe,
        }
    }
}

/// The AP startup handshake state of one LAPIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiState {
    Init,
    Sipi,
    Started,
}

/// A fully described inter-processor interrupt.
#[derive(Clone)]
pub struct Ipi {
    pub vector: u8,
    pub mode: DeliveryMode,
    pub logical: bool,
    pub trigger_mode: bool,
    pub shorthand: Shorthand,
    pub dst: u8,
    pub ack: Option<AckFn>,
}

impl core::fmt::Debug for Ipi {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ipi")
            .field("vector", &self.vector)
            .field("mode", &self.mode)
            .field("logical", &self.logical)
            .field("shorthand", &self.shorthand)
            .field("dst", &self.dst)
            .finish_non_exhaustive()
    }
}

struct IrqQueueEntry {
    vector: u32,
    trigger_mode: bool,
    ack: Option<AckFn>,
}

/// The bounded IRQ submission queue feeding one LAPIC.
struct IrqQueue {
    entries: VecDeque<IrqQueueEntry>,
}

/// The register block of one LAPIC.
pub struct ApicRegs {
    base_addr: u64,
    base_addr_msr: ApicBaseMsr,

    lapic_id: u32,
    apic_ver: u32,
    task_prio: u32,
    arb_prio: u32,
    proc_prio: u32,
    log_dst: LogDst,
    dst_fmt: DstFmt,
    spurious_int: u32,
    err_status: u32,
    int_cmd: IntCmd,

    tmr_vec_tbl: Lvt,
    therm_loc_vec_tbl: Lvt,
    perf_ctr_loc_vec_tbl: Lvt,
    lint0_vec_tbl: Lvt,
    lint1_vec_tbl: Lvt,
    err_vec_tbl: Lvt,
    ext_intr_vec_tbl: [Lvt; 4],

    tmr_div_cfg: u32,
    tmr_init_cnt: u32,
    tmr_cur_cnt: u32,
    missed_ints: u32,

    ext_apic_feature: u32,
    ext_apic_ctrl: u32,
    spec_eoi: u32,
    rem_rd_data: u32,

    ipi_state: IpiState,

    int_req_reg: [u8; 32],
    int_svc_reg: [u8; 32],
    int_en_reg: [u8; 32],
    trig_mode_reg: [u8; 32],

    irq_ack_cbs: Vec<Option<AckFn>>,
}

impl ApicRegs {
    fn new(id: u32) -> Self {
        let mut regs = Self {
            base_addr: DEFAULT_BASE_ADDR,
            base_addr_msr: ApicBaseMsr::default(),
            lapic_id: 0,
            apic_ver: 0,
            task_prio: 0,
            arb_prio: 0,
            proc_prio: 0,
            log_dst: LogDst::default(),
            dst_fmt: DstFmt(0),
            spurious_int: 0,
            err_status: 0,
            int_cmd: IntCmd::default(),
            tmr_vec_tbl: Lvt::default(),
            therm_loc_vec_tbl: Lvt::default(),
            perf_ctr_loc_vec_tbl: Lvt::default(),
            lint0_vec_tbl: Lvt::default(),
            lint1_vec_tbl: Lvt::default(),
            err_vec_tbl: Lvt::default(),
            ext_intr_vec_tbl: [Lvt::default(); 4],
            tmr_div_cfg: 0,
            tmr_init_cnt: 0,
            tmr_cur_cnt: 0,
            missed_ints: 0,
            ext_apic_feature: 0,
            ext_apic_ctrl: 0,
            spec_eoi: 0,
            rem_rd_data: 0,
            ipi_state: IpiState::Init,
            int_req_reg: [0; 32],
            int_svc_reg: [0; 32],
            int_en_reg: [0; 32],
            trig_mode_reg: [0; 32],
            irq_ack_cbs: core::iter::repeat_with(|| None).take(256).collect(),
        };
        regs.reset(id);
        regs
    }

    /// Puts the register block in its power-on state. The BSP flag in the
    /// base MSR distinguishes core 0.
    fn reset(&mut self, id: u32) {
        self.base_addr = DEFAULT_BASE_ADDR;
        self.base_addr_msr = ApicBaseMsr(if id == 0 { 0x900 } else { 0x800 });
        self.base_addr_msr.0 |= DEFAULT_BASE_ADDR;

        self.int_req_reg = [0; 32];
        self.int_svc_reg = [0; 32];
        // All vectors enabled out of reset; the enable mask is an extended
        // feature guests rarely touch.
        self.int_en_reg = [0xff; 32];
        self.trig_mode_reg = [0; 32];
        for cb in &mut self.irq_ack_cbs {
            *cb = None;
        }

        // The APIC id lives in the top byte; the lower 24 bits are reserved.
        self.lapic_id = id << 24;
        self.ipi_state = IpiState::Init;

        // Version 0x10, 6 LVT entries (5 << 16), extended register space.
        self.apic_ver = 0x8005_0010;

        self.task_prio = 0;
        self.arb_prio = 0;
        self.proc_prio = 0;
        self.log_dst = LogDst(0);
        self.dst_fmt = DstFmt(0xffff_ffff);
        self.spurious_int = 0xff;
        self.err_status = 0;
        self.int_cmd = IntCmd(0);
        self.tmr_vec_tbl = Lvt(0x0001_0000);
        self.therm_loc_vec_tbl = Lvt(0x0001_0000);
        self.perf_ctr_loc_vec_tbl = Lvt(0x0001_0000);
        self.lint0_vec_tbl = Lvt(0x0001_0000);
        self.lint1_vec_tbl = Lvt(0x0001_0000);
        self.err_vec_tbl = Lvt(0x0001_0000);
        self.ext_intr_vec_tbl = [Lvt(0x0001_0000); 4];
        self.tmr_div_cfg = 0;
        self.tmr_init_cnt = 0;
        self.tmr_cur_cnt = 0;
        self.missed_ints = 0;
        self.ext_apic_feature = 0x0004_0007;
        self.ext_apic_ctrl = 0;
        self.spec_eoi = 0;
        self.rem_rd_data = 0;
    }

    fn apic_id(&self) -> u8 {
        (self.lapic_id >> 24) as u8
    }

    fn is_bsp(&self) -> bool {
        self.base_addr_msr.bootstrap_cpu()
    }

    fn enabled(&self) -> bool {
        self.base_addr_msr.apic_enable()
    }

    /// Latches a queued IRQ into IRR. Already-requested vectors coalesce
    /// (the original ack callback is retained); disabled vectors are
    /// dropped.
    fn activate_irq(&mut self, entry: IrqQueueEntry) -> bool {
        let irq = entry.vector as usize;
        let major = irq / 8;
        let flag = 1u8 << (irq % 8);

        if self.int_req_reg[major] & flag != 0 {
            trace!("IRQ {irq} coalescing");
            return false;
        }

        if self.int_en_reg[major] & flag == 0 {
            trace!("IRQ {irq} not enabled");
            return false;
        }

        self.int_req_reg[major] |= flag;
        if entry.trigger_mode {
            self.trig_mode_reg[major] |= flag;
        } else {
            self.trig_mode_reg[major] &= !flag;
        }
        self.irq_ack_cbs[irq] = entry.ack;
        true
    }

    /// The highest-priority in-service vector.
    fn highest_isr(&self) -> Option<u32> {
        Self::highest_bit(&self.int_svc_reg, &[0xff; 32])
    }

    /// The highest-priority requested-and-enabled vector.
    fn highest_irr(&self) -> Option<u32> {
        Self::highest_bit(&self.int_req_reg, &self.int_en_reg)
    }

    fn highest_bit(map: &[u8; 32], mask: &[u8; 32]) -> Option<u32> {
        for i in (0..32).rev() {
            let masked = map[i] & mask[i];
            if masked != 0 {
                return Some((i as u32) * 8 + (7 - masked.leading_zeros()));
            }
        }
        None
    }

    /// Moves a vector from requested to in-service once the guest takes it.
    /// Ignored unless this LAPIC actually initiated the vector.
    fn begin_irq(&mut self, irq: u32) {
        let major = (irq / 8) as usize;
        let flag = 1u8 << (irq % 8);
        if self.int_req_reg[major] & flag != 0 {
            self.int_svc_reg[major] |= flag;
            self.int_req_reg[major] &= !flag;
        }
    }

    /// Completes the highest in-service interrupt; the caller runs the
    /// returned ack outside the register lock.
    fn do_eoi(&mut self) -> Option<(u32, Option<AckFn>)> {
        let isr = self.highest_isr()?;
        let major = (isr / 8) as usize;
        let flag = 1u8 << (isr % 8);
        self.int_svc_reg[major] &= !flag;
        debug!("EOI for IRQ {isr}");
        Some((isr, self.irq_ack_cbs[isr as usize].clone()))
    }

    /// The timer divide configuration as a shift count.
    fn timer_shift(&self) -> Option<u32> {
        // Bits 0, 1 and 3 encode the divider.
        match self.tmr_div_cfg & 0xb {
            0xb => Some(0),
            0x0 => Some(1),
            0x1 => Some(2),
            0x2 => Some(3),
            0x3 => Some(4),
            0x8 => Some(5),
            0x9 => Some(6),
            0xa => Some(7),
            _ => None,
        }
    }
}

struct Apic {
    regs: Mutex<ApicRegs>,
    queue: Mutex<IrqQueue>,
}

/// The per-VM LAPIC cluster.
pub struct ApicDev {
    /// Guards addressability (LDR/DFR) and lowest-priority arbitration.
    state_lock: Mutex<()>,
    apics: Vec<Apic>,
}

impl ApicDev {
    #[must_use]
    pub fn new(num_cores: u32) -> Arc<Self> {
        let apics = (0..num_cores)
            .map(|i| Apic {
                regs: Mutex::new(ApicRegs::new(i)),
                queue: Mutex::new(IrqQueue {
                    entries: VecDeque::with_capacity(MAX_IRQ_QUEUE_SIZE),
                }),
            })
            .collect();
        Arc::new(Self {
            state_lock: Mutex::new(()),
            apics,
        })
    }

    #[must_use]
    pub fn num_apics(&self) -> usize {
        self.apics.len()
    }

    /// The current MMIO base of a core's LAPIC page.
    #[must_use]
    pub fn base_addr(&self, idx: usize) -> u64 {
        self.apics[idx].regs.lock().base_addr
    }

    /// Whether the given core's LAPIC carries the BSP flag.
    #[must_use]
    pub fn is_bsp(&self, idx: usize) -> bool {
        self.apics[idx].regs.lock().is_bsp()
    }

    #[must_use]
    pub fn ipi_state(&self, idx: usize) -> IpiState {
        self.apics[idx].regs.lock().ipi_state
    }

    /// Submits an IRQ to a core's LAPIC queue. Fails when the queue is at
    /// capacity; vectors 0..=15 must go through exception raising instead.
    pub fn add_irq(
        &self,
        idx: usize,
        vector: u32,
        trigger_mode: bool,
        ack: Option<AckFn>,
    ) -> Result<()> {
        if vector <= 15 {
            error!("core {idx}: attempt to raise invalid interrupt {vector}");
            return Err(VmmError::InvalidVector(vector));
        }

        let mut queue = self.apics[idx].queue.lock();
        if queue.entries.len() >= MAX_IRQ_QUEUE_SIZE {
            error!("core {idx}: IRQ queue exhausted, cannot inject IRQ {vector}");
            return Err(VmmError::QueueFull(vector));
        }
        queue.entries.push_back(IrqQueueEntry {
            vector,
            trigger_mode,
            ack,
        });
        Ok(())
    }

    /// Latches every queued IRQ into the LAPIC registers. Queue and
    /// register locks are never held together.
    fn drain_irq_entries(&self, idx: usize) {
        loop {
            let entry = self.apics[idx].queue.lock().entries.pop_front();
            let Some(entry) = entry else { break };
            let _ = self.apics[idx].regs.lock().activate_irq(entry);
        }
    }

    /// The EOI action: completes the in-service vector and fires its ack
    /// (outside the register lock, since acks often re-raise IRQs).
    pub fn do_eoi(&self, idx: usize) {
        let completed = self.apics[idx].regs.lock().do_eoi();
        if let Some((irq, Some(ack))) = completed {
            ack(irq);
        }
    }

    /// Sends an IPI built by an external router (e.g. an I/O APIC device).
    pub fn send_ipi(&self, vm: &Vm, ipi: &Ipi) -> Result<()> {
        self.route_ipi(vm, None, ipi)
    }

    /// Whether this LAPIC accepts a logical-destination message for `mda`.
    fn matches_logical(&self, idx: usize, mda: u8) -> Result<bool> {
        let regs = self.apics[idx].regs.lock();
        if mda == 0xff {
            return Ok(true);
        }
        match regs.dst_fmt.model() {
            // Flat model: set intersection.
            0xf => Ok(regs.log_dst.dst_log_id() & mda != 0),
            // Cluster model: same cluster and intersecting member set.
            0x0 => Ok((mda & 0xf0 == regs.log_dst.dst_log_id() & 0xf0)
                && (mda & 0x0f & regs.log_dst.dst_log_id() != 0)),
            model => {
                error!("apic {idx}: invalid destination format model {model:#x}");
                Err(VmmError::Contract("invalid destination format register"))
            }
        }
    }

    fn find_physical_apic(&self, dst: u8) -> Option<usize> {
        let _guard = self.state_lock.lock();
        (0..self.apics.len()).find(|&i| self.apics[i].regs.lock().apic_id() == dst)
    }

    /// Routes an IPI to its destination LAPIC(s).
    ///
    /// `src` is the index of the sending LAPIC, or `None` when the message
    /// originates outside the cluster.
    pub fn route_ipi(&self, vm: &Vm, src: Option<usize>, ipi: &Ipi) -> Result<()> {
        trace!("routing IPI {ipi:?} from {src:?}");

        match ipi.shorthand {
            Shorthand::None if !ipi.logical => {
                let Some(dst) = self.find_physical_apic(ipi.dst) else {
                    error!("IPI to unregistered apic id {}", ipi.dst);
                    return Err(VmmError::UnknownApicId(u32::from(ipi.dst)));
                };
                self.deliver_ipi(vm, src, dst, ipi)
            }
            Shorthand::None if ipi.mode != DeliveryMode::LowestPrio => {
                // Logical, immediate-trigger modes: deliver to every match.
                let matches = self.logical_matches(ipi.dst)?;
                for dst in matches {
                    self.deliver_ipi(vm, src, dst, ipi)?;
                }
                Ok(())
            }
            Shorthand::None => {
                // Logical lowest-priority: arbitrate by task priority.
                let matches = self.logical_matches(ipi.dst)?;
                let best = {
                    let _guard = self.state_lock.lock();
                    matches
                        .into_iter()
                        .min_by_key(|&i| self.apics[i].regs.lock().task_prio)
                };
                match best {
                    Some(dst) => self.deliver_ipi(vm, src, dst, ipi),
                    None => {
                        debug!("lowest priority delivery with no destinations");
                        Ok(())
                    }
                }
            }
            Shorthand::SelfOnly => {
                let Some(src_idx) = src else {
                    error!("self-shorthand IPI from outside the cluster");
                    return Err(VmmError::Contract("self IPI without a source"));
                };
                self.deliver_ipi(vm, src, src_idx, ipi)
            }
            Shorthand::All | Shorthand::AllButMe => {
                for dst in 0..self.apics.len() {
                    if ipi.shorthand == Shorthand::AllButMe && Some(dst) == src {
                        continue;
                    }
                    self.deliver_ipi(vm, src, dst, ipi)?;
                }
                Ok(())
            }
        }
    }

    fn logical_matches(&self, mda: u8) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for i in 0..self.apics.len() {
            if self.matches_logical(i, mda)? {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Delivers one IPI to one LAPIC according to its delivery mode.
    fn deliver_ipi(&self, vm: &Vm, src: Option<usize>, dst: usize, ipi: &Ipi) -> Result<()> {
        match ipi.mode {
            DeliveryMode::Fixed | DeliveryMode::LowestPrio => {
                if ipi.vector < 32 {
                    error!("delivering reserved vector {} through the APIC", ipi.vector);
                    return Err(VmmError::InvalidVector(u32::from(ipi.vector)));
                }

                self.add_irq(dst, u32::from(ipi.vector), ipi.trigger_mode, ipi.ack.clone())?;

                // A target currently inside the guest on another processor
                // will not notice until something forces an exit.
                if src != Some(dst) {
                    vm.host().kick_cpu(vm.core(dst as u32).shared.pcpu_id());
                }
                Ok(())
            }

            DeliveryMode::Init => {
                debug!("INIT delivery to core {dst}");

                // An INIT-INIT-SIPI burst aimed at the BSP would tear the VM
                // down; drop it.
                if self.is_bsp(dst) {
                    error!("attempted to INIT the BSP, ignoring");
                    return Ok(());
                }
                if src == Some(dst) {
                    error!("core {dst} attempted to INIT itself, ignoring");
                    return Ok(());
                }

                if self.ipi_state(dst) != IpiState::Init {
                    // Stopping a core is a cross-core state change; quiesce
                    // the VM around it.
                    vm.barrier().raise(vm, src.map(|s| s as u32));
                    vm.core(dst as u32).shared.set_run_state(CoreRunState::Stopped);
                    self.apics[dst].regs.lock().ipi_state = IpiState::Init;
                    vm.barrier().lower();
                }

                // The target now awaits its startup vector.
                self.apics[dst].regs.lock().ipi_state = IpiState::Sipi;
                Ok(())
            }

            DeliveryMode::Sipi => {
                if self.ipi_state(dst) != IpiState::Sipi {
                    error!(
                        "core {dst} received SIPI while not awaiting one (state {:?}), ignored",
                        self.ipi_state(dst)
                    );
                    return Ok(());
                }

                // The target is parked; reshape its CS and start it.
                {
                    let mut core = vm.core(dst as u32).vcpu.lock();
                    core.reset_from_sipi(ipi.vector);
                    debug!(
                        "SIPI delivery ({:#x} -> {:#x}:0) to core {dst}",
                        ipi.vector, core.segments.cs.selector
                    );
                }
                vm.core(dst as u32).shared.set_run_state(CoreRunState::Running);
                self.apics[dst].regs.lock().ipi_state = IpiState::Started;
                Ok(())
            }

            DeliveryMode::Nmi => vm.core(dst as u32).shared.excp.raise_nmi(),

            // The legacy PIC carries ExtINT; the LAPIC ignores it.
            DeliveryMode::ExtInt => Ok(()),

            DeliveryMode::Smi | DeliveryMode::Reserved => {
                error!("unsupported IPI delivery mode {:?}", ipi.mode);
                Err(VmmError::UnsupportedIpi(ipi.mode as u32))
            }
        }
    }

    /// MMIO register read.
    pub fn apic_read(&self, core: &Vcpu, gpa: u64, data: &mut [u8]) -> Result<()> {
        let idx = core.vcpu_id as usize;
        let regs = self.apics[idx].regs.lock();

        if !regs.enabled() {
            error!(
                "apic {idx}: read from APIC address space while disabled (msr={:#x})",
                regs.base_addr_msr.0
            );
            return Err(VmmError::Device("read from disabled APIC"));
        }

        let reg_addr = gpa - regs.base_addr;
        let val: u32 = match reg_addr & !0x3 {
            // Reading the write-only EOI register is architecturally
            // undefined; certain kernels do it anyway.
            EOI_OFFSET => 0,
            APIC_ID_OFFSET => regs.lapic_id,
            APIC_VERSION_OFFSET => regs.apic_ver,
            TPR_OFFSET => regs.task_prio,
            APR_OFFSET => regs.arb_prio,
            PPR_OFFSET => regs.proc_prio,
            REMOTE_READ_OFFSET => regs.rem_rd_data,
            LDR_OFFSET => regs.log_dst.0,
            DFR_OFFSET => regs.dst_fmt.0,
            SPURIOUS_INT_VEC_OFFSET => regs.spurious_int,
            ESR_OFFSET => regs.err_status,
            INT_CMD_LO_OFFSET => regs.int_cmd.0 as u32,
            INT_CMD_HI_OFFSET => (regs.int_cmd.0 >> 32) as u32,
            TMR_LOC_VEC_TBL_OFFSET => regs.tmr_vec_tbl.0,
            THERM_LOC_VEC_TBL_OFFSET => regs.therm_loc_vec_tbl.0,
            PERF_CTR_LOC_VEC_TBL_OFFSET => regs.perf_ctr_loc_vec_tbl.0,
            LINT0_VEC_TBL_OFFSET => regs.lint0_vec_tbl.0,
            LINT1_VEC_TBL_OFFSET => regs.lint1_vec_tbl.0,
            ERR_VEC_TBL_OFFSET => regs.err_vec_tbl.0,
            TMR_INIT_CNT_OFFSET => regs.tmr_init_cnt,
            TMR_CUR_CNT_OFFSET => regs.tmr_cur_cnt,
            TMR_DIV_CFG_OFFSET => regs.tmr_div_cfg,
            EXT_APIC_FEATURE_OFFSET => regs.ext_apic_feature,
            off @ ISR_OFFSET..=0x170 => {
                word_of(&regs.int_svc_reg, off - ISR_OFFSET)
            }
            off @ TRIG_OFFSET..=0x1f0 => {
                word_of(&regs.trig_mode_reg, off - TRIG_OFFSET)
            }
            off @ IRR_OFFSET..=0x270 => {
                word_of(&regs.int_req_reg, off - IRR_OFFSET)
            }
            off @ IER_OFFSET..=0x4f0 => {
                word_of(&regs.int_en_reg, off - IER_OFFSET)
            }
            off @ EXT_INT_LOC_VEC_TBL_OFFSET..=0x530 => {
                regs.ext_intr_vec_tbl[((off - EXT_INT_LOC_VEC_TBL_OFFSET) / 0x10) as usize].0
            }
            off => {
                error!("apic {idx}: read from unhandled register {off:#x}");
                return Err(VmmError::Device("unhandled APIC register read"));
            }
        };

        // Sub-word reads are tolerated; hand out the addressed bytes.
        let shift = (reg_addr & 0x3) * 8;
        let bytes = (u64::from(val) >> shift).to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    /// MMIO register write. The interesting registers are the action
    /// registers: EOI completes the in-service vector, ICR-low fires an
    /// IPI.
    pub fn apic_write(&self, vm: &Vm, core: &Vcpu, gpa: u64, data: &[u8]) -> Result<()> {
        let idx = core.vcpu_id as usize;

        if data.len() != 4 {
            warn!(
                "apic {idx}: invalid write length {} ignored",
                data.len()
            );
            return Ok(());
        }
        let op_val = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

        let mut regs = self.apics[idx].regs.lock();
        if !regs.enabled() {
            error!(
                "apic {idx}: write to APIC address space while disabled (msr={:#x})",
                regs.base_addr_msr.0
            );
            return Err(VmmError::Device("write to disabled APIC"));
        }

        let reg_addr = gpa - regs.base_addr;
        match reg_addr {
            REMOTE_READ_OFFSET
            | APIC_VERSION_OFFSET
            | APR_OFFSET
            | PPR_OFFSET
            | EXT_APIC_FEATURE_OFFSET
            | ISR_OFFSET..=0x170
            | TRIG_OFFSET..=0x1f0
            | IRR_OFFSET..=0x270 => {
                error!("apic {idx}: write to read only register {reg_addr:#x}");
            }

            APIC_ID_OFFSET => regs.lapic_id = op_val,
            TPR_OFFSET => regs.task_prio = op_val,
            LDR_OFFSET => {
                drop(regs);
                // Addressability changes race with routing; take the
                // cluster lock.
                let _guard = self.state_lock.lock();
                self.apics[idx].regs.lock().log_dst = LogDst(op_val);
            }
            DFR_OFFSET => {
                drop(regs);
                let _guard = self.state_lock.lock();
                self.apics[idx].regs.lock().dst_fmt = DstFmt(op_val);
            }
            SPURIOUS_INT_VEC_OFFSET => regs.spurious_int = op_val,
            ESR_OFFSET => regs.err_status = op_val,
            TMR_LOC_VEC_TBL_OFFSET => regs.tmr_vec_tbl = Lvt(op_val),
            THERM_LOC_VEC_TBL_OFFSET => regs.therm_loc_vec_tbl = Lvt(op_val),
            PERF_CTR_LOC_VEC_TBL_OFFSET => regs.perf_ctr_loc_vec_tbl = Lvt(op_val),
            LINT0_VEC_TBL_OFFSET => regs.lint0_vec_tbl = Lvt(op_val),
            LINT1_VEC_TBL_OFFSET => regs.lint1_vec_tbl = Lvt(op_val),
            ERR_VEC_TBL_OFFSET => regs.err_vec_tbl = Lvt(op_val),
            TMR_INIT_CNT_OFFSET => {
                regs.tmr_init_cnt = op_val;
                regs.tmr_cur_cnt = op_val;
            }
            TMR_CUR_CNT_OFFSET => regs.tmr_cur_cnt = op_val,
            TMR_DIV_CFG_OFFSET => regs.tmr_div_cfg = op_val,

            off @ IER_OFFSET..=0x4f0 => {
                let base = ((off - IER_OFFSET) / 0x10 * 4) as usize;
                regs.int_en_reg[base..base + 4].copy_from_slice(&op_val.to_le_bytes());
            }
            off @ EXT_INT_LOC_VEC_TBL_OFFSET..=0x530 => {
                regs.ext_intr_vec_tbl[((off - EXT_INT_LOC_VEC_TBL_OFFSET) / 0x10) as usize] =
                    Lvt(op_val);
            }

            EOI_OFFSET => {
                drop(regs);
                self.do_eoi(idx);
            }

            INT_CMD_LO_OFFSET => {
                regs.int_cmd.0 = (regs.int_cmd.0 & !0xffff_ffff) | u64::from(op_val);
                let cmd = regs.int_cmd;
                drop(regs);

                let ipi = Ipi {
                    vector: cmd.vec(),
                    mode: DeliveryMode::from(cmd.del_mode()),
                    logical: cmd.dst_mode(),
                    trigger_mode: cmd.trig_mode(),
                    shorthand: Shorthand::from(cmd.dst_shorthand()),
                    dst: cmd.dst(),
                    ack: None,
                };
                self.route_ipi(vm, Some(idx), &ipi)?;
            }
            INT_CMD_HI_OFFSET => {
                regs.int_cmd.0 =
                    (regs.int_cmd.0 & 0xffff_ffff) | (u64::from(op_val) << 32);
            }

            EXT_APIC_CMD_OFFSET | SEOI_OFFSET => {
                error!("apic {idx}: write to unimplemented extended register {reg_addr:#x}");
                return Err(VmmError::Device("unhandled APIC register write"));
            }
            _ => {
                error!("apic {idx}: write to unhandled register {reg_addr:#x}");
                return Err(VmmError::Device("unhandled APIC register write"));
            }
        }
        Ok(())
    }

    /// Raises a local vector table interrupt (timer, LINTx, error).
    fn activate_internal_irq(&self, idx: usize, lvt: Lvt, trigger: bool) -> Result<()> {
        if lvt.mask() {
            trace!("apic {idx}: masked LVT interrupt dropped");
            return Ok(());
        }
        if DeliveryMode::from(lvt.msg_type()) != DeliveryMode::Fixed {
            error!("apic {idx}: unhandled LVT delivery mode {}", lvt.msg_type());
            return Err(VmmError::UnsupportedIpi(u32::from(lvt.msg_type())));
        }
        self.add_irq(idx, u32::from(lvt.vec()), trigger, None)
    }

    /// The per-core APIC record used by checkpointing.
    #[must_use]
    pub fn save_record(&self, idx: usize) -> Vec<u8> {
        let regs = self.apics[idx].regs.lock();
        let mut out = Vec::with_capacity(0x120);
        let mut push32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());

        out.extend_from_slice(&regs.base_addr.to_le_bytes());
        out.extend_from_slice(&regs.base_addr_msr.0.to_le_bytes());
        push32(&mut out, regs.lapic_id);
        push32(&mut out, regs.apic_ver);
        push32(&mut out, regs.task_prio);
        push32(&mut out, regs.arb_prio);
        push32(&mut out, regs.proc_prio);
        push32(&mut out, regs.log_dst.0);
        push32(&mut out, regs.dst_fmt.0);
        push32(&mut out, regs.spurious_int);
        push32(&mut out, regs.err_status);
        out.extend_from_slice(&regs.int_cmd.0.to_le_bytes());
        push32(&mut out, regs.tmr_vec_tbl.0);
        push32(&mut out, regs.therm_loc_vec_tbl.0);
        push32(&mut out, regs.perf_ctr_loc_vec_tbl.0);
        push32(&mut out, regs.lint0_vec_tbl.0);
        push32(&mut out, regs.lint1_vec_tbl.0);
        push32(&mut out, regs.err_vec_tbl.0);
        for lvt in &regs.ext_intr_vec_tbl {
            push32(&mut out, lvt.0);
        }
        push32(&mut out, regs.tmr_div_cfg);
        push32(&mut out, regs.tmr_init_cnt);
        push32(&mut out, regs.tmr_cur_cnt);
        push32(&mut out, regs.missed_ints);
        push32(&mut out, regs.ext_apic_feature);
        push32(&mut out, regs.ext_apic_ctrl);
        push32(&mut out, regs.spec_eoi);
        push32(&mut out, regs.rem_rd_data);
        push32(&mut out, regs.ipi_state as u32);
        out.extend_from_slice(&regs.int_req_reg);
        out.extend_from_slice(&regs.int_svc_reg);
        out.extend_from_slice(&regs.int_en_reg);
        out.extend_from_slice(&regs.trig_mode_reg);
        out
    }

    /// Restores the per-core APIC record written by [`ApicDev::save_record`].
    pub fn load_record(&self, idx: usize, data: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(data);
        let mut regs = self.apics[idx].regs.lock();

        regs.base_addr = cur.take64()?;
        regs.base_addr_msr = ApicBaseMsr(cur.take64()?);
        regs.lapic_id = cur.take32()?;
        regs.apic_ver = cur.take32()?;
        regs.task_prio = cur.take32()?;
        regs.arb_prio = cur.take32()?;
        regs.proc_prio = cur.take32()?;
        regs.log_dst = LogDst(cur.take32()?);
        regs.dst_fmt = DstFmt(cur.take32()?);
        regs.spurious_int = cur.take32()?;
        regs.err_status = cur.take32()?;
        regs.int_cmd = IntCmd(cur.take64()?);
        regs.tmr_vec_tbl = Lvt(cur.take32()?);
        regs.therm_loc_vec_tbl = Lvt(cur.take32()?);
        regs.perf_ctr_loc_vec_tbl = Lvt(cur.take32()?);
        regs.lint0_vec_tbl = Lvt(cur.take32()?);
        regs.lint1_vec_tbl = Lvt(cur.take32()?);
        regs.err_vec_tbl = Lvt(cur.take32()?);
        for i in 0..4 {
            regs.ext_intr_vec_tbl[i] = Lvt(cur.take32()?);
        }
        regs.tmr_div_cfg = cur.take32()?;
        regs.tmr_init_cnt = cur.take32()?;
        regs.tmr_cur_cnt = cur.take32()?;
        regs.missed_ints = cur.take32()?;
        regs.ext_apic_feature = cur.take32()?;
        regs.ext_apic_ctrl = cur.take32()?;
        regs.spec_eoi = cur.take32()?;
        regs.rem_rd_data = cur.take32()?;
        regs.ipi_state = match cur.take32()? {
            0 => IpiState::Init,
            1 => IpiState::Sipi,
            2 => IpiState::Started,
            _ => return Err(VmmError::BadCheckpoint),
        };
        cur.take_into(&mut regs.int_req_reg)?;
        cur.take_into(&mut regs.int_svc_reg)?;
        cur.take_into(&mut regs.int_en_reg)?;
        cur.take_into(&mut regs.trig_mode_reg)?;
        Ok(())
    }
}

/// Reads one 32-bit window of a 256-bit register array.
fn word_of(map: &[u8; 32], byte_off: u64) -> u32 {
    let base = (byte_off / 0x10 * 4) as usize;
    u32::from_le_bytes([map[base], map[base + 1], map[base + 2], map[base + 3]])
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take32(&mut self) -> Result<u32> {
        let b = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(VmmError::BadCheckpoint)?;
        self.pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take64(&mut self) -> Result<u64> {
        let lo = self.take32()?;
        let hi = self.take32()?;
        Ok(u64::from(lo) | (u64::from(hi) << 32))
    }

    fn take_into(&mut self, out: &mut [u8]) -> Result<()> {
        let b = self
            .data
            .get(self.pos..self.pos + out.len())
            .ok_or(VmmError::BadCheckpoint)?;
        out.copy_from_slice(b);
        self.pos += out.len();
        Ok(())
    }
}

impl IntrController for ApicDev {
    /// Deliverable iff the best requested vector outranks the best one in
    /// service.
    fn intr_pending(&self, core: &Vcpu) -> bool {
        let idx = core.vcpu_id as usize;
        self.drain_irq_entries(idx);

        let regs = self.apics[idx].regs.lock();
        match (regs.highest_irr(), regs.highest_isr()) {
            (Some(req), Some(svc)) => req > svc,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn get_intr_number(&self, core: &Vcpu) -> Option<u8> {
        let regs = self.apics[core.vcpu_id as usize].regs.lock();
        match (regs.highest_irr(), regs.highest_isr()) {
            (Some(req), Some(svc)) if svc < req => Some(req as u8),
            (Some(req), None) => Some(req as u8),
            _ => None,
        }
    }

    fn begin_irq(&self, core: &Vcpu, irq: u8) {
        self.apics[core.vcpu_id as usize]
            .regs
            .lock()
            .begin_irq(u32::from(irq));
    }
}

impl CoreTimer for ApicDev {
    /// Advances the LAPIC timer: the cycle count is scaled by the divide
    /// configuration, and crossing zero raises the timer LVT vector. In
    /// periodic mode missed laps are accounted; one-shot parks at zero.
    fn update(&self, core: &mut Vcpu, cycles: u64, _cpu_khz: u32) {
        let idx = core.vcpu_id as usize;
        let mut inject = None;

        {
            let mut regs = self.apics[idx].regs.lock();

            let oneshot_done = !regs.tmr_vec_tbl.tmr_mode() && regs.tmr_cur_cnt == 0;
            if regs.tmr_init_cnt == 0 || oneshot_done {
                return;
            }

            let Some(shift) = regs.timer_shift() else {
                error!("apic {idx}: invalid timer divider configuration");
                return;
            };

            let mut ticks = cycles >> shift;
            if ticks < u64::from(regs.tmr_cur_cnt) {
                regs.tmr_cur_cnt -= ticks as u32;

                #[cfg(feature = "timer_backlog_replay")]
                if regs.missed_ints > 0 {
                    regs.missed_ints -= 1;
                    inject = Some(regs.tmr_vec_tbl);
                }
            } else {
                ticks -= u64::from(regs.tmr_cur_cnt);
                regs.tmr_cur_cnt = 0;
                inject = Some(regs.tmr_vec_tbl);

                if regs.tmr_vec_tbl.tmr_mode() {
                    let init = u64::from(regs.tmr_init_cnt);
                    let missed = ticks / init;
                    let rem = ticks % init;
                    regs.tmr_cur_cnt = (init - rem) as u32;
                    regs.missed_ints += missed as u32;
                }
            }
        }

        if let Some(lvt) = inject {
            trace!(
                "apic {idx}: raising timer interrupt (periodic={})",
                lvt.tmr_mode()
            );
            if let Err(e) = self.activate_internal_irq(idx, lvt, false) {
                error!("apic {idx}: could not raise timer interrupt: {e}");
            }
        }
    }
}

impl MmioHook for ApicDev {
    fn mmio_read(&self, _vm: &Vm, core: &mut Vcpu, gpa: u64, data: &mut [u8]) -> Result<()> {
        self.apic_read(core, gpa, data)
    }

    fn mmio_write(&self, vm: &Vm, core: &mut Vcpu, gpa: u64, data: &[u8]) -> Result<()> {
        self.apic_write(vm, core, gpa, data)
    }
}

impl MsrHandler for ApicDev {
    fn read(&self, _vm: &Vm, core: &mut Vcpu, _msr: u32) -> Result<u64> {
        Ok(self.apics[core.vcpu_id as usize].regs.lock().base_addr_msr.0)
    }

    /// An APIC_BASE write relocates the MMIO window: the old region is torn
    /// down and a fresh hook is installed at the new base.
    fn write(&self, vm: &Vm, core: &mut Vcpu, _msr: u32, value: u64) -> Result<()> {
        let idx = core.vcpu_id as usize;
        let old_base = {
            let mut regs = self.apics[idx].regs.lock();
            let old = regs.base_addr;
            regs.base_addr_msr = ApicBaseMsr(value);
            regs.base_addr = value & 0x000f_ffff_ffff_f000;
            old
        };
        let new_base = self.apics[idx].regs.lock().base_addr;
        debug!("apic {idx}: base relocated {old_base:#x} -> {new_base:#x}");
        vm.rehook_apic_page(core, old_base, new_base)
    }
}

impl core::fmt::Debug for ApicDev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApicDev")
            .field("num_apics", &self.apics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::PagingMode;
    use crate::hw_vt::mock::MockVt;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn test_vcpu(id: u32) -> Vcpu {
        Vcpu::new(id, 0, 0, PagingMode::Nested, Box::new(MockVt::new()))
    }

    #[test]
    fn queue_overflow_is_reported_without_mutation() {
        let dev = ApicDev::new(1);
        for i in 0..MAX_IRQ_QUEUE_SIZE {
            dev.add_irq(0, 32 + (i as u32 % 200), false, None).unwrap();
        }
        assert_eq!(
            dev.add_irq(0, 0x99, false, None),
            Err(VmmError::QueueFull(0x99))
        );
        // The queue itself is unchanged; draining still works.
        let core = test_vcpu(0);
        assert!(dev.intr_pending(&core));
    }

    #[test]
    fn low_vectors_are_rejected_at_submission() {
        let dev = ApicDev::new(1);
        assert_eq!(dev.add_irq(0, 15, false, None), Err(VmmError::InvalidVector(15)));
        assert_eq!(dev.add_irq(0, 0, false, None), Err(VmmError::InvalidVector(0)));
        assert!(dev.add_irq(0, 16, false, None).is_ok());
    }

    #[test]
    fn priority_requires_pending_above_in_service() {
        let dev = ApicDev::new(1);
        let core = test_vcpu(0);

        dev.add_irq(0, 0x40, false, None).unwrap();
        assert!(dev.intr_pending(&core));
        assert_eq!(dev.get_intr_number(&core), Some(0x40));

        // The guest takes the interrupt.
        dev.begin_irq(&core, 0x40);
        assert!(!dev.intr_pending(&core));

        // A lower-priority request must wait behind the in-service vector.
        dev.add_irq(0, 0x30, false, None).unwrap();
        assert!(!dev.intr_pending(&core));

        // A higher-priority one preempts.
        dev.add_irq(0, 0x50, false, None).unwrap();
        assert!(dev.intr_pending(&core));
        assert_eq!(dev.get_intr_number(&core), Some(0x50));
    }

    #[test]
    fn coalesced_irq_keeps_original_ack() {
        let dev = ApicDev::new(1);
        let core = test_vcpu(0);
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = fired.clone();
        dev.add_irq(0, 0x40, false, Some(Arc::new(move |_| {
            let _ = f1.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        let f2 = fired.clone();
        dev.add_irq(0, 0x40, false, Some(Arc::new(move |_| {
            let _ = f2.fetch_add(100, Ordering::SeqCst);
        })))
        .unwrap();

        // Latch both entries; the second coalesces away.
        assert!(dev.intr_pending(&core));
        dev.begin_irq(&core, 0x40);

        let completed = dev.apics[0].regs.lock().do_eoi();
        let (irq, ack) = completed.unwrap();
        assert_eq!(irq, 0x40);
        ack.unwrap()(irq);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ier_gates_activation() {
        let dev = ApicDev::new(1);
        let core = test_vcpu(0);

        // Disable vector 0x40.
        dev.apics[0].regs.lock().int_en_reg[0x40 / 8] &= !(1 << (0x40 % 8));
        dev.add_irq(0, 0x40, false, None).unwrap();
        assert!(!dev.intr_pending(&core));
    }

    #[test]
    fn logical_flat_and_cluster_matching() {
        let dev = ApicDev::new(2);
        {
            let mut r0 = dev.apics[0].regs.lock();
            r0.dst_fmt = DstFmt(0xf000_0000);
            r0.log_dst = LogDst(0x0100_0000);
        }
        {
            let mut r1 = dev.apics[1].regs.lock();
            r1.dst_fmt = DstFmt(0xf000_0000);
            r1.log_dst = LogDst(0x0200_0000);
        }

        assert!(dev.matches_logical(0, 0x01).unwrap());
        assert!(!dev.matches_logical(1, 0x01).unwrap());
        assert!(dev.matches_logical(1, 0x03).unwrap());
        // Broadcast always matches.
        assert!(dev.matches_logical(0, 0xff).unwrap());

        // Cluster model: upper nibble selects the cluster.
        {
            let mut r0 = dev.apics[0].regs.lock();
            r0.dst_fmt = DstFmt(0x0000_0000);
            r0.log_dst = LogDst(0x1100_0000);
        }
        assert!(dev.matches_logical(0, 0x11).unwrap());
        assert!(!dev.matches_logical(0, 0x21).unwrap());
        assert!(!dev.matches_logical(0, 0x12).unwrap());
    }

    #[test]
    fn timer_counts_down_and_fires() {
        let dev = ApicDev::new(1);
        let mut core = test_vcpu(0);

        {
            let mut regs = dev.apics[0].regs.lock();
            let mut lvt = Lvt::default();
            lvt.set_vec(0xef);
            lvt.set_tmr_mode(true); // periodic
            regs.tmr_vec_tbl = lvt;
            regs.tmr_div_cfg = 0xb; // divide by 1
            regs.tmr_init_cnt = 1000;
            regs.tmr_cur_cnt = 1000;
        }

        // Not enough cycles to cross zero.
        dev.update(&mut core, 400, 1000);
        assert!(!dev.intr_pending(&core));
        assert_eq!(dev.apics[0].regs.lock().tmr_cur_cnt, 600);

        // Crossing zero injects and reloads.
        dev.update(&mut core, 700, 1000);
        assert!(dev.intr_pending(&core));
        assert_eq!(dev.get_intr_number(&core), Some(0xef));
        assert_eq!(dev.apics[0].regs.lock().tmr_cur_cnt, 900);
    }

    #[test]
    fn masked_timer_lvt_never_reaches_the_queue() {
        let dev = ApicDev::new(1);
        let mut core = test_vcpu(0);

        {
            let mut regs = dev.apics[0].regs.lock();
            let mut lvt = Lvt::default();
            lvt.set_vec(0xef);
            lvt.set_mask(true);
            regs.tmr_vec_tbl = lvt;
            regs.tmr_div_cfg = 0xb;
            regs.tmr_init_cnt = 10;
            regs.tmr_cur_cnt = 10;
        }

        dev.update(&mut core, 1_000, 1000);
        assert!(!dev.intr_pending(&core));
    }

    #[test]
    fn one_shot_timer_parks_at_zero() {
        let dev = ApicDev::new(1);
        let mut core = test_vcpu(0);

        {
            let mut regs = dev.apics[0].regs.lock();
            let mut lvt = Lvt::default();
            lvt.set_vec(0xee);
            regs.tmr_vec_tbl = lvt; // one-shot
            regs.tmr_div_cfg = 0xb;
            regs.tmr_init_cnt = 100;
            regs.tmr_cur_cnt = 100;
        }

        dev.update(&mut core, 150, 1000);
        assert!(dev.intr_pending(&core));
        assert_eq!(dev.apics[0].regs.lock().tmr_cur_cnt, 0);

        // Clear the request; further time must not re-fire.
        dev.begin_irq(&core, 0xee);
        let _ = dev.apics[0].regs.lock().do_eoi();
        dev.update(&mut core, 1_000, 1000);
        assert!(!dev.intr_pending(&core));
    }

    #[test]
    fn checkpoint_record_round_trips() {
        let dev = ApicDev::new(1);
        {
            let mut regs = dev.apics[0].regs.lock();
            regs.task_prio = 0x20;
            regs.tmr_init_cnt = 0x1234;
            regs.int_req_reg[8] = 0xa5;
            regs.ipi_state = IpiState::Started;
        }
        let record = dev.save_record(0);

        let dev2 = ApicDev::new(1);
        dev2.load_record(0, &record).unwrap();
        let regs = dev2.apics[0].regs.lock();
        assert_eq!(regs.task_prio, 0x20);
        assert_eq!(regs.tmr_init_cnt, 0x1234);
        assert_eq!(regs.int_req_reg[8], 0xa5);
        assert_eq!(regs.ipi_state, IpiState::Started);
    }

    #[test]
    fn truncated_checkpoint_record_is_rejected() {
        let dev = ApicDev::new(1);
        let record = dev.save_record(0);
        assert_eq!(
            dev.load_record(0, &record[..record.len() - 8]),
            Err(VmmError::BadCheckpoint)
        );
    }
}
