//! The module containing the virtual machine control block (VMCB) layout.
//!
//! The VMCB is the 4KB structure the VMRUN instruction consumes: a control
//! area holding intercept settings and exit information, and a state-save
//! area holding the guest register image hardware loads and stores. Layouts
//! here are bit-for-bit what the processor expects; every field carries its
//! byte offset and the structs are size-asserted.
//!
//! See: Appendix B Layout of VMCB

use crate::cpu::{Segment, Segments};
use bitfield::bitfield;

/// Intercept bits for the third intercept vector (`intercept_misc1`).
/// See: Table B-1. VMCB Layout, Control Area (offset 0x00c)
pub const INTERCEPT_INTR: u32 = 1 << 0;
pub const INTERCEPT_NMI: u32 = 1 << 1;
pub const INTERCEPT_SMI: u32 = 1 << 2;
pub const INTERCEPT_INIT: u32 = 1 << 3;
pub const INTERCEPT_VINTR: u32 = 1 << 4;
pub const INTERCEPT_RDTSC: u32 = 1 << 14;
pub const INTERCEPT_CPUID: u32 = 1 << 18;
pub const INTERCEPT_INTN: u32 = 1 << 21;
pub const INTERCEPT_PAUSE: u32 = 1 << 23;
pub const INTERCEPT_HLT: u32 = 1 << 24;
pub const INTERCEPT_INVLPG: u32 = 1 << 25;
pub const INTERCEPT_INVLPGA: u32 = 1 << 26;
pub const INTERCEPT_IOIO_PROT: u32 = 1 << 27;
pub const INTERCEPT_MSR_PROT: u32 = 1 << 28;
pub const INTERCEPT_SHUTDOWN: u32 = 1 << 31;

/// Intercept bits for the fourth intercept vector (`intercept_misc2`).
pub const INTERCEPT_VMRUN: u32 = 1 << 0;
pub const INTERCEPT_VMMCALL: u32 = 1 << 1;
pub const INTERCEPT_VMLOAD: u32 = 1 << 2;
pub const INTERCEPT_VMSAVE: u32 = 1 << 3;
pub const INTERCEPT_STGI: u32 = 1 << 4;
pub const INTERCEPT_CLGI: u32 = 1 << 5;
pub const INTERCEPT_SKINIT: u32 = 1 << 6;
pub const INTERCEPT_RDTSCP: u32 = 1 << 7;
pub const INTERCEPT_ICEBP: u32 = 1 << 8;
pub const INTERCEPT_WBINVD: u32 = 1 << 9;
pub const INTERCEPT_MONITOR: u32 = 1 << 10;
pub const INTERCEPT_MWAIT: u32 = 1 << 11;
pub const INTERCEPT_MWAIT_ARMED: u32 = 1 << 12;
pub const INTERCEPT_XSETBV: u32 = 1 << 13;

/// \#VMEXIT codes.
/// See: Appendix C SVM Intercept Exit Codes
pub const VMEXIT_CR0_READ: u64 = 0x00;
pub const VMEXIT_CR3_READ: u64 = 0x03;
pub const VMEXIT_CR4_READ: u64 = 0x04;
pub const VMEXIT_CR0_WRITE: u64 = 0x10;
pub const VMEXIT_CR3_WRITE: u64 = 0x13;
pub const VMEXIT_CR4_WRITE: u64 = 0x14;
pub const VMEXIT_CR8_WRITE: u64 = 0x18;
pub const VMEXIT_EXCP_BASE: u64 = 0x40;
pub const VMEXIT_EXCP_NM: u64 = 0x47;
pub const VMEXIT_EXCP_PF: u64 = 0x4e;
pub const VMEXIT_INTR: u64 = 0x60;
pub const VMEXIT_NMI: u64 = 0x61;
pub const VMEXIT_SMI: u64 = 0x62;
pub const VMEXIT_INIT: u64 = 0x63;
pub const VMEXIT_VINTR: u64 = 0x64;
pub const VMEXIT_CR0_SEL_WRITE: u64 = 0x65;
pub const VMEXIT_RDTSC: u64 = 0x6e;
pub const VMEXIT_CPUID: u64 = 0x72;
pub const VMEXIT_SWINT: u64 = 0x75;
pub const VMEXIT_PAUSE: u64 = 0x77;
pub const VMEXIT_HLT: u64 = 0x78;
pub const VMEXIT_INVLPG: u64 = 0x79;
pub const VMEXIT_INVLPGA: u64 = 0x7a;
pub const VMEXIT_IOIO: u64 = 0x7b;
pub const VMEXIT_MSR: u64 = 0x7c;
pub const VMEXIT_SHUTDOWN: u64 = 0x7f;
pub const VMEXIT_VMRUN: u64 = 0x80;
pub const VMEXIT_VMMCALL: u64 = 0x81;
pub const VMEXIT_VMLOAD: u64 = 0x82;
pub const VMEXIT_VMSAVE: u64 = 0x83;
pub const VMEXIT_STGI: u64 = 0x84;
pub const VMEXIT_CLGI: u64 = 0x85;
pub const VMEXIT_SKINIT: u64 = 0x86;
pub const VMEXIT_RDTSCP: u64 = 0x87;
pub const VMEXIT_XSETBV: u64 = 0x8d;
pub const VMEXIT_NPF: u64 = 0x400;
pub const VMEXIT_INVALID: u64 = u64::MAX;

/// Hardware event types for EVENTINJ / EXITINTINFO.
/// See: 15.20 Event Injection
pub const EVENT_TYPE_EXTERNAL_IRQ: u64 = 0;
pub const EVENT_TYPE_NMI: u64 = 2;
pub const EVENT_TYPE_EXCEPTION: u64 = 3;
pub const EVENT_TYPE_SOFT_INT: u64 = 4;

bitfield! {
    /// The guest interrupt control word at control-area offset 0x60: the
    /// virtual TPR and the virtual interrupt request the VMM asserts to make
    /// the guest take an interrupt when its RFLAGS.IF allows.
    ///
    /// See: 15.21 Virtual Interrupts
    #[derive(Clone, Copy, Default)]
    pub struct VIntr(u64);
    impl Debug;
    pub u8, v_tpr, set_v_tpr: 7, 0;
    pub v_irq, set_v_irq: 8;
    pub u8, v_intr_prio, set_v_intr_prio: 19, 16;
    pub v_ign_tpr, set_v_ign_tpr: 20;
    pub v_intr_masking, set_v_intr_masking: 24;
    pub u8, v_intr_vector, set_v_intr_vector: 39, 32;
}

bitfield! {
    /// The event injection / exit interrupt info record.
    ///
    /// See: 15.20 Event Injection
    #[derive(Clone, Copy, Default)]
    pub struct EventInj(u64);
    impl Debug;
    pub u8, vector, set_vector: 7, 0;
    pub u8, ev_type, set_ev_type: 10, 8;
    pub ev, set_ev: 11;
    pub valid, set_valid: 31;
    pub u32, error_code, set_error_code: 63, 32;
}

/// The "metadata" area where we specify what operations to intercept and
/// read the details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: u32, // +0x008
    pub intercept_misc1: u32,     // +0x00c
    pub intercept_misc2: u32,     // +0x010
    pub intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pub pause_filter_threshold: u16, // +0x03c
    pub pause_filter_count: u16,  // +0x03e
    pub iopm_base_pa: u64,        // +0x040
    pub msrpm_base_pa: u64,       // +0x048
    pub tsc_offset: u64,          // +0x050
    pub guest_asid: u32,          // +0x058
    pub tlb_control: u32,         // +0x05c
    pub vintr: VIntr,             // +0x060
    pub interrupt_shadow: u64,    // +0x068
    pub exit_code: u64,           // +0x070
    pub exit_info1: u64,          // +0x078
    pub exit_info2: u64,          // +0x080
    pub exit_int_info: EventInj,  // +0x088
    pub np_enable: u64,           // +0x090
    pub avic_apic_bar: u64,       // +0x098
    pub guest_pa_pf_ghcb: u64,    // +0x0a0
    pub event_inj: EventInj,      // +0x0a8
    pub ncr3: u64,                // +0x0b0
    pub lbr_virtualization_enable: u64, // +0x0b8
    pub vmcb_clean: u64,          // +0x0c0
    pub nrip: u64,                // +0x0c8
    pub num_of_bytes_fetched: u8, // +0x0d0
    pub guest_instruction_bytes: [u8; 15], // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    _padding2: u64, // +0x0e8
    pub avic_logical_table_pointer: u64, // +0x0f0
    pub avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    _padding3: u64, // +0x100
    pub vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    pub reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(core::mem::size_of::<ControlArea>() == 0x400);

/// The area hardware loads the guest register image from on VMRUN and
/// stores it back to on #VMEXIT.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
pub struct StateSaveArea {
    pub es_selector: u16,   // +0x000
    pub es_attrib: u16,     // +0x002
    pub es_limit: u32,      // +0x004
    pub es_base: u64,       // +0x008
    pub cs_selector: u16,   // +0x010
    pub cs_attrib: u16,     // +0x012
    pub cs_limit: u32,      // +0x014
    pub cs_base: u64,       // +0x018
    pub ss_selector: u16,   // +0x020
    pub ss_attrib: u16,     // +0x022
    pub ss_limit: u32,      // +0x024
    pub ss_base: u64,       // +0x028
    pub ds_selector: u16,   // +0x030
    pub ds_attrib: u16,     // +0x032
    pub ds_limit: u32,      // +0x034
    pub ds_base: u64,       // +0x038
    pub fs_selector: u16,   // +0x040
    pub fs_attrib: u16,     // +0x042
    pub fs_limit: u32,      // +0x044
    pub fs_base: u64,       // +0x048
    pub gs_selector: u16,   // +0x050
    pub gs_attrib: u16,     // +0x052
    pub gs_limit: u32,      // +0x054
    pub gs_base: u64,       // +0x058
    pub gdtr_selector: u16, // +0x060
    pub gdtr_attrib: u16,   // +0x062
    pub gdtr_limit: u32,    // +0x064
    pub gdtr_base: u64,     // +0x068
    pub ldtr_selector: u16, // +0x070
    pub ldtr_attrib: u16,   // +0x072
    pub ldtr_limit: u32,    // +0x074
    pub ldtr_base: u64,     // +0x078
    pub idtr_selector: u16, // +0x080
    pub idtr_attrib: u16,   // +0x082
    pub idtr_limit: u32,    // +0x084
    pub idtr_base: u64,     // +0x088
    pub tr_selector: u16,   // +0x090
    pub tr_attrib: u16,     // +0x092
    pub tr_limit: u32,      // +0x094
    pub tr_base: u64,       // +0x098
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    pub cpl: u8,            // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32, // +0x0cc
    pub efer: u64,          // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    pub cr4: u64,           // +0x148
    pub cr3: u64,           // +0x150
    pub cr0: u64,           // +0x158
    pub dr7: u64,           // +0x160
    pub dr6: u64,           // +0x168
    pub rflags: u64,        // +0x170
    pub rip: u64,           // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    pub rsp: u64,           // +0x1d8
    pub s_cet: u64,         // +0x1e0
    pub ssp: u64,           // +0x1e8
    pub isst_addr: u64,     // +0x1f0
    pub rax: u64,           // +0x1f8
    pub star: u64,          // +0x200
    pub lstar: u64,         // +0x208
    pub cstar: u64,         // +0x210
    pub sf_mask: u64,       // +0x218
    pub kernel_gs_base: u64, // +0x220
    pub sysenter_cs: u64,   // +0x228
    pub sysenter_esp: u64,  // +0x230
    pub sysenter_eip: u64,  // +0x238
    pub cr2: u64,           // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    pub gpat: u64,          // +0x268
    pub dbg_ctl: u64,       // +0x270
    pub br_from: u64,       // +0x278
    pub br_to: u64,         // +0x280
    pub last_excep_from: u64, // +0x288
    pub last_excep_to: u64, // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298], // +0x298
    pub spec_ctl: u64,      // +0x2e0
}
const _: () = assert!(core::mem::size_of::<StateSaveArea>() == 0x2e8);

/// The virtual machine control block.
#[derive(Debug, Default)]
#[repr(C, align(4096))]
pub struct Vmcb {
    pub control: ControlArea,
    pub save: StateSaveArea,
}
const _: () = assert!(core::mem::size_of::<Vmcb>() == 0x1000);

impl Vmcb {
    /// Copies the segment descriptor cache into the state-save area.
    pub fn set_segments(&mut self, segs: &Segments) {
        macro_rules! store {
            ($seg:ident, $sel:ident, $attr:ident, $limit:ident, $base:ident) => {
                self.save.$sel = segs.$seg.selector;
                self.save.$attr = pack_attrib(&segs.$seg);
                self.save.$limit = segs.$seg.limit;
                self.save.$base = segs.$seg.base;
            };
        }
        store!(es, es_selector, es_attrib, es_limit, es_base);
        store!(cs, cs_selector, cs_attrib, cs_limit, cs_base);
        store!(ss, ss_selector, ss_attrib, ss_limit, ss_base);
        store!(ds, ds_selector, ds_attrib, ds_limit, ds_base);
        store!(fs, fs_selector, fs_attrib, fs_limit, fs_base);
        store!(gs, gs_selector, gs_attrib, gs_limit, gs_base);
        store!(gdtr, gdtr_selector, gdtr_attrib, gdtr_limit, gdtr_base);
        store!(idtr, idtr_selector, idtr_attrib, idtr_limit, idtr_base);
        store!(ldtr, ldtr_selector, ldtr_attrib, ldtr_limit, ldtr_base);
        store!(tr, tr_selector, tr_attrib, tr_limit, tr_base);
    }

    /// Reads the segment descriptor cache back from the state-save area.
    pub fn get_segments(&self, segs: &mut Segments) {
        macro_rules! load {
            ($seg:ident, $sel:ident, $attr:ident, $limit:ident, $base:ident) => {
                segs.$seg.selector = self.save.$sel;
                segs.$seg.limit = self.save.$limit;
                segs.$seg.base = self.save.$base;
                unpack_attrib(self.save.$attr, &mut segs.$seg);
            };
        }
        load!(es, es_selector, es_attrib, es_limit, es_base);
        load!(cs, cs_selector, cs_attrib, cs_limit, cs_base);
        load!(ss, ss_selector, ss_attrib, ss_limit, ss_base);
        load!(ds, ds_selector, ds_attrib, ds_limit, ds_base);
        load!(fs, fs_selector, fs_attrib, fs_limit, fs_base);
        load!(gs, gs_selector, gs_attrib, gs_limit, gs_base);
        load!(gdtr, gdtr_selector, gdtr_attrib, gdtr_limit, gdtr_base);
        load!(idtr, idtr_selector, idtr_attrib, idtr_limit, idtr_base);
        load!(ldtr, ldtr_selector, ldtr_attrib, ldtr_limit, ldtr_base);
        load!(tr, tr_selector, tr_attrib, tr_limit, tr_base);
    }
}

/// Packs a descriptor-cache entry into the VMCB's 12-bit attribute form:
/// Type/S/DPL/P in the low byte, AVL/L/D-B/G in bits 8..11.
///
/// See: Appendix B, "Segment State in the VMCB"
pub(crate) fn pack_attrib(seg: &Segment) -> u16 {
    u16::from(seg.seg_type & 0xf)
        | u16::from(seg.system) << 4
        | u16::from(seg.dpl & 0x3) << 5
        | u16::from(seg.present) << 7
        | u16::from(seg.avail) << 8
        | u16::from(seg.long_mode) << 9
        | u16::from(seg.db) << 10
        | u16::from(seg.granularity) << 11
}

pub(crate) fn unpack_attrib(attrib: u16, seg: &mut Segment) {
    seg.seg_type = (attrib & 0xf) as u8;
    seg.system = attrib & (1 << 4) != 0;
    seg.dpl = ((attrib >> 5) & 0x3) as u8;
    seg.present = attrib & (1 << 7) != 0;
    seg.avail = attrib & (1 << 8) != 0;
    seg.long_mode = attrib & (1 << 9) != 0;
    seg.db = attrib & (1 << 10) != 0;
    seg.granularity = attrib & (1 << 11) != 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vintr_field_positions() {
        let mut v = VIntr::default();
        v.set_v_irq(true);
        v.set_v_intr_vector(0x20);
        v.set_v_ign_tpr(true);
        v.set_v_intr_prio(0xf);
        assert_eq!(v.0, (1 << 8) | (0xf << 16) | (1 << 20) | (0x20 << 32));
    }

    #[test]
    fn event_inj_field_positions() {
        let mut e = EventInj::default();
        e.set_vector(0x0e);
        e.set_ev_type(EVENT_TYPE_EXCEPTION as u8);
        e.set_ev(true);
        e.set_error_code(0x2);
        e.set_valid(true);
        assert_eq!(e.0, 0x0e | (3 << 8) | (1 << 11) | (1 << 31) | (0x2 << 32));
    }

    #[test]
    fn segment_attrib_round_trip() {
        let seg = Segment {
            selector: 0x10,
            base: 0x1234,
            limit: 0xfffff,
            seg_type: 0xb,
            system: true,
            dpl: 0,
            present: true,
            avail: false,
            long_mode: true,
            db: false,
            granularity: true,
        };
        let mut segs = Segments::default();
        segs.cs = seg;

        let mut vmcb = Vmcb::default();
        vmcb.set_segments(&segs);
        assert_eq!(vmcb.save.cs_attrib, 0x0a9b);

        let mut out = Segments::default();
        vmcb.get_segments(&mut out);
        assert_eq!(out.cs.seg_type, 0xb);
        assert!(out.cs.long_mode);
        assert!(out.cs.granularity);
        assert_eq!(out.cs.base, 0x1234);
    }
}
