//! The module containing the per-vCPU interrupt state and the VM-wide IRQ
//! routing fabric.
//!
//! Devices raise IRQ lines against the VM; registered routers (the legacy
//! PIC and the I/O APIC are the usual ones) decide which vCPU's interrupt
//! controller receives the resulting message. Each vCPU owns a stack of
//! interrupt controllers (the LAPIC registers itself here) that the
//! injection sequencer consults at every VM entry.
//!
//! Priority among the pending kinds is fixed: software interrupts posted by
//! emulated INTn beat virtual IRQs, which beat controller-delivered
//! external IRQs.

use crate::{
    config::MAX_IRQ,
    cpu::Vcpu,
    error::Result,
    vm::Vm,
};
use alloc::{sync::Arc, vec::Vec};
use log::error;
use spin::Mutex;

/// Callback invoked when the guest acknowledges (EOIs) a delivered IRQ.
pub type AckFn = Arc<dyn Fn(u32) + Send + Sync>;

/// One IRQ message traveling through the routers.
#[derive(Clone)]
pub struct IrqLine {
    pub irq: u32,
    pub ack: Option<AckFn>,
}

impl IrqLine {
    #[must_use]
    pub fn new(irq: u32) -> Self {
        Self { irq, ack: None }
    }

    #[must_use]
    pub fn with_ack(irq: u32, ack: AckFn) -> Self {
        Self { irq, ack: Some(ack) }
    }
}

impl core::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqLine")
            .field("irq", &self.irq)
            .field("acked", &self.ack.is_some())
            .finish()
    }
}

/// The kinds of interrupt the sequencer can find pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrType {
    Invalid,
    External,
    Virtual,
    Software,
}

/// A per-vCPU interrupt controller (the LAPIC, or a test double).
pub trait IntrController: Send + Sync {
    /// Whether the controller has a deliverable IRQ for this core.
    fn intr_pending(&self, core: &Vcpu) -> bool;

    /// The vector of the highest-priority deliverable IRQ.
    fn get_intr_number(&self, core: &Vcpu) -> Option<u8>;

    /// Notification that the interrupt-acknowledge cycle for `irq` has
    /// completed and the vector is now in service.
    fn begin_irq(&self, core: &Vcpu, irq: u8);
}

/// A VM-wide IRQ router (PIC, I/O APIC).
pub trait IntrRouter: Send + Sync {
    fn raise_intr(&self, vm: &Vm, irq: &IrqLine) -> Result<()>;
    fn lower_intr(&self, vm: &Vm, irq: &IrqLine) -> Result<()>;
}

/// The router table. Raising an IRQ on the VM walks every router under the
/// routing lock; each decides whether and where to deliver.
#[derive(Default)]
pub struct IntrRouters {
    routers: Mutex<Vec<Arc<dyn IntrRouter>>>,
}

impl IntrRouters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, router: Arc<dyn IntrRouter>) {
        self.routers.lock().push(router);
    }

    pub(crate) fn raise(&self, vm: &Vm, irq: &IrqLine) -> Result<()> {
        let routers = self.routers.lock();
        for router in routers.iter() {
            router.raise_intr(vm, irq)?;
        }
        Ok(())
    }

    pub(crate) fn lower(&self, vm: &Vm, irq: &IrqLine) -> Result<()> {
        let routers = self.routers.lock();
        for router in routers.iter() {
            router.lower_intr(vm, irq)?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for IntrRouters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IntrRouters")
            .field("count", &self.routers.lock().len())
            .finish()
    }
}

/// Per-vCPU interrupt delivery state.
///
/// `irq_pending`/`irq_started`/`irq_vector` carry one external IRQ through
/// its interrupt-acknowledge cycle across VM entries; the software-interrupt
/// slot and the virtual-IRQ bitmap feed the other two injection kinds.
pub struct IntrCoreState {
    pub irq_pending: bool,
    pub irq_started: bool,
    pub irq_vector: u8,

    pub swintr_posted: bool,
    pub swintr_vector: u8,

    virq_map: [u8; MAX_IRQ / 8],

    controllers: Vec<Arc<dyn IntrController>>,
}

impl IntrCoreState {
    pub(crate) fn new() -> Self {
        Self {
            irq_pending: false,
            irq_started: false,
            irq_vector: 0,
            swintr_posted: false,
            swintr_vector: 0,
            virq_map: [0; MAX_IRQ / 8],
            controllers: Vec::new(),
        }
    }

    pub fn register_controller(&mut self, ctrl: Arc<dyn IntrController>) {
        self.controllers.push(ctrl);
    }

    fn virq_set(&self, irq: usize) -> bool {
        self.virq_map[irq / 8] & (1 << (irq % 8)) != 0
    }
}

impl core::fmt::Debug for IntrCoreState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IntrCoreState")
            .field("irq_pending", &self.irq_pending)
            .field("irq_started", &self.irq_started)
            .field("irq_vector", &self.irq_vector)
            .field("swintr_posted", &self.swintr_posted)
            .finish_non_exhaustive()
    }
}

/// Posts a software interrupt (emulated INTn) for the next entry.
pub fn raise_swintr(core: &mut Vcpu, vector: u8) {
    core.intr_state.swintr_posted = true;
    core.intr_state.swintr_vector = vector;
}

/// Asserts a virtual IRQ line on this core.
pub fn raise_virq(core: &mut Vcpu, irq: u8) {
    let irq = irq as usize;
    core.intr_state.virq_map[irq / 8] |= 1 << (irq % 8);
}

/// Deasserts a virtual IRQ line.
pub fn lower_virq(core: &mut Vcpu, irq: u8) {
    let irq = irq as usize;
    core.intr_state.virq_map[irq / 8] &= !(1 << (irq % 8));
}

/// Drops the in-flight external IRQ (used when restoring state).
pub fn clear_pending_intr(core: &mut Vcpu) {
    core.intr_state.irq_pending = false;
}

/// What kind of interrupt, if any, should be considered at the next entry.
#[must_use]
pub fn intr_pending(core: &Vcpu) -> IntrType {
    let mut ret = IntrType::Invalid;

    // External IRQs have the lowest priority.
    for ctrl in &core.intr_state.controllers {
        if ctrl.intr_pending(core) {
            ret = IntrType::External;
            break;
        }
    }

    // Virtual IRQs rank above them.
    if core.intr_state.virq_map.iter().any(|&b| b != 0) {
        ret = IntrType::Virtual;
    }

    // Software interrupts beat everything.
    if core.intr_state.swintr_posted {
        ret = IntrType::Software;
    }

    ret
}

/// The vector to inject: the lowest asserted virtual IRQ wins, then the
/// controllers are consulted.
#[must_use]
pub fn get_intr(core: &Vcpu) -> Option<u8> {
    for (i, &byte) in core.intr_state.virq_map.iter().enumerate() {
        if byte != 0 {
            let irq = (i * 8) + byte.trailing_zeros() as usize;
            if irq < 32 {
                error!("received exception vector {irq} as a virtual IRQ");
            }
            debug_assert!(core.intr_state.virq_set(irq));
            return Some(irq as u8);
        }
    }

    for ctrl in &core.intr_state.controllers {
        if ctrl.intr_pending(core) {
            return ctrl.get_intr_number(core);
        }
    }

    None
}

/// Tells the controllers an external IRQ has completed its
/// interrupt-acknowledge cycle.
pub fn injecting_intr(core: &Vcpu, vector: u8, intr_type: IntrType) {
    if intr_type == IntrType::External {
        for ctrl in &core.intr_state.controllers {
            ctrl.begin_irq(core, vector);
        }
    }
}

/// Raises an IRQ line VM-wide (no ack callback).
pub fn raise_irq(vm: &Vm, irq: u32) -> Result<()> {
    raise_acked_irq(vm, IrqLine::new(irq))
}

/// Lowers an IRQ line VM-wide.
pub fn lower_irq(vm: &Vm, irq: u32) -> Result<()> {
    lower_acked_irq(vm, IrqLine::new(irq))
}

/// Raises an IRQ line carrying an ack callback.
pub fn raise_acked_irq(vm: &Vm, irq: IrqLine) -> Result<()> {
    vm.intr_routers().raise(vm, &irq)
}

/// Lowers an IRQ line carrying an ack callback.
pub fn lower_acked_irq(vm: &Vm, irq: IrqLine) -> Result<()> {
    vm.intr_routers().lower(vm, &irq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::PagingMode;
    use crate::hw_vt::mock::MockVt;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn test_vcpu() -> Vcpu {
        Vcpu::new(0, 0, 0, PagingMode::Nested, Box::new(MockVt::new()))
    }

    struct FixedCtrl {
        vector: u8,
        begun: AtomicU32,
    }

    impl IntrController for FixedCtrl {
        fn intr_pending(&self, _core: &Vcpu) -> bool {
            true
        }
        fn get_intr_number(&self, _core: &Vcpu) -> Option<u8> {
            Some(self.vector)
        }
        fn begin_irq(&self, _core: &Vcpu, irq: u8) {
            assert_eq!(irq, self.vector);
            let _ = self.begun.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn priority_order_swintr_virq_external() {
        let mut core = test_vcpu();
        assert_eq!(intr_pending(&core), IntrType::Invalid);

        core.intr_state.register_controller(Arc::new(FixedCtrl {
            vector: 0x40,
            begun: AtomicU32::new(0),
        }));
        assert_eq!(intr_pending(&core), IntrType::External);
        assert_eq!(get_intr(&core), Some(0x40));

        raise_virq(&mut core, 0x50);
        assert_eq!(intr_pending(&core), IntrType::Virtual);
        assert_eq!(get_intr(&core), Some(0x50));

        raise_swintr(&mut core, 0x80);
        assert_eq!(intr_pending(&core), IntrType::Software);

        lower_virq(&mut core, 0x50);
        core.intr_state.swintr_posted = false;
        assert_eq!(intr_pending(&core), IntrType::External);
    }

    #[test]
    fn begin_irq_reaches_controllers_for_external_only() {
        let mut core = test_vcpu();
        let ctrl = Arc::new(FixedCtrl {
            vector: 0x40,
            begun: AtomicU32::new(0),
        });
        core.intr_state.register_controller(ctrl.clone());

        injecting_intr(&core, 0x40, IntrType::External);
        assert_eq!(ctrl.begun.load(Ordering::SeqCst), 1);

        injecting_intr(&core, 0x40, IntrType::Virtual);
        assert_eq!(ctrl.begun.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn virq_bitmap_round_trips() {
        let mut core = test_vcpu();
        raise_virq(&mut core, 200);
        assert_eq!(get_intr(&core), Some(200));
        lower_virq(&mut core, 200);
        assert_eq!(get_intr(&core), None);
    }
}
