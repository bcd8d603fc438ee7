//! The module containing the VM-wide rendezvous barrier.
//!
//! Cross-core mutation of shared state (memory-map changes, INIT delivery,
//! pause/stop) is only safe while every vCPU sits at a known point outside
//! the guest. The initiating thread raises the barrier and waits for every
//! running core to check in at the top of its run loop; the mutation then
//! proceeds with the machine quiesced, and lowering the barrier releases
//! the cores.
//!
//! Only one raiser is admitted at a time. A vCPU raising the barrier from
//! an exit handler counts itself as already checked in.

use crate::vm::Vm;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Barrier {
    /// Serializes raisers.
    raise_lock: AtomicBool,
    /// Cores hold here while set.
    active: AtomicBool,
    /// Bit per core that has checked in.
    checked_in: AtomicU64,
}

impl Barrier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Raises the barrier and returns once every running core has checked
    /// in. `src` names the calling vCPU when the raiser is itself a core.
    pub fn raise(&self, vm: &Vm, src: Option<u32>) {
        while self
            .raise_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another raiser owns the barrier; if we are a vCPU we must
            // honor it or the other raiser waits on us forever.
            if let Some(id) = src {
                self.wait(vm, id);
            }
            vm.host().yield_cpu();
        }

        if let Some(id) = src {
            let _ = self.checked_in.fetch_or(1 << id, Ordering::AcqRel);
        }
        self.active.store(true, Ordering::Release);

        loop {
            let arrived = self.checked_in.load(Ordering::Acquire);
            let all_in = (0..vm.num_cores()).all(|i| {
                Some(i) == src
                    || arrived & (1 << i) != 0
                    || vm.core(i).shared.run_state() == crate::cpu::CoreRunState::Stopped
            });
            if all_in {
                break;
            }
            vm.host().yield_cpu();
        }
    }

    /// Lowers the barrier, releasing every waiting core.
    pub fn lower(&self) {
        self.checked_in.store(0, Ordering::Release);
        self.active.store(false, Ordering::Release);
        self.raise_lock.store(false, Ordering::Release);
    }

    /// The per-core checkpoint: called at the top of the run loop (and at
    /// AP startup). Parks until the barrier is lowered.
    pub fn wait(&self, vm: &Vm, vcpu_id: u32) {
        if !self.active() {
            return;
        }
        let _ = self.checked_in.fetch_or(1 << vcpu_id, Ordering::AcqRel);
        while self.active() {
            vm.host().yield_cpu();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::testing::nested_test_vm_cores;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn raise_waits_for_running_cores() {
        let (vm, _cores) = nested_test_vm_cores(0x10000, 0x10000, 2);

        // Mark core 1 running; core 0 is the raiser's own id.
        vm.core(1).shared.set_run_state(crate::cpu::CoreRunState::Running);

        let raised = Arc::new(AtomicBool::new(false));
        let raised2 = raised.clone();
        let vm2 = Arc::clone(&vm);
        let raiser = std::thread::spawn(move || {
            vm2.barrier().raise(&vm2, Some(0));
            raised2.store(true, Ordering::SeqCst);
            vm2.barrier().lower();
        });

        // The raiser cannot complete until core 1 checks in.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!raised.load(Ordering::SeqCst));

        vm.barrier().wait(&vm, 1);
        raiser.join().unwrap();
        assert!(raised.load(Ordering::SeqCst));
    }

    #[test]
    fn stopped_cores_do_not_block_the_barrier() {
        let (vm, _cores) = nested_test_vm_cores(0x10000, 0x10000, 2);
        // Both cores stopped; a host-side raise must complete immediately.
        vm.barrier().raise(&vm, None);
        assert!(vm.barrier().active());
        vm.barrier().lower();
        assert!(!vm.barrier().active());
    }
}
