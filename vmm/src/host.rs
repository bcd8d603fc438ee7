//! The module containing the host-services seam.
//!
//! Rather than a process-wide table of OS callbacks, the host services are
//! an explicit trait object owned by the VM and threaded through every path
//! that needs the host: page allocation for guest memory and page tables,
//! physical/virtual address conversion, cycle counting, cross-CPU kicks and
//! thread management for vCPU cores.

use crate::{error::Result, vm::Vm};
use alloc::sync::Arc;

/// A constraint on where host pages may be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocZone {
    /// Anywhere in host physical memory.
    Any,
    /// Below the 4 GiB boundary. Required for 32-bit non-PAE page tables.
    Below4G,
}

/// The services a host environment provides to the VMM core.
///
/// All methods may be called concurrently from multiple vCPU threads.
pub trait VmmHost: Send + Sync {
    /// Allocates `count` contiguous, page-aligned pages and returns their
    /// host physical address, or `None` when the host is out of memory (or
    /// the requested NUMA zone is exhausted).
    fn alloc_pages(&self, count: usize, zone: AllocZone, numa_id: Option<u32>) -> Option<u64>;

    /// Frees pages previously returned by [`VmmHost::alloc_pages`].
    fn free_pages(&self, hpa: u64, count: usize);

    /// Converts a host physical address to a pointer the VMM can access.
    fn hpa_to_hva(&self, hpa: u64) -> *mut u8;

    /// Converts a pointer obtained from [`VmmHost::hpa_to_hva`] back to the
    /// host physical address.
    fn hva_to_hpa(&self, hva: *const u8) -> u64;

    /// Reads the host cycle counter.
    fn cycles(&self) -> u64;

    /// The host core frequency in kHz, used to scale virtual timers.
    fn cpu_khz(&self) -> u32;

    /// The id of the physical CPU the caller is running on.
    fn current_pcpu(&self) -> u32;

    /// Sends a wake IPI to the given physical CPU, forcing a VM exit if a
    /// guest is running there.
    fn kick_cpu(&self, pcpu_id: u32);

    /// Yields the calling host thread.
    fn yield_cpu(&self);

    /// Yields the calling host thread to a specific host pid/tid pair.
    /// Hosts without directed yield fall back to a plain yield.
    fn yield_to_pid(&self, _pid: u32, _tid: u32) {
        self.yield_cpu();
    }

    /// Creates and starts the host thread that runs one vCPU, pinned to
    /// `pcpu_id`. The thread body must call [`crate::vm_loop::start_core`].
    /// Called exactly once per core, at launch.
    fn start_core_thread(&self, vm: &Arc<Vm>, vcpu_id: u32, pcpu_id: u32) -> Result<()>;

    /// Re-pins an already-started vCPU thread to another physical CPU.
    fn move_core_thread(&self, _vm: &Arc<Vm>, _vcpu_id: u32, _target_pcpu: u32) -> Result<()> {
        Ok(())
    }

    /// Test support: allows downcasting to a concrete host.
    #[cfg(test)]
    fn as_any(&self) -> &dyn core::any::Any;
}

/// Zeroes `count` pages at `hpa` through the host mapping.
pub(crate) fn zero_pages(host: &dyn VmmHost, hpa: u64, count: usize) {
    let ptr = host.hpa_to_hva(hpa);
    // Safety: `hpa` came from `alloc_pages`, which returns page-aligned
    // memory of at least `count` pages.
    unsafe { core::ptr::write_bytes(ptr, 0, count * 0x1000) };
}
