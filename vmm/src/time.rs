//! The module containing virtual time: per-core cycle accounting, the
//! registered timer devices ticked between VM entries, and the one-shot
//! timeout list consulted after each exit.
//!
//! Guest time is host TSC plus a per-core offset, fixed when the core first
//! starts so the guest observes time beginning near zero. Timer devices
//! (the LAPIC timer) receive the cycles that elapsed since their last
//! update and convert them to their own tick domains.

use crate::cpu::Vcpu;
use alloc::{sync::Arc, vec::Vec};

/// A per-core timer device (e.g. the LAPIC timer).
pub trait CoreTimer: Send + Sync {
    /// Advances the timer by `cycles` host cycles at `cpu_khz`.
    fn update(&self, core: &mut Vcpu, cycles: u64, cpu_khz: u32);
}

/// Controls how the TSC appears to the guest.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeFlags {
    /// Intercept RDTSC/RDTSCP instead of offsetting.
    pub trap_rdtsc: bool,
    /// Expose the raw host TSC (offset zero).
    pub tsc_passthrough: bool,
}

/// Per-core time state.
pub struct CoreTime {
    pub khz: u32,
    pub flags: TimeFlags,
    /// Added to the host TSC by hardware while the guest runs.
    pub tsc_offset: i64,
    pub time_in_guest: u64,
    pub time_in_host: u64,
    pub tsc_at_last_entry: u64,
    pub tsc_at_last_exit: u64,
    last_timer_update: u64,
    started: bool,
    timers: Vec<Arc<dyn CoreTimer>>,
}

impl Default for CoreTime {
    fn default() -> Self {
        Self {
            khz: 0,
            flags: TimeFlags::default(),
            tsc_offset: 0,
            time_in_guest: 0,
            time_in_host: 0,
            tsc_at_last_entry: 0,
            tsc_at_last_exit: 0,
            last_timer_update: 0,
            started: false,
            timers: Vec::new(),
        }
    }
}

impl CoreTime {
    pub fn register_timer(&mut self, timer: Arc<dyn CoreTimer>) {
        self.timers.push(timer);
    }

    /// The guest-visible TSC value for a host TSC reading.
    #[must_use]
    pub fn guest_tsc(&self, host_tsc: u64) -> u64 {
        if self.flags.tsc_passthrough {
            host_tsc
        } else {
            host_tsc.wrapping_add_signed(self.tsc_offset)
        }
    }
}

impl core::fmt::Debug for CoreTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoreTime")
            .field("khz", &self.khz)
            .field("tsc_offset", &self.tsc_offset)
            .field("time_in_guest", &self.time_in_guest)
            .field("time_in_host", &self.time_in_host)
            .finish_non_exhaustive()
    }
}

/// Fixes the guest time base the first time a core starts: the guest TSC
/// begins at zero.
pub fn start_time(core: &mut Vcpu, khz: u32) {
    if core.time.started {
        return;
    }
    let now = core.vt.read_tsc();
    core.time.khz = khz;
    core.time.tsc_offset = -(now as i64);
    core.time.last_timer_update = now;
    core.time.started = true;
}

/// Runs every registered timer with the cycles elapsed since its previous
/// update.
pub fn update_timers(core: &mut Vcpu) {
    let now = core.vt.read_tsc();
    let delta = now.saturating_sub(core.time.last_timer_update);
    core.time.last_timer_update = now;
    if delta == 0 {
        return;
    }

    let khz = core.time.khz;
    let timers = core.time.timers.clone();
    for timer in timers {
        timer.update(core, delta, khz);
    }
}

/// Callback fired when a timeout deadline passes.
pub type TimeoutFn = Arc<dyn Fn(&mut Vcpu) + Send + Sync>;

/// One-shot absolute-deadline callbacks, kept sorted soonest-first.
#[derive(Default)]
pub struct Timeouts {
    entries: Vec<(u64, TimeoutFn)>,
}

impl Timeouts {
    /// Whether any timeout is armed.
    #[must_use]
    pub fn active(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Arms a callback for the given absolute guest cycle count.
    pub fn add(&mut self, deadline_cycles: u64, cb: TimeoutFn) {
        let pos = self
            .entries
            .partition_point(|(deadline, _)| *deadline <= deadline_cycles);
        self.entries.insert(pos, (deadline_cycles, cb));
    }

    fn take_expired(&mut self, now: u64) -> Vec<(u64, TimeoutFn)> {
        let split = self.entries.partition_point(|(deadline, _)| *deadline <= now);
        self.entries.drain(..split).collect()
    }
}

impl core::fmt::Debug for Timeouts {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timeouts")
            .field("armed", &self.entries.len())
            .finish()
    }
}

/// Fires every timeout whose deadline has passed, in deadline order.
/// Timeout callbacks never terminate the VM; failures stay local to the
/// callback.
pub fn handle_timeouts(core: &mut Vcpu) {
    let now = core.time.guest_tsc(core.vt.read_tsc());
    let expired = core.timeouts.take_expired(now);
    for (_, cb) in expired {
        cb(core);
    }
}
