/*
 * System Timer and Uptime Tracking
 *
 * Global uptime counter and the entry point called once per timer
 * interrupt (IRQ0). This is the boundary between the trap-dispatch
 * layer and the scheduler: every IRQ0 here forwards to
 * `scheduler::tick`, matching the control-flow description in the
 * system overview (timer interrupt -> scheduler -> context switch).
 *
 * PIT programming itself (the divisor write that sets ~1000 Hz) is
 * bootstrap, not core; this module only consumes the resulting ticks.
 */

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TIMER_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Called from the IRQ0 handler exactly once per timer interrupt.
pub fn on_timer_interrupt() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TIMER_HZ as u64
}
