/*
 * Interrupt Control Utilities
 *
 * Thin, safe wrappers over the CPU's interrupt-enable flag. Used
 * throughout the allocator and memory-space layers to raise IRQ-disable
 * around critical sections that the page-fault handler may re-enter
 * (see the re-entrancy discipline in the scheduler/trap design notes).
 */

use x86::irq;
use x86::rflags;

pub fn enable() {
    unsafe { irq::enable() };
}

pub fn disable() {
    unsafe { irq::disable() };
}

pub fn are_enabled() -> bool {
    rflags::read().contains(rflags::RFlags::FLAGS_IF)
}

/// Runs `f` with interrupts disabled, restoring the prior state
/// (not unconditionally re-enabling) on return.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = are_enabled();
    if were_enabled {
        disable();
    }
    let result = f();
    if were_enabled {
        enable();
    }
    result
}

/// RAII guard equivalent of `without_interrupts`, for call sites that
/// can't express the critical section as a single closure.
pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let were_enabled = are_enabled();
        if were_enabled {
            disable();
        }
        Self { were_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}
