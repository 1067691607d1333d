/*
 * Preemptive Round-Robin Scheduler
 *
 * One doubly-ended queue holds every runnable process; the process at
 * its front is always the one the CPU is currently executing. A timer
 * tick decrements that process's quantum and, once it reaches zero,
 * rotates it to the back of the queue and promotes the new front.
 * Priority does not reorder the queue -- it only scales how many ticks
 * a process gets before its turn ends, so a high-priority process runs
 * exactly as often as everyone else but for longer each time.
 *
 * The scheduler starts gated in `Mode::Boot`: early boot code constructs
 * the first few processes one at a time and nothing should preempt that
 * sequence. `enter_normal_mode` flips the gate once the system has a
 * runnable process table, and every tick before that is a no-op.
 */

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::arch::x86::gdt;
use crate::config::BASE_QUANTUM;
use crate::process::{self, Pid, ProcessState, Registers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Mode {
    Boot = 0,
    Normal = 1,
}

static MODE: AtomicU8 = AtomicU8::new(Mode::Boot as u8);

struct SchedulerState {
    waiting: VecDeque<Pid>,
    current: Option<Pid>,
}

static STATE: Mutex<SchedulerState> = Mutex::new(SchedulerState { waiting: VecDeque::new(), current: None });

pub fn enter_normal_mode() {
    MODE.store(Mode::Normal as u8, Ordering::SeqCst);
    log::info!("scheduler entering normal mode");
}

fn is_normal_mode() -> bool {
    MODE.load(Ordering::Relaxed) == Mode::Normal as u8
}

/// Computes a process's quantum in ticks from its signed priority: a
/// negative priority shortens the quantum, a positive one lengthens it,
/// always leaving at least one tick so no process can starve itself.
pub fn quantum_for_priority(priority: i32) -> u32 {
    (BASE_QUANTUM + priority).max(1) as u32
}

/// Adds `pid` to the back of the run queue. Called once a process
/// transitions out of `Created`, `Blocked` or `Stopped` into runnable.
pub fn enqueue(pid: Pid) {
    let mut state = STATE.lock();
    if !state.waiting.contains(&pid) && state.current != Some(pid) {
        state.waiting.push_back(pid);
    }
    process::with_process_mut(pid, |p| p.state = ProcessState::Waiting);
}

/// Removes `pid` from the run queue, e.g. because it is blocking on I/O
/// or has been stopped by a signal.
pub fn dequeue(pid: Pid) {
    let mut state = STATE.lock();
    state.waiting.retain(|&p| p != pid);
    if state.current == Some(pid) {
        state.current = None;
    }
}

pub fn current() -> Option<Pid> {
    STATE.lock().current
}

fn pick_next(state: &mut SchedulerState) -> Option<Pid> {
    while let Some(pid) = state.waiting.pop_front() {
        let runnable = process::with_process(pid, |p| p.state == ProcessState::Waiting).unwrap_or(false);
        if runnable {
            return Some(pid);
        }
        // Stale entry for a process that blocked/exited since being
        // queued; drop it and keep looking.
    }
    None
}

/// The scheduler's sole entry point, called once per timer interrupt
/// with the trap frame's saved registers for whichever process the CPU
/// was just running. On a quantum expiry this overwrites `regs` in
/// place with the next process's saved context and switches that
/// process's page directory active, so the interrupt return resumes the
/// new process transparently; on a mid-quantum tick it does nothing.
pub fn tick(regs: &mut Registers) {
    if !is_normal_mode() {
        return;
    }

    let mut state = STATE.lock();
    let current_pid = match state.current {
        Some(pid) => pid,
        None => {
            if let Some(next) = pick_next(&mut state) {
                switch_to(&mut state, None, next, regs);
            }
            return;
        }
    };

    let exhausted = process::with_process_mut(current_pid, |p| {
        p.registers = *regs;
        if p.quantum_remaining > 0 {
            p.quantum_remaining -= 1;
        }
        p.quantum_remaining == 0
    })
    .unwrap_or(true);

    if !exhausted {
        return;
    }

    if let Some(next) = pick_next(&mut state) {
        switch_to(&mut state, Some(current_pid), next, regs);
    } else {
        // No other runnable process: recharge the current one's quantum
        // and let it keep running.
        process::with_process_mut(current_pid, |p| {
            p.quantum_remaining = quantum_for_priority(p.priority);
        });
    }
}

fn switch_to(state: &mut SchedulerState, outgoing: Option<Pid>, incoming: Pid, regs: &mut Registers) {
    if let Some(pid) = outgoing {
        process::with_process_mut(pid, |p| p.state = ProcessState::Waiting);
        state.waiting.push_back(pid);
    }

    process::with_process_mut(incoming, |p| {
        p.state = ProcessState::Running;
        p.quantum_remaining = quantum_for_priority(p.priority);
        *regs = p.registers;
    });
    state.current = Some(incoming);

    process::with_process(incoming, |p| {
        p.mem_space.activate();
        gdt::set_kernel_stack(p.kernel_stack_top);
    });
}

/// Voluntary relinquish: forces the current process's quantum to zero
/// so the next timer tick (or an immediate synthetic one, when called
/// from a syscall path) rotates it out early.
pub fn yield_now(regs: &mut Registers) {
    if let Some(pid) = current() {
        process::with_process_mut(pid, |p| p.quantum_remaining = 0);
    }
    tick(regs);
}

/// Clears the run queue and drops back to `Mode::Boot`. Host tests share
/// this one process-wide scheduler state; see `process::test_reset`,
/// which callers reset alongside this.
#[cfg(test)]
pub fn test_reset() {
    *STATE.lock() = SchedulerState { waiting: VecDeque::new(), current: None };
    MODE.store(Mode::Boot as u8, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mem_space::{MemSpace, RegionFlags};
    use crate::memory::{test_support, vmem};

    fn setup() {
        test_support::reset_heap();
        vmem::init_test_kernel_directory();
        process::test_reset();
        test_reset();
    }

    fn spawn(priority: i32) -> Pid {
        let mut mem_space = MemSpace::new().unwrap();
        mem_space.alloc(4096, RegionFlags::WRITE).unwrap();
        let pid = process::create_init(mem_space, priority).unwrap();
        enter_normal_mode();
        pid
    }

    #[test]
    fn quantum_scales_with_priority_and_floors_at_one() {
        assert_eq!(quantum_for_priority(0), BASE_QUANTUM as u32);
        assert_eq!(quantum_for_priority(10), (BASE_QUANTUM + 10) as u32);
        assert_eq!(quantum_for_priority(-1_000_000), 1);
    }

    #[test]
    fn tick_rotates_to_next_process_once_quantum_exhausted() {
        let _g = test_support::lock_world();
        setup();

        let a = spawn(0);
        let b = spawn(0);
        // `a` was enqueued first; the first tick with no current process
        // picks it as the running process.
        let mut regs = Registers::default();
        tick(&mut regs);
        assert_eq!(current(), Some(a));

        let quantum = quantum_for_priority(0);
        for _ in 0..quantum {
            tick(&mut regs);
        }
        assert_eq!(current(), Some(b));

        process::with_process(a, |p| assert_eq!(p.state, ProcessState::Waiting)).unwrap();
        process::with_process(b, |p| assert_eq!(p.state, ProcessState::Running)).unwrap();
    }

    #[test]
    fn single_runnable_process_keeps_running_with_recharged_quantum() {
        let _g = test_support::lock_world();
        setup();

        let a = spawn(0);
        let mut regs = Registers::default();
        tick(&mut regs);
        assert_eq!(current(), Some(a));

        let quantum = quantum_for_priority(0);
        for _ in 0..quantum {
            tick(&mut regs);
        }
        assert_eq!(current(), Some(a));
        process::with_process(a, |p| assert_eq!(p.quantum_remaining, quantum)).unwrap();
    }

    #[test]
    fn boot_mode_ignores_ticks() {
        let _g = test_support::lock_world();
        setup();
        // Still in Mode::Boot: spawn without entering normal mode.
        let mut mem_space = MemSpace::new().unwrap();
        mem_space.alloc(4096, RegionFlags::WRITE).unwrap();
        let pid = process::create_init(mem_space, 0).unwrap();

        let mut regs = Registers::default();
        tick(&mut regs);
        assert_eq!(current(), None);
        let _ = pid;
    }

    #[test]
    fn yield_now_rotates_immediately_regardless_of_quantum() {
        let _g = test_support::lock_world();
        setup();

        let a = spawn(0);
        let b = spawn(0);
        let mut regs = Registers::default();
        tick(&mut regs);
        assert_eq!(current(), Some(a));

        yield_now(&mut regs);
        assert_eq!(current(), Some(b));
    }
}
