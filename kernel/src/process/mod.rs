/*
 * Process Control
 *
 * A process is the unit the scheduler round-robins over and the unit a
 * trap's POSIX signal lands on. Its control block lives in a dedicated
 * slab cache (see `memory::slab::registry::process_cache`) rather than
 * the general kmalloc buckets, keeping process records densely packed
 * and their lifetime decoupled from whatever variable-size allocations
 * happen to be active elsewhere in the kernel at the time.
 */

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{KERNEL_STACK_PAGES, PID_MAX};
use crate::memory::mem_space::MemSpace;
use crate::memory::slab::{self, SlabBox};

pub type Pid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Waiting,
    Running,
    Blocked,
    Stopped,
    Terminated,
}

/// Saved general-purpose and segment registers, written by the trap
/// entry stub and restored by the context switch that resumes this
/// process -- the layout a real `iret` frame plus pusha expects.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Registers {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

pub const SIGNAL_COUNT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Default,
    Ignore,
    Handler(u32),
}

pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub state: ProcessState,
    pub priority: i32,
    pub quantum_remaining: u32,
    pub registers: Registers,
    pub mem_space: MemSpace,
    /// Top of this process's ring-0 stack, loaded into the TSS `esp0`
    /// field whenever the scheduler switches to it (see
    /// `scheduler::switch_to`) so a trap taken while this process is
    /// running lands on its own kernel stack rather than whatever
    /// process last ran.
    pub kernel_stack_top: u32,
    pub signal_table: [SignalDisposition; SIGNAL_COUNT],
    pub pending_signal: Option<u8>,
    /// Set while this process is inside a trap handler on its behalf
    /// (syscall or exception); the trap epilogue uses it to decide
    /// whether to `iret` to ring 0 or ring 3.
    pub syscalling: bool,
    pub exit_code: Option<i32>,
}

impl Process {
    fn new(pid: Pid, parent: Option<Pid>, mut mem_space: MemSpace, priority: i32) -> Result<Self, ProcessError> {
        let stack_base = mem_space.alloc_kernel_stack(KERNEL_STACK_PAGES)?;
        let kernel_stack_top = stack_base.0 as u32 + (KERNEL_STACK_PAGES * crate::config::PAGE_SIZE) as u32;
        Ok(Self {
            pid,
            parent,
            children: Vec::new(),
            state: ProcessState::Created,
            priority,
            quantum_remaining: 0,
            registers: Registers::default(),
            mem_space,
            kernel_stack_top,
            signal_table: [SignalDisposition::Default; SIGNAL_COUNT],
            pending_signal: None,
            syscalling: false,
            exit_code: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    OutOfPids,
    NoSuchProcess,
    Memory,
}

impl From<crate::memory::mem_space::MemSpaceError> for ProcessError {
    fn from(_: crate::memory::mem_space::MemSpaceError) -> Self {
        ProcessError::Memory
    }
}

impl From<crate::memory::slab::SlabError> for ProcessError {
    fn from(_: crate::memory::slab::SlabError) -> Self {
        ProcessError::Memory
    }
}

struct ProcessTable {
    processes: BTreeMap<Pid, SlabBox<Process>>,
    next_pid: Pid,
}

impl ProcessTable {
    const fn new() -> Self {
        Self { processes: BTreeMap::new(), next_pid: 1 }
    }

    fn allocate_pid(&mut self) -> Result<Pid, ProcessError> {
        let processes = &self.processes;
        next_free_pid(&mut self.next_pid, |pid| processes.contains_key(&pid))
    }
}

/// Core of PID allocation, split out from `ProcessTable::allocate_pid` so
/// the wraparound/exhaustion logic can be exercised against a plain
/// predicate instead of a real `BTreeMap<Pid, SlabBox<Process>>`: scans
/// forward from `*next_pid`, wrapping past `PID_MAX` back to 1, and fails
/// once the scan returns to its own starting point having found nothing free.
fn next_free_pid(next_pid: &mut Pid, taken: impl Fn(Pid) -> bool) -> Result<Pid, ProcessError> {
    let start = *next_pid;
    loop {
        let candidate = *next_pid;
        *next_pid = if *next_pid + 1 >= PID_MAX { 1 } else { *next_pid + 1 };
        if !taken(candidate) {
            return Ok(candidate);
        }
        if *next_pid == start {
            return Err(ProcessError::OutOfPids);
        }
    }
}

static TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// Creates the first process (PID 1), the only process not produced by
/// `fork`. Everything else in the system descends from it.
pub fn create_init(mem_space: MemSpace, priority: i32) -> Result<Pid, ProcessError> {
    let mut table = TABLE.lock();
    let pid = table.allocate_pid()?;
    let process = Process::new(pid, None, mem_space, priority)?;
    let cache = slab::registry::process_cache::<Process>();
    let boxed = SlabBox::new(cache, process)?;
    table.processes.insert(pid, boxed);
    drop(table);
    crate::scheduler::enqueue(pid);
    Ok(pid)
}

/// Duplicates `parent`'s address space under copy-on-write and registers
/// the result as a new child process.
pub fn fork(parent_pid: Pid) -> Result<Pid, ProcessError> {
    let mut table = TABLE.lock();
    let pid = table.allocate_pid()?;

    let child_mem_space = {
        let parent = table.processes.get_mut(&parent_pid).ok_or(ProcessError::NoSuchProcess)?;
        parent.mem_space.fork()?
    };

    let parent = table.processes.get(&parent_pid).ok_or(ProcessError::NoSuchProcess)?;
    let mut child = Process::new(pid, Some(parent_pid), child_mem_space, parent.priority)?;
    child.registers = parent.registers;
    child.signal_table = parent.signal_table;

    let cache = slab::registry::process_cache::<Process>();
    let boxed = SlabBox::new(cache, child)?;
    table.processes.insert(pid, boxed);
    if let Some(parent) = table.processes.get_mut(&parent_pid) {
        parent.children.push(pid);
    }
    drop(table);
    crate::scheduler::enqueue(pid);
    Ok(pid)
}

/// Marks `pid` terminated and tears down its address space. The control
/// block itself stays in the table (as a zombie) until `reap` collects it,
/// matching the usual parent-reads-exit-status lifecycle.
pub fn exit(pid: Pid, code: i32) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let process = table.processes.get_mut(&pid).ok_or(ProcessError::NoSuchProcess)?;
    process.state = ProcessState::Terminated;
    process.exit_code = Some(code);
    drop(table);
    crate::scheduler::dequeue(pid);
    Ok(())
}

pub fn reap(pid: Pid) -> Result<i32, ProcessError> {
    let mut table = TABLE.lock();
    let process = table.processes.get(&pid).ok_or(ProcessError::NoSuchProcess)?;
    if process.state != ProcessState::Terminated {
        return Err(ProcessError::NoSuchProcess);
    }
    let code = process.exit_code.unwrap_or(0);
    let boxed = table.processes.remove(&pid).expect("process vanished under lock");
    let process = SlabBox::into_inner(boxed);
    process.mem_space.destroy();
    Ok(code)
}

pub fn with_process<R>(pid: Pid, f: impl FnOnce(&Process) -> R) -> Option<R> {
    let table = TABLE.lock();
    table.processes.get(&pid).map(|p| f(p))
}

pub fn with_process_mut<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut table = TABLE.lock();
    table.processes.get_mut(&pid).map(|p| f(p))
}

pub fn set_signal_disposition(pid: Pid, signal: u8, disposition: SignalDisposition) -> Result<(), ProcessError> {
    with_process_mut(pid, |p| {
        p.signal_table[signal as usize % SIGNAL_COUNT] = disposition;
    })
    .ok_or(ProcessError::NoSuchProcess)
}

/// Wipes the process table back to empty with PID allocation restarting
/// at 1. Host tests share this one process-wide table, so anything that
/// calls `create_init`/`fork`/`exit`/`reap` resets it first; see
/// `memory::test_support::lock_world` for the cross-test exclusion this
/// relies on.
#[cfg(test)]
pub fn test_reset() {
    *TABLE.lock() = ProcessTable::new();
}

/// Routes `signal` to `pid` per its signal table: a custom handler marks
/// the signal pending for the next return to user mode, `Ignore` drops
/// it, and `Default` terminates the process (this kernel has no default
/// actions beyond terminate-or-ignore; stop/continue semantics are a
/// trap-dispatch policy decision, not this table's).
pub fn deliver_signal(pid: Pid, signal: u8) -> Result<(), ProcessError> {
    let mut table = TABLE.lock();
    let process = table.processes.get_mut(&pid).ok_or(ProcessError::NoSuchProcess)?;
    match process.signal_table[signal as usize % SIGNAL_COUNT] {
        SignalDisposition::Ignore => {}
        SignalDisposition::Handler(_) => process.pending_signal = Some(signal),
        SignalDisposition::Default => {
            process.state = ProcessState::Terminated;
            process.exit_code = Some(128 + signal as i32);
            drop(table);
            crate::scheduler::dequeue(pid);
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mem_space::{MemSpace, RegionFlags};
    use crate::memory::{test_support, vmem};

    fn setup() {
        test_support::reset_heap();
        vmem::init_test_kernel_directory();
        test_reset();
        crate::scheduler::test_reset();
    }

    fn new_mem_space() -> MemSpace {
        let mut space = MemSpace::new().unwrap();
        space.alloc(4096, RegionFlags::WRITE | RegionFlags::USER).unwrap();
        space
    }

    #[test]
    fn pid_allocation_wraps_past_pid_max() {
        let mut next_pid = PID_MAX - 1;
        let first = next_free_pid(&mut next_pid, |_| false).unwrap();
        assert_eq!(first, PID_MAX - 1);
        assert_eq!(next_pid, 1);

        let second = next_free_pid(&mut next_pid, |_| false).unwrap();
        assert_eq!(second, 1);
    }

    #[test]
    fn pid_allocation_skips_taken_ids() {
        let mut next_pid = 1;
        let taken: alloc::collections::BTreeSet<Pid> = [1, 2].into_iter().collect();
        let pid = next_free_pid(&mut next_pid, |p| taken.contains(&p)).unwrap();
        assert_eq!(pid, 3);
    }

    #[test]
    fn allocate_pid_fails_once_every_id_is_taken() {
        let mut next_pid = 1;
        let result = next_free_pid(&mut next_pid, |_| true);
        assert_eq!(result, Err(ProcessError::OutOfPids));
    }

    #[test]
    fn create_init_enqueues_pid_one_as_runnable() {
        let _g = test_support::lock_world();
        setup();

        let pid = create_init(new_mem_space(), 0).unwrap();
        assert_eq!(pid, 1);
        with_process(pid, |p| assert_eq!(p.state, ProcessState::Waiting)).unwrap();
    }

    #[test]
    fn fork_duplicates_address_space_and_registers_a_child() {
        let _g = test_support::lock_world();
        setup();

        let parent = create_init(new_mem_space(), 3).unwrap();
        with_process_mut(parent, |p| p.registers.eax = 0xABCD).unwrap();

        let child = fork(parent).unwrap();
        assert_ne!(child, parent);
        with_process(child, |p| {
            assert_eq!(p.parent, Some(parent));
            assert_eq!(p.priority, 3);
            assert_eq!(p.registers.eax, 0xABCD);
        })
        .unwrap();
        with_process(parent, |p| assert_eq!(p.children, alloc::vec![child])).unwrap();
    }

    #[test]
    fn exit_then_reap_tears_down_the_process() {
        let _g = test_support::lock_world();
        setup();

        let pid = create_init(new_mem_space(), 0).unwrap();
        assert_eq!(reap(pid), Err(ProcessError::NoSuchProcess));

        exit(pid, 7).unwrap();
        with_process(pid, |p| assert_eq!(p.state, ProcessState::Terminated)).unwrap();

        assert_eq!(reap(pid), Ok(7));
        assert!(with_process(pid, |_| ()).is_none());
    }

    #[test]
    fn deliver_signal_with_default_disposition_terminates() {
        let _g = test_support::lock_world();
        setup();

        let pid = create_init(new_mem_space(), 0).unwrap();
        deliver_signal(pid, 9).unwrap();
        with_process(pid, |p| {
            assert_eq!(p.state, ProcessState::Terminated);
            assert_eq!(p.exit_code, Some(128 + 9));
        })
        .unwrap();
    }

    #[test]
    fn deliver_signal_with_handler_queues_it_pending() {
        let _g = test_support::lock_world();
        setup();

        let pid = create_init(new_mem_space(), 0).unwrap();
        set_signal_disposition(pid, 10, SignalDisposition::Handler(0x1000)).unwrap();
        deliver_signal(pid, 10).unwrap();
        with_process(pid, |p| {
            assert_eq!(p.pending_signal, Some(10));
            assert_eq!(p.state, ProcessState::Waiting);
        })
        .unwrap();
    }
}
