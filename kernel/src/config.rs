/*
 * Kernel-wide Configuration and Layout Constants
 *
 * Every tunable named by the memory, scheduling and trap-dispatch
 * subsystems lives here instead of as a magic number scattered through
 * the module that happens to need it first. There is no runtime
 * configuration surface before boot; this module *is* the config layer.
 */

/// Bytes per physical/virtual page. The core only ever deals in 4 KiB pages.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Highest buddy order supported. Order k covers 2^k contiguous frames,
/// so MAX_ORDER = 10 covers 4 MiB in one block.
pub const MAX_ORDER: usize = 10;

/// kmalloc: smallest bucket size (bytes) and word alignment.
pub const KMALLOC_ALIGN: usize = 16;
pub const KMALLOC_FIRST_BUCKET: usize = 16;
/// Requests at or below this many bytes go through the bucketed
/// small-object path; above it, kmalloc falls through to a direct
/// buddy allocation recorded on the large-chunk list.
pub const KMALLOC_LARGE_THRESHOLD: usize = PAGE_SIZE - 64;
/// Number of size-class buckets, each double the last starting at
/// KMALLOC_FIRST_BUCKET; the largest bucket must stay at or below
/// KMALLOC_LARGE_THRESHOLD so the two paths never overlap.
pub const KMALLOC_BUCKET_COUNT: usize = 8;

/// Virtual address space layout, 32-bit flat 4 GiB split kernel/user.
/// The low 3 GiB are user-addressable; the kernel's higher half begins
/// at KERNEL_BEGIN and is identity-mapped into every directory.
pub const MEM_SPACE_BEGIN: usize = 0x0000_0000;
pub const MEM_SPACE_END: usize = 0xFFFF_F000; // last usable page boundary
pub const FIRST_USABLE_PAGE: usize = PAGE_SIZE; // page 0 is never mapped (null deref trap)
pub const KERNEL_BEGIN: usize = 0xC000_0000; // 3 GiB

/// Maximum PID, exclusive. PID 0 is reserved/unused, matching the
/// "PID in [1, PID_MAX)" invariant.
pub const PID_MAX: usize = 32768;

/// Timer tick rate driving the scheduler, ~1000 Hz per the core contract.
pub const TIMER_HZ: u32 = 1000;

/// Software interrupt vector reserved for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Base quantum added to a process's signed priority to get its quantum
/// count in ticks; see scheduler::quantum_for_priority.
pub const BASE_QUANTUM: i32 = 128;

/// Pages backing each process's ring-0 stack (the one the TSS `esp0`
/// points at during a privilege-level switch into a trap handler).
pub const KERNEL_STACK_PAGES: usize = 2;

/// Default per-object counts for the kernel's well-known slab caches.
pub const PROCESS_CACHE_OBJECTS_PER_SLAB: usize = 32;
pub const MEMSPACE_CACHE_OBJECTS_PER_SLAB: usize = 32;
pub const REGION_CACHE_OBJECTS_PER_SLAB: usize = 64;
pub const GAP_CACHE_OBJECTS_PER_SLAB: usize = 64;
