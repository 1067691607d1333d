/*
 * Memory Management
 *
 * Ties together the four layers the core contract describes:
 *  - buddy:     binary buddy physical frame allocator (L1)
 *  - slab:      fixed-size object caches atop buddy (L2)
 *  - kmalloc:   general small-object allocator, also the global allocator (L3)
 *  - vmem:      x86 two-level page table manipulation
 *  - mem_space: per-process region/gap virtual address space manager
 *
 * All physical memory the allocators hand out is reachable through one
 * permanent identity window: physical address P is mapped at virtual
 * address `KERNEL_BEGIN + P`. This only covers P < (4 GiB - KERNEL_BEGIN),
 * i.e. the low 1 GiB of physical RAM -- the conventional limit for a
 * 32-bit kernel using a 3 GiB/1 GiB split, and ample for the small
 * systems this kernel targets.
 */

pub mod avl;
pub mod buddy;
pub mod kmalloc;
pub mod mem_space;
pub mod slab;
pub mod vmem;

use crate::config::{KERNEL_BEGIN, PAGE_SHIFT, PAGE_SIZE};

/// A physical address. Kept distinct from virtual addresses so call
/// sites can't accidentally hand a buddy/slab function the wrong kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// A virtual address within the kernel's or a process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn align_down(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub const fn align_up(self, align: usize) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

/// Maps a physical address into the kernel's permanent identity window.
/// Valid for any frame the buddy allocator could plausibly have handed
/// out; callers never need to tear this mapping down.
#[cfg(not(test))]
pub fn phys_to_virt(addr: PhysAddr) -> usize {
    KERNEL_BEGIN + addr.0 as usize
}

/// Inverse of `phys_to_virt` for addresses known to fall inside the
/// identity window (kernel-owned pointers only -- never a user pointer).
#[cfg(not(test))]
pub fn virt_to_phys_identity(virt: usize) -> PhysAddr {
    PhysAddr((virt - KERNEL_BEGIN) as u64)
}

/// Host-side stand-in for the identity window used by `#[cfg(test)]`
/// unit tests (run on the host target, not under QEMU): a statically
/// allocated byte arena plays the role of "physical RAM" so buddy/slab
/// free-list pointers are real, dereferenceable host addresses instead
/// of `KERNEL_BEGIN`-offset addresses that only make sense once this
/// kernel's own page tables are live.
#[cfg(test)]
pub mod test_arena {
    use crate::config::{MAX_ORDER, PAGE_SIZE};

    pub const ARENA_FRAMES: usize = 1 << (MAX_ORDER + 1);
    const ARENA_BYTES: usize = ARENA_FRAMES * PAGE_SIZE;

    #[repr(align(4096))]
    struct Arena(core::cell::UnsafeCell<[u8; ARENA_BYTES]>);
    unsafe impl Sync for Arena {}

    static ARENA: Arena = Arena(core::cell::UnsafeCell::new([0u8; ARENA_BYTES]));

    pub fn base() -> usize {
        ARENA.0.get() as usize
    }
}

#[cfg(test)]
pub fn phys_to_virt(addr: PhysAddr) -> usize {
    test_arena::base() + addr.0 as usize
}

#[cfg(test)]
pub fn virt_to_phys_identity(virt: usize) -> PhysAddr {
    PhysAddr((virt - test_arena::base()) as u64)
}

/// Shared harness for unit tests that touch the buddy/slab/kmalloc
/// singletons, directly or indirectly through `Box`/`Vec` (which route
/// through this crate's `#[global_allocator]`). `cargo test` runs each
/// `#[test]` fn on its own host thread; on real hardware these modules
/// only ever run on the one CPU this kernel targets, so every such test
/// takes `lock_world()` for its duration and calls `reset_heap()` to
/// start from a known-clean, amply sized pool of frames.
#[cfg(test)]
pub mod test_support {
    use spin::{Mutex, MutexGuard};

    static WORLD_LOCK: Mutex<()> = Mutex::new(());

    pub fn lock_world() -> MutexGuard<'static, ()> {
        WORLD_LOCK.lock()
    }

    pub fn reset_heap() {
        crate::memory::buddy::test_reset();
        crate::memory::buddy::add_region(0, super::test_arena::ARENA_FRAMES);
    }
}

pub fn frame_count(bytes: u64) -> usize {
    (bytes >> PAGE_SHIFT) as usize
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub buddy: buddy::BuddyStats,
    pub kmalloc: kmalloc::KmallocStats,
}

pub fn stats() -> MemoryStats {
    MemoryStats {
        buddy: buddy::stats(),
        kmalloc: kmalloc::stats(),
    }
}

/// Top-level memory initialization, run once during early boot with
/// interrupts still disabled:
///  1. Seed the buddy allocator from every AVAILABLE region in the
///     Multiboot2 memory map.
///  2. Initialize the slab layer's bootstrap cache-of-caches and the
///     kernel's named slab caches.
///  3. Bring up vmem's kernel page directory (identity window + higher
///     half already mapped by the boot stub; this records it).
///  4. Build the kernel's own `mem_space::MemSpace` describing the
///     region occupied by the kernel image, buddy metadata and heap.
pub fn init(boot_info: &crate::boot::BootInfo) {
    log::info!("initializing memory management");

    for region in boot_info.available_regions() {
        let base = region.base.align_up(PAGE_SIZE as u64);
        let end = PhysAddr(region.base.0 + region.length).align_down(PAGE_SIZE as u64);
        if end.0 <= base.0 {
            continue;
        }
        let base_frame = (base.0 >> PAGE_SHIFT) as usize;
        let frames = frame_count(end.0 - base.0);
        buddy::add_region(base_frame, frames);
    }

    let stats = buddy::stats();
    log::info!(
        "buddy allocator: {} frames total, {} free",
        stats.total_frames,
        stats.free_frames
    );

    slab::init();
    kmalloc::init();
    vmem::init();
    mem_space::init_kernel_space();

    log::info!("memory management initialized");
}
