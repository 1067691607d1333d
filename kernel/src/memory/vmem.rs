/*
 * x86 Two-Level Page Table Manipulator
 *
 * A page directory is 1024 32-bit PDEs, each either absent or pointing
 * at a page table of 1024 32-bit PTEs mapping one 4 KiB frame apiece --
 * the classic 32-bit non-PAE layout, 4 MiB covered per page table and
 * 4 GiB total per directory.
 *
 * Every directory this module creates starts as a copy of the kernel
 * template: the top-of-address-space entries covering KERNEL_BEGIN..4G
 * are shared read-write, non-user page tables cloned by reference (the
 * same page table frame, not a copy), so every process directory sees
 * an identical kernel half without the kernel ever needing to special
 * case "whose directory is this". This is the kernel-mapping invariant:
 * the identity window, buddy/slab/kmalloc metadata and the kernel image
 * itself are reachable from every directory at all times.
 */

use bitflags::bitflags;
use x86::controlregs;

use crate::config::{KERNEL_BEGIN, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::buddy::{self, BuddyError};
use crate::memory::{phys_to_virt, PhysAddr, VirtAddr};

const ENTRIES_PER_TABLE: usize = 1024;
const PDE_SHIFT: u32 = 22;
const PTE_SHIFT: u32 = PAGE_SHIFT;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITE         = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const GLOBAL        = 1 << 8;
    }
}

const ADDR_MASK: u32 = 0xFFFF_F000;
const FLAGS_MASK: u32 = 0x0000_0FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmemError {
    OutOfMemory,
    NotMapped,
    AlreadyMapped,
}

impl From<BuddyError> for VmemError {
    fn from(_: BuddyError) -> Self {
        VmemError::OutOfMemory
    }
}

#[repr(transparent)]
struct Entry(u32);

impl Entry {
    const EMPTY: Entry = Entry(0);

    fn present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    fn addr(&self) -> PhysAddr {
        PhysAddr((self.0 & ADDR_MASK) as u64)
    }

    fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    fn set(&mut self, addr: PhysAddr, flags: PageFlags) {
        self.0 = (addr.0 as u32 & ADDR_MASK) | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

fn table_ptr(frame: PhysAddr) -> *mut [Entry; ENTRIES_PER_TABLE] {
    phys_to_virt(frame) as *mut [Entry; ENTRIES_PER_TABLE]
}

fn indices(vaddr: VirtAddr) -> (usize, usize) {
    let addr = vaddr.0 as u32;
    ((addr >> PDE_SHIFT) as usize, ((addr >> PTE_SHIFT) & 0x3FF) as usize)
}

/// An owned page directory: either the permanent kernel one, built once
/// at boot, or a per-process one created by `PageDirectory::new`.
pub struct PageDirectory {
    frame: PhysAddr,
}

static mut KERNEL_DIRECTORY_FRAME: PhysAddr = PhysAddr(0);

fn alloc_table() -> Result<PhysAddr, VmemError> {
    Ok(buddy::alloc_zero(0)?)
}

impl PageDirectory {
    fn directory(&self) -> &mut [Entry; ENTRIES_PER_TABLE] {
        unsafe { &mut *table_ptr(self.frame) }
    }

    /// Builds a fresh directory whose top half (KERNEL_BEGIN..4G) shares
    /// the kernel's page-table frames and whose bottom half is empty,
    /// ready for a process's `mem_space` to populate.
    pub fn new() -> Result<Self, VmemError> {
        let frame = alloc_table()?;
        let dir = Self { frame };
        let kernel_dir = unsafe { &*table_ptr(KERNEL_DIRECTORY_FRAME) };
        let (kernel_start_index, _) = indices(VirtAddr(KERNEL_BEGIN));
        let this_dir = dir.directory();
        for i in kernel_start_index..ENTRIES_PER_TABLE {
            this_dir[i] = Entry(kernel_dir[i].0);
        }
        Ok(dir)
    }

    /// Duplicates this directory's user half entry-by-entry (not the
    /// page tables themselves -- `mem_space` decides per-region whether
    /// the underlying frames are shared copy-on-write or deep copied).
    pub fn clone_shell(&self) -> Result<Self, VmemError> {
        Self::new()
    }

    pub fn frame(&self) -> PhysAddr {
        self.frame
    }

    fn ensure_table(&mut self, pd_index: usize, user: bool) -> Result<(), VmemError> {
        let dir = self.directory();
        if dir[pd_index].present() {
            return Ok(());
        }
        let table_frame = alloc_table()?;
        let mut flags = PageFlags::PRESENT | PageFlags::WRITE;
        if user {
            flags |= PageFlags::USER;
        }
        dir[pd_index].set(table_frame, flags);
        Ok(())
    }

    /// Maps one 4 KiB page. Fails rather than overwriting an existing
    /// mapping; callers that intend to replace a mapping call `unmap` first.
    pub fn map(&mut self, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) -> Result<(), VmemError> {
        let (pd_index, pt_index) = indices(vaddr);
        self.ensure_table(pd_index, flags.contains(PageFlags::USER))?;
        let dir = self.directory();
        let table = unsafe { &mut *table_ptr(dir[pd_index].addr()) };
        if table[pt_index].present() {
            return Err(VmemError::AlreadyMapped);
        }
        table[pt_index].set(paddr, flags | PageFlags::PRESENT);
        flush(vaddr);
        Ok(())
    }

    /// Like `map`, but replaces whatever mapping (if any) was already there.
    pub fn remap(&mut self, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) -> Result<(), VmemError> {
        let (pd_index, pt_index) = indices(vaddr);
        self.ensure_table(pd_index, flags.contains(PageFlags::USER))?;
        let dir = self.directory();
        let table = unsafe { &mut *table_ptr(dir[pd_index].addr()) };
        table[pt_index].set(paddr, flags | PageFlags::PRESENT);
        flush(vaddr);
        Ok(())
    }

    pub fn unmap(&mut self, vaddr: VirtAddr) -> Result<(), VmemError> {
        let (pd_index, pt_index) = indices(vaddr);
        let dir = self.directory();
        if !dir[pd_index].present() {
            return Err(VmemError::NotMapped);
        }
        let table = unsafe { &mut *table_ptr(dir[pd_index].addr()) };
        if !table[pt_index].present() {
            return Err(VmemError::NotMapped);
        }
        table[pt_index].clear();
        flush(vaddr);
        Ok(())
    }

    pub fn resolve(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let (pd_index, pt_index) = indices(vaddr);
        let dir = unsafe { &*table_ptr(self.frame) };
        if !dir[pd_index].present() {
            return None;
        }
        let table = unsafe { &*table_ptr(dir[pd_index].addr()) };
        let entry = &table[pt_index];
        if !entry.present() {
            return None;
        }
        Some((entry.addr(), entry.flags()))
    }

    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.resolve(vaddr).map(|(addr, _)| PhysAddr(addr.0 | vaddr.page_offset() as u64))
    }

    /// Maps `count` consecutive pages starting at `paddr` to the same
    /// virtual address (`vaddr == paddr`, used for the boot identity
    /// window and MMIO windows carved out by early init).
    pub fn identity_map(&mut self, paddr: PhysAddr, count: usize, flags: PageFlags) -> Result<(), VmemError> {
        for i in 0..count {
            let addr = PhysAddr(paddr.0 + (i * PAGE_SIZE) as u64);
            match self.map(VirtAddr(addr.0 as usize), addr, flags) {
                Ok(()) | Err(VmemError::AlreadyMapped) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Checks and clears the hardware dirty bit for `vaddr`'s mapping.
    /// This is advisory bookkeeping for frame-reclaim decisions, not the
    /// source of truth for region COW state -- a frame the CPU marked
    /// dirty might still be shared read-only again after a later unmap.
    pub fn poll_dirty(&mut self, vaddr: VirtAddr) -> bool {
        let (pd_index, pt_index) = indices(vaddr);
        let dir = self.directory();
        if !dir[pd_index].present() {
            return false;
        }
        let table = unsafe { &mut *table_ptr(dir[pd_index].addr()) };
        let entry = &mut table[pt_index];
        if !entry.present() {
            return false;
        }
        let was_dirty = entry.0 & PageFlags::DIRTY.bits() != 0;
        entry.0 &= !PageFlags::DIRTY.bits();
        was_dirty
    }

    /// Loads CR3 with this directory, making it the active translation
    /// used by every subsequent memory access (the core of a context switch's
    /// address-space half). A no-op on the host test target, where there is
    /// no second address space for the CPU to actually switch into.
    #[cfg(not(test))]
    pub fn activate(&self) {
        unsafe { controlregs::cr3_write(self.frame.0) };
    }

    #[cfg(test)]
    pub fn activate(&self) {}

    /// Frees every user-half page table and the directory frame itself.
    /// Frames the tables pointed at are the caller's responsibility
    /// (`mem_space` already knows which are shared and which are owned).
    pub fn destroy(self) {
        let (kernel_start_index, _) = indices(VirtAddr(KERNEL_BEGIN));
        let dir = unsafe { &mut *table_ptr(self.frame) };
        for i in 0..kernel_start_index {
            if dir[i].present() {
                buddy::free(dir[i].addr(), 0);
                dir[i].clear();
            }
        }
        buddy::free(self.frame, 0);
    }
}

/// Invalidates the TLB entry for `vaddr`. No-op on the host test target:
/// `invlpg` is a privileged instruction and there is no second cache to
/// go stale when `PageDirectory` is just plain host-process memory.
#[cfg(not(test))]
fn flush(vaddr: VirtAddr) {
    unsafe { x86::tlb::flush(vaddr.0) };
}

#[cfg(test)]
fn flush(_vaddr: VirtAddr) {}

#[cfg(not(test))]
pub fn current_frame() -> PhysAddr {
    PhysAddr(unsafe { controlregs::cr3() })
}

#[cfg(test)]
pub fn current_frame() -> PhysAddr {
    unsafe { KERNEL_DIRECTORY_FRAME }
}

/// Builds the permanent kernel directory: identity-maps the first
/// `identity_frames` physical frames (covering the kernel image, the
/// buddy/slab/kmalloc-managed identity window and all boot structures)
/// at `KERNEL_BEGIN + frame*PAGE_SIZE`, matching `memory::phys_to_virt`.
pub fn init() {
    let frame = alloc_table().expect("kernel page directory allocation failed");
    unsafe { KERNEL_DIRECTORY_FRAME = frame };

    let mut dir = PageDirectory { frame };
    let identity_bytes = buddy::stats().total_frames * PAGE_SIZE;
    let identity_frames = (identity_bytes / PAGE_SIZE).max(1);

    for i in 0..identity_frames {
        let phys = PhysAddr((i * PAGE_SIZE) as u64);
        let vaddr = VirtAddr(KERNEL_BEGIN + i * PAGE_SIZE);
        let _ = dir.map(vaddr, phys, PageFlags::PRESENT | PageFlags::WRITE | PageFlags::GLOBAL);
    }

    dir.activate();
    core::mem::forget(dir);
    log::info!("vmem initialized: {} identity frames mapped at 0x{:08x}", identity_frames, KERNEL_BEGIN);
}

pub fn kernel_directory_frame() -> PhysAddr {
    unsafe { KERNEL_DIRECTORY_FRAME }
}

/// Host-test substitute for `init`: allocates a bare kernel directory
/// frame and records it, without mapping an identity window or calling
/// `activate`. `memory::test_support::reset_heap` must run first so
/// `alloc_table` has frames to hand out. Lets `mem_space`/`PageDirectory`
/// tests call `PageDirectory::new`/`clone_shell`, which both read
/// `KERNEL_DIRECTORY_FRAME` to seed a directory's kernel half.
#[cfg(test)]
pub fn init_test_kernel_directory() {
    let frame = alloc_table().expect("test kernel directory allocation failed");
    unsafe { KERNEL_DIRECTORY_FRAME = frame };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    fn setup() {
        test_support::reset_heap();
        init_test_kernel_directory();
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let _g = test_support::lock_world();
        setup();

        let mut dir = PageDirectory::new().unwrap();
        let vaddr = VirtAddr(0x0040_0000);
        let paddr = buddy::alloc_zero(0).unwrap();

        assert!(dir.resolve(vaddr).is_none());
        dir.map(vaddr, paddr, PageFlags::PRESENT | PageFlags::WRITE).unwrap();

        let (resolved, flags) = dir.resolve(vaddr).unwrap();
        assert_eq!(resolved, paddr);
        assert!(flags.contains(PageFlags::WRITE));
        assert_eq!(dir.translate(VirtAddr(vaddr.0 + 0x10)).unwrap(), PhysAddr(paddr.0 + 0x10));

        assert_eq!(dir.map(vaddr, paddr, PageFlags::PRESENT), Err(VmemError::AlreadyMapped));

        dir.unmap(vaddr).unwrap();
        assert!(dir.resolve(vaddr).is_none());
        assert_eq!(dir.unmap(vaddr), Err(VmemError::NotMapped));
    }

    #[test]
    fn remap_replaces_existing_mapping() {
        let _g = test_support::lock_world();
        setup();

        let mut dir = PageDirectory::new().unwrap();
        let vaddr = VirtAddr(0x0080_0000);
        let first = buddy::alloc_zero(0).unwrap();
        let second = buddy::alloc_zero(0).unwrap();

        dir.map(vaddr, first, PageFlags::PRESENT | PageFlags::WRITE).unwrap();
        dir.remap(vaddr, second, PageFlags::PRESENT).unwrap();

        let (resolved, flags) = dir.resolve(vaddr).unwrap();
        assert_eq!(resolved, second);
        assert!(!flags.contains(PageFlags::WRITE));
    }

    #[test]
    fn clone_shell_shares_kernel_half_only() {
        let _g = test_support::lock_world();
        setup();

        let parent = PageDirectory::new().unwrap();
        let child = parent.clone_shell().unwrap();
        assert_ne!(parent.frame(), child.frame());

        let (kernel_start_index, _) = indices(VirtAddr(KERNEL_BEGIN));
        let parent_dir = unsafe { &*table_ptr(parent.frame()) };
        let child_dir = unsafe { &*table_ptr(child.frame()) };
        for i in kernel_start_index..ENTRIES_PER_TABLE {
            assert_eq!(parent_dir[i].0, child_dir[i].0);
        }
    }
}
