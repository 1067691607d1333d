/*
 * Per-Process Memory Space
 *
 * Partitions a process's virtual address space into regions (mapped,
 * in use) and gaps (free), each tracked in its own AVL tree keyed by
 * start address. Region backing frames are materialized lazily: an
 * `alloc` call only reserves address space and records the region's
 * permissions, the first access to each page takes a page fault that
 * `handle_page_fault` turns into a freshly zeroed frame.
 *
 * Fork shares a region's existing frames between parent and child under
 * copy-on-write: both mappings are forced read-only and the frame is
 * reference counted, so the first write by either side (caught again
 * through `handle_page_fault`) clones the single page that changed
 * instead of the whole region.
 */

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::{FIRST_USABLE_PAGE, KERNEL_BEGIN, PAGE_SIZE};
use crate::memory::avl::AvlTree;
use crate::memory::buddy;
use crate::memory::vmem::{PageDirectory, PageFlags, VmemError};
use crate::memory::{phys_to_virt, PhysAddr, VirtAddr};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const WRITE = 1 << 0;
        const EXEC  = 1 << 1;
        const USER  = 1 << 2;
        /// Grows toward lower addresses on a fault just below its current
        /// start, up to the gap available there (process/kernel stacks).
        const GROWS_DOWN = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSpaceError {
    OutOfAddressSpace,
    AddressInUse,
    NoSuchRegion,
    Vmem(VmemError),
}

impl From<VmemError> for MemSpaceError {
    fn from(e: VmemError) -> Self {
        MemSpaceError::Vmem(e)
    }
}

impl From<buddy::BuddyError> for MemSpaceError {
    fn from(_: buddy::BuddyError) -> Self {
        MemSpaceError::Vmem(VmemError::OutOfMemory)
    }
}

/// One physical frame backing a page of a region, reference counted so
/// a COW-shared frame is only returned to the buddy allocator once the
/// last mem_space referencing it drops or overwrites its slot.
struct Frame(PhysAddr);

impl Drop for Frame {
    fn drop(&mut self) {
        buddy::free(self.0, 0);
    }
}

struct Region {
    pages: usize,
    flags: RegionFlags,
    /// `cow` is set on both sides of a fork for every writable region;
    /// the next write fault to an unset slot here clones the page.
    cow: bool,
    frames: Vec<Option<Arc<Frame>>>,
}

impl Region {
    fn new(pages: usize, flags: RegionFlags) -> Self {
        Self {
            pages,
            flags,
            cow: false,
            frames: (0..pages).map(|_| None).collect(),
        }
    }

    fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

pub struct MemSpace {
    directory: PageDirectory,
    used: AvlTree<usize, Region>,
    free: AvlTree<usize, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    /// No region covers the faulting address, or the region forbids the
    /// access the CPU trapped on -- the caller (trap dispatch) turns this
    /// into SIGSEGV for the faulting process.
    SegmentationFault,
}

impl MemSpace {
    fn new_with_directory(directory: PageDirectory) -> Self {
        let mut free = AvlTree::new();
        free.insert(FIRST_USABLE_PAGE, KERNEL_BEGIN - FIRST_USABLE_PAGE);
        Self { directory, used: AvlTree::new(), free }
    }

    pub fn new() -> Result<Self, MemSpaceError> {
        Ok(Self::new_with_directory(PageDirectory::new()?))
    }

    pub fn directory_frame(&self) -> PhysAddr {
        self.directory.frame()
    }

    pub fn activate(&self) {
        self.directory.activate();
    }

    fn page_flags(flags: RegionFlags, writable: bool) -> PageFlags {
        let mut pf = PageFlags::PRESENT;
        if writable {
            pf |= PageFlags::WRITE;
        }
        if flags.contains(RegionFlags::USER) {
            pf |= PageFlags::USER;
        }
        pf
    }

    /// Finds the first gap at least `size` bytes wide (first-fit); the
    /// number of live gaps in a process address space is small enough
    /// that a linear scan beats the bookkeeping of a size-ordered index.
    fn find_fit(&self, size: usize) -> Option<usize> {
        let mut found = None;
        self.free.for_each(|&start, &gap_size| {
            if found.is_none() && gap_size >= size {
                found = Some(start);
            }
        });
        found
    }

    /// Removes `[start, start+size)` from the free tree, splitting or
    /// entirely consuming whichever gaps it overlaps, after checking no
    /// existing region already occupies any part of the range.
    fn crush_gaps(&mut self, start: usize, size: usize) -> Result<(), MemSpaceError> {
        let end = start + size;

        let mut overlap = false;
        self.used.for_each(|&rstart, region| {
            let rend = rstart + region.size();
            if rstart < end && start < rend {
                overlap = true;
            }
        });
        if overlap {
            return Err(MemSpaceError::AddressInUse);
        }

        let mut to_remove: Vec<usize> = Vec::new();
        let mut to_insert: Vec<(usize, usize)> = Vec::new();
        self.free.for_each(|&gstart, &gsize| {
            let gend = gstart + gsize;
            if gstart < end && start < gend {
                to_remove.push(gstart);
                if gstart < start {
                    to_insert.push((gstart, start - gstart));
                }
                if gend > end {
                    to_insert.push((end, gend - end));
                }
            }
        });
        if to_remove.is_empty() {
            return Err(MemSpaceError::AddressInUse);
        }
        for g in to_remove {
            self.free.remove(g);
        }
        for (s, sz) in to_insert {
            self.free.insert(s, sz);
        }
        Ok(())
    }

    /// Reserves `size` bytes anywhere in the address space. No frames
    /// are materialized; the region's pages fault in on first access.
    pub fn alloc(&mut self, size: usize, flags: RegionFlags) -> Result<VirtAddr, MemSpaceError> {
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let start = self.find_fit(size).ok_or(MemSpaceError::OutOfAddressSpace)?;
        self.crush_gaps(start, size)?;
        let pages = size / PAGE_SIZE;
        self.used.insert(start, Region::new(pages, flags));
        Ok(VirtAddr(start))
    }

    /// Reserves `size` bytes at exactly `start`. Any existing region
    /// fully inside `[start, start+size)` is removed outright; a region
    /// only partially overlapping one edge is split via `free`, keeping
    /// the part outside the requested range. Whatever gaps the range
    /// still covers afterward are crushed the same way `alloc` does.
    pub fn alloc_fixed(&mut self, start: VirtAddr, size: usize, flags: RegionFlags) -> Result<(), MemSpaceError> {
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = start.0 + size;

        let mut overlapping: Vec<(usize, usize)> = Vec::new();
        self.used.for_each(|&rstart, region| {
            let rend = rstart + region.size();
            if rstart < end && start.0 < rend {
                overlapping.push((rstart, rend));
            }
        });
        for (rstart, rend) in overlapping {
            let clamp_start = rstart.max(start.0);
            let clamp_end = rend.min(end);
            let clamp_pages = (clamp_end - clamp_start) / PAGE_SIZE;
            self.free(VirtAddr(clamp_start), clamp_pages)?;
        }

        self.crush_gaps(start.0, size)?;
        let pages = size / PAGE_SIZE;
        self.used.insert(start.0, Region::new(pages, flags));
        Ok(())
    }

    /// Allocates and eagerly maps a kernel-only stack: interrupt and
    /// fault handlers run with faults already disabled for the stack
    /// they're using, so it cannot be lazily backed.
    pub fn alloc_kernel_stack(&mut self, pages: usize) -> Result<VirtAddr, MemSpaceError> {
        let size = pages * PAGE_SIZE;
        let start = self.find_fit(size).ok_or(MemSpaceError::OutOfAddressSpace)?;
        self.crush_gaps(start, size)?;
        let mut region = Region::new(pages, RegionFlags::WRITE | RegionFlags::GROWS_DOWN);
        for i in 0..pages {
            let phys = buddy::alloc_zero(0)?;
            let vaddr = VirtAddr(start + i * PAGE_SIZE);
            self.directory.map(vaddr, phys, Self::page_flags(region.flags, true))?;
            region.frames[i] = Some(Arc::new(Frame(phys)));
        }
        self.used.insert(start, region);
        Ok(VirtAddr(start))
    }

    /// Releases `[start, start + pages*PAGE_SIZE)`, which must fall
    /// entirely inside one existing region. Unmaps and frees every page
    /// in the range (or drops this space's reference to a COW-shared
    /// one). If the freed range doesn't cover the whole region, the
    /// region is split into up to two residual regions surrounding it.
    /// The freed range is then returned to the free tree, coalescing
    /// with whatever gaps border it.
    pub fn free(&mut self, start: VirtAddr, pages: usize) -> Result<(), MemSpaceError> {
        let region_start = self.used.floor(start.0).map(|(&s, _)| s).ok_or(MemSpaceError::NoSuchRegion)?;
        let region_end = {
            let region = self.used.get(region_start).ok_or(MemSpaceError::NoSuchRegion)?;
            region_start + region.size()
        };
        let free_start = start.0;
        let free_end = free_start + pages * PAGE_SIZE;
        if free_start < region_start || free_start >= region_end || free_end > region_end {
            return Err(MemSpaceError::NoSuchRegion);
        }

        let region = self.used.remove(region_start).expect("region vanished under free");
        let first_index = (free_start - region_start) / PAGE_SIZE;
        let last_index = (free_end - region_start) / PAGE_SIZE;

        for i in first_index..last_index {
            let vaddr = VirtAddr(region_start + i * PAGE_SIZE);
            if region.frames[i].is_some() {
                let _ = self.directory.unmap(vaddr);
            }
        }

        if first_index > 0 {
            let mut left = Region::new(first_index, region.flags);
            left.cow = region.cow;
            left.frames.clone_from_slice(&region.frames[..first_index]);
            self.used.insert(region_start, left);
        }
        if last_index < region.pages {
            let mut right = Region::new(region.pages - last_index, region.flags);
            right.cow = region.cow;
            right.frames.clone_from_slice(&region.frames[last_index..]);
            self.used.insert(free_end, right);
        }
        drop(region);

        let mut new_start = free_start;
        let mut new_size = free_end - free_start;
        if let Some((&gstart, &gsize)) = self.free.floor(new_start.wrapping_sub(1)) {
            if gstart + gsize == new_start {
                self.free.remove(gstart);
                new_start = gstart;
                new_size += gsize;
            }
        }
        if let Some((&gstart, &gsize)) = self.free.ceiling(new_start + new_size) {
            if gstart == new_start + new_size {
                self.free.remove(gstart);
                new_size += gsize;
            }
        }
        self.free.insert(new_start, new_size);
        Ok(())
    }

    /// Builds a child space sharing every region with `self` under
    /// copy-on-write: both spaces' mappings are forced read-only and the
    /// backing frames reference counted.
    pub fn fork(&mut self) -> Result<Self, MemSpaceError> {
        let mut child = Self::new_with_directory(self.directory.clone_shell()?);
        child.free = AvlTree::new();

        let mut regions: Vec<(usize, usize, RegionFlags)> = Vec::new();
        self.used.for_each(|&start, region| {
            regions.push((start, region.pages, region.flags));
        });

        for (start, pages, flags) in &regions {
            let region = self.used.get_mut(*start).expect("region vanished mid-fork");
            region.cow = true;
            let mut child_region = Region::new(*pages, *flags);
            child_region.cow = true;

            for i in 0..*pages {
                if let Some(frame) = &region.frames[i] {
                    let vaddr = VirtAddr(start + i * PAGE_SIZE);
                    let phys = frame.0;
                    let read_only = Self::page_flags(*flags, false);
                    let _ = self.directory.unmap(vaddr);
                    self.directory.map(vaddr, phys, read_only)?;
                    child.directory.map(vaddr, phys, read_only)?;
                    child_region.frames[i] = Some(Arc::clone(frame));
                }
            }
            child.used.insert(*start, child_region);
        }

        // Mirror the parent's free tree by construction: the child has
        // exactly the same regions, so the complement is identical.
        let mut free_entries: Vec<(usize, usize)> = Vec::new();
        self.free.for_each(|&s, &sz| free_entries.push((s, sz)));
        for (s, sz) in free_entries {
            child.free.insert(s, sz);
        }

        Ok(child)
    }

    fn region_covering(&self, addr: usize) -> Option<(usize, &Region)> {
        let (&start, region) = self.used.floor(addr)?;
        if addr < start + region.size() {
            Some((start, region))
        } else {
            None
        }
    }

    /// Routes a page fault to either lazy materialization, a
    /// copy-on-write copy, automatic stack growth, or a segfault verdict.
    pub fn handle_page_fault(&mut self, addr: VirtAddr, write: bool, present: bool) -> FaultOutcome {
        let page_addr = addr.align_down(PAGE_SIZE);

        if let Some((start, _)) = self.region_covering(page_addr.0) {
            return self.resolve_fault_in_region(start, page_addr, write, present);
        }

        // Stack auto-grow: a fault one page below a GROWS_DOWN region's
        // current start, inside a gap large enough to absorb it.
        let mut grow_candidate = None;
        self.used.for_each(|&start, region| {
            if region.flags.contains(RegionFlags::GROWS_DOWN) && start == page_addr.0 + PAGE_SIZE {
                grow_candidate = Some(start);
            }
        });
        if let Some(start) = grow_candidate {
            if self.crush_gaps(page_addr.0, PAGE_SIZE).is_ok() {
                let region = self.used.remove(start).expect("grow candidate vanished");
                let mut grown = Region::new(region.pages + 1, region.flags);
                grown.cow = region.cow;
                grown.frames[1..].clone_from_slice(&region.frames[..]);
                self.used.insert(page_addr.0, grown);
                return self.resolve_fault_in_region(page_addr.0, page_addr, write, present);
            }
        }

        FaultOutcome::SegmentationFault
    }

    fn resolve_fault_in_region(&mut self, region_start: usize, page_addr: VirtAddr, write: bool, present: bool) -> FaultOutcome {
        let region = self.used.get_mut(region_start).expect("region disappeared under fault handler");
        let index = (page_addr.0 - region_start) / PAGE_SIZE;

        if write && !region.flags.contains(RegionFlags::WRITE) {
            return FaultOutcome::SegmentationFault;
        }

        if !present {
            let phys = match buddy::alloc_zero(0) {
                Ok(p) => p,
                Err(_) => return FaultOutcome::SegmentationFault,
            };
            let flags = Self::page_flags(region.flags, write && !region.cow);
            if self.directory.map(page_addr, phys, flags).is_err() {
                buddy::free(phys, 0);
                return FaultOutcome::SegmentationFault;
            }
            region.frames[index] = Some(Arc::new(Frame(phys)));
            return FaultOutcome::Resolved;
        }

        if write && region.cow {
            // Check strong_count on the slot's own reference, not a clone
            // of it -- cloning first would count the clone itself and the
            // sole-owner fast path below would never trigger.
            let sole_owner = match &region.frames[index] {
                Some(f) => Arc::strong_count(f) == 1,
                None => return FaultOutcome::SegmentationFault,
            };
            if sole_owner {
                // Sole remaining owner: just reinstate write access.
                let phys = region.frames[index].as_ref().unwrap().0;
                let flags = Self::page_flags(region.flags, true);
                let _ = self.directory.unmap(page_addr);
                if self.directory.remap(page_addr, phys, flags).is_err() {
                    return FaultOutcome::SegmentationFault;
                }
                return FaultOutcome::Resolved;
            }

            let old = Arc::clone(region.frames[index].as_ref().unwrap());
            let new_phys = match buddy::alloc(0) {
                Ok(p) => p,
                Err(_) => return FaultOutcome::SegmentationFault,
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(old.0) as *const u8,
                    phys_to_virt(new_phys) as *mut u8,
                    PAGE_SIZE,
                );
            }
            let flags = Self::page_flags(region.flags, true);
            let _ = self.directory.unmap(page_addr);
            if self.directory.remap(page_addr, new_phys, flags).is_err() {
                buddy::free(new_phys, 0);
                return FaultOutcome::SegmentationFault;
            }
            region.frames[index] = Some(Arc::new(Frame(new_phys)));
            return FaultOutcome::Resolved;
        }

        FaultOutcome::SegmentationFault
    }

    /// True if `[addr, addr+len)` is entirely covered by regions granting
    /// at least the requested access, used to validate a pointer/length
    /// pair handed in from user space before the kernel dereferences it.
    pub fn can_access(&self, addr: VirtAddr, len: usize, write: bool) -> bool {
        if len == 0 {
            return true;
        }
        let mut cursor = addr.0;
        let end = addr.0 + len;
        while cursor < end {
            let (start, region) = match self.region_covering(cursor) {
                Some(r) => r,
                None => return false,
            };
            if !region.flags.contains(RegionFlags::USER) {
                return false;
            }
            if write && !region.flags.contains(RegionFlags::WRITE) {
                return false;
            }
            cursor = start + region.size();
        }
        true
    }

    /// Copies out of this space's address range into a kernel buffer.
    /// Works across a foreign (not currently active) address space: each
    /// page is translated through this space's own directory and read
    /// back through the kernel identity window, never through the raw
    /// virtual address itself.
    pub fn copy_from(&self, addr: VirtAddr, dest: &mut [u8]) -> Result<(), MemSpaceError> {
        if !self.can_access(addr, dest.len(), false) {
            return Err(MemSpaceError::NoSuchRegion);
        }
        let mut copied = 0;
        while copied < dest.len() {
            let cursor = VirtAddr(addr.0 + copied);
            let page = cursor.align_down(PAGE_SIZE);
            let offset = cursor.0 - page.0;
            let chunk = (PAGE_SIZE - offset).min(dest.len() - copied);
            let (phys, _) = self.directory.resolve(page).ok_or(MemSpaceError::NoSuchRegion)?;
            unsafe {
                let src = (phys_to_virt(phys) as usize + offset) as *const u8;
                core::ptr::copy_nonoverlapping(src, dest[copied..].as_mut_ptr(), chunk);
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Copies a kernel buffer into this space's address range, the same
    /// page-by-page translation as `copy_from` in the other direction.
    pub fn copy_to(&self, addr: VirtAddr, src: &[u8]) -> Result<(), MemSpaceError> {
        if !self.can_access(addr, src.len(), true) {
            return Err(MemSpaceError::NoSuchRegion);
        }
        let mut copied = 0;
        while copied < src.len() {
            let cursor = VirtAddr(addr.0 + copied);
            let page = cursor.align_down(PAGE_SIZE);
            let offset = cursor.0 - page.0;
            let chunk = (PAGE_SIZE - offset).min(src.len() - copied);
            let (phys, _) = self.directory.resolve(page).ok_or(MemSpaceError::NoSuchRegion)?;
            unsafe {
                let dst = (phys_to_virt(phys) as usize + offset) as *mut u8;
                core::ptr::copy_nonoverlapping(src[copied..].as_ptr(), dst, chunk);
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Tears down every region and the page directory itself. Called
    /// once a process has been reaped and nothing can fault into it again.
    pub fn destroy(mut self) {
        let mut regions: Vec<(usize, usize)> = Vec::new();
        self.used.for_each(|&start, region| regions.push((start, region.pages)));
        for (start, pages) in regions {
            let _ = self.free(VirtAddr(start), pages);
        }
        self.directory.destroy();
    }
}

static mut KERNEL_SPACE_DIRECTORY_FRAME: PhysAddr = PhysAddr(0);

/// Records the kernel's own directory frame for diagnostics; the kernel
/// never faults through `MemSpace`, it relies on vmem's permanent
/// identity mapping instead.
pub fn init_kernel_space() {
    unsafe { KERNEL_SPACE_DIRECTORY_FRAME = crate::memory::vmem::kernel_directory_frame() };
    log::info!("kernel memory space recorded");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;
    use crate::memory::vmem;

    fn setup() -> MemSpace {
        test_support::reset_heap();
        vmem::init_test_kernel_directory();
        MemSpace::new().unwrap()
    }

    #[test]
    fn alloc_reserves_address_space_without_materializing_frames() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let before = buddy::stats().free_frames;
        let addr = space.alloc(PAGE_SIZE * 4, RegionFlags::WRITE).unwrap();
        assert_eq!(addr.0 % PAGE_SIZE, 0);
        assert_eq!(buddy::stats().free_frames, before);
        assert!(space.directory.resolve(addr).is_none());
    }

    #[test]
    fn alloc_fixed_crushes_an_overlapping_region() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE, RegionFlags::WRITE).unwrap();
        assert_eq!(space.handle_page_fault(addr, true, false), FaultOutcome::Resolved);
        let before_free_frames = buddy::stats().free_frames;

        space.alloc_fixed(addr, PAGE_SIZE, RegionFlags::WRITE | RegionFlags::USER).unwrap();

        // The old region's frame was released and the new region starts
        // unmapped, exactly as a fresh `alloc` would.
        assert_eq!(buddy::stats().free_frames, before_free_frames + 1);
        assert!(space.directory.resolve(addr).is_none());
        let (start, region) = space.region_covering(addr.0).unwrap();
        assert_eq!(start, addr.0);
        assert!(region.flags.contains(RegionFlags::USER));
    }

    #[test]
    fn alloc_fixed_splits_a_region_overlapping_one_edge() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE * 4, RegionFlags::WRITE).unwrap();
        for i in 0..4 {
            space.handle_page_fault(VirtAddr(addr.0 + i * PAGE_SIZE), true, false);
        }

        // Reserve pages [2, 4) of the existing region plus one page past
        // its end; only the overlapping tail of the old region is crushed.
        let target = VirtAddr(addr.0 + PAGE_SIZE * 2);
        space.alloc_fixed(target, PAGE_SIZE * 3, RegionFlags::WRITE).unwrap();

        let (left_start, left_region) = space.region_covering(addr.0).unwrap();
        assert_eq!(left_start, addr.0);
        assert_eq!(left_region.pages, 2);
        assert!(space.directory.resolve(addr).is_some());

        let (new_start, new_region) = space.region_covering(target.0).unwrap();
        assert_eq!(new_start, target.0);
        assert_eq!(new_region.pages, 3);
        assert!(space.directory.resolve(target).is_none());
    }

    #[test]
    fn partial_free_splits_the_region_around_the_freed_range() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE * 4, RegionFlags::WRITE).unwrap();
        for i in 0..4 {
            space.handle_page_fault(VirtAddr(addr.0 + i * PAGE_SIZE), true, false);
        }
        let before_free_frames = buddy::stats().free_frames;

        // Free the middle two pages, leaving residual regions on both sides.
        space.free(VirtAddr(addr.0 + PAGE_SIZE), 2).unwrap();

        assert_eq!(buddy::stats().free_frames, before_free_frames + 2);
        let (left_start, left_region) = space.region_covering(addr.0).unwrap();
        assert_eq!(left_start, addr.0);
        assert_eq!(left_region.pages, 1);
        let (right_start, right_region) = space.region_covering(addr.0 + PAGE_SIZE * 3).unwrap();
        assert_eq!(right_start, addr.0 + PAGE_SIZE * 3);
        assert_eq!(right_region.pages, 1);
        assert_eq!(space.free.get(addr.0 + PAGE_SIZE), Some(&(PAGE_SIZE * 2)));
        assert!(space.directory.resolve(VirtAddr(addr.0 + PAGE_SIZE)).is_none());
        assert!(space.directory.resolve(addr).is_some());
    }

    #[test]
    fn lazy_fault_materializes_a_zeroed_frame() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE, RegionFlags::WRITE).unwrap();
        let outcome = space.handle_page_fault(addr, false, false);
        assert_eq!(outcome, FaultOutcome::Resolved);
        let (phys, flags) = space.directory.resolve(addr).unwrap();
        assert!(flags.contains(PageFlags::PRESENT));
        let _ = phys;
    }

    #[test]
    fn write_fault_to_read_only_region_segfaults() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE, RegionFlags::empty()).unwrap();
        let outcome = space.handle_page_fault(addr, true, false);
        assert_eq!(outcome, FaultOutcome::SegmentationFault);
    }

    #[test]
    fn fault_outside_any_region_or_grow_candidate_segfaults() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let outcome = space.handle_page_fault(VirtAddr(FIRST_USABLE_PAGE + 0x1000), false, false);
        assert_eq!(outcome, FaultOutcome::SegmentationFault);
    }

    #[test]
    fn stack_grows_down_into_the_adjoining_gap() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE, RegionFlags::WRITE | RegionFlags::GROWS_DOWN).unwrap();
        let below = VirtAddr(addr.0 - PAGE_SIZE);
        let outcome = space.handle_page_fault(below, true, false);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(space.directory.resolve(below).is_some());
        // The grown region now starts one page lower and covers both pages.
        let (start, region) = space.region_covering(below.0).unwrap();
        assert_eq!(start, below.0);
        assert_eq!(region.pages, 2);
    }

    #[test]
    fn free_returns_frames_and_coalesces_adjoining_gaps() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let addr = space.alloc(PAGE_SIZE, RegionFlags::WRITE).unwrap();
        space.handle_page_fault(addr, false, false);
        let before_free_frames = buddy::stats().free_frames;

        space.free(addr, 1).unwrap();
        assert_eq!(buddy::stats().free_frames, before_free_frames + 1);
        assert!(space.region_covering(addr.0).is_none());
        assert_eq!(space.free.get(FIRST_USABLE_PAGE), Some(&(KERNEL_BEGIN - FIRST_USABLE_PAGE)));
    }

    #[test]
    fn fork_shares_frames_cow_and_private_write_copies() {
        let _g = test_support::lock_world();
        let mut parent = setup();

        let addr = parent.alloc(PAGE_SIZE, RegionFlags::WRITE).unwrap();
        assert_eq!(parent.handle_page_fault(addr, true, false), FaultOutcome::Resolved);
        let (parent_phys_before, _) = parent.directory.resolve(addr).unwrap();

        let mut child = parent.fork().unwrap();

        // Both sides now see the same frame, read-only.
        let (pphys, pflags) = parent.directory.resolve(addr).unwrap();
        let (cphys, cflags) = child.directory.resolve(addr).unwrap();
        assert_eq!(pphys, parent_phys_before);
        assert_eq!(pphys, cphys);
        assert!(!pflags.contains(PageFlags::WRITE));
        assert!(!cflags.contains(PageFlags::WRITE));

        // A write fault in the child, with the frame still shared, copies
        // the page rather than mutating the parent's.
        let outcome = child.handle_page_fault(addr, true, true);
        assert_eq!(outcome, FaultOutcome::Resolved);
        let (child_phys_after, child_flags_after) = child.directory.resolve(addr).unwrap();
        assert_ne!(child_phys_after, pphys);
        assert!(child_flags_after.contains(PageFlags::WRITE));

        // The parent is now the sole owner of the original frame; its own
        // write fault just reinstates write access without copying.
        let outcome = parent.handle_page_fault(addr, true, true);
        assert_eq!(outcome, FaultOutcome::Resolved);
        let (parent_phys_after, parent_flags_after) = parent.directory.resolve(addr).unwrap();
        assert_eq!(parent_phys_after, pphys);
        assert!(parent_flags_after.contains(PageFlags::WRITE));
    }

    #[test]
    fn can_access_respects_user_and_write_flags() {
        let _g = test_support::lock_world();
        let mut space = setup();

        let user_rw = space.alloc(PAGE_SIZE, RegionFlags::WRITE | RegionFlags::USER).unwrap();
        let kernel_only = space.alloc(PAGE_SIZE, RegionFlags::WRITE).unwrap();

        assert!(space.can_access(user_rw, PAGE_SIZE, true));
        assert!(!space.can_access(kernel_only, PAGE_SIZE, true));
        assert!(!space.can_access(VirtAddr(user_rw.0 + PAGE_SIZE), PAGE_SIZE * 2, false));
    }
}
