/*
 * Multiboot2 Boot Information
 *
 * Full multiboot tag parsing is the bootstrap's job (see the PURPOSE
 * scope exclusions); this module is only the seam the core actually
 * consumes through: the memory map, the upper-memory bound, and the
 * ELF sections tag, wrapped behind a small interface so `memory::init`
 * never touches the `multiboot2` crate's tag-iteration types directly.
 */

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

use crate::memory::PhysAddr;

pub struct BootInfo {
    inner: BootInformation<'static>,
}

#[derive(Debug, Clone, Copy)]
pub struct AvailableRegion {
    pub base: PhysAddr,
    pub length: u64,
}

impl BootInfo {
    /// Parses the boot-info tag block `kernel_main` received from the
    /// Multiboot2 loader. `magic` must be the value the loader left in
    /// EAX; a mismatch means this wasn't actually a Multiboot2 boot and
    /// is a bootstrap-level contract violation, not a core one.
    pub unsafe fn load(magic: u32, boot_info_ptr: u32) -> Self {
        assert_eq!(magic, multiboot2::MAGIC, "kernel_main: not entered via a Multiboot2 loader");
        let inner = unsafe {
            BootInformation::load(boot_info_ptr as *const BootInformationHeader).expect("malformed multiboot2 boot information")
        };
        Self { inner }
    }

    /// Every memory-map entry the loader reported as `Available`,
    /// aligned to nothing in particular -- `memory::init` does the
    /// page alignment since that's a core concern, not a boot-info one.
    pub fn available_regions(&self) -> impl Iterator<Item = AvailableRegion> + '_ {
        self.inner
            .memory_map_tag()
            .into_iter()
            .flat_map(|tag| tag.memory_areas().iter())
            .filter(|area| matches!(area.typ(), MemoryAreaType::Available))
            .map(|area| AvailableRegion { base: PhysAddr(area.start_address()), length: area.size() })
    }

    /// `[start, end)` of the kernel's own loaded ELF sections, used to
    /// carve the kernel's own identity region out of the address space
    /// before any region/gap allocation happens.
    pub fn kernel_image_range(&self) -> Option<(PhysAddr, PhysAddr)> {
        let sections = self.inner.elf_sections().ok()?;
        let mut start = u64::MAX;
        let mut end = 0u64;
        for section in sections {
            if section.size() == 0 {
                continue;
            }
            start = start.min(section.start_address());
            end = end.max(section.start_address() + section.size());
        }
        if end > start {
            Some((PhysAddr(start), PhysAddr(end)))
        } else {
            None
        }
    }

    pub fn upper_memory_kb(&self) -> Option<u32> {
        self.inner.basic_memory_info_tag().map(|tag| tag.memory_upper())
    }
}
