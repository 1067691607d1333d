/*
 * Slab Allocator (L2)
 *
 * Fixed-size object caches carved out of buddy-allocated pages. Each
 * cache's slabs are always allocated at the same buddy order, which
 * means a slab's base address is simply the containing object pointer
 * masked down to that order's size -- no metadata lookup needed on the
 * free path once the caller already knows which cache an object came
 * from (Process/MemSpace/Region/Gap all do, via their own typed free
 * functions).
 *
 * A global AVL index from slab base address to owning cache is kept
 * alongside this for integrity checking: `cache_free` validates the
 * pointer it was given actually falls inside a live slab of the right
 * cache before touching the free list, which catches a caller passing
 * a stale or foreign pointer instead of silently corrupting memory.
 */

use core::ptr::NonNull;

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::memory::avl::AvlTree;
use crate::memory::buddy::{self, BuddyError};
use crate::memory::{phys_to_virt, virt_to_phys_identity};

const MAX_CACHES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    OutOfMemory,
    RegistryFull,
    UnknownCache,
    /// `cache_free` was handed a pointer that does not belong to a live
    /// slab of the cache it claims to belong to.
    ForeignPointer,
}

impl From<BuddyError> for SlabError {
    fn from(_: BuddyError) -> Self {
        SlabError::OutOfMemory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheId(usize);

#[repr(C)]
struct SlabHeader {
    cache: usize,
    free_count: usize,
    free_list: Option<NonNull<u8>>,
    prev: Option<NonNull<SlabHeader>>,
    next: Option<NonNull<SlabHeader>>,
}

/// Object lifecycle hooks a cache may be created with. Both run with the
/// object already zeroed; `dtor` runs immediately before the object's
/// memory is returned to the free list, so it sees the object's last
/// live state, not the zeroed state `ctor` saw.
pub type Ctor = fn(NonNull<u8>);
pub type Dtor = fn(NonNull<u8>);

struct Cache {
    name: &'static str,
    object_size: usize,
    object_align: usize,
    objects_per_slab: usize,
    slab_order: usize,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
    partial: Option<NonNull<SlabHeader>>,
    full: Option<NonNull<SlabHeader>>,
    total_objects: usize,
    free_objects: usize,
}

// Caches and their slab lists are only ever touched under REGISTRY's lock.
unsafe impl Send for Cache {}

struct Registry {
    caches: [Option<Cache>; MAX_CACHES],
    count: usize,
    index: AvlTree<usize, usize>,
}

impl Registry {
    const fn new() -> Self {
        const NONE: Option<Cache> = None;
        Self {
            caches: [NONE; MAX_CACHES],
            count: 0,
            index: AvlTree::new(),
        }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

fn header_size(align: usize) -> usize {
    let raw = core::mem::size_of::<SlabHeader>();
    (raw + align - 1) & !(align - 1)
}

fn pick_slab_order(object_size: usize, object_align: usize, objects_per_slab: usize) -> usize {
    let needed = header_size(object_align) + object_size * objects_per_slab;
    let mut order = 0;
    while (PAGE_SIZE << order) < needed {
        order += 1;
    }
    order
}

/// Creates (or returns the existing) cache named `name`. Idempotent: a
/// second call with the same name and compatible parameters returns the
/// same `CacheId` rather than allocating a duplicate cache, so modules
/// that lazily reach for a well-known cache never have to coordinate
/// who calls this first. `ctor`/`dtor` are optional object lifecycle
/// hooks; pass `None` for either to skip it.
pub fn cache_create(
    name: &'static str,
    object_size: usize,
    object_align: usize,
    objects_per_slab: usize,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
) -> Result<CacheId, SlabError> {
    let mut reg = REGISTRY.lock();

    for (i, slot) in reg.caches.iter().enumerate() {
        if let Some(c) = slot {
            if c.name == name {
                return Ok(CacheId(i));
            }
        }
    }

    let slot = reg.caches.iter().position(|c| c.is_none()).ok_or(SlabError::RegistryFull)?;
    let object_size = object_size.max(core::mem::size_of::<usize>());
    let slab_order = pick_slab_order(object_size, object_align, objects_per_slab);

    reg.caches[slot] = Some(Cache {
        name,
        object_size,
        object_align,
        objects_per_slab,
        slab_order,
        ctor,
        dtor,
        partial: None,
        full: None,
        total_objects: 0,
        free_objects: 0,
    });
    reg.count += 1;
    Ok(CacheId(slot))
}

fn object_at(slab_base: usize, header_sz: usize, object_size: usize, index: usize) -> NonNull<u8> {
    let addr = slab_base + header_sz + index * object_size;
    NonNull::new(addr as *mut u8).expect("slab object address is never null")
}

unsafe fn carve_slab(cache_idx: usize, cache: &mut Cache) -> Result<NonNull<SlabHeader>, SlabError> {
    let phys = buddy::alloc_zero(cache.slab_order)?;
    let base = phys_to_virt(phys);
    let header_sz = header_size(cache.object_align);

    let header_ptr = base as *mut SlabHeader;
    let mut free_list: Option<NonNull<u8>> = None;
    for i in (0..cache.objects_per_slab).rev() {
        let obj = object_at(base, header_sz, cache.object_size, i);
        unsafe {
            *(obj.as_ptr() as *mut Option<NonNull<u8>>) = free_list;
        }
        free_list = Some(obj);
    }

    unsafe {
        header_ptr.write(SlabHeader {
            cache: cache_idx,
            free_count: cache.objects_per_slab,
            free_list,
            prev: None,
            next: None,
        });
    }
    let header = NonNull::new(header_ptr).unwrap();

    REGISTRY.lock().index.insert(base, cache_idx);

    cache.total_objects += cache.objects_per_slab;
    cache.free_objects += cache.objects_per_slab;
    Ok(header)
}

unsafe fn list_push(head: &mut Option<NonNull<SlabHeader>>, mut node: NonNull<SlabHeader>) {
    unsafe {
        node.as_mut().prev = None;
        node.as_mut().next = *head;
        if let Some(mut h) = *head {
            h.as_mut().prev = Some(node);
        }
        *head = Some(node);
    }
}

unsafe fn list_remove(head: &mut Option<NonNull<SlabHeader>>, mut node: NonNull<SlabHeader>) {
    unsafe {
        let prev = node.as_mut().prev;
        let next = node.as_mut().next;
        match prev {
            Some(mut p) => p.as_mut().next = next,
            None => *head = next,
        }
        if let Some(mut n) = next {
            n.as_mut().prev = prev;
        }
    }
}

/// Allocates one zeroed object from the named cache.
pub fn cache_alloc(id: CacheId) -> Result<NonNull<u8>, SlabError> {
    let mut reg = REGISTRY.lock();
    let cache_idx = id.0;
    let cache = reg.caches[cache_idx].as_mut().ok_or(SlabError::UnknownCache)?;

    let mut slab = match cache.partial {
        Some(s) => s,
        None => unsafe { carve_slab(cache_idx, cache)? },
    };

    let obj = unsafe { slab.as_mut().free_list.take().expect("slab on partial/fresh list has no free objects") };
    unsafe {
        slab.as_mut().free_list = *(obj.as_ptr() as *const Option<NonNull<u8>>);
        slab.as_mut().free_count -= 1;
        core::ptr::write_bytes(obj.as_ptr(), 0, cache.object_size);
    }
    cache.free_objects -= 1;

    let now_full = unsafe { slab.as_ref().free_count == 0 };
    if cache.partial == Some(slab) {
        unsafe { list_remove(&mut cache.partial, slab) };
    }
    if now_full {
        unsafe { list_push(&mut cache.full, slab) };
    } else {
        unsafe { list_push(&mut cache.partial, slab) };
    }

    if let Some(ctor) = cache.ctor {
        ctor(obj);
    }

    Ok(obj)
}

/// Returns `ptr` to `id`'s free list. The pointer must be one previously
/// returned by `cache_alloc(id)` on this same cache; passing a pointer
/// from a different cache or a stale one is rejected rather than
/// silently corrupting both caches' bookkeeping.
pub fn cache_free(id: CacheId, ptr: NonNull<u8>) -> Result<(), SlabError> {
    let mut reg = REGISTRY.lock();
    let cache_idx = id.0;
    let cache = reg.caches[cache_idx].as_mut().ok_or(SlabError::UnknownCache)?;

    let slab_size = PAGE_SIZE << cache.slab_order;
    let slab_base = ptr.as_ptr() as usize & !(slab_size - 1);

    match reg.index.get(slab_base) {
        Some(&owner) if owner == cache_idx => {}
        _ => return Err(SlabError::ForeignPointer),
    }

    if let Some(dtor) = cache.dtor {
        dtor(ptr);
    }

    let mut slab = NonNull::new(slab_base as *mut SlabHeader).unwrap();
    let was_full = unsafe { slab.as_ref().free_count == 0 };

    unsafe {
        *(ptr.as_ptr() as *mut Option<NonNull<u8>>) = slab.as_ref().free_list;
        slab.as_mut().free_list = Some(ptr);
        slab.as_mut().free_count += 1;
    }
    cache.free_objects += 1;

    if was_full {
        unsafe {
            list_remove(&mut cache.full, slab);
            list_push(&mut cache.partial, slab);
        }
    }

    let empty = unsafe { slab.as_ref().free_count == cache.objects_per_slab };
    if empty {
        unsafe { list_remove(&mut cache.partial, slab) };
        reg.index.remove(slab_base);
        cache.total_objects -= cache.objects_per_slab;
        cache.free_objects -= cache.objects_per_slab;
        let phys = virt_to_phys_identity(slab_base);
        buddy::free(phys, cache.slab_order);
    }

    Ok(())
}

/// Tears a cache down: every slab it owns (full or partial) is unlinked
/// from the registry index and handed back to the buddy allocator, and
/// the registry slot itself is freed for a future `cache_create`. Any
/// outstanding object pointers allocated from this cache become
/// dangling -- the caller must have already freed or abandoned them.
pub fn cache_destroy(id: CacheId) -> Result<(), SlabError> {
    let mut reg = REGISTRY.lock();
    let cache_idx = id.0;
    let cache = reg.caches[cache_idx].as_ref().ok_or(SlabError::UnknownCache)?;
    let slab_order = cache.slab_order;

    let mut slabs: Vec<NonNull<SlabHeader>> = Vec::new();
    let mut cursor = cache.full;
    while let Some(s) = cursor {
        slabs.push(s);
        cursor = unsafe { s.as_ref().next };
    }
    let mut cursor = cache.partial;
    while let Some(s) = cursor {
        slabs.push(s);
        cursor = unsafe { s.as_ref().next };
    }

    for slab in slabs {
        let base = slab.as_ptr() as usize;
        reg.index.remove(base);
        let phys = virt_to_phys_identity(base);
        buddy::free(phys, slab_order);
    }

    reg.caches[cache_idx] = None;
    reg.count -= 1;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub total_objects: usize,
    pub free_objects: usize,
}

pub fn cache_stats(id: CacheId) -> Option<CacheStats> {
    let reg = REGISTRY.lock();
    reg.caches[id.0].as_ref().map(|c| CacheStats {
        name: c.name,
        object_size: c.object_size,
        total_objects: c.total_objects,
        free_objects: c.free_objects,
    })
}

/// Well-known cache handles, created once during `memory::init` and
/// looked up by name thereafter by whichever module owns that type.
pub mod registry {
    use super::CacheId;
    use crate::config::{
        GAP_CACHE_OBJECTS_PER_SLAB, MEMSPACE_CACHE_OBJECTS_PER_SLAB, PROCESS_CACHE_OBJECTS_PER_SLAB,
        REGION_CACHE_OBJECTS_PER_SLAB,
    };
    use spin::Once;

    static PROCESS: Once<CacheId> = Once::new();
    static MEM_SPACE: Once<CacheId> = Once::new();
    static REGION: Once<CacheId> = Once::new();
    static GAP: Once<CacheId> = Once::new();

    pub fn process_cache<T>() -> CacheId {
        *PROCESS.call_once(|| {
            super::cache_create(
                "process",
                core::mem::size_of::<T>(),
                core::mem::align_of::<T>(),
                PROCESS_CACHE_OBJECTS_PER_SLAB,
                None,
                None,
            )
            .expect("process cache registration failed")
        })
    }

    pub fn mem_space_cache<T>() -> CacheId {
        *MEM_SPACE.call_once(|| {
            super::cache_create(
                "mem_space",
                core::mem::size_of::<T>(),
                core::mem::align_of::<T>(),
                MEMSPACE_CACHE_OBJECTS_PER_SLAB,
                None,
                None,
            )
            .expect("mem_space cache registration failed")
        })
    }

    pub fn region_cache<T>() -> CacheId {
        *REGION.call_once(|| {
            super::cache_create(
                "region",
                core::mem::size_of::<T>(),
                core::mem::align_of::<T>(),
                REGION_CACHE_OBJECTS_PER_SLAB,
                None,
                None,
            )
            .expect("region cache registration failed")
        })
    }

    pub fn gap_cache<T>() -> CacheId {
        *GAP.call_once(|| {
            super::cache_create(
                "gap",
                core::mem::size_of::<T>(),
                core::mem::align_of::<T>(),
                GAP_CACHE_OBJECTS_PER_SLAB,
                None,
                None,
            )
            .expect("gap cache registration failed")
        })
    }
}

pub fn init() {
    log::info!("slab allocator initialized ({} cache slots)", MAX_CACHES);
}

/// An owning pointer to a single cache object, the slab-backed
/// equivalent of `alloc::boxed::Box` for kernel structures that live in
/// a named cache (process control blocks in particular) instead of the
/// general kmalloc buckets.
pub struct SlabBox<T> {
    ptr: NonNull<T>,
    cache: CacheId,
}

impl<T> SlabBox<T> {
    pub fn new(cache: CacheId, value: T) -> Result<Self, SlabError> {
        let raw = cache_alloc(cache)?;
        let ptr = raw.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, cache })
    }
}

impl<T> core::ops::Deref for SlabBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> core::ops::DerefMut for SlabBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> SlabBox<T> {
    /// Moves the value out of the slab slot and releases the slot
    /// without running `T`'s destructor twice.
    pub fn into_inner(mut this: Self) -> T {
        let value = unsafe { core::ptr::read(this.ptr.as_ptr()) };
        let _ = cache_free(this.cache, this.ptr.cast());
        core::mem::forget(this);
        value
    }
}

impl<T> Drop for SlabBox<T> {
    fn drop(&mut self) {
        unsafe { core::ptr::drop_in_place(self.ptr.as_ptr()) };
        let _ = cache_free(self.cache, self.ptr.cast());
    }
}

// SlabBox<T> behaves like Box<T>: send/sync follow T.
unsafe impl<T: Send> Send for SlabBox<T> {}
unsafe impl<T: Sync> Sync for SlabBox<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn setup() {
        test_support::reset_heap();
    }

    #[test]
    fn alloc_zeroes_and_recycles_a_slab() {
        let _g = test_support::lock_world();
        setup();

        let cache = cache_create("t-basic", 32, 8, 4, None, None).unwrap();
        let objs: alloc::vec::Vec<_> = (0..4).map(|_| cache_alloc(cache).unwrap()).collect();
        let stats = cache_stats(cache).unwrap();
        assert_eq!(stats.total_objects, 4);
        assert_eq!(stats.free_objects, 0);

        for &o in &objs {
            unsafe { assert_eq!(*o.as_ptr(), 0) };
        }

        for o in objs {
            cache_free(cache, o).unwrap();
        }
        // Every object on the one slab freed: the slab itself is handed
        // back to the buddy allocator, so total_objects drops to 0.
        let stats = cache_stats(cache).unwrap();
        assert_eq!(stats.total_objects, 0);
        assert_eq!(stats.free_objects, 0);
    }

    #[test]
    fn cache_destroy_frees_every_slab_and_frees_the_registry_slot() {
        let _g = test_support::lock_world();
        setup();

        let cache = cache_create("t-destroy", 32, 8, 4, None, None).unwrap();
        // Two slabs: four objects fill the first, a fifth spills into a second.
        for _ in 0..5 {
            cache_alloc(cache).unwrap();
        }
        assert_eq!(cache_stats(cache).unwrap().total_objects, 8);
        let before_free_frames = buddy::stats().free_frames;

        cache_destroy(cache).unwrap();

        assert!(buddy::stats().free_frames > before_free_frames);
        assert!(cache_stats(cache).is_none());
        // Name is free again for a new, unrelated cache.
        let recreated = cache_create("t-destroy", 16, 8, 4, None, None).unwrap();
        assert_eq!(cache_stats(recreated).unwrap().total_objects, 0);
    }

    #[test]
    fn cache_create_is_idempotent_by_name() {
        let _g = test_support::lock_world();
        setup();

        let a = cache_create("t-idempotent", 16, 8, 4, None, None).unwrap();
        let b = cache_create("t-idempotent", 16, 8, 4, None, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_free_rejects_foreign_pointer() {
        let _g = test_support::lock_world();
        setup();

        let a = cache_create("t-foreign-a", 16, 8, 4, None, None).unwrap();
        let b = cache_create("t-foreign-b", 16, 8, 4, None, None).unwrap();

        let obj = cache_alloc(a).unwrap();
        assert_eq!(cache_free(b, obj), Err(SlabError::ForeignPointer));
        cache_free(a, obj).unwrap();
    }

    #[test]
    fn ctor_and_dtor_run_once_per_object() {
        let _g = test_support::lock_world();
        setup();

        static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
        static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(_obj: NonNull<u8>) {
            CTOR_CALLS.fetch_add(1, Ordering::Relaxed);
        }
        fn dtor(_obj: NonNull<u8>) {
            DTOR_CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let cache = cache_create("t-ctor-dtor", 16, 8, 4, Some(ctor), Some(dtor)).unwrap();
        let obj = cache_alloc(cache).unwrap();
        assert_eq!(CTOR_CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(DTOR_CALLS.load(Ordering::Relaxed), 0);

        cache_free(cache, obj).unwrap();
        assert_eq!(DTOR_CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn slab_box_runs_drop_and_releases_slot() {
        let _g = test_support::lock_world();
        setup();

        struct Counted;
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let cache = cache_create("t-slabbox", core::mem::size_of::<Counted>(), 8, 4, None, None).unwrap();
        {
            let _boxed = SlabBox::new(cache, Counted).unwrap();
            assert_eq!(DROPS.load(Ordering::Relaxed), 0);
        }
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }
}
