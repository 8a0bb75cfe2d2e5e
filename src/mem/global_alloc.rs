//! The process-wide `#[global_allocator]`.
//!
//! Every `KVec`/`KBox`/`KRc`/`KHashMap`/`KString` built with the default
//! `Global` allocator ultimately bottoms out here. This is the one piece
//! of genuinely global state in the whole crate: `alloc`'s own design
//! requires exactly one `#[global_allocator]` per binary, the same way
//! the teacher's `kernel::mem::allocator` installs a single `Allocator`
//! unit struct over its slab allocator. The guarded-cell shape (an
//! `AtomicBool` spin flag protecting an `UnsafeCell`) mirrors
//! `eonix_log::Console` rather than inventing a new singleton idiom.
//!
//! `install` must run once, during `kernel_init`, after the page
//! allocator and a page table are both available; every `alloc`/`dealloc`
//! before that point — there should be none — aborts.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::mem::address::VAddr;
use crate::mem::heap::KernelHeap;
use crate::mem::page_alloc::PageAllocator;
use crate::mem::page_table::PageMap;

struct Backing {
    page_alloc: PageAllocator,
    page_map: PageMap,
    heap: KernelHeap,
}

struct GuardedCell {
    locked: AtomicBool,
    inner: UnsafeCell<Option<Backing>>,
}

// SAFETY: access to `inner` is serialized by `locked`; this kernel never
// runs `alloc`/`dealloc` concurrently from more than one logical thread
// of control (§5).
unsafe impl Sync for GuardedCell {}

impl GuardedCell {
    fn with<R>(&self, f: impl FnOnce(&mut Option<Backing>) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let result = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        result
    }
}

static BACKING: GuardedCell = GuardedCell {
    locked: AtomicBool::new(false),
    inner: UnsafeCell::new(None),
};

/// Installs the kernel heap as the backing for every `Global`-allocator
/// container in the crate.
///
/// # Safety
/// Must run exactly once, after `page_map` already maps the heap window
/// `heap` was initialized against, and before any `Global`-backed
/// container is touched.
pub unsafe fn install(page_alloc: PageAllocator, page_map: PageMap, heap: KernelHeap) {
    BACKING.with(|slot| {
        *slot = Some(Backing {
            page_alloc,
            page_map,
            heap,
        });
    });
}

/// Lets a caller reach into the installed backing to borrow the raw
/// `PageAllocator` for frame allocation that must be physically contiguous
/// and DMA-capable (e.g. an AHCI port's command/FIS/DMA buffers) — the
/// heap's segregated free lists don't promise either. Panics if called
/// before `install`.
pub fn with_page_alloc<R>(f: impl FnOnce(&mut PageAllocator) -> R) -> R {
    BACKING.with(|slot| {
        let backing = slot.as_mut().expect("global allocator not installed yet");
        f(&mut backing.page_alloc)
    })
}

pub struct KernelGlobalAlloc;

unsafe impl GlobalAlloc for KernelGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        BACKING.with(|slot| {
            let Some(backing) = slot.as_mut() else {
                return core::ptr::null_mut();
            };
            let size = layout.size().max(layout.align());
            match backing
                .heap
                .allocate(&mut backing.page_alloc, &mut backing.page_map, size)
            {
                Ok(vaddr) => vaddr.get() as *mut u8,
                Err(_) => core::ptr::null_mut(),
            }
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        BACKING.with(|slot| {
            if let Some(backing) = slot.as_mut() {
                backing.heap.free(&mut backing.page_alloc, VAddr::new(ptr as u64));
            }
        });
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        BACKING.with(|slot| {
            let Some(backing) = slot.as_mut() else {
                return core::ptr::null_mut();
            };
            match backing.heap.reallocate(
                &mut backing.page_alloc,
                &mut backing.page_map,
                VAddr::new(ptr as u64),
                new_size,
            ) {
                Ok(vaddr) => vaddr.get() as *mut u8,
                Err(_) => core::ptr::null_mut(),
            }
        })
    }
}

#[global_allocator]
static ALLOCATOR: KernelGlobalAlloc = KernelGlobalAlloc;
