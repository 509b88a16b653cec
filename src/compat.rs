//! A malloc-family compatibility layer (`calloc`, `realloc`) and a
//! `GlobalAlloc` adapter, both built on the crate's own `allocate`/`free`
//! entry points.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::mem::size_of;

use crate::config::{self, SB_SIZE, SIZES};
use crate::superblock::{SbTag, Superblock};

/// Recovers the usable size of a previously-allocated, non-null pointer by
/// inspecting its owning superblock's header — the same `align_down(ptr,
/// SB_SIZE)` trick `free` uses to find metadata, since this allocator keeps
/// no separate per-pointer size table.
unsafe fn usable_size(ptr: *mut u8) -> usize {
    let sb = config::sb_align(ptr as usize) as *mut Superblock;
    match (*sb).tag {
        SbTag::Normal(sc) => SIZES[sc as usize],
        SbTag::Large => (*sb).used * SB_SIZE - size_of::<Superblock>(),
        SbTag::Empty => unreachable!("realloc called on a pointer into an empty superblock"),
    }
}

/// Zero-initialized allocation of `nmemb * size` bytes, checked for
/// overflow the way libc's `calloc` is required to be.
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return core::ptr::null_mut(),
    };
    let p = crate::allocate(total);
    if !p.is_null() {
        unsafe { core::ptr::write_bytes(p, 0, total) };
    }
    p
}

/// Resizes an allocation, copying the overlap and freeing the old pointer
/// on success. Unlike a naive port, `ptr`'s old size is not a caller-supplied
/// parameter: it's recovered from the owning superblock's own header, the
/// same way every other pointer-only operation in this crate (`free`) does
/// — matching the ordinary libc `realloc(ptr, size)` signature rather than
/// requiring the caller to remember what it originally asked for.
pub fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return crate::allocate(new_size);
    }
    if new_size == 0 {
        crate::free(ptr);
        return core::ptr::null_mut();
    }
    let old_size = unsafe { usable_size(ptr) };
    let new_ptr = crate::allocate(new_size);
    if new_ptr.is_null() {
        return core::ptr::null_mut();
    }
    let copy_len = cmp::min(old_size, new_size);
    unsafe {
        core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
    }
    crate::free(ptr);
    new_ptr
}

/// A `GlobalAlloc` adapter. `Layout::align()` is honored only up to the
/// size class's own natural alignment (8 bytes for every size class here,
/// `SB_SIZE` for large allocations); callers asking for a stricter
/// alignment get whatever the underlying size class happens to provide,
/// which is sufficient for every alignment this crate's size classes
/// actually produce but is not a general-purpose guarantee.
pub struct HoardAlloc;

unsafe impl GlobalAlloc for HoardAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        crate::allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        crate::free(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        calloc(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        realloc(ptr, new_size)
    }
}
