//! Subheaps, heaps, and the process-wide registry tying them to one arena.

use core::mem::size_of;
use core::ptr;

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::config::NSIZES;
use crate::cpu;
use crate::error::InitError;
use crate::superblock::Superblock;

/// All mutable state of one subheap, behind its own lock. Lives inline
/// inside `Heap` (no indirection), so its address is stable for the
/// process lifetime and can be recovered from a `Superblock::bin` pointer
/// by arithmetic (`heap_index_of`).
pub struct SubheapInner {
    pub bins: [*mut Superblock; crate::config::NBINS],
    pub full_bin: *mut Superblock,
    /// Sum of `max_blocks[sc]` over every superblock this subheap owns.
    pub allocated: usize,
    /// Sum of `used` over every superblock this subheap owns.
    pub used: usize,
}

pub struct Subheap {
    pub lock: Mutex<SubheapInner>,
}

impl Subheap {
    fn new() -> Self {
        Subheap {
            lock: Mutex::new(SubheapInner {
                bins: [ptr::null_mut(); crate::config::NBINS],
                full_bin: ptr::null_mut(),
                allocated: 0,
                used: 0,
            }),
        }
    }
}

pub struct EmptiesInner {
    pub head: *mut Superblock,
    pub count: usize,
}

/// One heap: `NSIZES` subheaps plus an empties pool. Cache-line aligned so
/// neighboring heaps in the contiguous array don't false-share locks or
/// counters.
#[repr(align(64))]
pub struct Heap {
    pub subheaps: [Subheap; NSIZES],
    pub empties: Mutex<EmptiesInner>,
}

impl Heap {
    fn new() -> Self {
        Heap {
            subheaps: array_of(Subheap::new),
            empties: Mutex::new(EmptiesInner {
                head: ptr::null_mut(),
                count: 0,
            }),
        }
    }
}

fn array_of<T, const N: usize>(mut f: impl FnMut() -> T) -> [T; N] {
    // MaybeUninit array construction, via `transmute_copy` since plain
    // `transmute` can't see through a const-generic array length.
    let mut data: [core::mem::MaybeUninit<T>; N] =
        unsafe { core::mem::MaybeUninit::uninit().assume_init() };
    for elem in &mut data {
        *elem = core::mem::MaybeUninit::new(f());
    }
    unsafe { core::mem::transmute_copy::<[core::mem::MaybeUninit<T>; N], [T; N]>(&data) }
}

/// Process-wide state: one arena, and a contiguous `num_cpus + 1` element
/// heap array with the global heap at index 0 and CPU heaps immediately
/// following it. The heap array itself is carved out of the arena (`struct
/// heap *global_heap = SBRK(sizeof(struct heap) * (num_cpus + 1))` in
/// `a2alloc.c`), not allocated through the ambient Rust allocator — this
/// crate's own `compat::HoardAlloc` can be installed as the process's
/// `#[global_allocator]`, so building the heap array through `Box`/`Vec`
/// would have the first allocation anywhere in the process reenter this
/// same lazy-init path before it has finished running.
pub struct Registry {
    pub arena: Arena,
    heaps: *mut Heap,
    pub num_cpus: usize,
}

impl Registry {
    /// Builds an independent registry (its own arena, its own heap array).
    /// `pub(crate)` rather than private: every core operation has an
    /// `_in(reg, ...)` variant that tests exercise against a freshly built
    /// registry instead of the process-wide singleton, so parallel test
    /// threads never contend over the same CPU heaps.
    pub(crate) fn init() -> Result<Registry, InitError> {
        let num_cpus = cpu::num_processors();
        let arena = Arena::init()?;
        let num_heaps = num_cpus + 1;
        let heap_bytes = num_heaps * size_of::<Heap>();
        let region = arena.extend(crate::config::sb_align_up(heap_bytes));
        if region.is_null() {
            return Err(InitError::HeapArrayReservationFailed);
        }
        let heaps = region as *mut Heap;
        // The arena hands back fresh, uncommitted pages; there's no prior
        // value at these slots to drop, so a plain `ptr::write` per heap is
        // the in-place construction this array needs.
        for i in 0..num_heaps {
            unsafe { ptr::write(heaps.add(i), Heap::new()) };
        }
        Ok(Registry {
            arena,
            heaps,
            num_cpus,
        })
    }

    #[inline]
    fn heaps(&self) -> &[Heap] {
        unsafe { core::slice::from_raw_parts(self.heaps, self.num_cpus + 1) }
    }

    #[inline]
    pub fn global(&self) -> &Heap {
        &self.heaps()[0]
    }

    #[inline]
    pub fn cpu_heap(&self, cpu: usize) -> &Heap {
        &self.heaps()[1 + cpu]
    }

    #[inline]
    pub fn is_global(&self, heap: &Heap) -> bool {
        ptr::eq(heap, self.global())
    }

    /// Recovers which heap in the contiguous array contains a given bin
    /// slot address, by pointer-arithmetic division.
    pub fn heap_of(&self, bin: *mut *mut Superblock) -> &Heap {
        let base = self.heaps as usize;
        let addr = bin as usize;
        debug_assert!(addr >= base);
        let idx = (addr - base) / size_of::<Heap>();
        debug_assert!(idx < self.num_cpus + 1);
        &self.heaps()[idx]
    }
}

// SAFETY: every field is internally synchronized (Mutex) or read-only after
// `init` (arena's own internal mutex handles its mutability); `heaps` points
// into the arena's own reservation, which outlives every `&Heap` handed out
// (the arena is never shrunk or unmapped until `Registry` itself is dropped).
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

static REGISTRY: once_cell_shim::OnceCell<Registry> = once_cell_shim::OnceCell::new();

/// One-shot initialization. Idempotent: a second call is a no-op returning
/// `Ok(())` rather than re-initializing, since re-running it would leak the
/// first arena's virtual memory reservation.
pub fn init() -> Result<(), InitError> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::init()?;
    crate::config::assert_size_classes_sane();
    let _ = REGISTRY.set(registry);
    Ok(())
}

/// Returns the process-wide registry, initializing it with default
/// settings on first use if `init()` hasn't been called yet.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::init().expect("superhoard: failed to initialize arena"))
}

/// A minimal single-slot `OnceCell` for a one-shot lazily-initialized
/// global, built directly on `parking_lot` rather than pulling in another
/// crate for a handful of lines.
mod once_cell_shim {
    use parking_lot::{Once, OnceState};
    use std::cell::UnsafeCell;
    use std::mem::MaybeUninit;

    pub struct OnceCell<T> {
        once: Once,
        value: UnsafeCell<MaybeUninit<T>>,
    }

    unsafe impl<T: Sync + Send> Sync for OnceCell<T> {}

    impl<T> OnceCell<T> {
        pub const fn new() -> Self {
            OnceCell {
                once: Once::new(),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }
        }

        pub fn get(&self) -> Option<&T> {
            if self.once.state() == OnceState::Done {
                Some(unsafe { (*self.value.get()).assume_init_ref() })
            } else {
                None
            }
        }

        pub fn set(&self, val: T) -> Result<(), T> {
            let mut slot = Some(val);
            self.once.call_once(|| unsafe {
                (*self.value.get()).write(slot.take().unwrap());
            });
            match slot {
                Some(v) => Err(v),
                None => Ok(()),
            }
        }

        pub fn get_or_init(&self, f: impl FnOnce() -> T) -> &T {
            self.once.call_once(|| unsafe {
                (*self.value.get()).write(f());
            });
            unsafe { (*self.value.get()).assume_init_ref() }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_of_recovers_global_and_cpu_heaps() {
        let reg = Registry::init().unwrap();
        {
            let mut guard = reg.global().subheaps[0].lock.lock();
            let bin_ptr: *mut *mut Superblock = &mut guard.bins[0];
            drop(guard);
            assert!(reg.is_global(reg.heap_of(bin_ptr)));
        }
        if reg.num_cpus > 0 {
            let mut guard = reg.cpu_heap(0).subheaps[0].lock.lock();
            let bin_ptr: *mut *mut Superblock = &mut guard.full_bin;
            drop(guard);
            assert!(ptr::eq(reg.heap_of(bin_ptr), reg.cpu_heap(0)));
        }
    }
}
