//! The allocation path: fullness-bin scanning within a CPU's subheap, and
//! the cold-path acquisition cascade when that subheap has no partial
//! superblock to offer.

use core::ptr;

use crate::config::{self, max_blocks, NBINS, SB_SIZE};
use crate::cpu;
use crate::heap::{registry, Heap, Registry};
use crate::superblock::{self, SbTag, Superblock};

/// Allocates `sz` bytes from the process-wide registry's current-CPU heap.
pub fn allocate_small(sz: usize) -> *mut u8 {
    allocate_small_in(registry(), sz)
}

/// Allocates `sz` bytes from a specific registry, classified to the
/// smallest size class that fits, and returns a pointer aligned to
/// `sizes[size_class(sz)]`.
///
/// Caller must already have routed `sz > sizes[NSIZES - 1]` to
/// `crate::large`. Split out from `allocate_small` so tests can exercise
/// the allocation path against an isolated `Registry` instead of the
/// process-wide singleton — parallel `#[test]` threads would otherwise
/// contend for the same CPU heaps and make assertions about which
/// superblock served a request flaky.
pub fn allocate_small_in(reg: &Registry, sz: usize) -> *mut u8 {
    let sc = config::size_class(sz);
    let cpu = cpu::current_cpu(reg.num_cpus.max(1));
    let heap = reg.cpu_heap(cpu);

    let mut guard = heap.subheaps[sc].lock.lock();

    // Scan fullness bins fullest-first under a single held lock, re-scanning
    // once more under the same lock if the chosen victim turns out to
    // already be full (can't happen here since nothing else holds this lock
    // between the scan and the pop, but written defensively in case a
    // future refactor reintroduces a lock-drop).
    let mut sb = scan_bins(&guard.bins);

    if sb.is_null() {
        drop(guard);
        // Cold path: acquire a superblock via the cascade, which must not
        // hold this subheap's lock. Null means the arena itself is
        // exhausted; propagate that straight out as a null allocation
        // rather than panicking.
        let acquired = acquire_superblock(reg, sc);
        if acquired.is_null() {
            return ptr::null_mut();
        }
        guard = heap.subheaps[sc].lock.lock();
        unsafe {
            debug_assert!((*acquired).bin.is_null());
            superblock::push(&mut guard.bins[0], acquired);
        }
        guard.allocated += max_blocks(sc);
        guard.used += unsafe { (*acquired).used };
        sb = acquired;
    } else if unsafe { (*sb).used >= max_blocks(sc) } {
        // Defensive re-scan (see comment above).
        sb = scan_bins(&guard.bins);
        debug_assert!(!sb.is_null());
    }

    let block = unsafe {
        let b = Superblock::pop_block(sb);
        guard.used += 1;
        rebin(&mut guard, sb, sc);
        b
    };

    drop(guard);
    block
}

/// Scans fullness bins from fullest (`NBINS - 1`) to emptiest (`0`),
/// returning the head of the first non-empty one.
fn scan_bins(bins: &[*mut Superblock; NBINS]) -> *mut Superblock {
    for b in (0..NBINS).rev() {
        if !bins[b].is_null() {
            return bins[b];
        }
    }
    ptr::null_mut()
}

/// Recomputes `sb`'s fullness bin after an allocation and moves it if
/// necessary, including the full-bin promotion.
unsafe fn rebin(guard: &mut crate::heap::SubheapInner, sb: *mut Superblock, sc: usize) {
    if (*sb).used == max_blocks(sc) {
        superblock::remove(sb);
        superblock::push(&mut guard.full_bin, sb);
    } else {
        let target = superblock::appropriate_bin(sb);
        if (*sb).bin != &mut guard.bins[target] as *mut *mut Superblock {
            superblock::remove(sb);
            superblock::push(&mut guard.bins[target], sb);
        }
        // Else: pushing to the same bin is skipped — unlike the free path,
        // the allocation path does not move-to-front on a same-bin outcome.
    }
}

/// Cold path: obtains a detached, classified superblock for size class
/// `sc`, trying in order: this CPU's empties, the global heap's least-full
/// partials, the global heap's empties, and finally the arena. Stops at the
/// first success. Returns null only if every step fails, which can only
/// happen at the arena step (arena exhaustion) — callers must propagate a
/// null result straight out as a failed allocation, not panic.
fn acquire_superblock(reg: &Registry, sc: usize) -> *mut Superblock {
    let cpu = cpu::current_cpu(reg.num_cpus.max(1));
    let heap = reg.cpu_heap(cpu);

    // 1. Local empties.
    if let Some(sb) = pop_empties(heap) {
        unsafe { Superblock::classify(sb, sc) };
        log::trace!("allocate: reused local empty superblock for size class {}", sc);
        return sb;
    }

    // 2. Global partials (least-full bin only).
    {
        let global = reg.global();
        let mut g = global.subheaps[sc].lock.lock();
        let sb = unsafe { superblock::pop(&mut g.bins[0]) };
        if !sb.is_null() {
            let mblocks = max_blocks(sc);
            g.allocated -= mblocks;
            g.used -= unsafe { (*sb).used };
            log::trace!(
                "allocate: pulled a partial superblock from the global heap for size class {}",
                sc
            );
            return sb;
        }
    }

    // 3. Global empties.
    if let Some(sb) = pop_empties(reg.global()) {
        unsafe { Superblock::classify(sb, sc) };
        log::trace!("allocate: reused a global empty superblock for size class {}", sc);
        return sb;
    }

    // 4. Arena. Exhaustion here is a genuine allocation failure, not a bug:
    // return null rather than asserting, matching the large-object path
    // (`large::allocate_large_in`) and the crate's documented null-on-
    // exhaustion contract.
    let region = reg.arena.extend(SB_SIZE);
    if region.is_null() {
        log::debug!("allocate: arena exhausted while acquiring a superblock for size class {}", sc);
        return ptr::null_mut();
    }
    let sb = unsafe { Superblock::format_fresh(region) };
    unsafe { Superblock::classify(sb, sc) };
    log::debug!(
        "allocate: extended the arena for a fresh superblock (size class {})",
        sc
    );
    sb
}

fn pop_empties(heap: &Heap) -> Option<*mut Superblock> {
    let mut e = heap.empties.lock();
    let sb = unsafe { superblock::pop(&mut e.head) };
    if sb.is_null() {
        None
    } else {
        e.count -= 1;
        debug_assert_eq!(unsafe { (*sb).tag }, SbTag::Empty);
        Some(sb)
    }
}
