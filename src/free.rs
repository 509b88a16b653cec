//! The free path: migration-tolerant lock acquisition, move-to-front
//! rebinning, pseudo-reclamation, and the reclamation donation trigger.

use core::sync::atomic::{compiler_fence, Ordering};

use crate::config::{self, max_blocks, K_THRESH, NBINS};
use crate::heap::{registry, Heap, Registry};
use crate::superblock::{self, SbTag, Superblock};

/// Frees a pointer previously returned by `allocate_small` on the
/// process-wide registry. `ptr` must not be null (route that case out in
/// `crate::free_any`) and must not point at a large allocation.
pub fn free_small(ptr: *mut u8) {
    free_small_in(registry(), ptr)
}

/// Frees a small (non-large) allocation against a specific registry. Split
/// out for the same testability reason as `allocate::allocate_small_in`.
pub fn free_small_in(reg: &Registry, ptr: *mut u8) {
    let sb = config::sb_align(ptr as usize) as *mut Superblock;
    let sc = match unsafe { (*sb).tag } {
        SbTag::Normal(sc) => sc as usize,
        other => panic!("free_small_in called on a non-normal superblock ({:?})", other),
    };

    // `heap` is the heap whose subheap lock we now hold, and `sb` cannot
    // migrate to a different heap until we release it.
    let (heap, mut guard) = lock_owning_heap(reg, sb, sc);

    unsafe {
        Superblock::push_block(sb, ptr);
        guard.used -= 1;

        if (*sb).used > 0 {
            // Always re-push, even into the same bin: deliberate
            // move-to-front for locality on the expected re-allocation.
            let target = superblock::appropriate_bin(sb);
            superblock::remove(sb);
            superblock::push(&mut guard.bins[target], sb);
        } else {
            recycle_to_empty(reg, heap, &mut guard, sb, sc);
        }
    }

    let is_global = reg.is_global(heap);
    if is_global {
        return;
    }

    maybe_donate(reg, heap, &mut guard, sc);
}

/// Resolves and locks the subheap whose bin currently owns `sb`, tolerating
/// concurrent migration of `sb` between heaps via a validate-and-retry loop.
///
/// Must not itself hold any other lock: this read of `sb.bin` is advisory
/// and is always re-validated under the lock it tentatively picks. Returns
/// the heap together with its now-held subheap lock, so the caller's
/// critical section starts exactly where this one leaves off — there is no
/// window where `sb` is left unlocked between validation and use.
fn lock_owning_heap<'a>(
    reg: &'a Registry,
    sb: *mut Superblock,
    sc: usize,
) -> (&'a Heap, parking_lot::MutexGuard<'a, crate::heap::SubheapInner>) {
    loop {
        let bin = unsafe { (*sb).bin };
        if bin.is_null() {
            // Superblock is mid-transition between lists; nobody else can
            // observe this state stably either, so just retry.
            compiler_fence(Ordering::SeqCst);
            continue;
        }
        let heap = reg.heap_of(bin);
        let guard = heap.subheaps[sc].lock.lock();
        let still = unsafe { (*sb).bin };
        if still == bin && core::ptr::eq(reg.heap_of(bin), heap) {
            return (heap, guard);
        }
        drop(guard);
        compiler_fence(Ordering::SeqCst);
    }
}

/// Handles a superblock dropping to zero used blocks: tag it `Empty`,
/// account for it leaving the subheap, and push it into an empties pool —
/// the CPU heap's own, unless that pool is already at `K_THRESH`, in which
/// case it goes straight to the global heap's (pseudo-reclamation).
unsafe fn recycle_to_empty(
    reg: &Registry,
    heap: &Heap,
    guard: &mut crate::heap::SubheapInner,
    sb: *mut Superblock,
    sc: usize,
) {
    Superblock::clear_freelist(sb);
    (*sb).tag = SbTag::Empty;
    guard.allocated -= max_blocks(sc);
    superblock::remove(sb);

    if reg.is_global(heap) {
        let mut e = heap.empties.lock();
        superblock::push(&mut e.head, sb);
        e.count += 1;
        return;
    }

    // Hold this CPU heap's empties lock across the whole check-then-act
    // decision, rather than reading the count unlocked and deciding after:
    // an unlocked read can transiently push a CPU heap past `K_THRESH`
    // under concurrent frees on different size classes of the same heap,
    // and the bound on empties is meant to be exact, not probabilistic.
    let mut e = heap.empties.lock();
    if e.count >= K_THRESH {
        drop(e);
        let mut ge = reg.global().empties.lock();
        superblock::push(&mut ge.head, sb);
        ge.count += 1;
        log::trace!("free: pseudo-reclaimed an empty superblock to the global heap");
    } else {
        superblock::push(&mut e.head, sb);
        e.count += 1;
    }
}

/// After a free, checks whether this CPU subheap is both over-provisioned
/// in absolute terms and under-utilized in ratio, and if so donates its
/// least-full superblock to the global heap.
fn maybe_donate(
    reg: &Registry,
    heap: &Heap,
    guard: &mut crate::heap::SubheapInner,
    sc: usize,
) {
    let mblocks = max_blocks(sc);
    let over_provisioned = guard.used < guard.allocated.saturating_sub(K_THRESH * mblocks);
    let under_utilized = NBINS * guard.used < guard.allocated;

    if !(over_provisioned && under_utilized) {
        return;
    }

    let sb = unsafe { superblock::pop(&mut guard.bins[0]) };
    debug_assert!(
        !sb.is_null(),
        "reclamation trigger fired but bins[0] was empty"
    );
    if sb.is_null() {
        return;
    }
    guard.allocated -= mblocks;
    let used = unsafe { (*sb).used };
    guard.used -= used;

    let global = reg.global();
    let mut g = global.subheaps[sc].lock.lock();
    unsafe { superblock::push(&mut g.bins[0], sb) };
    g.allocated += mblocks;
    g.used += used;
    log::debug!(
        "free: donated a superblock from a CPU heap to the global heap for size class {}",
        sc
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::allocate::allocate_small_in;

    #[test]
    fn free_null_is_noop() {
        crate::free_any(core::ptr::null_mut());
    }

    #[test]
    fn allocate_free_allocate_reuses_slot_with_high_probability() {
        let _ = env_logger::try_init();
        crate::cpu::set_test_cpu(Some(0));
        let reg = Registry::init().unwrap();
        let p1 = allocate_small_in(&reg, 8);
        unsafe {
            core::ptr::write_bytes(p1, 0xAB, 8);
        }
        free_small_in(&reg, p1);
        let p2 = allocate_small_in(&reg, 8);
        assert_eq!(p1, p2, "single-threaded reuse should hit the same slot");
        crate::cpu::set_test_cpu(None);
    }

    #[test]
    fn pseudo_reclamation_caps_empties_per_cpu_heap() {
        let _ = env_logger::try_init();
        crate::cpu::set_test_cpu(Some(0));
        let reg = Registry::init().unwrap();
        let sc = 2; // size class for 32 bytes
        let block_size = config::SIZES[sc];

        // Drive K_THRESH + 2 superblocks of this size class to empty, one
        // at a time: fully allocate one superblock, then free it, repeated.
        for _ in 0..(K_THRESH + 2) {
            let n = max_blocks(sc);
            let mut ptrs = Vec::with_capacity(n);
            for _ in 0..n {
                ptrs.push(allocate_small_in(&reg, block_size));
            }
            for p in ptrs {
                free_small_in(&reg, p);
            }
        }

        let cpu_heap = reg.cpu_heap(0);
        let cpu_empties = cpu_heap.empties.lock().count;
        assert!(cpu_empties <= K_THRESH, "cpu empties {} exceeds K_THRESH", cpu_empties);

        let global_empties = reg.global().empties.lock().count;
        assert!(global_empties >= 2, "excess empties should have spilled to the global heap");
        crate::cpu::set_test_cpu(None);
    }

    #[test]
    fn reclamation_trigger_donates_one_superblock() {
        let _ = env_logger::try_init();
        crate::cpu::set_test_cpu(Some(0));
        let reg = Registry::init().unwrap();
        let sc = 2;
        let block_size = config::SIZES[sc];
        let n = max_blocks(sc);

        // Fill K_THRESH + 2 superblocks entirely.
        let mut superblocks: Vec<Vec<*mut u8>> = Vec::new();
        for _ in 0..(K_THRESH + 2) {
            let mut ptrs = Vec::with_capacity(n);
            for _ in 0..n {
                ptrs.push(allocate_small_in(&reg, block_size));
            }
            superblocks.push(ptrs);
        }

        let cpu_heap = reg.cpu_heap(0);
        let allocated_before = cpu_heap.subheaps[sc].lock.lock().allocated;

        // Free all but one block of each superblock.
        for ptrs in &mut superblocks {
            while ptrs.len() > 1 {
                free_small_in(&reg, ptrs.pop().unwrap());
            }
        }

        let allocated_after = cpu_heap.subheaps[sc].lock.lock().allocated;
        assert_eq!(
            allocated_before - allocated_after,
            max_blocks(sc),
            "exactly one superblock's worth of capacity should have migrated to the global heap"
        );

        // Clean up remaining single blocks.
        for ptrs in superblocks {
            for p in ptrs {
                free_small_in(&reg, p);
            }
        }
        crate::cpu::set_test_cpu(None);
    }
}
