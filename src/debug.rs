//! Debug-only invariant checking and diagnostics. Nothing here is on the
//! hot allocate/free path in a release build; it exists to catch
//! corruption in tests rather than to back any guarantee at runtime.

use crate::config::{self, max_blocks, NBINS, NSIZES};
use crate::heap::{Heap, Registry};
use crate::superblock::{Superblock, SbTag};

/// Walks one subheap's bins and confirms every superblock's reported
/// `used`/fullness-bin placement is internally consistent, and that the
/// subheap's own `allocated`/`used` accounting matches the sum over every
/// superblock it actually owns (spec invariant #2). Panics on the first
/// inconsistency found.
#[cfg(debug_assertions)]
pub fn check_subheap(heap: &Heap, sc: usize) {
    let guard = heap.subheaps[sc].lock.lock();
    let mblocks = max_blocks(sc);
    let mut allocated_sum = 0usize;
    let mut used_sum = 0usize;

    for bin_idx in 0..NBINS {
        let mut cur = guard.bins[bin_idx];
        while !cur.is_null() {
            unsafe {
                assert!(matches!((*cur).tag, SbTag::Normal(n) if n as usize == sc));
                assert!((*cur).used < mblocks, "a full superblock sits in a partial bin");
                let free = Superblock::count_free(cur);
                assert_eq!(
                    free + (*cur).used,
                    mblocks,
                    "free count and used count don't add up to this size class's capacity"
                );
                Superblock::check_freelist(cur, sc);
                let expected_bin = crate::superblock::appropriate_bin(cur);
                assert_eq!(
                    expected_bin, bin_idx,
                    "superblock sits in bin {} but its occupancy implies bin {}",
                    bin_idx, expected_bin
                );
                allocated_sum += mblocks;
                used_sum += (*cur).used;
                cur = (*cur).next;
            }
        }
    }

    let mut cur = guard.full_bin;
    while !cur.is_null() {
        unsafe {
            assert_eq!((*cur).used, mblocks, "superblock in full_bin is not actually full");
            Superblock::check_freelist(cur, sc);
            allocated_sum += mblocks;
            used_sum += (*cur).used;
            cur = (*cur).next;
        }
    }

    assert_eq!(
        guard.allocated, allocated_sum,
        "subheap allocated ({}) disagrees with the sum of owned superblocks' capacity ({})",
        guard.allocated, allocated_sum
    );
    assert_eq!(
        guard.used, used_sum,
        "subheap used ({}) disagrees with the sum of owned superblocks' used counts ({})",
        guard.used, used_sum
    );
}

/// Checks every size class of one heap.
#[cfg(debug_assertions)]
pub fn check_heap(heap: &Heap) {
    for sc in 0..NSIZES {
        check_subheap(heap, sc);
    }
    let empties = heap.empties.lock();
    let mut cur = empties.head;
    let mut n = 0;
    while !cur.is_null() {
        unsafe {
            assert_eq!((*cur).tag, SbTag::Empty);
            assert_eq!((*cur).used, 0);
            cur = (*cur).next;
        }
        n += 1;
    }
    assert_eq!(n, empties.count, "empties pool's head count disagrees with the walked list length");
}

/// Checks the global heap and every CPU heap in a registry.
#[cfg(debug_assertions)]
pub fn check_heaps(reg: &Registry) {
    check_heap(reg.global());
    for cpu in 0..reg.num_cpus {
        check_heap(reg.cpu_heap(cpu));
    }
}

/// Logs one line of occupancy stats per size class, for every heap in the
/// registry (global heap first, then each CPU heap in order).
pub fn print_stats(reg: &Registry) {
    print_heap_stats("global", reg.global());
    for cpu in 0..reg.num_cpus {
        print_heap_stats(&format!("cpu{}", cpu), reg.cpu_heap(cpu));
    }
}

fn print_heap_stats(label: &str, heap: &Heap) {
    for sc in 0..config::NSIZES {
        let guard = heap.subheaps[sc].lock.lock();
        log::info!(
            "{} sc={} size={} allocated={} used={}",
            label,
            sc,
            config::SIZES[sc],
            guard.allocated,
            guard.used,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::allocate::allocate_small_in;
    use crate::free::free_small_in;

    #[test]
    fn print_stats_does_not_panic() {
        let _ = env_logger::try_init();
        let reg = Registry::init().unwrap();
        let p = allocate_small_in(&reg, 16);
        print_stats(&reg);
        free_small_in(&reg, p);
    }

    #[test]
    fn check_heaps_passes_after_mixed_traffic() {
        let reg = Registry::init().unwrap();
        crate::cpu::set_test_cpu(Some(0));
        let mut ptrs = Vec::new();
        for sz in [4usize, 20, 60, 300] {
            for _ in 0..5 {
                ptrs.push(allocate_small_in(&reg, sz));
            }
        }
        check_heaps(&reg);
        for p in ptrs.drain(..2) {
            free_small_in(&reg, p);
        }
        check_heaps(&reg);
        for p in ptrs {
            free_small_in(&reg, p);
        }
        check_heaps(&reg);
        crate::cpu::set_test_cpu(None);
    }
}
