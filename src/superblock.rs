//! Superblock header, free-list threading, and the intrusive doubly-linked
//! list primitives shared by fullness bins and empties pools.

use core::ptr;

use crate::config::{self, max_blocks, NSIZES, SIZES};

/// What a superblock is currently carrying: a closed enum in place of
/// sentinel size-class integers for the empty/large states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbTag {
    /// Classified to a size class; a member of exactly one bin.
    Normal(u8),
    /// Unclassified, empty, a member of some heap's empties pool.
    Empty,
    /// First superblock of a multi-superblock large allocation.
    Large,
}

impl SbTag {
    #[inline]
    pub fn size_class(self) -> Option<usize> {
        match self {
            SbTag::Normal(sc) => Some(sc as usize),
            _ => None,
        }
    }
}

/// A singly-linked free-list node, overlaid on an otherwise-unused block.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Lives at the front of every `SB_SIZE`-byte, `SB_SIZE`-aligned region cut
/// from the arena. `align_down(ptr, SB_SIZE)` on any interior pointer
/// reaches this header — the sole metadata-discovery mechanism.
#[repr(C)]
pub struct Superblock {
    pub tag: SbTag,
    /// Number of occupied slots (size classes) or `num_superblocks` (large).
    pub used: usize,
    /// Back-pointer to the head-of-list slot of the containing bin, or
    /// null if detached. Heap identity is recovered from this by pointer
    /// arithmetic, not by a second stored parent pointer.
    pub bin: *mut *mut Superblock,
    pub prev: *mut Superblock,
    pub next: *mut Superblock,
    freelist: *mut FreeNode,
}

impl Superblock {
    /// Formats a fresh arena region as a detached, unclassified superblock.
    pub unsafe fn format_fresh(region: *mut u8) -> *mut Superblock {
        let sb = region as *mut Superblock;
        ptr::write(
            sb,
            Superblock {
                tag: SbTag::Empty,
                used: 0,
                bin: ptr::null_mut(),
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                freelist: ptr::null_mut(),
            },
        );
        sb
    }

    /// Classifies a detached superblock (fresh or empty) to size class
    /// `sc`, rebuilding its free list over evenly-spaced slots.
    pub unsafe fn classify(sb: *mut Superblock, sc: usize) {
        debug_assert!((*sb).bin.is_null());
        (*sb).tag = SbTag::Normal(sc as u8);
        (*sb).used = 0;
        (*sb).prev = ptr::null_mut();
        (*sb).next = ptr::null_mut();

        let header = config::superblock_header_size();
        let block_size = SIZES[sc];
        let mblocks = max_blocks(sc);
        let base = (sb as usize) + header;

        let mut prev: *mut FreeNode = ptr::null_mut();
        let mut head: *mut FreeNode = ptr::null_mut();
        // Thread the free list back-to-front so the head ends up at the
        // first slot.
        for i in (0..mblocks).rev() {
            let slot = (base + i * block_size) as *mut FreeNode;
            ptr::write(slot, FreeNode { next: prev });
            prev = slot;
            head = slot;
        }
        (*sb).freelist = head;
    }

    /// Pops one block off this superblock's free list. Caller must hold the
    /// owning subheap's lock and must have already confirmed the free list
    /// is non-empty (i.e. `used < max_blocks`).
    pub unsafe fn pop_block(sb: *mut Superblock) -> *mut u8 {
        let node = (*sb).freelist;
        debug_assert!(!node.is_null());
        (*sb).freelist = (*node).next;
        (*sb).used += 1;
        node as *mut u8
    }

    /// Prepends `ptr` back onto this superblock's free list.
    pub unsafe fn push_block(sb: *mut Superblock, ptr: *mut u8) {
        let node = ptr as *mut FreeNode;
        (*node).next = (*sb).freelist;
        (*sb).freelist = node;
        (*sb).used -= 1;
    }

    /// Clears the free list entirely, as done when a superblock becomes
    /// empty and is about to be recycled.
    pub unsafe fn clear_freelist(sb: *mut Superblock) {
        (*sb).freelist = ptr::null_mut();
    }

    /// Number of distinct free-list entries, for invariant checking.
    /// Walks the list, so debug-only.
    #[cfg(debug_assertions)]
    pub unsafe fn count_free(sb: *mut Superblock) -> usize {
        let mut n = 0usize;
        let mut cur = (*sb).freelist;
        while !cur.is_null() {
            n += 1;
            cur = (*cur).next;
        }
        n
    }

    /// Walks `sb`'s free list for size class `sc` and asserts every entry is
    /// within the superblock's data region, lands exactly on a slot
    /// boundary, and is distinct from every other entry — the full content
    /// of invariant #6 ("free list ... contains exactly `max_blocks[sc] -
    /// used` distinct addresses, all within that superblock, all
    /// slot-aligned"), not just the count. Debug-only: walks the whole list
    /// and hashes every address.
    #[cfg(debug_assertions)]
    pub unsafe fn check_freelist(sb: *mut Superblock, sc: usize) {
        use std::collections::HashSet;

        let header = config::superblock_header_size();
        let block_size = SIZES[sc];
        let base = sb as usize + header;
        let end = sb as usize + config::SB_SIZE;

        let mut seen = HashSet::new();
        let mut cur = (*sb).freelist;
        while !cur.is_null() {
            let addr = cur as usize;
            assert!(
                addr >= base && addr < end,
                "free-list entry {:#x} lies outside superblock {:#x}'s data region",
                addr,
                sb as usize
            );
            assert_eq!(
                (addr - base) % block_size,
                0,
                "free-list entry {:#x} is not aligned to a size-class-{} slot boundary",
                addr,
                sc
            );
            assert!(
                seen.insert(addr),
                "free-list entry {:#x} appears more than once in superblock {:#x}'s free list",
                addr,
                sb as usize
            );
            cur = (*cur).next;
        }
    }
}

/// Appropriate fullness bin index for a superblock's current occupancy:
/// `floor(NBINS * used / max_blocks[sc])`.
pub unsafe fn appropriate_bin(sb: *mut Superblock) -> usize {
    let sc = (*sb).tag.size_class().expect("appropriate_bin on non-normal superblock");
    config::NBINS * (*sb).used / max_blocks(sc)
}

/// Inserts `sb` (which must be detached) at the head of `bin`.
pub unsafe fn push(bin: *mut *mut Superblock, sb: *mut Superblock) {
    debug_assert!((*sb).bin.is_null());
    (*sb).bin = bin;
    (*sb).next = *bin;
    (*sb).prev = ptr::null_mut();
    if !(*bin).is_null() {
        (**bin).prev = sb;
    }
    *bin = sb;
}

/// Detaches and returns the head of `bin`, or null if empty.
pub unsafe fn pop(bin: *mut *mut Superblock) -> *mut Superblock {
    let sb = *bin;
    if sb.is_null() {
        return ptr::null_mut();
    }
    if !(*sb).next.is_null() {
        (*(*sb).next).prev = ptr::null_mut();
    }
    *bin = (*sb).next;
    (*sb).bin = ptr::null_mut();
    (*sb).next = ptr::null_mut();
    (*sb).prev = ptr::null_mut();
    sb
}

/// Detaches `sb` from wherever it currently sits (`sb.bin` must be
/// non-null).
pub unsafe fn remove(sb: *mut Superblock) {
    debug_assert!(!(*sb).bin.is_null());
    if (*sb).prev.is_null() {
        pop((*sb).bin);
        return;
    } else if (*sb).next.is_null() {
        (*(*sb).prev).next = ptr::null_mut();
    } else {
        (*(*sb).prev).next = (*sb).next;
        (*(*sb).next).prev = (*sb).prev;
    }
    (*sb).bin = ptr::null_mut();
    (*sb).next = ptr::null_mut();
    (*sb).prev = ptr::null_mut();
}

#[allow(dead_code)]
const _: () = {
    // NSIZES must fit in a u8 tag; guards SbTag::Normal(u8).
    assert!(NSIZES <= u8::MAX as usize);
    ()
};

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::max_blocks;

    unsafe fn alloc_region() -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(config::SB_SIZE, config::SB_SIZE).unwrap();
        std::alloc::alloc_zeroed(layout)
    }

    #[test]
    fn classify_builds_full_freelist() {
        unsafe {
            let region = alloc_region();
            let sb = Superblock::format_fresh(region);
            Superblock::classify(sb, 0);
            assert_eq!((*sb).used, 0);
            let mut popped = vec![];
            for _ in 0..max_blocks(0) {
                popped.push(Superblock::pop_block(sb));
            }
            assert_eq!((*sb).used, max_blocks(0));
            // every slot distinct and within the superblock
            popped.sort();
            popped.dedup();
            assert_eq!(popped.len(), max_blocks(0));
            for p in &popped {
                let addr = *p as usize;
                assert!(addr >= region as usize + config::superblock_header_size());
                assert!(addr < region as usize + config::SB_SIZE);
            }
            std::alloc::dealloc(
                region,
                std::alloc::Layout::from_size_align(config::SB_SIZE, config::SB_SIZE).unwrap(),
            );
        }
    }

    #[test]
    fn list_push_pop_remove_roundtrip() {
        unsafe {
            let r1 = alloc_region();
            let r2 = alloc_region();
            let sb1 = Superblock::format_fresh(r1);
            let sb2 = Superblock::format_fresh(r2);
            Superblock::classify(sb1, 0);
            Superblock::classify(sb2, 0);

            let mut bin: *mut Superblock = ptr::null_mut();
            push(&mut bin, sb1);
            push(&mut bin, sb2);
            assert_eq!(bin, sb2);
            assert_eq!((*sb2).next, sb1);
            assert_eq!((*sb1).prev, sb2);

            remove(sb1);
            assert!((*sb1).bin.is_null());
            assert_eq!(bin, sb2);
            assert!((*sb2).next.is_null());

            let popped = pop(&mut bin);
            assert_eq!(popped, sb2);
            assert!(bin.is_null());

            let layout = std::alloc::Layout::from_size_align(config::SB_SIZE, config::SB_SIZE).unwrap();
            std::alloc::dealloc(r1, layout);
            std::alloc::dealloc(r2, layout);
        }
    }

    #[test]
    fn check_freelist_passes_on_a_freshly_classified_superblock() {
        unsafe {
            let region = alloc_region();
            let sb = Superblock::format_fresh(region);
            Superblock::classify(sb, 1);
            Superblock::check_freelist(sb, 1);
            Superblock::pop_block(sb);
            Superblock::check_freelist(sb, 1);
            std::alloc::dealloc(
                region,
                std::alloc::Layout::from_size_align(config::SB_SIZE, config::SB_SIZE).unwrap(),
            );
        }
    }

    #[test]
    #[should_panic(expected = "appears more than once")]
    fn check_freelist_catches_a_duplicated_entry() {
        unsafe {
            let region = alloc_region();
            let sb = Superblock::format_fresh(region);
            Superblock::classify(sb, 0);
            // Corrupt the free list by pointing the head's link at itself.
            let head = (*sb).freelist;
            (*head).next = head;
            Superblock::check_freelist(sb, 0);
            std::alloc::dealloc(
                region,
                std::alloc::Layout::from_size_align(config::SB_SIZE, config::SB_SIZE).unwrap(),
            );
        }
    }
}
