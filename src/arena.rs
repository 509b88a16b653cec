//! The arena: a single monotonically growing, `SB_SIZE`-aligned region,
//! extended under one lock.
//!
//! There's no libc `sbrk` to lean on from a normal multi-threaded Rust
//! program, and repeatedly growing a region with `mmap(MAP_FIXED)` risks
//! losing contiguity to a racing unrelated mapping. Instead this reserves a
//! large virtual range once via anonymous `mmap` and bumps a tail pointer
//! inside it. Pages are never touched until the memory inside them is
//! actually written, so the up-front reservation is cheap.

use parking_lot::Mutex;

use crate::config::{sb_align_up, ARENA_VIRT_SIZE, SB_SIZE};
use crate::error::InitError;

pub struct Arena {
    base: usize,
    limit: usize,
    tail: Mutex<usize>,
}

impl Arena {
    /// Reserves the arena's backing virtual address space and aligns the
    /// base up to `SB_SIZE`.
    pub fn init() -> Result<Arena, InitError> {
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                ARENA_VIRT_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(InitError::ArenaReservationFailed(errno::errno()));
        }
        let raw = raw as usize;
        let base = sb_align_up(raw);
        // Alignment padding is lost address space, not lost memory (pages
        // are never committed until touched).
        let limit = raw + ARENA_VIRT_SIZE;
        Ok(Arena {
            base,
            limit,
            tail: Mutex::new(base),
        })
    }

    /// Extends the arena by `n` bytes (`n` must be a positive multiple of
    /// `SB_SIZE`), returning an `SB_SIZE`-aligned pointer to fresh bytes, or
    /// null if the reservation is exhausted.
    pub fn extend(&self, n: usize) -> *mut u8 {
        debug_assert!(n > 0 && n % SB_SIZE == 0);
        let mut tail = self.tail.lock();
        let start = *tail;
        let new_tail = start + n;
        if new_tail > self.limit {
            return core::ptr::null_mut();
        }
        *tail = new_tail;
        start as *mut u8
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.limit - self.base);
        }
    }
}

// SAFETY: `Arena` only ever hands out disjoint byte ranges under `tail`'s
// lock; the raw pointer it wraps is not otherwise shared.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extend_returns_aligned_disjoint_regions() {
        let arena = Arena::init().unwrap();
        let a = arena.extend(SB_SIZE);
        let b = arena.extend(SB_SIZE * 2);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_eq!(a as usize % SB_SIZE, 0);
        assert_eq!(b as usize % SB_SIZE, 0);
        assert_eq!(b as usize, a as usize + SB_SIZE);
    }

    #[test]
    fn exhaustion_returns_null() {
        let arena = Arena::init().unwrap();
        // Ask for more than the reservation; must fail cleanly rather than
        // panic or corrupt the tail.
        let huge = sb_align_up(ARENA_VIRT_SIZE + SB_SIZE);
        assert!(arena.extend(huge).is_null());
        // Arena must still be usable afterward.
        assert!(!arena.extend(SB_SIZE).is_null());
    }
}
