//! The large-object path: allocations bigger than the largest size class,
//! served as a contiguous run of whole superblocks whose first superblock
//! self-identifies via its header.

use core::mem;

use crate::config::{sb_align_up, SB_SIZE};
use crate::heap::{registry, Registry};
use crate::superblock::{self, SbTag, Superblock};

/// Allocates `sz` bytes as a run of whole superblocks. `sz` must already be
/// known to exceed the largest size class.
pub fn allocate_large(sz: usize) -> *mut u8 {
    allocate_large_in(registry(), sz)
}

pub fn allocate_large_in(reg: &Registry, sz: usize) -> *mut u8 {
    let header = mem::size_of::<Superblock>();
    let n = sb_align_up(sz + header) / SB_SIZE;
    let region = reg.arena.extend(n * SB_SIZE);
    if region.is_null() {
        return core::ptr::null_mut();
    }
    let sb = unsafe { Superblock::format_fresh(region) };
    unsafe {
        (*sb).tag = SbTag::Large;
        (*sb).used = n; // num_superblocks, repurposing the `used` field
    }
    log::debug!("allocate: large allocation of {} bytes spanning {} superblocks", sz, n);
    unsafe { region.add(header) }
}

/// Frees a large allocation: every superblock in the run is zeroed and
/// pushed onto the global heap's empties pool, in address order — the only
/// path by which large-block memory re-enters circulation as ordinary
/// superblocks.
pub fn free_large(ptr: *mut u8) {
    free_large_in(registry(), ptr)
}

pub fn free_large_in(reg: &Registry, ptr: *mut u8) {
    let header = mem::size_of::<Superblock>();
    let first = (ptr as usize - header) as *mut Superblock;
    debug_assert_eq!(unsafe { (*first).tag }, SbTag::Large);
    let n = unsafe { (*first).used };

    let mut region = first as *mut u8;
    let mut global = reg.global().empties.lock();
    for _ in 0..n {
        unsafe {
            core::ptr::write_bytes(region, 0, SB_SIZE);
            let sb = Superblock::format_fresh(region);
            superblock::push(&mut global.head, sb);
        }
        global.count += 1;
        region = unsafe { region.add(SB_SIZE) };
    }
    log::debug!("free: returned {} superblocks from a large allocation to the global heap", n);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SB_SIZE;

    #[test]
    fn large_roundtrip_spans_expected_superblocks() {
        let _ = env_logger::try_init();
        let reg = Registry::init().unwrap();
        let sz = 2 * SB_SIZE;
        let p = allocate_large_in(&reg, sz);
        assert!(!p.is_null());

        let header = mem::size_of::<Superblock>();
        let n_expected = sb_align_up(sz + header) / SB_SIZE;
        assert_eq!(n_expected, 3);

        let first = (p as usize - header) as *mut Superblock;
        unsafe {
            assert_eq!((*first).tag, SbTag::Large);
            assert_eq!((*first).used, n_expected);
        }
        assert_eq!((first as usize) % SB_SIZE, 0);

        unsafe {
            core::ptr::write_bytes(p, 0x42, sz);
        }

        let before = reg.global().empties.lock().count;
        free_large_in(&reg, p);
        let after = reg.global().empties.lock().count;
        assert_eq!(after - before, n_expected);
    }
}
