//! CPU-identification collaborators consumed by the core heap machinery.
//!
//! `current_cpu()` is a hint, not a guarantee: correctness never depends on
//! a thread observing the same CPU across two calls.

use std::cell::Cell;

/// Number of heaps to size the CPU array for. Queried once at `init` time.
pub fn num_processors() -> usize {
    num_cpus::get()
}

thread_local! {
    static TEST_CPU_OVERRIDE: Cell<Option<usize>> = Cell::new(None);
}

/// Returns the hint CPU a thread is currently (probably) running on, as an
/// index in `[0, num_processors())`.
///
/// `sched_getcpu` can legitimately return a core index that's momentarily
/// stale by the time the caller acts on it; that's fine, the heap hierarchy
/// tolerates it.
pub fn current_cpu(num_processors: usize) -> usize {
    if let Some(forced) = TEST_CPU_OVERRIDE.with(|c| c.get()) {
        return forced % num_processors.max(1);
    }
    real_current_cpu(num_processors)
}

#[cfg(target_os = "linux")]
fn real_current_cpu(num_processors: usize) -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        (cpu as usize) % num_processors.max(1)
    }
}

#[cfg(not(target_os = "linux"))]
fn real_current_cpu(num_processors: usize) -> usize {
    // No cheap current-CPU syscall on this platform; any fixed choice is a
    // valid hint given how tolerant callers are of staleness.
    let _ = num_processors;
    0
}

/// Test-only: pin `current_cpu()` for the calling thread to a fixed value,
/// so tests can deterministically exercise per-CPU-heap behavior regardless
/// of how many real cores the test machine has.
#[cfg(any(test, feature = "test-support"))]
pub fn set_test_cpu(cpu: Option<usize>) {
    TEST_CPU_OVERRIDE.with(|c| c.set(cpu));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn override_pins_current_cpu() {
        set_test_cpu(Some(3));
        assert_eq!(current_cpu(8), 3);
        set_test_cpu(None);
    }
}
