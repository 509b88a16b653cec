//! Crate-wide error types.
//!
//! `allocate`/`free` keep the malloc-family contract (null return, never a
//! `Result`); `init` is the one call worth a named failure reason, since it
//! can fail only for an identifiable cause (the initial arena reservation).

use core::fmt;

#[derive(Debug)]
pub enum InitError {
    /// The initial `mmap` reservation for the arena's virtual address
    /// range failed. Carries the raw `errno` for diagnostics.
    ArenaReservationFailed(errno::Errno),
    /// The arena's initial reservation succeeded, but carving the
    /// `num_cpus + 1`-element heap array out of it at startup exhausted the
    /// reservation. In practice this only happens if `ARENA_VIRT_SIZE` has
    /// been configured absurdly small relative to the machine's core count.
    HeapArrayReservationFailed,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::ArenaReservationFailed(e) => {
                write!(f, "failed to reserve arena address space: {}", e)
            }
            InitError::HeapArrayReservationFailed => {
                write!(f, "failed to carve the heap array out of the arena at startup")
            }
        }
    }
}

impl std::error::Error for InitError {}
