use std::fmt;

/// The identity of a pool. Chosen at random when the pool is
/// created and stored in its header, so it stays the same
/// across every reopen of the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn generate() -> PoolId {
        loop {
            let raw: u64 = rand::random();
            if raw != 0 {
                return PoolId(raw);
            }
        }
    }

    pub(crate) const fn from_raw(raw: u64) -> PoolId {
        PoolId(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A persistent pointer to the start of an allocation.
///
/// Only the offset is meaningful on media; store
/// `Handle::offset` inside the pool and turn it back into a
/// `Handle` with `Pool::handle` after reopening. The pool
/// identity lets every operation reject handles that belong
/// to some other pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    pool: PoolId,
    offset: u64,
}

impl Handle {
    pub(crate) const fn new(pool: PoolId, offset: u64) -> Handle {
        Handle { pool, offset }
    }

    pub const fn pool(&self) -> PoolId {
        self.pool
    }

    /// The pool-relative offset of the first usable byte.
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.pool, self.offset)
    }
}
