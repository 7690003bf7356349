//! Durability primitives. A store into the mapping is only
//! durable once the range covering it has been persisted,
//! and stores issued after a `fence` are never reordered
//! ahead of the ones before it.

use std::io;
use std::sync::atomic::{fence as atomic_fence, Ordering};

use fault_injection::fallible;

use crate::region::Region;

/// Orders all previous stores before any following ones.
pub(crate) fn fence() {
    atomic_fence(Ordering::SeqCst);
}

/// Whether stores to this kind of mapping become durable
/// without explicit flushing. File-backed mappings go
/// through the page cache, so this is always `false`.
/// Purely informational: the engine flushes regardless.
pub fn has_auto_flush() -> bool {
    false
}

impl Region {
    /// Synchronously writes back the pages covering
    /// `offset..offset + len`, then fences.
    pub fn persist(&self, offset: u64, len: u64) -> io::Result<()> {
        if len != 0 {
            assert!(self.contains(offset, len));
            fallible!(self.mmap.flush_range(offset as usize, len as usize));
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
        fence();
        Ok(())
    }

    pub fn persist_all(&self) -> io::Result<()> {
        fallible!(self.mmap.flush());
        self.flushes.fetch_add(1, Ordering::Relaxed);
        fence();
        Ok(())
    }
}
