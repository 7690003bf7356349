//! # pmheap
//!
//! pmheap is a crash-consistent heap that lives inside of a
//! single memory-mapped file, called a pool. It hands out
//! blocks from size classes, lets you read and write their
//! bytes in place, and lets you group writes, allocations
//! and frees into transactions that either happen entirely
//! or not at all, even if the process dies halfway through.
//!
//! Durability is achieved with nothing but ordinary stores
//! into the mapping plus explicit flushes and fences. Every
//! range a transaction is about to modify gets its previous
//! contents copied into an undo log first. Committing flushes
//! the new contents and then discards the log. Aborting, or
//! reopening a pool after a crash, copies the old contents
//! back. Allocator metadata is never undo-logged; it changes
//! only through small crc-protected redo records.
//!
//! A pool is a fixed-size file. It never grows, and only one
//! process may have it open at a time.
//!
//! Blocks are addressed by `Handle`, which pairs the stable
//! pool-relative offset with the identity of the pool it
//! came from, so a handle from one pool can never be used to
//! free or scribble over memory in another. Only
//! `Handle::offset` should be stored persistently: after a
//! reopen, turn it back into a handle with `Pool::handle`.
//! The pool has one 64-bit root value that survives restarts
//! and is the place to anchor everything else.
//!
//! # Examples
//!
//! ```
//! use pmheap::{ClassId, Config, HeaderKind};
//!
//! let path = std::env::temp_dir().join("pmheap-doc-pool");
//! # let _ = std::fs::remove_file(&path);
//! let config = Config {
//!     path: path.clone(),
//!     classes: vec![(128, HeaderKind::None)],
//!     ..Config::default()
//! };
//!
//! let pool = config.open_or_create().unwrap();
//!
//! // allocate a zeroed block and anchor it at the root
//! let block = pool.allocate(100, ClassId::DEFAULT, true).unwrap();
//! pool.set_root(block.offset()).unwrap();
//!
//! // change several ranges at once, atomically
//! pool.with_transaction(|tx| {
//!     tx.write(block, 0, b"hello")?;
//!     tx.write_u64(block, 8, 42)
//! })
//! .unwrap();
//!
//! drop(pool);
//!
//! let pool = config.open().unwrap();
//! let block = pool.handle(pool.root()).unwrap();
//!
//! let mut buf = [0; 5];
//! pool.read(block, 0, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! assert_eq!(pool.read_u64(block, 8).unwrap(), 42);
//!
//! // print out pool statistics
//! dbg!(pool.stats());
//! # drop(pool);
//! # std::fs::remove_file(&path).unwrap();
//! ```
//!
//! Allocation classes are registered once and then stay part
//! of the pool. Registering the same unit size again, for
//! example on every start via `Config::classes`, hands back
//! the same `ClassId`:
//!
//! ```
//! use pmheap::{ClassId, HeaderKind};
//!
//! let path = std::env::temp_dir().join("pmheap-doc-classes");
//! # let _ = std::fs::remove_file(&path);
//! let pool = pmheap::open_or_create(&path, 16 * 1024 * 1024).unwrap();
//!
//! let class = pool.register_class(128, HeaderKind::None).unwrap();
//! assert_eq!(pool.register_class(128, HeaderKind::None).unwrap(), class);
//!
//! let block = pool.allocate(100, class, false).unwrap();
//! assert_eq!(pool.usable_size(block).unwrap(), 128);
//! # drop(pool);
//! # std::fs::remove_file(&path).unwrap();
//! ```
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering::Acquire};

use parking_lot::Mutex;

mod class;
mod config;
#[cfg(feature = "runtime_validation")]
mod debug_history;
mod error;
mod flush;
mod handle;
mod heap;
mod layout;
mod probe;
mod readpath;
mod recovery;
mod redo;
mod region;
mod tx;
mod undo;
mod writepath;

pub use class::{AllocationClass, ClassId, HeaderKind, MAX_UNIT_SIZE};
pub use config::Config;
pub use error::{Error, Result};
pub use flush::has_auto_flush;
pub use handle::{Handle, PoolId};
pub use layout::{MAX_LAYOUT_LEN, MIN_POOL_SIZE, MIN_UNDO_LOG_SIZE};
pub use probe::probe_extent;
pub use recovery::{exists, remove};
pub use tx::{Transaction, TxState};

use heap::Heap;
use layout::{Layout, PoolHeader};
use region::Region;
use tx::TxSlot;

/// Statistics about the space and activity of a pool since
/// it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// The size of the pool file.
    pub pool_size: u64,
    /// The number of bytes available for allocations,
    /// excluding the header, logs and allocator metadata.
    pub heap_size: u64,
    /// The number of chunks the heap is divided into.
    pub chunks: u32,
    /// Chunks neither bound to a class nor part of a run.
    pub free_chunks: u32,
    /// Allocations currently published as live.
    pub live_allocations: u64,
    /// The sum of the usable sizes of all live allocations.
    pub live_bytes: u64,
    /// Built-in plus custom allocation classes.
    pub classes: usize,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    /// Bytes of pre-images written to the undo log.
    pub undo_bytes_logged: u64,
    /// The number of msync calls issued.
    pub flushes: u64,
}

/// Create a pool of `size` bytes at `path` with the default
/// layout tag, or open it if it already exists.
pub fn open_or_create<P: AsRef<Path>>(path: P, size: u64) -> Result<Pool> {
    let config = Config {
        path: path.as_ref().into(),
        size,
        ..Config::default()
    };

    config.open_or_create()
}

/// Open an existing pool created with the default layout tag.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Pool> {
    let config = Config {
        path: path.as_ref().into(),
        ..Config::default()
    };

    config.open()
}

/// An open pool.
///
/// `Pool` is `Send + Sync`. Allocation and freeing are safe
/// from any number of threads at once. At most one
/// transaction can be in progress per pool. Nothing stops
/// two threads from writing the same bytes concurrently; it
/// is up to the caller to serialize writers of a range.
pub struct Pool {
    region: Region,
    layout: Layout,
    header: PoolHeader,
    id: PoolId,
    heap: Mutex<Heap>,
    tx: Mutex<TxSlot>,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("path", &self.region.path())
            .field("layout", &self.header.layout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pool {{ id: {}, path: {:?} }}", self.id, self.region.path())
    }
}

impl Pool {
    /// The stable identity of this pool.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The size of the pool file in bytes.
    pub fn size(&self) -> u64 {
        self.region.len()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// The layout tag the pool was created with.
    pub fn layout(&self) -> &str {
        &self.header.layout
    }

    /// Seconds since the unix epoch at which the pool was
    /// created.
    pub fn created_at(&self) -> u64 {
        self.header.created_at
    }

    /// See [`has_auto_flush`].
    pub fn has_auto_flush(&self) -> bool {
        flush::has_auto_flush()
    }

    /// Space and activity statistics.
    #[doc(alias = "statistics")]
    #[doc(alias = "metrics")]
    pub fn stats(&self) -> Stats {
        let (free_chunks, live_allocations, live_bytes, classes) = {
            let heap = self.heap.lock();
            (
                heap.free_chunks(),
                heap.live_allocations(),
                heap.live_bytes(),
                heap.classes().len(),
            )
        };

        let undo_bytes_logged = self.tx.lock().undo.bytes_logged;

        Stats {
            pool_size: self.region.len(),
            heap_size: self.layout.heap_end() - self.layout.heap_offset,
            chunks: self.layout.chunk_count,
            free_chunks,
            live_allocations,
            live_bytes,
            classes,
            transactions_committed: self.transactions_committed.load(Acquire),
            transactions_aborted: self.transactions_aborted.load(Acquire),
            undo_bytes_logged,
            flushes: self.region.flushes.load(Acquire),
        }
    }

    /// Flushes the entire mapping and closes the pool. Any
    /// transaction still in progress would have borrowed the
    /// pool, so there can't be one.
    pub fn close(self) -> Result<()> {
        self.region.persist_all()?;
        log::debug!("closed pool {} at {:?}", self.id, self.region.path());
        Ok(())
    }
}
