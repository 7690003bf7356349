use std::sync::atomic::Ordering::Release;

use crate::flush::fence;
use crate::heap::Reservation;
use crate::layout::ROOT_OFFSET;
use crate::redo::{RedoKind, REDO_CAPACITY};
use crate::undo::UndoLog;
use crate::{ClassId, Error, Handle, Pool, Result};

/// The state of a pool's transaction slot.
///
/// ```txt
/// None -> Work -> OnCommit -> Finally -> None
///              -> OnAbort  -> Finally -> None
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    /// No transaction is in progress.
    None,
    /// A transaction is accepting ranges, writes, allocations
    /// and frees.
    Work,
    OnCommit,
    OnAbort,
    /// The outcome is durable and reservations are being
    /// released.
    Finally,
}

#[derive(Debug)]
pub(crate) struct TxSlot {
    pub state: TxState,
    pub undo: UndoLog,
    // the undo log header of a finished transaction may not
    // have reached media
    unsettled: bool,
}

impl TxSlot {
    pub fn new(undo: UndoLog) -> TxSlot {
        TxSlot {
            state: TxState::None,
            undo,
            unsettled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Active,
    Committed,
    Aborted,
}

/// A transaction on one pool, created by `Pool::begin`.
///
/// Every range must be registered with `add_range` (or
/// written through one of the transaction's own write
/// methods, which do that implicitly) before it is modified.
/// Blocks allocated inside of the transaction don't need
/// registering: they are flushed at commit and simply never
/// existed if the transaction aborts.
///
/// Dropping a transaction that was neither committed nor
/// aborted aborts it.
pub struct Transaction<'a> {
    pool: &'a Pool,
    outcome: Outcome,
    allocs: Vec<Reservation>,
    frees: Vec<Reservation>,
    // allocated and then freed again within this transaction
    released: Vec<Reservation>,
    redo_stores: usize,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("pool", &self.pool.id())
            .field("outcome", &self.outcome)
            .field("allocs", &self.allocs.len())
            .field("frees", &self.frees.len())
            .finish()
    }
}

impl Pool {
    /// Starts a transaction. Fails with
    /// `Error::TransactionProtocolViolation` if this pool
    /// already has one in progress.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let mut slot = self.tx.lock();
        if slot.state != TxState::None {
            return Err(Error::TransactionProtocolViolation(
                "a transaction is already in progress on this pool",
            ));
        }

        self.settle(&mut slot)?;

        slot.state = TxState::Work;

        log::trace!("began transaction on pool {}", self.id);

        Ok(Transaction {
            pool: self,
            outcome: Outcome::Active,
            allocs: vec![],
            frees: vec![],
            released: vec![],
            redo_stores: 0,
        })
    }

    /// Finishes flushing whatever an earlier commit or abort
    /// left behind after its outcome was decided, before a new
    /// transaction can log anything. A commit record left
    /// behind would otherwise make recovery keep the partial
    /// writes of the next transaction.
    fn settle(&self, slot: &mut TxSlot) -> Result<()> {
        if slot.unsettled {
            slot.undo.persist_header(&self.region)?;
            slot.unsettled = false;
            log::info!("settled the undo log of an earlier transaction on pool {}", self.id);
        }

        self.heap.lock().settle(&self.region)?;

        Ok(())
    }

    /// The state of this pool's transaction slot.
    pub fn tx_state(&self) -> TxState {
        self.tx.lock().state
    }

    /// Runs `f` in a new transaction, committing if it returns
    /// `Ok` and aborting if it returns `Err` or panics.
    ///
    /// Returns `Error::TransactionAborted` if `f` aborted the
    /// transaction itself and then returned `Ok`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.abort();
                Err(e)
            }
        }
    }

    /// Atomically changes `len` bytes of a block, `at` bytes in,
    /// through a mutable slice. Either all of `f`'s changes
    /// survive a crash or none do.
    pub fn mutate_atomically<R, F>(&self, handle: Handle, at: u64, len: u64, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut tx = self.begin()?;
        let offset = tx.add_range_offset(handle, at, len)?;

        // the range is in use by a live allocation and nothing
        // else in this pool writes to it while we hold the only
        // transaction
        let bytes = unsafe { self.region.slice_mut(offset, len) };
        let ret = f(bytes);

        tx.commit()?;

        Ok(ret)
    }
}

impl<'a> Transaction<'a> {
    pub fn pool(&self) -> &'a Pool {
        self.pool
    }

    /// The state of the pool's transaction slot.
    pub fn state(&self) -> TxState {
        self.pool.tx_state()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.outcome {
            Outcome::Active => Ok(()),
            Outcome::Committed => Err(Error::TransactionProtocolViolation(
                "transaction has already committed",
            )),
            Outcome::Aborted => Err(Error::TransactionAborted),
        }
    }

    fn log_range(&mut self, offset: u64, len: u64) -> Result<()> {
        self.ensure_active()?;
        let mut slot = self.pool.tx.lock();
        slot.undo.append(&self.pool.region, offset, len)?;
        Ok(())
    }

    fn add_range_offset(&mut self, handle: Handle, at: u64, len: u64) -> Result<u64> {
        self.ensure_active()?;
        let offset = self.pool.checked_range(handle, at, len)?;
        self.log_range(offset, len)?;
        Ok(offset)
    }

    /// Registers `at..at + len` of the block so that it will be
    /// restored if the transaction does not commit. The
    /// pre-image is durable once this returns.
    pub fn add_range(&mut self, handle: Handle, at: u64, len: u64) -> Result<()> {
        self.add_range_offset(handle, at, len).map(drop)
    }

    /// Registers the range and copies `bytes` into it.
    pub fn write(&mut self, handle: Handle, at: u64, bytes: &[u8]) -> Result<()> {
        let offset = self.add_range_offset(handle, at, bytes.len() as u64)?;
        self.pool.region.write(offset, bytes);
        Ok(())
    }

    pub fn write_u64(&mut self, handle: Handle, at: u64, value: u64) -> Result<()> {
        self.write(handle, at, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, handle: Handle, at: u64, value: u32) -> Result<()> {
        self.write(handle, at, &value.to_le_bytes())
    }

    pub fn fill(&mut self, handle: Handle, at: u64, len: u64, byte: u8) -> Result<()> {
        let offset = self.add_range_offset(handle, at, len)?;
        self.pool.region.fill(offset, len, byte);
        Ok(())
    }

    /// Sets the root value as part of this transaction.
    pub fn set_root(&mut self, value: u64) -> Result<()> {
        self.log_range(ROOT_OFFSET, 8)?;
        self.pool.region.store_u64(ROOT_OFFSET, value);
        Ok(())
    }

    fn reserve_redo(&mut self, stores: usize) -> Result<()> {
        if self.redo_stores + stores > REDO_CAPACITY {
            return Err(Error::LogExhausted {
                log: "redo",
                needed: ((self.redo_stores + stores) * 16) as u64,
                available: (REDO_CAPACITY * 16) as u64,
            });
        }
        self.redo_stores += stores;
        Ok(())
    }

    /// Allocates a block that only becomes allocated on media
    /// if the transaction commits.
    pub fn allocate(&mut self, size: u64, class: ClassId, zero_fill: bool) -> Result<Handle> {
        self.ensure_active()?;

        let zero = zero_fill || class == ClassId::DEFAULT;
        let pool = self.pool;
        let region = &pool.region;

        let mut heap = pool.heap.lock();
        let reservation = heap.reserve(region, size, class)?;

        if let Err(e) = self.reserve_redo(reservation.redo_stores()) {
            heap.cancel(&[reservation], &[]);
            return Err(e);
        }

        heap.prepare(region, &reservation, size, zero);
        self.allocs.push(reservation);

        Ok(Handle::new(pool.id, reservation.offset))
    }

    /// Frees a block when the transaction commits. Fails with
    /// `Error::InvalidOffsetOrAddress` if `handle` is not a live
    /// allocation of this pool.
    pub fn free(&mut self, handle: Handle) -> Result<()> {
        self.ensure_active()?;
        self.pool.check_identity(handle)?;

        if let Some(position) = self.allocs.iter().position(|r| r.offset == handle.offset()) {
            // never published, so it just goes back at the end
            let reservation = self.allocs.remove(position);
            self.redo_stores -= reservation.redo_stores();
            self.released.push(reservation);
            return Ok(());
        }

        let pool = self.pool;
        let mut heap = pool.heap.lock();
        let reservation = heap.begin_free(&pool.region, handle.offset())?;

        if let Err(e) = self.reserve_redo(reservation.redo_stores()) {
            heap.cancel(&[], &[reservation]);
            return Err(e);
        }

        self.frees.push(reservation);

        Ok(())
    }

    /// Makes every change of the transaction durable. Calling
    /// this again after success does nothing; calling it after
    /// an abort returns `Error::TransactionAborted`.
    ///
    /// If flushing fails before the commit point, the
    /// transaction is rolled back and the error returned. Past
    /// the commit point this always succeeds: anything that
    /// fails to flush afterwards is finished by the next
    /// `Pool::begin`, or by recovery.
    pub fn commit(&mut self) -> Result<()> {
        match self.outcome {
            Outcome::Committed => return Ok(()),
            Outcome::Aborted => return Err(Error::TransactionAborted),
            Outcome::Active => {}
        }

        let pool = self.pool;
        let region = &pool.region;
        let mut slot = pool.tx.lock();
        slot.state = TxState::OnCommit;

        let ranges: Vec<(u64, u64)> = slot.undo.ranges().collect();

        let flushed = ranges
            .iter()
            .copied()
            .chain(self.allocs.iter().map(|r| (r.start, r.len)))
            .try_for_each(|(offset, len)| region.persist(offset, len));

        let mut heap = pool.heap.lock();

        let published = flushed.and_then(|()| {
            fence();
            heap.publish(region, RedoKind::Commit, &self.allocs, &self.frees)
        });

        let stores = match published {
            Ok(stores) => stores,
            Err(e) => {
                drop(heap);
                log::warn!("rolling back transaction after failed commit: {}", e);
                slot.state = TxState::OnAbort;
                self.rollback(&mut slot);
                return Err(e.into());
            }
        };

        // Without allocator changes, discarding the undo log is
        // the commit point. With them, the record published
        // above already was, and recovery finishes the rest.
        // Either way the new generation and the stores are in
        // the mapping, only their flushes can still fail.
        // A commit record may only be cleared once the discard is
        // durable, so recovery never replays a committed log.
        match slot.undo.discard(region) {
            Ok(()) => heap.finish(region, &stores),
            Err(e) => {
                log::warn!("failed to flush discarded undo log, settling later: {}", e);
                slot.unsettled = true;
                heap.defer(region, &stores);
            }
        }

        slot.state = TxState::Finally;

        heap.cancel(&self.released, &[]);
        drop(heap);

        self.allocs.clear();
        self.frees.clear();
        self.released.clear();
        self.outcome = Outcome::Committed;

        slot.state = TxState::None;
        drop(slot);

        pool.transactions_committed.fetch_add(1, Release);

        log::trace!("committed {} ranges in pool {}", ranges.len(), pool.id);

        Ok(())
    }

    /// Rolls back every registered range and forgets every
    /// allocation and free of this transaction. Does nothing
    /// if the transaction already finished.
    pub fn abort(&mut self) {
        if self.outcome != Outcome::Active {
            return;
        }

        let pool = self.pool;
        let mut slot = pool.tx.lock();
        slot.state = TxState::OnAbort;
        self.rollback(&mut slot);
    }

    fn rollback(&mut self, slot: &mut TxSlot) {
        let pool = self.pool;
        let region = &pool.region;

        // The restored bytes are in the shared mapping even if
        // flushing them failed. The entries then stay in the log,
        // to be flushed by the next commit or replayed again.
        match slot.undo.replay(region) {
            Ok(()) => {
                if let Err(e) = slot.undo.discard(region) {
                    log::error!("failed to discard undo log after rollback: {}", e);
                    slot.unsettled = true;
                }
            }
            Err(e) => log::error!("failed to flush rolled back ranges: {}", e),
        }

        slot.state = TxState::Finally;

        let mut released = std::mem::take(&mut self.allocs);
        released.append(&mut self.released);

        pool.heap.lock().cancel(&released, &self.frees);
        self.frees.clear();
        self.redo_stores = 0;
        self.outcome = Outcome::Aborted;

        slot.state = TxState::None;

        pool.transactions_aborted.fetch_add(1, Release);

        log::trace!("aborted transaction on pool {}", pool.id);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.outcome == Outcome::Active {
            log::warn!("transaction dropped while in progress, rolling it back");
            self.abort();
        }
    }
}
