use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::time::{SystemTime, UNIX_EPOCH};

use fault_injection::fallible;
use parking_lot::Mutex;

use crate::heap::Heap;
use crate::layout::{
    Layout, PoolHeader, FORMAT_VERSION, HEADER_LEN, MIN_FORMAT_VERSION, PAGE_SIZE, ROOT_OFFSET,
    ROOT_SIZE, ROOT_VERSION_OFFSET,
};
use crate::redo::{self, RedoKind};
use crate::region::Region;
use crate::tx::TxSlot;
use crate::undo::UndoLog;
use crate::{Config, Error, Pool, PoolId, Result};

impl Config {
    /// Create a new pool. Fails if anything already exists at
    /// `Config::path`.
    pub fn create(&self) -> Result<Pool> {
        self.validate()?;

        log::debug!("creating pool of {} bytes at {:?}", self.size, self.path);

        let region = Region::create(&self.path, self.size)
            .map_err(|e| Error::create_or_open(&self.path, e))?;

        self.format(region)
    }

    /// Open an existing pool, rolling back any transaction
    /// that was interrupted by a crash.
    pub fn open(&self) -> Result<Pool> {
        self.validate()?;

        log::debug!("opening pool at {:?}", self.path);

        let region = Region::open(&self.path).map_err(|e| Error::create_or_open(&self.path, e))?;

        self.recover(region)
    }

    /// Open the pool at `Config::path`, creating it first if
    /// nothing is there. Creation is exclusive, so when two
    /// processes race, one creates and the other opens.
    pub fn open_or_create(&self) -> Result<Pool> {
        self.validate()?;

        match Region::create(&self.path, self.size) {
            Ok(region) => {
                log::debug!("created pool of {} bytes at {:?}", self.size, self.path);
                return self.format(region);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::create_or_open(&self.path, e)),
        }

        match Region::open(&self.path) {
            Ok(region) => self.recover(region),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // removed between our create and open attempts
                log::debug!("pool at {:?} vanished, retrying creation once", self.path);
                self.create()
            }
            Err(e) => Err(Error::create_or_open(&self.path, e)),
        }
    }

    fn format(&self, region: Region) -> Result<Pool> {
        let formatted = self.write_initial_structures(&region);

        if let Err(e) = formatted {
            // we created the file exclusively, so nobody else
            // can be relying on what is left of it
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        self.recover(region)
    }

    fn write_initial_structures(&self, region: &Region) -> Result<()> {
        let layout = Layout::new(self.size, self.undo_log_size)
            .ok_or_else(|| Error::InvalidConfig("no room for the heap".into()))?;

        Heap::format(region, &layout)?;
        UndoLog::format(region, &layout)?;

        region.store_u64(ROOT_VERSION_OFFSET, FORMAT_VERSION);
        region.persist(ROOT_OFFSET, ROOT_SIZE)?;

        let header = PoolHeader {
            version: FORMAT_VERSION,
            pool_id: PoolId::generate().to_raw(),
            pool_size: self.size,
            undo_log_size: self.undo_log_size,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            layout: self.layout.clone(),
        };

        // the header goes last: a pool without a valid
        // header was never successfully created
        region.write(0, &header.encode());
        region.persist(0, PAGE_SIZE)?;

        Ok(())
    }

    fn recover(&self, region: Region) -> Result<Pool> {
        let path = region.path().to_path_buf();

        if region.len() < PAGE_SIZE {
            return Err(Error::create_or_open(&path, "file is too small to be a pool"));
        }

        let mut buf = [0_u8; HEADER_LEN];
        region.read(0, &mut buf);
        let header = PoolHeader::decode(&buf).map_err(|reason| Error::create_or_open(&path, reason))?;

        if header.layout != self.layout {
            return Err(Error::create_or_open(
                &path,
                format!(
                    "layout mismatch, pool was created as {:?} but opened as {:?}",
                    header.layout, self.layout
                ),
            ));
        }

        if header.pool_size > region.len() {
            return Err(Error::create_or_open(
                &path,
                "file is shorter than the pool size in its header",
            ));
        }

        let layout = Layout::new(header.pool_size, header.undo_log_size)
            .ok_or_else(|| Error::create_or_open(&path, "header describes an impossible layout"))?;

        let heap_version = region.load_u64(ROOT_VERSION_OFFSET);
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&heap_version) {
            return Err(Error::create_or_open(&path, "unsupported heap version in root"));
        }

        // A committed transaction leaves a commit record behind
        // until after its undo log is discarded, so the record
        // decides whether the undo log is rolled back.
        let committed = match redo::recover(&region, layout.heap_end()) {
            Some((kind, stores)) => {
                log::warn!(
                    "applying {:?} redo record of {} stores left behind by a crash",
                    kind,
                    stores.len()
                );
                redo::apply(&region, &stores)?;
                kind == RedoKind::Commit
            }
            None => false,
        };

        let (undo, found) = UndoLog::recover(&region, &layout, !committed)?;
        if found > 0 && committed {
            log::warn!("completed interrupted commit of {} ranges", found);
        }

        redo::clear(&region)?;

        let mut heap =
            Heap::recover(&region, layout).map_err(|reason| Error::create_or_open(&path, reason))?;

        for (unit_size, header_kind) in &self.classes {
            heap.register_class(&region, *unit_size, *header_kind)?;
        }

        let id = PoolId::from_raw(header.pool_id);

        log::debug!(
            "opened pool {} at {:?} with {} chunks of heap",
            id,
            path,
            layout.chunk_count
        );

        Ok(Pool {
            region,
            layout,
            header,
            id,
            heap: Mutex::new(heap),
            tx: Mutex::new(TxSlot::new(undo)),
            transactions_committed: AtomicU64::new(0),
            transactions_aborted: AtomicU64::new(0),
        })
    }
}

fn read_header(path: &Path) -> io::Result<Option<PoolHeader>> {
    let mut file = fallible!(File::open(path));
    let mut buf = [0_u8; HEADER_LEN];
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(PoolHeader::decode(&buf).ok()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Returns `true` if `path` holds a pool with a valid header.
pub fn exists<P: AsRef<Path>>(path: P) -> bool {
    matches!(read_header(path.as_ref()), Ok(Some(_)))
}

fn unlink_unlocked(path: &Path) -> io::Result<()> {
    let file = fallible!(File::open(path));
    fallible!(fs2::FileExt::try_lock_exclusive(&file));
    fallible!(fs::remove_file(path));
    Ok(())
}

/// Deletes the pool file at `path`. Refuses to delete files
/// that are not pools, or pools that are currently open.
pub fn remove<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();

    let header = read_header(path).map_err(|e| Error::create_or_open(path, e))?;
    if header.is_none() {
        return Err(Error::create_or_open(path, "refusing to remove a file that is not a pool"));
    }

    unlink_unlocked(path).map_err(|e| {
        Error::create_or_open(path, format!("refusing to remove a pool that is open: {}", e))
    })?;

    log::debug!("removed pool at {:?}", path);

    Ok(())
}
