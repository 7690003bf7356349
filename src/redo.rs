//! Redo records for allocator metadata.
//!
//! A record is a batch of aligned `u64` stores into the
//! class table or chunk table or chunk bitmaps. The entries
//! are written and flushed first, then the 16-byte header
//! `count | kind | crc` is written and flushed: that header
//! is the commit point. Applying a record is idempotent, so
//! recovery simply applies any record whose crc checks out.
//!
//! ```txt
//! +0   count: u64
//! +8   kind: u32
//! +12  crc32(count, kind, entries): u32
//! +64  entries: (offset: u64, value: u64) * count
//! ```

use std::collections::BTreeSet;
use std::io;

use crate::layout::{PAGE_SIZE, REDO_OFFSET, REDO_SIZE};
use crate::region::Region;

const HEADER_LEN: u64 = 16;
const ENTRIES_OFFSET: u64 = REDO_OFFSET + 64;
pub(crate) const REDO_CAPACITY: usize = ((REDO_SIZE - 64) / 16) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedoKind {
    /// A self-contained allocator operation.
    Atomic,
    /// The allocator half of a committing transaction. Its
    /// presence means the transaction's undo log is obsolete.
    Commit,
}

impl RedoKind {
    fn to_raw(self) -> u32 {
        match self {
            RedoKind::Atomic => 1,
            RedoKind::Commit => 2,
        }
    }

    fn from_raw(raw: u32) -> Option<RedoKind> {
        match raw {
            1 => Some(RedoKind::Atomic),
            2 => Some(RedoKind::Commit),
            _ => None,
        }
    }
}

fn crc(count: u64, kind: u32, entries: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&count.to_le_bytes());
    hasher.update(&kind.to_le_bytes());
    hasher.update(entries);
    hasher.finalize()
}

/// Writes and flushes a record. Once this returns, the
/// stores will be applied even if we crash before `apply`.
pub(crate) fn publish(region: &Region, kind: RedoKind, stores: &[(u64, u64)]) -> io::Result<()> {
    assert!(!stores.is_empty());
    assert!(
        stores.len() <= REDO_CAPACITY,
        "redo record of {} entries exceeds capacity",
        stores.len()
    );

    let mut entries = Vec::with_capacity(stores.len() * 16);
    for (offset, value) in stores {
        entries.extend_from_slice(&offset.to_le_bytes());
        entries.extend_from_slice(&value.to_le_bytes());
    }

    region.write(ENTRIES_OFFSET, &entries);
    region.persist(ENTRIES_OFFSET, entries.len() as u64)?;

    let count = stores.len() as u64;
    let raw_kind = kind.to_raw();

    let mut header = [0_u8; HEADER_LEN as usize];
    header[0..8].copy_from_slice(&count.to_le_bytes());
    header[8..12].copy_from_slice(&raw_kind.to_le_bytes());
    header[12..16].copy_from_slice(&crc(count, raw_kind, &entries).to_le_bytes());

    region.write(REDO_OFFSET, &header);
    if let Err(e) = region.persist(REDO_OFFSET, HEADER_LEN) {
        // the caller treats this as not published, so the
        // mapping must not say otherwise
        region.fill(REDO_OFFSET, HEADER_LEN, 0);
        let _ = region.persist(REDO_OFFSET, HEADER_LEN);
        return Err(e);
    }

    log::trace!("published {:?} redo record of {} stores", kind, count);

    Ok(())
}

/// Performs the stores and flushes every page they touched.
pub(crate) fn apply(region: &Region, stores: &[(u64, u64)]) -> io::Result<()> {
    let mut pages = BTreeSet::new();
    for (offset, value) in stores {
        region.store_u64(*offset, *value);
        pages.insert(offset / PAGE_SIZE);
    }

    // coalesce adjacent pages into single flushes
    let mut pages = pages.into_iter().peekable();
    while let Some(first) = pages.next() {
        let mut last = first;
        while pages.peek() == Some(&(last + 1)) {
            last = pages.next().unwrap();
        }
        region.persist(first * PAGE_SIZE, (last - first + 1) * PAGE_SIZE)?;
    }

    Ok(())
}

pub(crate) fn clear(region: &Region) -> io::Result<()> {
    region.fill(REDO_OFFSET, HEADER_LEN, 0);
    region.persist(REDO_OFFSET, HEADER_LEN)
}

/// Reads back a committed record, if one survived. A torn
/// or partially written record is indistinguishable from no
/// record at all.
pub(crate) fn recover(region: &Region, metadata_end: u64) -> Option<(RedoKind, Vec<(u64, u64)>)> {
    let header = region.read_vec(REDO_OFFSET, HEADER_LEN);
    let count = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let raw_kind = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let expected_crc = u32::from_le_bytes(header[12..16].try_into().unwrap());

    if count == 0 {
        return None;
    }

    if count > REDO_CAPACITY as u64 {
        log::warn!("ignoring redo header with impossible count {}", count);
        return None;
    }

    let entries = region.read_vec(ENTRIES_OFFSET, count * 16);
    let actual_crc = crc(count, raw_kind, &entries);
    if actual_crc != expected_crc {
        log::debug!(
            "ignoring torn redo record, expected crc {} but got {}",
            expected_crc,
            actual_crc
        );
        return None;
    }

    let kind = RedoKind::from_raw(raw_kind)?;

    let mut stores = Vec::with_capacity(count as usize);
    for entry in entries.chunks(16) {
        let offset = u64::from_le_bytes(entry[..8].try_into().unwrap());
        let value = u64::from_le_bytes(entry[8..].try_into().unwrap());
        if offset % 8 != 0 || offset.saturating_add(8) > metadata_end {
            log::error!("redo record stores outside of allocator metadata at {}", offset);
            return None;
        }
        stores.push((offset, value));
    }

    Some((kind, stores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::UNDO_OFFSET;

    fn region() -> (tempfile::TempDir, Region) {
        let dir = tempfile::tempdir().unwrap();
        let region = Region::create(&dir.path().join("redo"), 1 << 20).unwrap();
        (dir, region)
    }

    #[test]
    fn published_record_is_recovered_until_cleared() {
        let (_dir, region) = region();
        let metadata_end = 1 << 20;

        assert!(recover(&region, metadata_end).is_none());

        let stores = [(UNDO_OFFSET + 8, 7), (UNDO_OFFSET + 4096 * 3, 9)];
        publish(&region, RedoKind::Commit, &stores).unwrap();

        let (kind, recovered) = recover(&region, metadata_end).unwrap();
        assert_eq!(kind, RedoKind::Commit);
        assert_eq!(recovered, stores);

        apply(&region, &recovered).unwrap();
        assert_eq!(region.load_u64(UNDO_OFFSET + 8), 7);
        assert_eq!(region.load_u64(UNDO_OFFSET + 4096 * 3), 9);

        clear(&region).unwrap();
        assert!(recover(&region, metadata_end).is_none());
    }

    #[test]
    fn torn_record_is_ignored() {
        let (_dir, region) = region();

        publish(&region, RedoKind::Atomic, &[(UNDO_OFFSET, 1)]).unwrap();

        // corrupt the single entry's value after the header went out
        region.store_u64(ENTRIES_OFFSET + 8, 2);
        assert!(recover(&region, 1 << 20).is_none());
    }
}
