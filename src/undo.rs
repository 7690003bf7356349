//! The undo log holds pre-images of every range a transaction
//! registered. Entries belong to a generation; bumping the
//! generation in the log header discards every entry at once,
//! which is the commit point of a transaction without
//! allocator changes.
//!
//! ```txt
//! header (64 bytes)
//!   +0   generation: u64
//! entry
//!   +0   generation: u64
//!   +8   offset: u64
//!   +16  len: u64
//!   +24  crc32(generation, offset, len, data): u32
//!   +28  padding: u32
//!   +32  data, padded to a multiple of 8
//! ```

use std::io;

use crate::layout::{align_up, Layout};
use crate::region::Region;
use crate::{Error, Result};

const ENTRIES_START: u64 = 64;
const ENTRY_HEADER_LEN: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    // pool offset of the logged range
    offset: u64,
    len: u64,
    // pool offset of the pre-image
    data: u64,
}

fn crc(generation: u64, offset: u64, len: u64, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&generation.to_le_bytes());
    hasher.update(&offset.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug)]
pub(crate) struct UndoLog {
    area: u64,
    size: u64,
    generation: u64,
    tail: u64,
    entries: Vec<Entry>,
    pub bytes_logged: u64,
}

impl UndoLog {
    /// Writes the initial header of a freshly created pool.
    pub fn format(region: &Region, layout: &Layout) -> io::Result<()> {
        region.store_u64(layout.undo_offset, 1);
        region.persist(layout.undo_offset, 8)
    }

    /// Deals with whatever transaction was in flight when the
    /// pool was last closed or crashed. Its pre-images are
    /// restored if `rollback` is set, and discarded either way.
    /// Returns the number of ranges found in the log.
    pub fn recover(region: &Region, layout: &Layout, rollback: bool) -> io::Result<(UndoLog, usize)> {
        let mut log = UndoLog {
            area: layout.undo_offset,
            size: layout.undo_size,
            generation: region.load_u64(layout.undo_offset),
            tail: ENTRIES_START,
            entries: vec![],
            bytes_logged: 0,
        };

        log.entries = log.scan(region);
        let found = log.entries.len();

        if found > 0 {
            if rollback {
                log::warn!(
                    "rolling back interrupted transaction of {} ranges in generation {}",
                    found,
                    log.generation
                );
                log.replay(region)?;
            } else {
                log::debug!("discarding undo log of committed transaction");
            }
            log.discard(region)?;
        }

        Ok((log, found))
    }

    fn scan(&self, region: &Region) -> Vec<Entry> {
        let mut entries = vec![];
        let mut position = ENTRIES_START;

        while position + ENTRY_HEADER_LEN <= self.size {
            let at = self.area + position;
            let header = region.read_vec(at, ENTRY_HEADER_LEN);
            let u64_at = |i: usize| u64::from_le_bytes(header[i..i + 8].try_into().unwrap());

            let generation = u64_at(0);
            let offset = u64_at(8);
            let len = u64_at(16);
            let expected_crc = u32::from_le_bytes(header[24..28].try_into().unwrap());

            if generation != self.generation
                || len > self.size - position - ENTRY_HEADER_LEN
                || !region.contains(offset, len)
            {
                break;
            }

            let data = at + ENTRY_HEADER_LEN;
            let actual_crc = crc(generation, offset, len, &region.read_vec(data, len));
            if actual_crc != expected_crc {
                log::debug!("undo scan stopped at torn entry at offset {}", at);
                break;
            }

            entries.push(Entry { offset, len, data });
            position += ENTRY_HEADER_LEN + align_up(len, 8);
        }

        entries
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every range logged in the current generation.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().map(|e| (e.offset, e.len))
    }

    fn covers(&self, offset: u64, len: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.offset <= offset && offset + len <= e.offset + e.len)
    }

    /// Captures and flushes the current contents of the range.
    /// Returns `false` when the range was already covered by
    /// an earlier entry and nothing was logged.
    pub fn append(&mut self, region: &Region, offset: u64, len: u64) -> Result<bool> {
        if len == 0 || self.covers(offset, len) {
            return Ok(false);
        }

        let needed = ENTRY_HEADER_LEN + align_up(len, 8);
        let available = self.size - self.tail;
        if needed > available {
            return Err(Error::LogExhausted {
                log: "undo",
                needed,
                available,
            });
        }

        let pre_image = region.read_vec(offset, len);

        let mut header = [0_u8; ENTRY_HEADER_LEN as usize];
        header[0..8].copy_from_slice(&self.generation.to_le_bytes());
        header[8..16].copy_from_slice(&offset.to_le_bytes());
        header[16..24].copy_from_slice(&len.to_le_bytes());
        header[24..28].copy_from_slice(&crc(self.generation, offset, len, &pre_image).to_le_bytes());

        let at = self.area + self.tail;
        region.write(at, &header);
        region.write(at + ENTRY_HEADER_LEN, &pre_image);
        region.persist(at, ENTRY_HEADER_LEN + len)?;

        self.entries.push(Entry {
            offset,
            len,
            data: at + ENTRY_HEADER_LEN,
        });
        self.tail += needed;
        self.bytes_logged += len;

        log::trace!("logged pre-image of {}+{}", offset, len);

        Ok(true)
    }

    /// Restores every pre-image, newest first, and then
    /// flushes the restored ranges.
    pub fn replay(&self, region: &Region) -> io::Result<()> {
        for entry in self.entries.iter().rev() {
            region.copy_within(entry.data, entry.offset, entry.len);
        }
        for entry in &self.entries {
            region.persist(entry.offset, entry.len)?;
        }
        Ok(())
    }

    /// Flushes the log header again, after a `discard` whose
    /// flush failed.
    pub fn persist_header(&self, region: &Region) -> io::Result<()> {
        region.persist(self.area, 8)
    }

    /// Invalidates every entry by moving to the next generation.
    pub fn discard(&mut self, region: &Region) -> io::Result<()> {
        self.generation += 1;
        self.tail = ENTRIES_START;
        self.entries.clear();

        region.store_u64(self.area, self.generation);
        region.persist(self.area, 8)
    }
}
