//! On-media layout of a pool file.
//!
//! ```txt
//! 0        header page (magic, version, identity, size, layout tag, crc)
//! 4096     root record (64 bytes), class table (128 x 16 bytes)
//! 8192     redo log (allocator metadata)
//! 73728    undo log (`Config::undo_log_size`)
//! ...      chunk table, one u64 per chunk
//! ...      heap, page aligned, `chunk_count` chunks of `CHUNK_SIZE`
//! ```
//!
//! Everything is little-endian.

use crate::ClassId;

pub(crate) const PAGE_SIZE: u64 = 4096;

/// Heap chunks are bound either to a single allocation
/// class or to one multi-chunk run.
pub(crate) const CHUNK_SIZE: u64 = 256 * 1024;

/// The smallest pool that `create` will accept.
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// The smallest undo log a pool may be configured with.
pub const MIN_UNDO_LOG_SIZE: u64 = 64 * 1024;

/// Longest accepted layout tag, in bytes.
pub const MAX_LAYOUT_LEN: usize = 255;

pub(crate) const MAGIC: [u8; 8] = *b"pmheap\0\x01";
pub(crate) const FORMAT_VERSION: u64 = 1100;
pub(crate) const MIN_FORMAT_VERSION: u64 = 900;

pub(crate) const ROOT_OFFSET: u64 = PAGE_SIZE;
pub(crate) const ROOT_SIZE: u64 = 64;
pub(crate) const ROOT_VERSION_OFFSET: u64 = ROOT_OFFSET + 8;

pub(crate) const CLASS_TABLE_OFFSET: u64 = ROOT_OFFSET + ROOT_SIZE;
pub(crate) const CLASS_ENTRY_SIZE: u64 = 16;
pub(crate) const MAX_CLASSES: usize = 128;

pub(crate) const REDO_OFFSET: u64 = 2 * PAGE_SIZE;
pub(crate) const REDO_SIZE: u64 = 64 * 1024;
pub(crate) const UNDO_OFFSET: u64 = REDO_OFFSET + REDO_SIZE;

const HEADER_CRC_OFFSET: usize = 312;
pub(crate) const HEADER_LEN: usize = HEADER_CRC_OFFSET + 4;

pub(crate) const fn align_up(value: u64, to: u64) -> u64 {
    (value + to - 1) / to * to
}

/// The first page of every pool. It is written once, last,
/// during creation, and is read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolHeader {
    pub version: u64,
    pub pool_id: u64,
    pub pool_size: u64,
    pub undo_log_size: u64,
    pub created_at: u64,
    pub layout: String,
}

impl PoolHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0_u8; HEADER_LEN];
        let layout = self.layout.as_bytes();
        assert!(layout.len() <= MAX_LAYOUT_LEN);

        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pool_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.pool_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.undo_log_size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.created_at.to_le_bytes());
        buf[48..50].copy_from_slice(&(layout.len() as u16).to_le_bytes());
        buf[50..50 + layout.len()].copy_from_slice(layout);

        let crc = crc32fast::hash(&buf[..HEADER_CRC_OFFSET]);
        buf[HEADER_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());

        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<PoolHeader, &'static str> {
        if buf[0..8] != MAGIC {
            return Err("bad magic, not a pool file");
        }

        let expected_crc = u32::from_le_bytes(buf[HEADER_CRC_OFFSET..].try_into().unwrap());
        let actual_crc = crc32fast::hash(&buf[..HEADER_CRC_OFFSET]);
        if expected_crc != actual_crc {
            return Err("pool header crc mismatch");
        }

        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());

        let version = u64_at(8);
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err("unsupported pool format version");
        }

        let layout_len = u16::from_le_bytes(buf[48..50].try_into().unwrap()) as usize;
        if layout_len > MAX_LAYOUT_LEN {
            return Err("layout tag length out of range");
        }
        let layout = std::str::from_utf8(&buf[50..50 + layout_len])
            .map_err(|_| "layout tag is not utf-8")?
            .to_owned();

        Ok(PoolHeader {
            version,
            pool_id: u64_at(16),
            pool_size: u64_at(24),
            undo_log_size: u64_at(32),
            created_at: u64_at(40),
            layout,
        })
    }
}

/// Offsets of every area, derived from the pool size and the
/// undo log size recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub pool_size: u64,
    pub undo_offset: u64,
    pub undo_size: u64,
    pub chunk_table_offset: u64,
    pub chunk_count: u32,
    pub heap_offset: u64,
}

impl Layout {
    /// Returns `None` if not even a single chunk fits.
    pub fn new(pool_size: u64, undo_size: u64) -> Option<Layout> {
        if undo_size < MIN_UNDO_LOG_SIZE || undo_size % PAGE_SIZE != 0 {
            return None;
        }

        let chunk_table_offset = UNDO_OFFSET.checked_add(undo_size)?;
        let remaining = pool_size.checked_sub(chunk_table_offset)?;

        let fits = |n: u64| align_up(chunk_table_offset + n * 8, PAGE_SIZE) + n * CHUNK_SIZE <= pool_size;

        let mut chunk_count = (remaining / (CHUNK_SIZE + 8)).min(u64::from(u32::MAX));
        while chunk_count > 0 && !fits(chunk_count) {
            chunk_count -= 1;
        }

        if chunk_count == 0 {
            return None;
        }

        Some(Layout {
            pool_size,
            undo_offset: UNDO_OFFSET,
            undo_size,
            chunk_table_offset,
            chunk_count: chunk_count as u32,
            heap_offset: align_up(chunk_table_offset + chunk_count * 8, PAGE_SIZE),
        })
    }

    pub fn heap_end(&self) -> u64 {
        self.heap_offset + u64::from(self.chunk_count) * CHUNK_SIZE
    }

    pub fn chunk_base(&self, chunk: u32) -> u64 {
        debug_assert!(chunk < self.chunk_count);
        self.heap_offset + u64::from(chunk) * CHUNK_SIZE
    }

    pub fn chunk_entry(&self, chunk: u32) -> u64 {
        debug_assert!(chunk < self.chunk_count);
        self.chunk_table_offset + u64::from(chunk) * 8
    }

    /// The chunk containing `offset`, if it lies in the heap.
    pub fn chunk_of(&self, offset: u64) -> Option<u32> {
        if offset < self.heap_offset || offset >= self.heap_end() {
            return None;
        }
        Some(((offset - self.heap_offset) / CHUNK_SIZE) as u32)
    }

    pub fn class_entry(&self, class: ClassId) -> u64 {
        CLASS_TABLE_OFFSET + u64::from(class.get()) * CLASS_ENTRY_SIZE
    }
}

/// Persistent state of one chunk, stored as a tagged `u64`
/// in the chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    Free,
    Class(ClassId),
    RunHead { chunks: u32 },
    RunTail { head: u32 },
}

const TAG_FREE: u64 = 0;
const TAG_CLASS: u64 = 1;
const TAG_RUN_HEAD: u64 = 2;
const TAG_RUN_TAIL: u64 = 3;

impl ChunkKind {
    pub fn to_raw(self) -> u64 {
        match self {
            ChunkKind::Free => TAG_FREE,
            ChunkKind::Class(class) => TAG_CLASS | (u64::from(class.get()) << 8),
            ChunkKind::RunHead { chunks } => TAG_RUN_HEAD | (u64::from(chunks) << 32),
            ChunkKind::RunTail { head } => TAG_RUN_TAIL | (u64::from(head) << 32),
        }
    }

    pub fn from_raw(raw: u64) -> Option<ChunkKind> {
        let payload = (raw >> 32) as u32;
        match raw & 0xff {
            TAG_FREE if raw == 0 => Some(ChunkKind::Free),
            TAG_CLASS => Some(ChunkKind::Class(ClassId::new((raw >> 8) as u8))),
            TAG_RUN_HEAD if payload > 0 => Some(ChunkKind::RunHead { chunks: payload }),
            TAG_RUN_TAIL => Some(ChunkKind::RunTail { head: payload }),
            _ => None,
        }
    }
}
