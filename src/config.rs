use std::path::PathBuf;

use crate::class::{MAX_UNIT_SIZE, MIN_UNIT_SIZE};
use crate::layout::{Layout, MAX_LAYOUT_LEN, MIN_POOL_SIZE, MIN_UNDO_LOG_SIZE, PAGE_SIZE};
use crate::{Error, HeaderKind, Result};

/// Configuration for creating and opening a `Pool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The pool file.
    pub path: PathBuf,
    /// Total size of the pool file when it is created. A
    /// pool never grows, and this is ignored when opening
    /// an existing pool.
    pub size: u64,
    /// A tag identifying what kind of data the pool holds.
    /// Opening a pool that was created with a different tag
    /// fails.
    pub layout: String,
    /// Bytes set aside at creation for pre-images of ranges
    /// registered in a transaction. This bounds how much a
    /// single transaction can modify. Must be a multiple of
    /// 4096 and at least 64k.
    pub undo_log_size: u64,
    /// Allocation classes `(unit_size, header)` to register on
    /// every open. Registration is idempotent, so the same
    /// list yields the same `ClassId`s every time, in order.
    pub classes: Vec<(u64, HeaderKind)>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: "".into(),
            size: 64 * 1024 * 1024,
            layout: "pmheap".into(),
            undo_log_size: 1024 * 1024,
            classes: vec![],
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.size < MIN_POOL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Config's size must be at least {} bytes",
                MIN_POOL_SIZE
            )));
        }

        if self.layout.len() > MAX_LAYOUT_LEN {
            return Err(Error::InvalidConfig(format!(
                "Config's layout must be at most {} bytes",
                MAX_LAYOUT_LEN
            )));
        }

        if self.undo_log_size < MIN_UNDO_LOG_SIZE || self.undo_log_size % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "Config's undo_log_size must be a multiple of {} and at least {}",
                PAGE_SIZE, MIN_UNDO_LOG_SIZE
            )));
        }

        if Layout::new(self.size, self.undo_log_size).is_none() {
            return Err(Error::InvalidConfig(
                "Config's undo_log_size leaves no room for the heap".into(),
            ));
        }

        for (unit_size, header) in &self.classes {
            if !(MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(unit_size) || *unit_size <= header.len() {
                return Err(Error::InvalidConfig(format!(
                    "Config's classes contain an unsupported unit size of {}",
                    unit_size
                )));
            }
        }

        Ok(())
    }
}
