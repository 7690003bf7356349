use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use fault_injection::{annotate, fallible};
use memmap2::{MmapMut, MmapOptions};

/// A pool file mapped shared and read-write into this
/// process. All offsets handed to a `Region` are
/// pool-relative and checked against the mapping length;
/// going out of bounds is a bug in the caller and panics.
pub(crate) struct Region {
    path: PathBuf,
    // held for its advisory lock
    _file: File,
    pub(crate) mmap: MmapMut,
    base: *mut u8,
    len: u64,
    pub(crate) flushes: AtomicU64,
}

// The mapping is only ever accessed through raw pointers
// derived from `base`, and all metadata mutation is
// serialized by the owning `Pool`'s locks.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.path)
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

impl Region {
    /// Exclusively creates a new zeroed file of `size` bytes
    /// and maps it. Fails with `AlreadyExists` if anything
    /// is present at `path`.
    pub fn create(path: &Path, size: u64) -> io::Result<Region> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);

        let file = fallible!(options.open(path));

        let mapped = Region::lock_and_size(path, file, size);

        if mapped.is_err() {
            // a file we created but could not size is not a pool
            let _ = std::fs::remove_file(path);
        }

        mapped
    }

    fn lock_and_size(path: &Path, file: File, size: u64) -> io::Result<Region> {
        fallible!(fs2::FileExt::try_lock_exclusive(&file));
        fallible!(file.set_len(size));
        Region::map(path, file, size)
    }

    pub fn open(path: &Path) -> io::Result<Region> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);

        let file = fallible!(options.open(path));
        fallible!(fs2::FileExt::try_lock_exclusive(&file));
        let len = fallible!(file.metadata()).len();

        Region::map(path, file, len)
    }

    fn map(path: &Path, file: File, len: u64) -> io::Result<Region> {
        let map_len = usize::try_from(len).map_err(|_| {
            annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pool file is larger than the address space"
            ))
        })?;

        let mut mmap = fallible!(unsafe { MmapOptions::new().len(map_len).map_mut(&file) });
        let base = mmap.as_mut_ptr();

        log::debug!("mapped {} bytes of {:?} at {:?}", len, path, base);

        Ok(Region {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            base,
            len,
            flushes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.len)
    }

    /// Translates an address into a pool-relative offset
    /// if it lies inside of this mapping.
    pub fn offset_of(&self, address: *const u8) -> Option<u64> {
        let address = address as usize;
        let base = self.base as usize;
        if address < base || address - base >= self.len as usize {
            return None;
        }
        Some((address - base) as u64)
    }

    fn check(&self, offset: u64, len: u64) {
        assert!(
            self.contains(offset, len),
            "range {}+{} is outside of the {} byte mapping",
            offset,
            len,
            self.len
        );
    }

    pub fn ptr(&self, offset: u64) -> *mut u8 {
        self.check(offset, 0);
        unsafe { self.base.add(offset as usize) }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        self.check(offset, buf.len() as u64);
        unsafe {
            ptr::copy_nonoverlapping(self.ptr(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    pub fn read_vec(&self, offset: u64, len: u64) -> Vec<u8> {
        let mut buf = vec![0; len as usize];
        self.read(offset, &mut buf);
        buf
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) {
        self.check(offset, bytes.len() as u64);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(offset), bytes.len());
        }
    }

    pub fn fill(&self, offset: u64, len: u64, byte: u8) {
        self.check(offset, len);
        unsafe {
            ptr::write_bytes(self.ptr(offset), byte, len as usize);
        }
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may
    /// overlap.
    pub fn copy_within(&self, src: u64, dst: u64, len: u64) {
        self.check(src, len);
        self.check(dst, len);
        unsafe {
            ptr::copy(self.ptr(src), self.ptr(dst), len as usize);
        }
    }

    fn word(&self, offset: u64) -> &AtomicU64 {
        assert_eq!(offset % 8, 0, "metadata words must be 8-byte aligned");
        self.check(offset, 8);
        unsafe { &*(self.ptr(offset) as *const AtomicU64) }
    }

    /// Loads an aligned metadata word.
    pub fn load_u64(&self, offset: u64) -> u64 {
        u64::from_le(self.word(offset).load(Ordering::Acquire))
    }

    /// Stores an aligned metadata word with a single 8-byte
    /// store, so it can never be observed torn after a crash.
    pub fn store_u64(&self, offset: u64, value: u64) {
        self.word(offset).store(value.to_le(), Ordering::Release)
    }

    /// # Safety
    ///
    /// The caller must guarantee that nothing else reads or
    /// writes the range for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: u64, len: u64) -> &mut [u8] {
        self.check(offset, len);
        std::slice::from_raw_parts_mut(self.ptr(offset), len as usize)
    }
}
