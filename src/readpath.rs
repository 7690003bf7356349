use std::ptr::NonNull;

use crate::heap::Reservation;
use crate::layout::ROOT_OFFSET;
use crate::{AllocationClass, ClassId, Error, Handle, Pool, Result};

impl Pool {
    pub(crate) fn check_identity(&self, handle: Handle) -> Result<()> {
        if handle.pool() != self.id {
            return Err(Error::invalid_offset(
                handle.offset(),
                "handle belongs to a different pool",
            ));
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, handle: Handle) -> Result<Reservation> {
        self.check_identity(handle)?;
        self.heap.lock().resolve(&self.region, handle.offset())
    }

    /// Checks that `at..at + len` lies inside of the usable
    /// bytes of `handle` and returns the pool offset of `at`.
    pub(crate) fn checked_range(&self, handle: Handle, at: u64, len: u64) -> Result<u64> {
        let usable = self.resolve(handle)?.usable;

        match at.checked_add(len) {
            Some(end) if end <= usable => Ok(handle.offset() + at),
            _ => Err(Error::invalid_offset(
                handle.offset().saturating_add(at),
                "range extends past the end of the allocation",
            )),
        }
    }

    /// The registered class with this id, if any.
    pub fn allocation_class(&self, id: ClassId) -> Option<AllocationClass> {
        self.heap.lock().classes().get(id).copied()
    }

    /// The value of the root record. Zero until first set.
    pub fn root(&self) -> u64 {
        self.region.load_u64(ROOT_OFFSET)
    }

    /// Turns an offset read back out of the pool into a handle,
    /// after checking that a live allocation starts there.
    pub fn handle(&self, offset: u64) -> Result<Handle> {
        let handle = Handle::new(self.id, offset);
        self.resolve(handle)?;
        Ok(handle)
    }

    /// The address of the first usable byte of `handle` in this
    /// process. It is only valid while the pool stays open.
    pub fn direct_address(&self, handle: Handle) -> Result<NonNull<u8>> {
        self.resolve(handle)?;
        NonNull::new(self.region.ptr(handle.offset()))
            .ok_or_else(|| Error::invalid_offset(handle.offset(), "null mapping"))
    }

    /// The inverse of `direct_address`.
    #[doc(alias = "to_offset")]
    pub fn to_handle(&self, address: *const u8) -> Result<Handle> {
        let offset = self.region.offset_of(address).ok_or_else(|| {
            Error::invalid_offset(address as u64, "address is outside of this pool's mapping")
        })?;
        self.handle(offset)
    }

    /// The number of bytes that may be used in the block, which
    /// is at least what was requested when allocating it.
    pub fn usable_size(&self, handle: Handle) -> Result<u64> {
        Ok(self.resolve(handle)?.usable)
    }

    /// The size originally requested for blocks of classes with
    /// a `HeaderKind::Size` header, and the usable size for all
    /// others.
    pub fn allocated_size(&self, handle: Handle) -> Result<u64> {
        let reservation = self.resolve(handle)?;
        if reservation.header.len() == 0 {
            return Ok(reservation.usable);
        }

        let mut buf = [0; 8];
        self.region.read(reservation.start, &mut buf);
        Ok(u64::from_le_bytes(buf))
    }

    /// Copies bytes out of the block, starting `at` bytes in.
    pub fn read(&self, handle: Handle, at: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.checked_range(handle, at, buf.len() as u64)?;
        self.region.read(offset, buf);
        Ok(())
    }

    pub fn read_u64(&self, handle: Handle, at: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read(handle, at, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u32(&self, handle: Handle, at: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.read(handle, at, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u16(&self, handle: Handle, at: u64) -> Result<u16> {
        let mut buf = [0; 2];
        self.read(handle, at, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u8(&self, handle: Handle, at: u64) -> Result<u8> {
        let mut buf = [0; 1];
        self.read(handle, at, &mut buf)?;
        Ok(buf[0])
    }
}
