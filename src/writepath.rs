use crate::layout::ROOT_OFFSET;
use crate::{ClassId, Handle, HeaderKind, Pool, Result};

impl Pool {
    /// Allocates a block of at least `size` bytes, outside of
    /// any transaction. The allocation is durable once this
    /// returns, and a crash can never leave it half done.
    ///
    /// `ClassId::DEFAULT` picks the smallest fitting class and
    /// always zero-fills. Requests larger than every class get
    /// a run of whole chunks.
    pub fn allocate(&self, size: u64, class: ClassId, zero_fill: bool) -> Result<Handle> {
        let zero = zero_fill || class == ClassId::DEFAULT;

        let mut heap = self.heap.lock();
        let reservation = heap.reserve(&self.region, size, class)?;
        heap.prepare(&self.region, &reservation, size, zero);

        let dirty = if zero {
            reservation.len
        } else {
            reservation.header.len()
        };

        if let Err(e) = self.region.persist(reservation.start, dirty) {
            heap.cancel(&[reservation], &[]);
            return Err(e.into());
        }

        heap.publish_atomically(&self.region, &[reservation], &[])?;

        log::trace!(
            "allocated {} bytes at {} in pool {}",
            reservation.usable,
            reservation.offset,
            self.id
        );

        Ok(Handle::new(self.id, reservation.offset))
    }

    /// Frees a block outside of any transaction. Fails with
    /// `Error::InvalidOffsetOrAddress` without changing
    /// anything if `handle` is not a live allocation of this
    /// pool.
    pub fn free(&self, handle: Handle) -> Result<()> {
        self.check_identity(handle)?;

        let mut heap = self.heap.lock();
        let reservation = heap.begin_free(&self.region, handle.offset())?;
        heap.publish_atomically(&self.region, &[], &[reservation])?;

        log::trace!("freed {} in pool {}", handle.offset(), self.id);

        Ok(())
    }

    /// Registers a custom allocation class, or returns the id
    /// of an identical one registered earlier.
    pub fn register_class(&self, unit_size: u64, header: HeaderKind) -> Result<ClassId> {
        self.heap.lock().register_class(&self.region, unit_size, header)
    }

    /// Durably sets the root value with a single 8-byte store.
    pub fn set_root(&self, value: u64) -> Result<()> {
        self.region.store_u64(ROOT_OFFSET, value);
        self.region.persist(ROOT_OFFSET, 8)?;
        Ok(())
    }

    /// Copies `bytes` into the block, starting `at` bytes in.
    /// Nothing is logged or flushed: this is only crash safe
    /// for blocks nobody can reach yet, or when followed by
    /// `Pool::flush` for data that tolerates torn writes.
    pub fn write(&self, handle: Handle, at: u64, bytes: &[u8]) -> Result<()> {
        let offset = self.checked_range(handle, at, bytes.len() as u64)?;
        self.region.write(offset, bytes);
        Ok(())
    }

    pub fn write_u64(&self, handle: Handle, at: u64, value: u64) -> Result<()> {
        self.write(handle, at, &value.to_le_bytes())
    }

    pub fn write_u32(&self, handle: Handle, at: u64, value: u32) -> Result<()> {
        self.write(handle, at, &value.to_le_bytes())
    }

    pub fn write_u16(&self, handle: Handle, at: u64, value: u16) -> Result<()> {
        self.write(handle, at, &value.to_le_bytes())
    }

    pub fn write_u8(&self, handle: Handle, at: u64, value: u8) -> Result<()> {
        self.write(handle, at, &[value])
    }

    pub fn fill(&self, handle: Handle, at: u64, len: u64, byte: u8) -> Result<()> {
        let offset = self.checked_range(handle, at, len)?;
        self.region.fill(offset, len, byte);
        Ok(())
    }

    /// Copies `len` bytes between two blocks of this pool, or
    /// within one. Overlapping ranges are handled.
    pub fn copy(
        &self,
        src: Handle,
        src_at: u64,
        dst: Handle,
        dst_at: u64,
        len: u64,
    ) -> Result<()> {
        let from = self.checked_range(src, src_at, len)?;
        let to = self.checked_range(dst, dst_at, len)?;
        self.region.copy_within(from, to, len);
        Ok(())
    }

    /// Makes the range durable.
    pub fn flush(&self, handle: Handle, at: u64, len: u64) -> Result<()> {
        let offset = self.checked_range(handle, at, len)?;
        self.region.persist(offset, len)?;
        Ok(())
    }
}
