use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;

use crate::class::{AllocationClass, ClassTable, HeaderKind, MAX_UNIT_SIZE, MIN_UNIT_SIZE};
use crate::layout::{ChunkKind, Layout, CHUNK_SIZE, MAX_CLASSES};
use crate::redo::{self, RedoKind, REDO_CAPACITY};
use crate::region::Region;
use crate::{ClassId, Error, Result};

/// Where a block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Unit { class: ClassId, chunk: u32, index: u32 },
    Run { first: u32, chunks: u32 },
}

/// A block that has been taken out of (or is on its way back
/// into) the free sets, but whose bitmap bit or chunk table
/// entries have not been published yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    /// Offset of the first usable byte, as handed out.
    pub offset: u64,
    /// Offset of the unit or run, header included.
    pub start: u64,
    /// Length of the unit or run, header included.
    pub len: u64,
    pub usable: u64,
    pub header: HeaderKind,
    pub slot: Slot,
}

impl Reservation {
    /// The number of redo stores that publishing this block
    /// will need, at most.
    pub fn redo_stores(&self) -> usize {
        match self.slot {
            Slot::Unit { .. } => 1,
            Slot::Run { chunks, .. } => chunks as usize,
        }
    }
}

/// The allocator. Persistent truth is the chunk table plus one
/// bitmap at the front of every class chunk; everything here
/// is a volatile index over it that `recover` rebuilds.
///
/// Every persistent change goes through a redo record, so
/// the heap never needs the undo log.
pub(crate) struct Heap {
    layout: Layout,
    classes: ClassTable,
    chunks: Vec<ChunkKind>,
    free_chunks: BTreeSet<u32>,
    free_units: Vec<BTreeSet<(u32, u32)>>,
    // keyed by `Reservation::start`
    reserved: HashMap<u64, Reservation>,
    freeing: HashSet<u64>,
    live_allocations: u64,
    live_bytes: u64,
    // a published redo record may not be fully applied or
    // cleared on media yet
    unsettled: bool,
    #[cfg(feature = "runtime_validation")]
    debug_history: crate::debug_history::DebugHistory,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("chunks", &self.chunks.len())
            .field("free_chunks", &self.free_chunks.len())
            .field("live_allocations", &self.live_allocations)
            .field("reserved", &self.reserved.len())
            .field("unsettled", &self.unsettled)
            .finish()
    }
}

impl Heap {
    /// Writes the built-in classes into a freshly created
    /// pool. The pool header has not been written yet, so
    /// no redo record is needed.
    pub fn format(region: &Region, layout: &Layout) -> io::Result<()> {
        let classes = ClassTable::builtin();
        for class in classes.iter() {
            for (offset, value) in ClassTable::entry_stores(layout, class) {
                region.store_u64(offset, value);
            }
        }
        region.persist(layout.class_entry(ClassId::DEFAULT), (MAX_CLASSES as u64) * 16)
    }

    /// Rebuilds the free sets from the chunk table and bitmaps.
    pub fn recover(region: &Region, layout: Layout) -> Result<Heap, &'static str> {
        let classes = ClassTable::recover(region, &layout)?;

        let mut heap = Heap {
            layout,
            classes,
            chunks: vec![ChunkKind::Free; layout.chunk_count as usize],
            free_chunks: BTreeSet::new(),
            free_units: vec![BTreeSet::new(); MAX_CLASSES],
            reserved: HashMap::new(),
            freeing: HashSet::new(),
            live_allocations: 0,
            live_bytes: 0,
            unsettled: false,
            #[cfg(feature = "runtime_validation")]
            debug_history: Default::default(),
        };

        let mut chunk = 0;
        while chunk < layout.chunk_count {
            let raw = region.load_u64(layout.chunk_entry(chunk));
            let kind = ChunkKind::from_raw(raw).ok_or("corrupt chunk table entry")?;

            match kind {
                ChunkKind::Free => {
                    heap.free_chunks.insert(chunk);
                    chunk += 1;
                }
                ChunkKind::Class(id) => {
                    let class = *heap
                        .classes
                        .get(id)
                        .ok_or("chunk bound to an unregistered class")?;
                    heap.chunks[chunk as usize] = kind;
                    heap.recover_class_chunk(region, &class, chunk);
                    chunk += 1;
                }
                ChunkKind::RunHead { chunks } => {
                    let end = chunk.checked_add(chunks).ok_or("run overflows the heap")?;
                    if end > layout.chunk_count {
                        return Err("run overflows the heap");
                    }
                    heap.chunks[chunk as usize] = kind;
                    for tail in chunk + 1..end {
                        let raw = region.load_u64(layout.chunk_entry(tail));
                        if ChunkKind::from_raw(raw) != Some(ChunkKind::RunTail { head: chunk }) {
                            return Err("run head without matching tails");
                        }
                        heap.chunks[tail as usize] = ChunkKind::RunTail { head: chunk };
                    }
                    heap.live_allocations += 1;
                    heap.live_bytes += u64::from(chunks) * CHUNK_SIZE;
                    #[cfg(feature = "runtime_validation")]
                    heap.debug_history
                        .mark_alloc(layout.chunk_base(chunk), u64::from(chunks) * CHUNK_SIZE);
                    chunk = end;
                }
                ChunkKind::RunTail { .. } => return Err("run tail without a head"),
            }
        }

        log::debug!(
            "recovered heap with {} live allocations, {} of {} chunks free",
            heap.live_allocations,
            heap.free_chunks.len(),
            layout.chunk_count
        );

        Ok(heap)
    }

    fn recover_class_chunk(&mut self, region: &Region, class: &AllocationClass, chunk: u32) {
        let base = self.layout.chunk_base(chunk);
        let free = &mut self.free_units[usize::from(class.id.get())];

        for word_index in 0..class.bitmap_words() {
            let word = region.load_u64(base + word_index * 8);
            let first = (word_index * 64) as u32;
            let last = (first + 64).min(class.units_per_chunk);
            for index in first..last {
                if word & (1 << (index - first)) == 0 {
                    free.insert((chunk, index));
                } else {
                    self.live_allocations += 1;
                    self.live_bytes += class.usable_size();
                    #[cfg(feature = "runtime_validation")]
                    self.debug_history
                        .mark_alloc(class.unit_offset(base, index), class.unit_size);
                }
            }
        }
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    #[cfg(test)]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Registers a custom class, or returns the id of an
    /// identical one registered earlier.
    pub fn register_class(
        &mut self,
        region: &Region,
        unit_size: u64,
        header: HeaderKind,
    ) -> Result<ClassId> {
        if !(MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(&unit_size) || unit_size <= header.len() {
            return Err(Error::AllocationClass(format!(
                "unit size {} is outside of the supported range {}..={}",
                unit_size, MIN_UNIT_SIZE, MAX_UNIT_SIZE
            )));
        }

        if let Some(existing) = self.classes.find_custom(unit_size, header) {
            return Ok(existing);
        }

        let id = self.classes.next_custom_id().ok_or_else(|| {
            Error::AllocationClass("no room left in the class table".to_owned())
        })?;

        let class = AllocationClass::new(id, unit_size, header);
        self.execute(region, &ClassTable::entry_stores(&self.layout, &class))?;
        self.classes.insert(class);

        log::debug!(
            "registered class {:?} with unit size {} and {:?} header, {} units per chunk",
            id,
            unit_size,
            header,
            class.units_per_chunk
        );

        Ok(id)
    }

    /// Takes a block out of the free sets. Nothing becomes
    /// allocated on media until the reservation is published.
    pub fn reserve(&mut self, region: &Region, size: u64, class: ClassId) -> Result<Reservation> {
        if size == 0 {
            return Err(Error::InvalidAllocationSize {
                size,
                class,
                reason: "zero-sized allocations are not supported",
            });
        }

        let chosen = if class == ClassId::DEFAULT {
            self.classes.select(size).copied()
        } else {
            let chosen = *self.classes.get(class).ok_or_else(|| {
                Error::AllocationClass(format!("class {} is not registered", class.get()))
            })?;
            if size > chosen.usable_size() {
                return Err(Error::InvalidAllocationSize {
                    size,
                    class,
                    reason: "larger than the usable size of the class",
                });
            }
            Some(chosen)
        };

        let reservation = match chosen {
            Some(chosen) => self.reserve_unit(region, &chosen, size)?,
            None => self.reserve_run(size)?,
        };

        self.reserved.insert(reservation.start, reservation);

        log::trace!(
            "reserved {} bytes at {} for a request of {} in class {:?}",
            reservation.len,
            reservation.offset,
            size,
            class
        );

        Ok(reservation)
    }

    fn reserve_unit(&mut self, region: &Region, class: &AllocationClass, size: u64) -> Result<Reservation> {
        let id = class.id;
        if self.free_units[usize::from(id.get())].is_empty() {
            self.carve(region, class, size)?;
        }

        let (chunk, index) = self.free_units[usize::from(id.get())]
            .pop_first()
            .ok_or(Error::OutOfSpace { requested: size })?;

        let start = class.unit_offset(self.layout.chunk_base(chunk), index);

        Ok(Reservation {
            offset: start + class.header.len(),
            start,
            len: class.unit_size,
            usable: class.usable_size(),
            header: class.header,
            slot: Slot::Unit {
                class: id,
                chunk,
                index,
            },
        })
    }

    /// Binds the lowest free chunk to `class`. This is
    /// published on its own and survives an abort of the
    /// transaction that triggered it.
    fn carve(&mut self, region: &Region, class: &AllocationClass, size: u64) -> Result<()> {
        let chunk = self
            .free_chunks
            .first()
            .copied()
            .ok_or(Error::OutOfSpace { requested: size })?;

        let base = self.layout.chunk_base(chunk);
        let bitmap_len = class.bitmap_words() * 8;

        // a chunk that used to back a run may hold anything
        region.fill(base, bitmap_len, 0);
        region.persist(base, bitmap_len)?;

        let kind = ChunkKind::Class(class.id);
        self.execute(region, &[(self.layout.chunk_entry(chunk), kind.to_raw())])?;

        self.free_chunks.remove(&chunk);
        self.chunks[chunk as usize] = kind;
        self.free_units[usize::from(class.id.get())]
            .extend((0..class.units_per_chunk).map(|index| (chunk, index)));

        log::debug!("carved chunk {} for class {:?}", chunk, class.id);

        Ok(())
    }

    fn reserve_run(&mut self, size: u64) -> Result<Reservation> {
        let needed = size.div_ceil(CHUNK_SIZE);

        if needed > REDO_CAPACITY as u64 {
            return Err(Error::LogExhausted {
                log: "redo",
                needed: needed * 16,
                available: REDO_CAPACITY as u64 * 16,
            });
        }
        let needed = needed as u32;

        // lowest-addressed run of `needed` contiguous free chunks
        let mut first = None;
        let mut run_start = 0;
        let mut run_len = 0;
        for chunk in &self.free_chunks {
            if run_len > 0 && *chunk == run_start + run_len {
                run_len += 1;
            } else {
                run_start = *chunk;
                run_len = 1;
            }
            if run_len == needed {
                first = Some(run_start);
                break;
            }
        }

        let first = first.ok_or(Error::OutOfSpace { requested: size })?;
        for chunk in first..first + needed {
            self.free_chunks.remove(&chunk);
        }

        let start = self.layout.chunk_base(first);
        let len = u64::from(needed) * CHUNK_SIZE;

        Ok(Reservation {
            offset: start,
            start,
            len,
            usable: len,
            header: HeaderKind::None,
            slot: Slot::Run {
                first,
                chunks: needed,
            },
        })
    }

    /// Zeroes and stamps a reserved block. Flushing is up to
    /// the caller.
    pub fn prepare(&self, region: &Region, reservation: &Reservation, requested: u64, zero: bool) {
        if zero {
            region.fill(reservation.offset, reservation.usable, 0);
        }
        if reservation.header == HeaderKind::Size {
            region.write(reservation.start, &requested.to_le_bytes());
        }
    }

    /// Looks up the live allocation starting at `offset`.
    /// Blocks reserved by an in-flight transaction count as
    /// live for that purpose.
    pub fn resolve(&self, region: &Region, offset: u64) -> Result<Reservation> {
        let chunk = self
            .layout
            .chunk_of(offset)
            .ok_or_else(|| Error::invalid_offset(offset, "not inside the heap"))?;

        match self.chunks[chunk as usize] {
            ChunkKind::Class(id) => {
                let class = self
                    .classes
                    .get(id)
                    .ok_or_else(|| Error::invalid_offset(offset, "chunk has no class"))?;
                let base = self.layout.chunk_base(chunk);
                let start = offset
                    .checked_sub(class.header.len())
                    .ok_or_else(|| Error::invalid_offset(offset, "not the start of an allocation"))?;
                let index = class
                    .unit_index(base, start)
                    .ok_or_else(|| Error::invalid_offset(offset, "not the start of an allocation"))?;

                if let Some(reservation) = self.reserved.get(&start) {
                    return Ok(*reservation);
                }

                let word = region.load_u64(base + u64::from(index / 64) * 8);
                if word & (1 << (index % 64)) == 0 {
                    return Err(Error::invalid_offset(offset, "not a live allocation"));
                }

                Ok(Reservation {
                    offset,
                    start,
                    len: class.unit_size,
                    usable: class.usable_size(),
                    header: class.header,
                    slot: Slot::Unit {
                        class: id,
                        chunk,
                        index,
                    },
                })
            }
            ChunkKind::RunHead { chunks } if offset == self.layout.chunk_base(chunk) => {
                let len = u64::from(chunks) * CHUNK_SIZE;
                Ok(Reservation {
                    offset,
                    start: offset,
                    len,
                    usable: len,
                    header: HeaderKind::None,
                    slot: Slot::Run {
                        first: chunk,
                        chunks,
                    },
                })
            }
            _ => self
                .reserved
                .get(&offset)
                .copied()
                .ok_or_else(|| Error::invalid_offset(offset, "not a live allocation")),
        }
    }

    /// Marks a live, published allocation as being freed. It
    /// stays allocated until the free is published.
    pub fn begin_free(&mut self, region: &Region, offset: u64) -> Result<Reservation> {
        let reservation = self.resolve(region, offset)?;

        if self.reserved.contains_key(&reservation.start) {
            return Err(Error::invalid_offset(
                offset,
                "allocation belongs to an uncommitted transaction",
            ));
        }

        if !self.freeing.insert(reservation.start) {
            return Err(Error::invalid_offset(offset, "allocation is already being freed"));
        }

        Ok(reservation)
    }

    fn bitmap_word(&self, chunk: u32, index: u32) -> (u64, u64) {
        let word = self.layout.chunk_base(chunk) + u64::from(index / 64) * 8;
        (word, 1 << (index % 64))
    }

    /// Computes the metadata stores that turn `allocs` into
    /// live allocations and `frees` into free space.
    fn stores(&self, region: &Region, allocs: &[Reservation], frees: &[Reservation]) -> Vec<(u64, u64)> {
        let mut words = BTreeMap::new();

        for reservation in allocs {
            match reservation.slot {
                Slot::Unit { chunk, index, .. } => {
                    let (word, bit) = self.bitmap_word(chunk, index);
                    *words.entry(word).or_insert_with(|| region.load_u64(word)) |= bit;
                }
                Slot::Run { first, chunks } => {
                    words.insert(
                        self.layout.chunk_entry(first),
                        ChunkKind::RunHead { chunks }.to_raw(),
                    );
                    for tail in first + 1..first + chunks {
                        words.insert(
                            self.layout.chunk_entry(tail),
                            ChunkKind::RunTail { head: first }.to_raw(),
                        );
                    }
                }
            }
        }

        for reservation in frees {
            match reservation.slot {
                Slot::Unit { chunk, index, .. } => {
                    let (word, bit) = self.bitmap_word(chunk, index);
                    *words.entry(word).or_insert_with(|| region.load_u64(word)) &= !bit;
                }
                Slot::Run { first, chunks } => {
                    for chunk in first..first + chunks {
                        words.insert(self.layout.chunk_entry(chunk), ChunkKind::Free.to_raw());
                    }
                }
            }
        }

        words.into_iter().collect()
    }

    /// Finishes applying and clearing a record whose apply or
    /// clear failed earlier. Must succeed before another record
    /// is published, or before a transaction logs anything.
    pub fn settle(&mut self, region: &Region) -> io::Result<()> {
        if !self.unsettled {
            return Ok(());
        }

        // a commit record may only go once the discard of its
        // transaction's undo log is durable
        region.persist(self.layout.undo_offset, 8)?;

        if let Some((_, stores)) = redo::recover(region, self.layout.heap_end()) {
            redo::apply(region, &stores)?;
        }
        redo::clear(region)?;

        self.unsettled = false;

        log::info!("settled allocator metadata left over from an earlier failure");

        Ok(())
    }

    /// Applies and clears a published record. The record is
    /// already durable, so a failure here only leaves the heap
    /// unsettled until the next `settle`.
    pub fn finish(&mut self, region: &Region, stores: &[(u64, u64)]) {
        if stores.is_empty() {
            return;
        }

        let finished = redo::apply(region, stores).and_then(|()| redo::clear(region));

        if let Err(e) = finished {
            log::warn!("failed to apply a published redo record, settling later: {}", e);
            self.unsettled = true;
        }
    }

    /// Applies a published record but leaves it on media until
    /// the next `settle`.
    pub fn defer(&mut self, region: &Region, stores: &[(u64, u64)]) {
        if stores.is_empty() {
            return;
        }

        if let Err(e) = redo::apply(region, stores) {
            log::warn!("failed to apply a published redo record, settling later: {}", e);
        }
        self.unsettled = true;
    }

    /// Publishes, applies, and clears a record of raw metadata
    /// stores. Only fails if nothing was published.
    fn execute(&mut self, region: &Region, stores: &[(u64, u64)]) -> io::Result<()> {
        if stores.is_empty() {
            return Ok(());
        }

        self.settle(region)?;
        redo::publish(region, RedoKind::Atomic, stores)?;
        self.finish(region, stores);

        Ok(())
    }

    /// Publishes a redo record for the given allocator changes
    /// and updates the volatile state. On success the changes
    /// are durable, and the returned stores still need to go
    /// through `finish` while the heap lock is held. On failure
    /// everything is rolled back.
    pub fn publish(
        &mut self,
        region: &Region,
        kind: RedoKind,
        allocs: &[Reservation],
        frees: &[Reservation],
    ) -> io::Result<Vec<(u64, u64)>> {
        if let Err(e) = self.settle(region) {
            self.cancel(allocs, frees);
            return Err(e);
        }

        let stores = self.stores(region, allocs, frees);

        if !stores.is_empty() {
            if let Err(e) = redo::publish(region, kind, &stores) {
                self.cancel(allocs, frees);
                return Err(e);
            }
        }

        for reservation in allocs {
            self.reserved.remove(&reservation.start);
            self.live_allocations += 1;
            self.live_bytes += reservation.usable;
            if let Slot::Run { first, chunks } = reservation.slot {
                self.chunks[first as usize] = ChunkKind::RunHead { chunks };
                for tail in first + 1..first + chunks {
                    self.chunks[tail as usize] = ChunkKind::RunTail { head: first };
                }
            }
            #[cfg(feature = "runtime_validation")]
            self.debug_history.mark_alloc(reservation.start, reservation.len);
        }

        for reservation in frees {
            self.freeing.remove(&reservation.start);
            self.live_allocations -= 1;
            self.live_bytes -= reservation.usable;
            match reservation.slot {
                Slot::Unit { class, chunk, index } => {
                    self.free_units[usize::from(class.get())].insert((chunk, index));
                }
                Slot::Run { first, chunks } => {
                    for chunk in first..first + chunks {
                        self.chunks[chunk as usize] = ChunkKind::Free;
                        self.free_chunks.insert(chunk);
                    }
                }
            }
            #[cfg(feature = "runtime_validation")]
            self.debug_history.mark_free(reservation.start, reservation.len);
        }

        Ok(stores)
    }

    /// Publishes, applies, and clears in one step, for
    /// allocator operations outside of any transaction. An error
    /// means nothing changed; once the record is published this
    /// succeeds.
    pub fn publish_atomically(
        &mut self,
        region: &Region,
        allocs: &[Reservation],
        frees: &[Reservation],
    ) -> io::Result<()> {
        let stores = self.publish(region, RedoKind::Atomic, allocs, frees)?;
        self.finish(region, &stores);
        Ok(())
    }

    /// Returns reservations to the free sets and forgets
    /// pending frees.
    pub fn cancel(&mut self, allocs: &[Reservation], frees: &[Reservation]) {
        for reservation in allocs {
            if self.reserved.remove(&reservation.start).is_none() {
                continue;
            }
            match reservation.slot {
                Slot::Unit { class, chunk, index } => {
                    self.free_units[usize::from(class.get())].insert((chunk, index));
                }
                Slot::Run { first, chunks } => {
                    self.free_chunks.extend(first..first + chunks);
                }
            }
        }

        for reservation in frees {
            self.freeing.remove(&reservation.start);
        }
    }

    pub fn free_chunks(&self) -> u32 {
        self.free_chunks.len() as u32
    }

    pub fn live_allocations(&self) -> u64 {
        self.live_allocations
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }
}
