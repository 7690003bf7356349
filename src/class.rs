use crate::layout::{align_up, Layout, CHUNK_SIZE, MAX_CLASSES};
use crate::region::Region;

/// Identifies an allocation class within one pool.
///
/// `ClassId::DEFAULT` asks the allocator to pick the
/// smallest class that fits the requested size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(u8);

impl ClassId {
    pub const DEFAULT: ClassId = ClassId(0);

    pub const fn new(raw: u8) -> ClassId {
        ClassId(raw)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Per-block header stored in front of the user bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    /// Compact: the block is exactly one unit of user bytes.
    None,
    /// An 8-byte header records the requested length, which
    /// `Pool::allocated_size` reports back.
    Size,
}

impl HeaderKind {
    pub(crate) const fn len(self) -> u64 {
        match self {
            HeaderKind::None => 0,
            HeaderKind::Size => 8,
        }
    }

    fn to_raw(self) -> u64 {
        match self {
            HeaderKind::None => 0,
            HeaderKind::Size => 1,
        }
    }

    fn from_raw(raw: u64) -> Option<HeaderKind> {
        match raw {
            0 => Some(HeaderKind::None),
            1 => Some(HeaderKind::Size),
            _ => None,
        }
    }
}

pub(crate) const FIRST_CUSTOM_CLASS: u8 = 32;
pub(crate) const MIN_UNIT_SIZE: u64 = 8;

const REGISTERED: u64 = 1;

/// Largest unit that still fits a single unit plus its
/// bitmap into one chunk.
pub const MAX_UNIT_SIZE: u64 = CHUNK_SIZE - 64;

/// An allocation class: every block carved from chunks bound
/// to it is exactly `unit_size` bytes, header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationClass {
    pub id: ClassId,
    pub unit_size: u64,
    pub header: HeaderKind,
    pub units_per_chunk: u32,
    pub(crate) data_offset: u64,
}

impl AllocationClass {
    pub(crate) fn new(id: ClassId, unit_size: u64, header: HeaderKind) -> AllocationClass {
        assert!((MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(&unit_size));
        assert!(unit_size > header.len());

        // shrink until bitmap + units fit, the bitmap rounded up
        // to a cache line so the first unit starts on one
        let mut units = CHUNK_SIZE / unit_size;
        let mut data_offset = align_up(units.div_ceil(64) * 8, 64);
        while data_offset + units * unit_size > CHUNK_SIZE {
            units -= 1;
            data_offset = align_up(units.div_ceil(64) * 8, 64);
        }

        AllocationClass {
            id,
            unit_size,
            header,
            units_per_chunk: units as u32,
            data_offset,
        }
    }

    /// The number of bytes a caller may use in each block.
    pub fn usable_size(&self) -> u64 {
        self.unit_size - self.header.len()
    }

    pub(crate) fn is_custom(&self) -> bool {
        self.id.get() >= FIRST_CUSTOM_CLASS
    }

    pub(crate) fn bitmap_words(&self) -> u64 {
        u64::from(self.units_per_chunk).div_ceil(64)
    }

    pub(crate) fn unit_offset(&self, chunk_base: u64, unit: u32) -> u64 {
        chunk_base + self.data_offset + u64::from(unit) * self.unit_size
    }

    /// The unit index for a unit start offset inside of the
    /// chunk at `chunk_base`, if it lands exactly on one.
    pub(crate) fn unit_index(&self, chunk_base: u64, unit_start: u64) -> Option<u32> {
        let data = chunk_base + self.data_offset;
        if unit_start < data {
            return None;
        }
        let relative = unit_start - data;
        if relative % self.unit_size != 0 {
            return None;
        }
        let index = relative / self.unit_size;
        if index >= u64::from(self.units_per_chunk) {
            return None;
        }
        Some(index as u32)
    }

    fn to_words(self) -> [u64; 2] {
        [self.unit_size, REGISTERED | (self.header.to_raw() << 8)]
    }
}

/// Built-in classes present in every pool: multiples of
/// 8 bytes up to 120, then powers of two up to 128k.
pub(crate) fn builtin_classes() -> impl Iterator<Item = AllocationClass> {
    let small = (1..=15_u8).map(|i| (i, 8 * u64::from(i)));
    let large = (16..=26_u8).map(|i| (i, 128_u64 << (i - 16)));

    small
        .chain(large)
        .map(|(id, unit)| AllocationClass::new(ClassId(id), unit, HeaderKind::None))
}

/// Volatile mirror of the persistent class table.
#[derive(Debug, Clone)]
pub(crate) struct ClassTable {
    classes: Vec<Option<AllocationClass>>,
}

impl ClassTable {
    pub fn builtin() -> ClassTable {
        let mut classes = vec![None; MAX_CLASSES];
        for class in builtin_classes() {
            classes[class.id.index()] = Some(class);
        }
        ClassTable { classes }
    }

    /// Reads the class table of an existing pool.
    pub fn recover(region: &Region, layout: &Layout) -> Result<ClassTable, &'static str> {
        let mut classes = vec![None; MAX_CLASSES];

        for (index, slot) in classes.iter_mut().enumerate().skip(1) {
            let id = ClassId(index as u8);
            let entry = layout.class_entry(id);
            let unit_size = region.load_u64(entry);
            let flags = region.load_u64(entry + 8);

            if flags & REGISTERED == 0 {
                continue;
            }

            let header = HeaderKind::from_raw(flags >> 8).ok_or("unknown class header kind")?;
            if !(MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(&unit_size) || unit_size <= header.len() {
                return Err("class table entry has an unsupported unit size");
            }

            *slot = Some(AllocationClass::new(id, unit_size, header));
        }

        Ok(ClassTable { classes })
    }

    pub fn get(&self, id: ClassId) -> Option<&AllocationClass> {
        self.classes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationClass> {
        self.classes.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn find_custom(&self, unit_size: u64, header: HeaderKind) -> Option<ClassId> {
        self.iter()
            .find(|c| c.is_custom() && c.unit_size == unit_size && c.header == header)
            .map(|c| c.id)
    }

    pub fn next_custom_id(&self) -> Option<ClassId> {
        (FIRST_CUSTOM_CLASS..MAX_CLASSES as u8)
            .map(ClassId)
            .find(|id| self.get(*id).is_none())
    }

    pub fn insert(&mut self, class: AllocationClass) {
        let slot = &mut self.classes[class.id.index()];
        assert!(slot.is_none(), "class {:?} registered twice", class.id);
        *slot = Some(class);
    }

    /// Redo entries that persist `class` in the table.
    pub fn entry_stores(layout: &Layout, class: &AllocationClass) -> [(u64, u64); 2] {
        let entry = layout.class_entry(class.id);
        let [unit, flags] = class.to_words();
        [(entry, unit), (entry + 8, flags)]
    }

    /// Picks the class for a default-class request. A custom
    /// class whose usable size matches exactly wins, otherwise
    /// the smallest unit that fits. `None` means the request
    /// must be served as a chunk run.
    pub fn select(&self, size: u64) -> Option<&AllocationClass> {
        if let Some(exact) = self
            .iter()
            .find(|c| c.is_custom() && c.usable_size() == size)
        {
            return Some(exact);
        }

        self.iter()
            .filter(|c| c.usable_size() >= size)
            .min_by_key(|c| (c.unit_size, c.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_keeps_units_inside_the_chunk() {
        for unit in [8, 100, 120, 4096, 65536, MAX_UNIT_SIZE] {
            let class = AllocationClass::new(ClassId(40), unit, HeaderKind::None);
            assert!(class.units_per_chunk >= 1);
            assert!(class.bitmap_words() * 8 <= class.data_offset);
            assert_eq!(class.data_offset % 64, 0);
            let last = class.unit_offset(0, class.units_per_chunk - 1);
            assert!(last + unit <= CHUNK_SIZE);
        }

        let tiny = AllocationClass::new(ClassId(1), 8, HeaderKind::None);
        assert!(tiny.units_per_chunk > 30_000);
        assert_eq!(tiny.unit_index(0, tiny.unit_offset(0, 5)), Some(5));
        assert_eq!(tiny.unit_index(0, tiny.unit_offset(0, 5) + 1), None);
        assert_eq!(tiny.unit_index(0, 0), None);
    }

    #[test]
    fn default_selection() {
        let mut table = ClassTable::builtin();

        assert_eq!(table.select(1).unwrap().unit_size, 8);
        assert_eq!(table.select(113).unwrap().unit_size, 120);
        assert_eq!(table.select(121).unwrap().unit_size, 128);
        assert_eq!(table.select(5000).unwrap().unit_size, 8192);
        assert!(table.select(128 * 1024 + 1).is_none());

        let custom = AllocationClass::new(ClassId(FIRST_CUSTOM_CLASS), 100, HeaderKind::None);
        table.insert(custom);
        assert_eq!(table.select(100).unwrap().id, custom.id);
        assert_eq!(table.select(99).unwrap().unit_size, 100);
        assert_eq!(table.find_custom(100, HeaderKind::None), Some(custom.id));
        assert_eq!(table.find_custom(100, HeaderKind::Size), None);
        assert_eq!(table.next_custom_id(), Some(ClassId(FIRST_CUSTOM_CLASS + 1)));
    }

    #[test]
    fn size_header_reduces_usable_size() {
        let class = AllocationClass::new(ClassId(FIRST_CUSTOM_CLASS), 64, HeaderKind::Size);
        assert_eq!(class.usable_size(), 56);
    }
}
