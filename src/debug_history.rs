use std::collections::BTreeMap;

/// `DebugHistory` asserts that published allocations never
/// overlap any other live allocation, and that frees only
/// ever target something that is currently allocated.
#[derive(Default, Debug)]
pub struct DebugHistory {
    // start -> end
    live: BTreeMap<u64, u64>,
}

impl DebugHistory {
    pub fn mark_alloc(&mut self, start: u64, len: u64) {
        let end = start + len;

        if let Some((_, prev_end)) = self.live.range(..end).next_back() {
            assert!(
                *prev_end <= start,
                "allocation {}..{} overlaps one ending at {}",
                start,
                end,
                prev_end
            );
        }

        let new_allocation = self.live.insert(start, end).is_none();
        assert!(new_allocation);
    }

    pub fn mark_free(&mut self, start: u64, len: u64) {
        let present = self.live.remove(&start);
        assert_eq!(present, Some(start + len), "free of a block that is not live");
    }
}
