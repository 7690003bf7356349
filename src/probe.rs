use crate::Pool;

// well past any mappable size
const PROBE_CEILING: u64 = 1 << 56;

/// Binary search for the size of a contiguous extent that
/// starts at zero: returns the smallest `n` in
/// `lower..=upper` for which `owned(n)` is `false`, given
/// that everything below `lower` is owned and `owned` is
/// monotone over the range. Returns `upper` if everything up
/// to it is owned.
pub fn probe_extent<F: Fn(u64) -> bool>(lower: u64, upper: u64, owned: F) -> u64 {
    let mut lo = lower.min(upper);
    let mut hi = upper;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if owned(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    lo
}

impl Pool {
    /// Finds the extent of this pool's mapping by probing which
    /// candidate addresses past its base still translate back
    /// into this pool, starting from a size that is known to be
    /// mapped. For an open pool this is always `Pool::size()`;
    /// it is meant for callers that only kept an address.
    pub fn probe_size(&self, known_lower_bound: u64) -> u64 {
        let base = self.region.base();

        let size = probe_extent(known_lower_bound, PROBE_CEILING, |offset| {
            usize::try_from(offset)
                .map_or(false, |offset| self.region.offset_of(base.wrapping_add(offset)).is_some())
        });

        log::trace!("probed pool {} size as {}", self.id, size);

        size
    }
}
