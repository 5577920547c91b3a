use crate::tracer::address::{AddressRange, TargetAddress};
use crate::tracer::error::Error;

/// Allocator over the target-side jump pad region.
///
/// Claims are first-fit over a free list of previously released ranges;
/// released ranges are coalesced with free neighbours so the pool can
/// satisfy a same-sized request after any install/uninstall sequence.
pub struct JumpPadPool {
    region: AddressRange,
    /// Free ranges, sorted by start address, non-adjacent.
    free: Vec<AddressRange>,
}

impl JumpPadPool {
    /// Create a pool over `size` bytes of reserved target memory at `base`.
    pub fn new(base: TargetAddress, size: u64) -> Self {
        let region = AddressRange::from_start(base, size);
        Self {
            region,
            free: vec![region],
        }
    }

    pub fn region(&self) -> AddressRange {
        self.region
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.len()).sum()
    }

    /// Claim the first free range large enough for `size` bytes.
    pub fn allocate(&mut self, size: u64) -> Result<AddressRange, Error> {
        debug_assert!(size > 0);
        let slot = self
            .free
            .iter()
            .position(|r| r.len() >= size)
            .ok_or(Error::PadExhausted(size))?;

        let range = self.free[slot];
        let claim = AddressRange::from_start(range.start, size);
        if range.len() == size {
            self.free.remove(slot);
        } else {
            self.free[slot] = AddressRange::new(claim.end, range.end);
        }
        Ok(claim)
    }

    /// Return a claimed range to the pool, merging with free neighbours.
    pub fn release(&mut self, range: AddressRange) {
        if range.is_empty() {
            return;
        }
        debug_assert!(self.region.start <= range.start && range.end <= self.region.end);
        debug_assert!(self.free.iter().all(|r| !r.overlaps(&range)));

        let slot = self
            .free
            .partition_point(|r| r.start < range.start);
        self.free.insert(slot, range);

        // coalesce with the successor first, then with the predecessor
        if slot + 1 < self.free.len() && self.free[slot].adjoins(&self.free[slot + 1]) {
            self.free[slot].end = self.free[slot + 1].end;
            self.free.remove(slot + 1);
        }
        if slot > 0 && self.free[slot - 1].adjoins(&self.free[slot]) {
            self.free[slot - 1].end = self.free[slot].end;
            self.free.remove(slot);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool(size: u64) -> JumpPadPool {
        JumpPadPool::new(TargetAddress::from(0x7000u64), size)
    }

    #[test]
    fn test_first_fit_and_exhaustion() {
        let mut pool = pool(64);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(48).unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(b.start, a.end);
        assert!(!a.overlaps(&b));
        assert!(matches!(pool.allocate(1), Err(Error::PadExhausted(1))));
    }

    #[test]
    fn test_release_coalesces_neighbours() {
        let mut pool = pool(64);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        let c = pool.allocate(32).unwrap();
        assert_eq!(pool.free_bytes(), 0);

        // release out of order: middle, tail, head
        pool.release(b);
        pool.release(c);
        pool.release(a);
        assert_eq!(pool.free_bytes(), 64);

        // a fully coalesced pool satisfies the whole region again
        let all = pool.allocate(64).unwrap();
        assert_eq!(all, pool.region());
    }

    #[test]
    fn test_no_leak_across_reuse() {
        let mut pool = pool(13);
        for _ in 0..10 {
            let claim = pool.allocate(13).unwrap();
            pool.release(claim);
        }
        assert_eq!(pool.free_bytes(), 13);
    }

    #[test]
    fn test_claims_are_disjoint() {
        let mut pool = pool(128);
        let claims: Vec<_> = (0..8).map(|_| pool.allocate(16).unwrap()).collect();
        for (i, a) in claims.iter().enumerate() {
            for b in claims.iter().skip(i + 1) {
                assert!(!a.overlaps(b));
            }
        }
    }
}
