//! Fixed-block pool allocator
//!
//! A `Memb` is a statically sized array of slots, each carrying a reference count.
//! Allocation scans linearly for the first slot with a zero count; nothing ever grows.
//! Exclusive access through `&mut self` stands in for the interrupt-disabled section
//! the pools are shared under; the [`crate::host::Host`] wrapper provides the lock.

/// Index of an allocated block inside one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockId(u16);

impl BlockId {
    /// Slot index within the owning pool
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Slot<T> {
    refs: u8,
    value: Option<T>,
}

/// A pool of `N` blocks of `T` with embedded reference counts
#[derive(Debug)]
pub struct Memb<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Memb<T, N> {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                refs: 0,
                value: None,
            }),
        }
    }

    /// Take the first free block and store `value` in it
    ///
    /// Returns `None` when every block is in use.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&mut self, value: T) -> Option<BlockId> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.refs == 0)?;
        slot.refs = 1;
        slot.value = Some(value);
        Some(BlockId(index as u16))
    }

    /// Drop one reference and return the remaining count
    ///
    /// The block is released when the count reaches zero.
    pub fn free(&mut self, id: BlockId) -> u8 {
        self.release(id);
        self.refs(id)
    }

    /// Drop one reference, handing back the value if this released the block
    pub fn release(&mut self, id: BlockId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.refs == 0 {
            warn!("memb: free of unallocated block {}", id.index());
            return None;
        }
        slot.refs -= 1;
        if slot.refs == 0 { slot.value.take() } else { None }
    }

    /// Take an additional reference on an allocated block
    pub fn inc_ref(&mut self, id: BlockId) -> u8 {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.refs > 0 => {
                slot.refs = slot.refs.saturating_add(1);
                slot.refs
            }
            _ => 0,
        }
    }

    /// Current reference count of a block (zero when free)
    #[must_use]
    pub fn refs(&self, id: BlockId) -> u8 {
        self.slots.get(id.index()).map_or(0, |slot| slot.refs)
    }

    /// Borrow the value of an allocated block
    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<&T> {
        self.slots.get(id.index())?.value.as_ref()
    }

    /// Mutably borrow the value of an allocated block
    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut T> {
        self.slots.get_mut(id.index())?.value.as_mut()
    }

    /// Iterate over every allocated block
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.value.as_ref().map(|v| (BlockId(i as u16), v)))
    }

    /// Mutably iterate over every allocated block
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BlockId, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.value.as_mut().map(|v| (BlockId(i as u16), v)))
    }

    /// First allocated block matching `pred`
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<BlockId> {
        self.iter().find(|(_, v)| pred(v)).map(|(id, _)| id)
    }

    /// Snapshot of the allocated block ids, for walks that mutate the pool
    #[must_use]
    pub fn ids(&self) -> heapless::Vec<BlockId, N> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Release every block regardless of its count
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.refs = 0;
            slot.value = None;
        }
    }

    /// Number of blocks in use
    #[must_use]
    pub fn used(&self) -> usize {
        self.slots.iter().filter(|slot| slot.refs > 0).count()
    }

    /// Total number of blocks
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for Memb<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memb_exhaustion_and_reuse() {
        let mut pool: Memb<u32, 4> = Memb::new();
        let ids: heapless::Vec<BlockId, 4> = (0..4).map(|i| pool.alloc(i).unwrap()).collect();

        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert!(pool.alloc(99).is_none());
        assert_eq!(pool.used(), 4);

        assert_eq!(pool.free(ids[2]), 0);
        let again = pool.alloc(7).unwrap();
        assert_eq!(again, ids[2]);
        assert_eq!(pool.get(again), Some(&7));
    }

    #[test]
    fn test_memb_reference_counting() {
        let mut pool: Memb<u8, 2> = Memb::new();
        let id = pool.alloc(5).unwrap();

        assert_eq!(pool.inc_ref(id), 2);
        assert_eq!(pool.free(id), 1);
        assert_eq!(pool.get(id), Some(&5));

        assert_eq!(pool.release(id), Some(5));
        assert_eq!(pool.refs(id), 0);
        assert!(pool.get(id).is_none());

        // Freeing a released block is a no-op
        assert_eq!(pool.free(id), 0);
        assert_eq!(pool.inc_ref(id), 0);
    }

    #[test]
    fn test_memb_find_and_ids() {
        let mut pool: Memb<u16, 4> = Memb::new();
        pool.alloc(10).unwrap();
        let b = pool.alloc(20).unwrap();
        pool.alloc(30).unwrap();

        assert_eq!(pool.find(|v| *v == 20), Some(b));
        assert!(pool.find(|v| *v == 40).is_none());
        assert_eq!(pool.ids().len(), 3);

        for (_, v) in pool.iter_mut() {
            *v += 1;
        }
        assert_eq!(pool.get(b), Some(&21));

        pool.clear();
        assert_eq!(pool.used(), 0);
    }
}
