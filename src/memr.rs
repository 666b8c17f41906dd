//! First-fit coalescing heap
//!
//! One arena of `SIZE` bytes. Every block starts with a header holding the
//! offsets of the next and previous blocks and a used flag, so free blocks form
//! an implicit list threaded through the arena. A sentinel header marks the end.
//! Allocation scans first-fit from the lowest known free block; freeing merges a
//! block with free neighbours straight away.

use crate::constants::MEM_ALIGNMENT;

const HDR: usize = 12;
const MIN_SIZE: usize = 12;

const fn align_up(size: usize) -> usize {
    (size + MEM_ALIGNMENT - 1) & !(MEM_ALIGNMENT - 1)
}

const fn align_down(size: usize) -> usize {
    size & !(MEM_ALIGNMENT - 1)
}

/// Offset of an allocation's payload inside the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemrPtr(u32);

impl MemrPtr {
    #[allow(clippy::cast_possible_truncation)]
    const fn new(offset: usize) -> Self {
        Self(offset as u32)
    }

    const fn offset(self) -> usize {
        self.0 as usize
    }
}

/// First-fit heap over a fixed arena
#[derive(Debug)]
pub struct Memr<const SIZE: usize> {
    ram: [u8; SIZE],
    end: usize,
    lfree: usize,
}

impl<const SIZE: usize> Memr<SIZE> {
    /// Create a heap with one free block spanning the arena
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Self {
            ram: [0; SIZE],
            end: align_down(SIZE.saturating_sub(HDR)),
            lfree: 0,
        };
        heap.init();
        heap
    }

    fn init(&mut self) {
        let end = self.end;
        self.write_header(0, end, 0, false);
        self.write_header(end, end, end, true);
        self.lfree = 0;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_header(&mut self, at: usize, next: usize, prev: usize, used: bool) {
        self.ram[at..at + 4].copy_from_slice(&(next as u32).to_le_bytes());
        self.ram[at + 4..at + 8].copy_from_slice(&(prev as u32).to_le_bytes());
        self.ram[at + 8] = u8::from(used);
    }

    fn word(&self, at: usize) -> usize {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.ram[at..at + 4]);
        u32::from_le_bytes(raw) as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_word(&mut self, at: usize, value: usize) {
        self.ram[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes());
    }

    fn next(&self, block: usize) -> usize {
        self.word(block)
    }

    fn prev(&self, block: usize) -> usize {
        self.word(block + 4)
    }

    fn used(&self, block: usize) -> bool {
        self.ram[block + 8] != 0
    }

    fn set_next(&mut self, block: usize, next: usize) {
        self.set_word(block, next);
    }

    fn set_prev(&mut self, block: usize, prev: usize) {
        self.set_word(block + 4, prev);
    }

    fn set_used(&mut self, block: usize, used: bool) {
        self.ram[block + 8] = u8::from(used);
    }

    fn plug_holes(&mut self, block: usize) {
        let next = self.next(block);
        if next != block && next != self.end && !self.used(next) {
            if self.lfree == next {
                self.lfree = block;
            }
            let after = self.next(next);
            self.set_next(block, after);
            if after != self.end {
                self.set_prev(after, block);
            }
        }

        let prev = self.prev(block);
        if prev != block && !self.used(prev) {
            if self.lfree == block {
                self.lfree = prev;
            }
            let after = self.next(block);
            self.set_next(prev, after);
            if after != self.end {
                self.set_prev(after, prev);
            }
        }
    }

    /// Carve a free block out of the tail of `block` so it keeps `size` payload bytes
    fn split(&mut self, block: usize, size: usize) -> Option<usize> {
        let next = self.next(block);
        if next - (block + HDR) < size + HDR + MIN_SIZE {
            return None;
        }
        let tail = block + HDR + size;
        self.write_header(tail, next, block, false);
        self.set_next(block, tail);
        if next != self.end {
            self.set_prev(next, tail);
        }
        Some(tail)
    }

    /// Allocate `size` bytes, first fit from the lowest free block
    pub fn malloc(&mut self, size: usize) -> Option<MemrPtr> {
        if size == 0 {
            return None;
        }
        let size = align_up(size).max(MIN_SIZE);

        let mut block = self.lfree;
        while block + HDR + size <= self.end {
            if !self.used(block) && self.next(block) - (block + HDR) >= size {
                self.split(block, size);
                self.set_used(block, true);
                if block == self.lfree {
                    while self.used(self.lfree) && self.lfree != self.end {
                        self.lfree = self.next(self.lfree);
                    }
                }
                return Some(MemrPtr::new(block + HDR));
            }
            block = self.next(block);
        }
        warn!("memr: could not allocate {} bytes", size);
        None
    }

    fn block_of(&self, ptr: MemrPtr) -> Option<usize> {
        let block = ptr.offset().checked_sub(HDR)?;
        (block < self.end && self.used(block)).then_some(block)
    }

    /// Return an allocation to the heap, merging it with free neighbours
    pub fn free(&mut self, ptr: MemrPtr) {
        let Some(block) = self.block_of(ptr) else {
            error!("memr: free of invalid pointer {}", ptr.offset());
            return;
        };
        self.set_used(block, false);
        if block < self.lfree {
            self.lfree = block;
        }
        self.plug_holes(block);
    }

    /// Shrink an allocation in place
    ///
    /// Growth is not supported and returns `None`; the allocation is untouched then.
    pub fn realloc(&mut self, ptr: MemrPtr, new_size: usize) -> Option<MemrPtr> {
        let block = self.block_of(ptr)?;
        let new_size = align_up(new_size).max(MIN_SIZE);
        let size = self.next(block) - ptr.offset();
        if new_size > size {
            return None;
        }
        if let Some(tail) = self.split(block, new_size) {
            if tail < self.lfree {
                self.lfree = tail;
            }
            self.plug_holes(tail);
        }
        Some(ptr)
    }

    /// Resize an allocation, moving it when it has to grow
    pub fn reallocm(&mut self, ptr: MemrPtr, new_size: usize) -> Option<MemrPtr> {
        if let Some(same) = self.realloc(ptr, new_size) {
            return Some(same);
        }
        let old_size = self.size_of(ptr);
        let fresh = self.malloc(new_size)?;
        let count = old_size.min(new_size);
        self.ram
            .copy_within(ptr.offset()..ptr.offset() + count, fresh.offset());
        self.free(ptr);
        Some(fresh)
    }

    /// Usable payload size of an allocation
    #[must_use]
    pub fn size_of(&self, ptr: MemrPtr) -> usize {
        self.block_of(ptr)
            .map_or(0, |block| self.next(block) - ptr.offset())
    }

    /// Payload bytes of an allocation
    #[must_use]
    pub fn bytes(&self, ptr: MemrPtr) -> &[u8] {
        let size = self.size_of(ptr);
        &self.ram[ptr.offset()..ptr.offset() + size]
    }

    /// Mutable payload bytes of an allocation
    pub fn bytes_mut(&mut self, ptr: MemrPtr) -> &mut [u8] {
        let size = self.size_of(ptr);
        &mut self.ram[ptr.offset()..ptr.offset() + size]
    }

    /// Total free payload bytes, ignoring headers of free blocks
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = 0;
        while block != self.end {
            let next = self.next(block);
            if !self.used(block) {
                total += next - block - HDR;
            }
            block = next;
        }
        total
    }

    /// Number of blocks, used or free, between the start and the sentinel
    #[must_use]
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut block = 0;
        while block != self.end {
            count += 1;
            block = self.next(block);
        }
        count
    }
}

impl<const SIZE: usize> Default for Memr<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memr_first_fit_and_coalesce() {
        let mut heap: Memr<1024> = Memr::new();
        let initial = heap.free_bytes();
        assert_eq!(heap.block_count(), 1);

        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(50).unwrap();
        let c = heap.malloc(30).unwrap();
        assert!(a.offset() < b.offset() && b.offset() < c.offset());
        assert_eq!(heap.size_of(a), 100);
        assert_eq!(heap.size_of(b), 52);

        // A hole in the middle is reused first-fit
        heap.free(b);
        let d = heap.malloc(40).unwrap();
        assert_eq!(d, b);

        heap.free(a);
        heap.free(d);
        heap.free(c);
        assert_eq!(heap.block_count(), 1);
        assert_eq!(heap.free_bytes(), initial);
    }

    #[test]
    fn test_memr_exhaustion() {
        let mut heap: Memr<256> = Memr::new();
        assert!(heap.malloc(0).is_none());
        assert!(heap.malloc(1024).is_none());

        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(100).unwrap();
        assert!(heap.malloc(100).is_none());
        heap.free(a);
        assert!(heap.malloc(100).is_some());
        heap.free(b);
    }

    #[test]
    fn test_memr_realloc_shrinks_in_place() {
        let mut heap: Memr<512> = Memr::new();
        let a = heap.malloc(200).unwrap();
        let before = heap.free_bytes();

        let shrunk = heap.realloc(a, 64).unwrap();
        assert_eq!(shrunk, a);
        assert_eq!(heap.size_of(a), 64);
        // Tail merged with the free remainder
        assert_eq!(heap.free_bytes(), before + 136);
        assert_eq!(heap.block_count(), 2);

        assert!(heap.realloc(a, 400).is_none());
        assert_eq!(heap.size_of(a), 64);
    }

    #[test]
    fn test_memr_reallocm_moves_and_copies() {
        let mut heap: Memr<512> = Memr::new();
        let a = heap.malloc(16).unwrap();
        let _guard = heap.malloc(16).unwrap();
        heap.bytes_mut(a).copy_from_slice(&[7u8; 16]);

        let grown = heap.reallocm(a, 64).unwrap();
        assert_ne!(grown, a);
        assert_eq!(&heap.bytes(grown)[..16], &[7u8; 16]);
        assert_eq!(heap.size_of(a), 0);
    }

    #[test]
    fn test_memr_invalid_free_is_ignored() {
        let mut heap: Memr<256> = Memr::new();
        let a = heap.malloc(32).unwrap();
        heap.free(a);
        let before = heap.free_bytes();
        heap.free(a);
        assert_eq!(heap.free_bytes(), before);
    }
}
