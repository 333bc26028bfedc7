//! The garbage-collected heap.
//!
//! Objects are contiguous byte blocks kept in an offset-ordered sequence.
//! Allocation is best fit: the smallest gap between consecutive live objects
//! that satisfies the request wins, otherwise the object is appended after
//! the last one. Live objects never move; there is no compaction.
//!
//! Every object starts with an 8-byte header: 4 bytes type info (the static
//! area address of its runtime class, or the element size for arrays) and
//! 4 bytes GC info. Arrays carry an extra 4-byte length field after the
//! header, then `length * element_size` payload bytes.

use bitflags::bitflags;

use crate::error::MemoryError;
use crate::memory::{self, Region};

/// Bytes of type info plus GC info in front of every object.
pub const OBJECT_HEADER_SIZE: u32 = 8;
/// Header plus length field in front of array payloads.
pub const ARRAY_HEADER_SIZE: u32 = 12;

bitflags! {
    /// The GC info word of an object header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct GcFlags: u32 {
        /// Set by the mark phase, cleared again by the sweep.
        const MARKED = 1 << 0;
        /// The object is an array; type info holds the element size.
        const ARRAY = 1 << 1;
        /// Array elements are addresses and must be traced.
        const ADDRESS_ELEMENTS = 1 << 2;
    }
}

#[derive(Debug)]
struct Block {
    offset: u32,
    data: Vec<u8>,
}

impl Block {
    fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }

    fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

#[derive(Debug)]
pub struct Heap {
    blocks: Vec<Block>,
    limit: u32,
}

impl Heap {
    pub fn new(limit: u32) -> Self {
        Heap {
            blocks: Vec::new(),
            limit,
        }
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.blocks.len()
    }

    /// Base offsets of all live objects, in address order.
    pub fn objects(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().map(|block| block.offset)
    }

    /// Allocates `size` zeroed bytes and returns the heap offset of the block.
    ///
    /// Best fit over the gaps between consecutive live objects; falls back to
    /// appending after the last object.
    pub fn malloc(&mut self, size: u32) -> Result<u32, MemoryError> {
        if size == 0 || size > self.limit {
            return Err(MemoryError::HeapExhausted {
                requested: size,
                limit: self.limit,
            });
        }
        let mut best: Option<(usize, u32, u32)> = None;
        let mut prev_end = 0u32;
        for (index, block) in self.blocks.iter().enumerate() {
            let gap = block.offset - prev_end;
            if gap >= size && best.is_none_or(|(_, _, g)| gap < g) {
                best = Some((index, prev_end, gap));
            }
            prev_end = block.end();
        }
        let (index, offset) = match best {
            Some((index, offset, _)) => (index, offset),
            None => {
                if prev_end + size > self.limit {
                    return Err(MemoryError::HeapExhausted {
                        requested: size,
                        limit: self.limit,
                    });
                }
                (self.blocks.len(), prev_end)
            }
        };
        self.blocks.insert(
            index,
            Block {
                offset,
                data: vec![0; size as usize],
            },
        );
        Ok(offset)
    }

    /// Allocates an object of a runtime class. `type_info` is the class's
    /// static block address, `size` its header-inclusive instance size.
    pub fn malloc_object(&mut self, type_info: u32, size: u32) -> Result<u32, MemoryError> {
        let offset = self.malloc(size.max(OBJECT_HEADER_SIZE))?;
        self.write_u32(offset, type_info)?;
        self.write_u32(offset + 4, GcFlags::empty().bits())?;
        Ok(offset)
    }

    /// Allocates an array of `length` elements of `element_size` bytes.
    pub fn malloc_array(
        &mut self,
        element_size: u32,
        length: u32,
        address_elements: bool,
    ) -> Result<u32, MemoryError> {
        let total = element_size
            .checked_mul(length)
            .and_then(|payload| payload.checked_add(ARRAY_HEADER_SIZE))
            .ok_or(MemoryError::HeapExhausted {
                requested: u32::MAX,
                limit: self.limit,
            })?;
        let offset = self.malloc(total)?;
        let mut flags = GcFlags::ARRAY;
        if address_elements {
            flags |= GcFlags::ADDRESS_ELEMENTS;
        }
        self.write_u32(offset, element_size)?;
        self.write_u32(offset + 4, flags.bits())?;
        self.write_u32(offset + 8, length)?;
        Ok(offset)
    }

    fn locate(&self, offset: u32) -> Result<usize, MemoryError> {
        let index = self.blocks.partition_point(|block| block.offset <= offset);
        if index > 0 && self.blocks[index - 1].contains(offset) {
            return Ok(index - 1);
        }
        Err(MemoryError::InvalidAddress {
            addr: memory::encode(offset, Region::Heap).unwrap_or(0),
        })
    }

    /// Base offset of the live object containing `offset`.
    pub fn object_base(&self, offset: u32) -> Result<u32, MemoryError> {
        Ok(self.blocks[self.locate(offset)?].offset)
    }

    /// Resolves an interior offset to its backing bytes.
    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<&[u8], MemoryError> {
        let block = &self.blocks[self.locate(offset)?];
        let start = (offset - block.offset) as usize;
        let end = start + len as usize;
        if end > block.data.len() {
            return Err(MemoryError::InvalidAddress {
                addr: memory::encode(offset, Region::Heap).unwrap_or(0),
            });
        }
        Ok(&block.data[start..end])
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let index = self.locate(offset)?;
        let block = &mut self.blocks[index];
        let start = (offset - block.offset) as usize;
        let end = start + bytes.len();
        if end > block.data.len() {
            return Err(MemoryError::InvalidAddress {
                addr: memory::encode(offset, Region::Heap).unwrap_or(0),
            });
        }
        block.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u8(&self, offset: u32) -> Result<u8, MemoryError> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32, MemoryError> {
        let bytes = self.read_bytes(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_f64(&self, offset: u32) -> Result<f64, MemoryError> {
        let bytes = self.read_bytes(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }

    pub fn write_u8(&mut self, offset: u32, value: u8) -> Result<(), MemoryError> {
        self.write_bytes(offset, &[value])
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_f64(&mut self, offset: u32, value: f64) -> Result<(), MemoryError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Type info word of the object at `base`.
    pub fn type_info(&self, base: u32) -> Result<u32, MemoryError> {
        self.read_u32(base)
    }

    /// GC flags of the object at `base`.
    pub fn gc_flags(&self, base: u32) -> Result<GcFlags, MemoryError> {
        Ok(GcFlags::from_bits_truncate(self.read_u32(base + 4)?))
    }

    pub fn set_gc_flags(&mut self, base: u32, flags: GcFlags) -> Result<(), MemoryError> {
        self.write_u32(base + 4, flags.bits())
    }

    /// Removes every unmarked object and clears the mark on the survivors.
    /// Returns the number of objects removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.blocks.len();
        self.blocks.retain_mut(|block| {
            let raw = u32::from_le_bytes([block.data[4], block.data[5], block.data[6], block.data[7]]);
            let flags = GcFlags::from_bits_truncate(raw);
            if flags.contains(GcFlags::MARKED) {
                let cleared = flags - GcFlags::MARKED;
                block.data[4..8].copy_from_slice(&cleared.bits().to_le_bytes());
                true
            } else {
                false
            }
        });
        before - self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(heap: &mut Heap, base: u32) {
        let flags = heap.gc_flags(base).unwrap() | GcFlags::MARKED;
        heap.set_gc_flags(base, flags).unwrap();
    }

    #[test]
    fn allocations_append_in_order() {
        let mut heap = Heap::new(1024);
        let a = heap.malloc(16).unwrap();
        let b = heap.malloc(32).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 16);
    }

    #[test]
    fn best_fit_picks_the_smallest_sufficient_gap() {
        let mut heap = Heap::new(4096);
        let a = heap.malloc_object(0, 16).unwrap();
        let b = heap.malloc_object(0, 64).unwrap();
        let c = heap.malloc_object(0, 16).unwrap();
        let d = heap.malloc_object(0, 24).unwrap();
        let e = heap.malloc_object(0, 16).unwrap();

        // Free b (64 bytes) and d (24 bytes), keep the rest.
        mark(&mut heap, a);
        mark(&mut heap, c);
        mark(&mut heap, e);
        assert_eq!(heap.sweep(), 2);

        // A 20-byte request fits both gaps; the 24-byte one is the best fit.
        let reused = heap.malloc_object(0, 20).unwrap();
        assert_eq!(reused, d);
        // The next 20-byte request must go to the larger gap.
        let reused = heap.malloc_object(0, 20).unwrap();
        assert_eq!(reused, b);
    }

    #[test]
    fn sweep_preserves_survivor_bytes() {
        let mut heap = Heap::new(1024);
        let a = heap.malloc_object(7, 24).unwrap();
        let b = heap.malloc_object(7, 24).unwrap();
        heap.write_bytes(a + 8, b"survivor-payload").unwrap();
        heap.write_bytes(b + 8, b"doomed-payload--").unwrap();

        mark(&mut heap, a);
        assert_eq!(heap.sweep(), 1);
        assert_eq!(heap.read_bytes(a + 8, 16).unwrap(), b"survivor-payload");
        assert!(heap.read_bytes(b + 8, 1).is_err());
        // Mark bit is cleared on survivors.
        assert!(!heap.gc_flags(a).unwrap().contains(GcFlags::MARKED));
    }

    #[test]
    fn arrays_carry_length_and_flags() {
        let mut heap = Heap::new(1024);
        let arr = heap.malloc_array(4, 5, true).unwrap();
        assert_eq!(heap.type_info(arr).unwrap(), 4);
        assert_eq!(heap.read_u32(arr + 8).unwrap(), 5);
        let flags = heap.gc_flags(arr).unwrap();
        assert!(flags.contains(GcFlags::ARRAY));
        assert!(flags.contains(GcFlags::ADDRESS_ELEMENTS));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut heap = Heap::new(64);
        heap.malloc(48).unwrap();
        assert!(matches!(
            heap.malloc(32),
            Err(MemoryError::HeapExhausted { .. })
        ));
    }

    #[test]
    fn interior_offsets_resolve_to_the_owning_object() {
        let mut heap = Heap::new(1024);
        let a = heap.malloc(16).unwrap();
        let b = heap.malloc(16).unwrap();
        assert_eq!(heap.object_base(a + 7).unwrap(), a);
        assert_eq!(heap.object_base(b + 15).unwrap(), b);
        heap.write_u32(a + 12, 0xDEAD_BEEF).unwrap();
        assert_eq!(heap.read_u32(a + 12).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn dangling_offsets_are_invalid() {
        let mut heap = Heap::new(1024);
        let a = heap.malloc(16).unwrap();
        assert!(heap.read_u8(a + 16).is_err());
        assert!(heap.read_u8(500).is_err());
    }
}
