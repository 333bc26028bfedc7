//! The unified logical address space.
//!
//! Every value the interpreter touches lives behind a 32-bit logical address.
//! Address 0 is reserved as null; every non-zero address decodes into exactly
//! one region by subtracting the fixed region sizes in declaration order.
//! Changing a region size changes every encoded address, so the sizes are
//! versioned together with the binary module format.

use crate::error::MemoryError;

/// Port space for memory-mapped console I/O, in bytes.
pub const PRESERVED_SIZE: u32 = 16;
/// Execution stack capacity, in slots.
pub const STACK_SIZE: u32 = 1 << 16;
/// Heap capacity, in bytes.
pub const HEAP_SIZE: u32 = 1 << 20;
/// Static area capacity, in bytes.
pub const STATIC_SIZE: u32 = 1 << 16;
/// Method area capacity, in bytes.
pub const METHOD_SIZE: u32 = 1 << 20;

/// Byte offset of the character output port within the preserved region.
pub const PORT_CHAR_OUT: u32 = 0;
/// Byte offset of the integer output port.
pub const PORT_INT_OUT: u32 = 4;
/// Byte offset of the string output port.
pub const PORT_STRING_OUT: u32 = 8;

/// One disjoint partition of the logical address space.
///
/// Declaration order is decode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Preserved,
    Stack,
    Heap,
    Static,
    Method,
}

impl Region {
    /// Size limit of this region. Stack offsets count slots, the rest bytes.
    pub fn limit(self) -> u32 {
        match self {
            Region::Preserved => PRESERVED_SIZE,
            Region::Stack => STACK_SIZE,
            Region::Heap => HEAP_SIZE,
            Region::Static => STATIC_SIZE,
            Region::Method => METHOD_SIZE,
        }
    }

    /// First absolute address belonging to this region.
    pub fn base(self) -> u32 {
        // Address 0 is null, so the first region starts at 1.
        let mut base = 1;
        for region in [
            Region::Preserved,
            Region::Stack,
            Region::Heap,
            Region::Static,
            Region::Method,
        ] {
            if region == self {
                return base;
            }
            base += region.limit();
        }
        unreachable!()
    }
}

/// Result of decoding a logical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Null,
    /// Region plus offset within that region.
    At(Region, u32),
    Invalid,
}

/// Decodes an address into the region it falls in and the offset inside it.
pub fn decode(addr: u32) -> Target {
    if addr == 0 {
        return Target::Null;
    }
    let mut rest = addr - 1;
    for region in [
        Region::Preserved,
        Region::Stack,
        Region::Heap,
        Region::Static,
        Region::Method,
    ] {
        if rest < region.limit() {
            return Target::At(region, rest);
        }
        rest -= region.limit();
    }
    Target::Invalid
}

/// Encodes a region-relative offset back into an absolute address.
///
/// The exact inverse of [`decode`]; an offset at or past the region's limit
/// is rejected as an overflow.
pub fn encode(offset: u32, region: Region) -> Result<u32, MemoryError> {
    if offset >= region.limit() {
        return Err(MemoryError::RegionOverflow { region, offset });
    }
    Ok(region.base() + offset)
}
