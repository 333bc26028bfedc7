//! The static area.
//!
//! Bump-allocated storage for per-class static field blocks. Nothing here is
//! ever reclaimed: once the loader reserves a class's block, its address is
//! the class's runtime type identity for the lifetime of the process.

use crate::error::MemoryError;
use crate::memory::{self, Region};

#[derive(Debug)]
pub struct StaticArea {
    data: Vec<u8>,
    cursor: u32,
    limit: u32,
}

impl StaticArea {
    pub fn new(limit: u32) -> Self {
        StaticArea {
            data: vec![0; limit as usize],
            cursor: 0,
            limit,
        }
    }

    /// Bytes allocated so far.
    pub fn used(&self) -> u32 {
        self.cursor
    }

    /// Reserves `size` zeroed bytes and returns their region offset.
    pub fn malloc(&mut self, size: u32) -> Result<u32, MemoryError> {
        if self.limit - self.cursor < size {
            return Err(MemoryError::StaticExhausted {
                requested: size,
                limit: self.limit,
            });
        }
        let offset = self.cursor;
        self.cursor += size;
        Ok(offset)
    }

    fn check(&self, offset: u32, len: u32) -> Result<(), MemoryError> {
        if offset >= self.cursor || self.cursor - offset < len {
            return Err(MemoryError::InvalidAddress {
                addr: memory::encode(offset, Region::Static).unwrap_or(0),
            });
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: u32) -> Result<u8, MemoryError> {
        self.check(offset, 1)?;
        Ok(self.data[offset as usize])
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32, MemoryError> {
        self.check(offset, 4)?;
        let at = offset as usize;
        Ok(u32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ]))
    }

    pub fn read_f64(&self, offset: u32) -> Result<f64, MemoryError> {
        self.check(offset, 8)?;
        let at = offset as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[at..at + 8]);
        Ok(f64::from_le_bytes(raw))
    }

    pub fn write_u8(&mut self, offset: u32, value: u8) -> Result<(), MemoryError> {
        self.check(offset, 1)?;
        self.data[offset as usize] = value;
        Ok(())
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), MemoryError> {
        self.check(offset, 4)?;
        let at = offset as usize;
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_f64(&mut self, offset: u32, value: f64) -> Result<(), MemoryError> {
        self.check(offset, 8)?;
        let at = offset as usize;
        self.data[at..at + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_is_monotonic() {
        let mut statics = StaticArea::new(256);
        let a = statics.malloc(16).unwrap();
        let b = statics.malloc(8).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        assert_eq!(statics.used(), 24);
    }

    #[test]
    fn reads_and_writes_round_trip() {
        let mut statics = StaticArea::new(64);
        let block = statics.malloc(16).unwrap();
        statics.write_u32(block + 8, 0x0102_0304).unwrap();
        statics.write_f64(block, 2.25).unwrap();
        assert_eq!(statics.read_u32(block + 8).unwrap(), 0x0102_0304);
        assert_eq!(statics.read_f64(block).unwrap(), 2.25);
    }

    #[test]
    fn unallocated_offsets_are_invalid() {
        let mut statics = StaticArea::new(64);
        statics.malloc(8).unwrap();
        assert!(statics.read_u32(8).is_err());
        assert!(statics.write_u8(20, 1).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut statics = StaticArea::new(16);
        statics.malloc(12).unwrap();
        assert!(matches!(
            statics.malloc(8),
            Err(MemoryError::StaticExhausted { .. })
        ));
    }
}
