//! The method area.
//!
//! Append-only storage for two kinds of immutable content: method code
//! blocks and string constant payloads. Strings are interned process-wide
//! through a content-keyed table, so the same literal loaded from two
//! different modules resolves to one canonical address. Nothing is ever
//! freed here and the collector never scans it.
//!
//! Strings are stored as a 4-byte length followed by UTF-8 bytes, so the
//! string output port can read a payload back from its address alone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::MemoryError;
use crate::memory::{self, Region};

/// Conventional name of the entry class in the root module.
pub const ENTRY_CLASS: &str = "Main";
/// Conventional name of the entry method.
pub const ENTRY_METHOD: &str = "main";
/// Descriptor of the zero-argument void entry method.
pub const ENTRY_DESCRIPTOR: &str = "()V";

/// The process-wide intern table, shared between the method area and the
/// loader. Maps a string value to its canonical method area address.
#[derive(Debug, Clone, Default)]
pub struct Strings(Arc<RwLock<HashMap<String, u32>>>);

impl Strings {
    pub fn lookup(&self, value: &str) -> Option<u32> {
        self.0.read().get(value).copied()
    }

    fn insert(&self, value: &str, addr: u32) {
        self.0.write().insert(value.to_owned(), addr);
    }
}

#[derive(Debug)]
pub struct MethodArea {
    data: Vec<u8>,
    cursor: u32,
    limit: u32,
    strings: Strings,
}

impl MethodArea {
    /// Creates the area and pre-registers the three well-known strings the
    /// interpreter needs to locate the entry point.
    pub fn new(limit: u32) -> Result<Self, MemoryError> {
        let mut area = MethodArea {
            data: vec![0; limit as usize],
            cursor: 0,
            limit,
            strings: Strings::default(),
        };
        area.add_constant_string(ENTRY_CLASS)?;
        area.add_constant_string(ENTRY_METHOD)?;
        area.add_constant_string(ENTRY_DESCRIPTOR)?;
        Ok(area)
    }

    /// A handle onto the intern table.
    pub fn strings(&self) -> Strings {
        self.strings.clone()
    }

    /// Appends an immutable block and returns its absolute address.
    pub fn malloc(&mut self, bytes: &[u8]) -> Result<u32, MemoryError> {
        let len = bytes.len() as u32;
        if self.limit - self.cursor < len {
            return Err(MemoryError::MethodExhausted {
                requested: len,
                limit: self.limit,
            });
        }
        let offset = self.cursor;
        self.data[offset as usize..(offset + len) as usize].copy_from_slice(bytes);
        self.cursor += len;
        memory::encode(offset, Region::Method)
    }

    /// Interns a string constant, returning the canonical address for its
    /// value regardless of which module introduced it.
    pub fn add_constant_string(&mut self, value: &str) -> Result<u32, MemoryError> {
        if let Some(addr) = self.strings.lookup(value) {
            return Ok(addr);
        }
        let mut payload = Vec::with_capacity(4 + value.len());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value.as_bytes());
        let addr = self.malloc(&payload)?;
        self.strings.insert(value, addr);
        Ok(addr)
    }

    fn check(&self, offset: u32, len: u32) -> Result<(), MemoryError> {
        if offset >= self.cursor || self.cursor - offset < len {
            return Err(MemoryError::InvalidAddress {
                addr: memory::encode(offset, Region::Method).unwrap_or(0),
            });
        }
        Ok(())
    }

    /// Immutable bytes at a region offset, used to fetch instruction streams.
    pub fn bytes(&self, offset: u32, len: u32) -> Result<&[u8], MemoryError> {
        self.check(offset, len)?;
        Ok(&self.data[offset as usize..(offset + len) as usize])
    }

    pub fn read_u8(&self, offset: u32) -> Result<u8, MemoryError> {
        self.check(offset, 1)?;
        Ok(self.data[offset as usize])
    }

    /// Reads a length-prefixed string payload back from its region offset.
    pub fn load_string(&self, offset: u32) -> Result<String, MemoryError> {
        self.check(offset, 4)?;
        let at = offset as usize;
        let len = u32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ]);
        let bytes = self.bytes(offset + 4, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MemoryError::InvalidAddress {
            addr: memory::encode(offset, Region::Method).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Target;

    #[test]
    fn well_known_strings_are_preregistered() {
        let area = MethodArea::new(4096).unwrap();
        assert!(area.strings().lookup(ENTRY_CLASS).is_some());
        assert!(area.strings().lookup(ENTRY_METHOD).is_some());
        assert!(area.strings().lookup(ENTRY_DESCRIPTOR).is_some());
    }

    #[test]
    fn interning_is_content_keyed() {
        let mut area = MethodArea::new(4096).unwrap();
        let a = area.add_constant_string("abc").unwrap();
        let b = area.add_constant_string("abc").unwrap();
        let c = area.add_constant_string("abd").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn strings_read_back_from_their_address() {
        let mut area = MethodArea::new(4096).unwrap();
        let addr = area.add_constant_string("hello port").unwrap();
        let Target::At(Region::Method, offset) = memory::decode(addr) else {
            panic!("string address must decode into the method area");
        };
        assert_eq!(area.load_string(offset).unwrap(), "hello port");
    }

    #[test]
    fn code_blocks_are_immutable_appends() {
        let mut area = MethodArea::new(4096).unwrap();
        let code = [1u8, 2, 3, 4];
        let addr = area.malloc(&code).unwrap();
        let Target::At(Region::Method, offset) = memory::decode(addr) else {
            panic!("code address must decode into the method area");
        };
        assert_eq!(area.bytes(offset, 4).unwrap(), &code);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut area = MethodArea::new(64).unwrap();
        assert!(matches!(
            area.malloc(&[0; 128]),
            Err(MemoryError::MethodExhausted { .. })
        ));
    }
}
