//! The descriptor mini-language.
//!
//! Types are short strings: `B` byte, `I` four-byte int, `D` eight-byte
//! double, `L` address, `[` followed by an element descriptor for
//! array-of. A method descriptor is `(` + parameter descriptors + `)` +
//! return descriptor, with `V` for void. Overload matching is an exact
//! string comparison on the full descriptor.

use crate::error::LoadError;

/// The kind of value a stack slot holds, as named by a descriptor letter.
///
/// Arrays count as addresses; a double occupies two slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Byte,
    Int,
    Double,
    Address,
}

impl SlotKind {
    /// Stack slots occupied by a value of this kind.
    pub fn slots(self) -> u32 {
        match self {
            SlotKind::Double => 2,
            _ => 1,
        }
    }

    /// Bytes occupied by a field of this kind.
    pub fn byte_size(self) -> u32 {
        match self {
            SlotKind::Byte => 1,
            SlotKind::Int => 4,
            SlotKind::Double => 8,
            SlotKind::Address => 4,
        }
    }
}

/// A parsed method descriptor: ordered parameter kinds plus return kind,
/// `None` for void.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<SlotKind>,
    pub ret: Option<SlotKind>,
}

impl MethodDescriptor {
    /// Total stack slots occupied by the parameters.
    pub fn param_slots(&self) -> u32 {
        self.params.iter().map(|kind| kind.slots()).sum()
    }

    /// Stack slots occupied by the return value, 0 for void.
    pub fn return_slots(&self) -> u32 {
        self.ret.map_or(0, SlotKind::slots)
    }
}

fn bad(descriptor: &str) -> LoadError {
    LoadError::BadDescriptor {
        descriptor: descriptor.to_owned(),
    }
}

/// Reads one field descriptor from the front of `chars`, consuming array
/// prefixes. Returns the slot kind of the whole descriptor.
fn take_field(chars: &mut std::str::Chars<'_>, whole: &str) -> Result<SlotKind, LoadError> {
    match chars.next() {
        Some('B') => Ok(SlotKind::Byte),
        Some('I') => Ok(SlotKind::Int),
        Some('D') => Ok(SlotKind::Double),
        Some('L') => Ok(SlotKind::Address),
        Some('[') => {
            // The element descriptor is consumed but an array is always
            // a single address.
            take_field(chars, whole)?;
            Ok(SlotKind::Address)
        }
        _ => Err(bad(whole)),
    }
}

/// Parses a single field descriptor such as `I` or `[D`.
pub fn parse_field(descriptor: &str) -> Result<SlotKind, LoadError> {
    let mut chars = descriptor.chars();
    let kind = take_field(&mut chars, descriptor)?;
    if chars.next().is_some() {
        return Err(bad(descriptor));
    }
    Ok(kind)
}

/// Bytes a field of the given descriptor occupies in an object or static
/// block. Arrays are references, so they take address width.
pub fn field_byte_size(descriptor: &str) -> Result<u32, LoadError> {
    Ok(parse_field(descriptor)?.byte_size())
}

/// Parses a method descriptor such as `(ID)V` or `([I)L`.
pub fn parse_method(descriptor: &str) -> Result<MethodDescriptor, LoadError> {
    let mut chars = descriptor.chars();
    if chars.next() != Some('(') {
        return Err(bad(descriptor));
    }
    let mut params = Vec::new();
    loop {
        match chars.clone().next() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => params.push(take_field(&mut chars, descriptor)?),
            None => return Err(bad(descriptor)),
        }
    }
    let ret = match chars.next() {
        Some('V') => None,
        Some('B') => Some(SlotKind::Byte),
        Some('I') => Some(SlotKind::Int),
        Some('D') => Some(SlotKind::Double),
        Some('L') => Some(SlotKind::Address),
        Some('[') => {
            take_field(&mut chars, descriptor)?;
            Some(SlotKind::Address)
        }
        _ => return Err(bad(descriptor)),
    };
    if chars.next().is_some() {
        return Err(bad(descriptor));
    }
    Ok(MethodDescriptor { params, ret })
}

/// Parses a local-variable descriptor: a flat run of field descriptors, one
/// entry per local, in declaration order.
pub fn parse_locals(descriptor: &str) -> Result<Vec<SlotKind>, LoadError> {
    let mut chars = descriptor.chars();
    let mut kinds = Vec::new();
    while chars.clone().next().is_some() {
        kinds.push(take_field(&mut chars, descriptor)?);
    }
    Ok(kinds)
}
