//! Runtime records the loader links constant pools against.
//!
//! A loaded class is permanent: its static block address doubles as its
//! runtime type identity, and its dispatch table maps `(name, descriptor)`
//! pairs to method records so overloads resolve by exact descriptor match.

use std::collections::HashMap;
use std::rc::Rc;

use crate::descriptor::SlotKind;
use crate::heap::OBJECT_HEADER_SIZE;

/// One field's permanent place in an instance or static block layout.
/// Offsets are header-inclusive byte offsets from the block start.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub descriptor: String,
    pub kind: SlotKind,
    pub offset: u32,
}

#[derive(Debug)]
pub struct RuntimeClass {
    pub name: String,
    pub module: String,
    /// Absolute static area address of the class's static block; the
    /// process-wide type identity of the class.
    pub statics_addr: u32,
    /// Header-inclusive byte size of an instance.
    pub instance_size: u32,
    /// Header-inclusive byte size of the static block.
    pub static_size: u32,
    pub instance_fields: Vec<FieldLayout>,
    pub static_fields: Vec<FieldLayout>,
    /// Dispatch table keyed by (name, descriptor).
    pub methods: HashMap<(String, String), Rc<RuntimeMethod>>,
}

impl RuntimeClass {
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&Rc<RuntimeMethod>> {
        self.methods
            .get(&(name.to_owned(), descriptor.to_owned()))
    }

    /// Finds a field by exact name and descriptor in either layout.
    /// The second component tells whether it is static.
    pub fn field(&self, name: &str, descriptor: &str) -> Option<(&FieldLayout, bool)> {
        let probe = |fields: &'_ Vec<FieldLayout>| {
            fields
                .iter()
                .position(|f| f.name == name && f.descriptor == descriptor)
        };
        if let Some(at) = probe(&self.static_fields) {
            return Some((&self.static_fields[at], true));
        }
        if let Some(at) = probe(&self.instance_fields) {
            return Some((&self.instance_fields[at], false));
        }
        None
    }

    /// Whether the class declares any field or method yet.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
            && self.instance_size == OBJECT_HEADER_SIZE
            && self.static_size == OBJECT_HEADER_SIZE
    }
}

#[derive(Debug)]
pub struct RuntimeMethod {
    /// Declaring class name.
    pub owner: String,
    /// Module the declaring class lives in.
    pub module: String,
    pub name: String,
    pub descriptor: String,
    /// Local-variable descriptor: one field descriptor per local, in order.
    pub locals: String,
    pub flags: u16,
    /// Absolute method area address of the code block; the method identity
    /// saved in frame headers.
    pub code_addr: u32,
    pub code_len: u32,
}

/// A resolved field constant: the declaring class plus the field's permanent
/// offset in its static block or instance layout.
#[derive(Debug, Clone)]
pub struct FieldRef {
    pub class: Rc<RuntimeClass>,
    pub name: String,
    pub descriptor: String,
    pub kind: SlotKind,
    pub is_static: bool,
    pub offset: u32,
}

/// A linked module: its link tables translate the module's own 1-based
/// constant pool indices into runtime records and addresses. External
/// entries are `None` until the loader's resolution pass patches them;
/// after a successful load every entry is `Some`.
#[derive(Debug)]
pub struct ModuleRecord {
    pub name: String,
    /// String pool link table: local index - 1 → method area address.
    pub strings: Vec<u32>,
    /// Class pool link table.
    pub classes: Vec<Option<Rc<RuntimeClass>>>,
    /// Field pool link table.
    pub fields: Vec<Option<FieldRef>>,
    /// Method pool link table.
    pub methods: Vec<Option<Rc<RuntimeMethod>>>,
    /// Directory of the classes this module itself defines.
    pub own_classes: HashMap<String, Rc<RuntimeClass>>,
}
