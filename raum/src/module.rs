//! The binary module format.
//!
//! A module is a self-describing record: magic number, string pool, three
//! parallel constant pools (class, field, method) and the module's own name.
//! All cross-references are 1-based indices into the corresponding pool;
//! index 0 means "none". Everything is little-endian.
//!
//! The front end that emits modules is a separate tool; [`ModuleBuilder`]
//! exists so embedders and tests can assemble modules in memory.

use crate::error::LoadError;

/// `"RAUM"` read as a little-endian word. The region sizes in
/// [`memory`](crate::memory) are versioned with this value.
pub const MAGIC: u32 = 0x4D55_4152;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassConst {
    /// String index of the owning module's name.
    pub module: u16,
    pub name: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldConst {
    /// Class pool index of the declaring class.
    pub class: u16,
    pub name: u16,
    pub descriptor: u16,
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodConst {
    pub class: u16,
    pub name: u16,
    pub descriptor: u16,
    pub flags: u16,
    /// String index of the local-variable descriptor.
    pub locals: u16,
    pub code: Vec<u8>,
}

/// Field and method access flags.
pub mod flags {
    /// The member belongs to the class, not to instances.
    pub const STATIC: u16 = 1 << 0;
}

/// A deserialized module, before any linking.
#[derive(Debug, Clone, Default)]
pub struct ModuleImage {
    pub strings: Vec<String>,
    pub classes: Vec<ClassConst>,
    pub fields: Vec<FieldConst>,
    pub methods: Vec<MethodConst>,
    pub name: u16,
}

impl ModuleImage {
    /// Resolves a 1-based string pool index.
    pub fn string(&self, index: u16) -> Result<&str, LoadError> {
        if index == 0 || index as usize > self.strings.len() {
            return Err(LoadError::BadStringIndex {
                module: self.name_or_unknown().to_owned(),
                index,
            });
        }
        Ok(&self.strings[index as usize - 1])
    }

    /// The module's own name, or a placeholder while the image is malformed.
    pub fn name_or_unknown(&self) -> &str {
        if self.name == 0 || self.name as usize > self.strings.len() {
            "<unknown>"
        } else {
            &self.strings[self.name as usize - 1]
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LoadError> {
        let mut reader = Reader { bytes, at: 0 };
        let magic = reader.u32("magic")?;
        if magic != MAGIC {
            return Err(LoadError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }

        let string_count = reader.u16("string pool count")?;
        let mut strings = Vec::with_capacity(string_count as usize);
        for _ in 0..string_count {
            let len = reader.u16("string length")?;
            let raw = reader.take(len as usize, "string bytes")?;
            let value = std::str::from_utf8(raw).map_err(|_| LoadError::Truncated {
                what: "string bytes",
            })?;
            strings.push(value.to_owned());
        }

        let class_count = reader.u16("class pool count")?;
        let mut classes = Vec::with_capacity(class_count as usize);
        for _ in 0..class_count {
            classes.push(ClassConst {
                module: reader.u16("class module index")?,
                name: reader.u16("class name index")?,
            });
        }

        let field_count = reader.u16("field pool count")?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(FieldConst {
                class: reader.u16("field class index")?,
                name: reader.u16("field name index")?,
                descriptor: reader.u16("field descriptor index")?,
                flags: reader.u16("field flags")?,
            });
        }

        let method_count = reader.u16("method pool count")?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let class = reader.u16("method class index")?;
            let name = reader.u16("method name index")?;
            let descriptor = reader.u16("method descriptor index")?;
            let method_flags = reader.u16("method flags")?;
            let locals = reader.u16("method locals index")?;
            let code_len = reader.u32("method code length")?;
            let code = reader.take(code_len as usize, "method code")?.to_vec();
            methods.push(MethodConst {
                class,
                name,
                descriptor,
                flags: method_flags,
                locals,
                code,
            });
        }

        let name = reader.u16("module name index")?;
        Ok(ModuleImage {
            strings,
            classes,
            fields,
            methods,
            name,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.strings.len() as u16).to_le_bytes());
        for value in &self.strings {
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out.extend_from_slice(&(self.classes.len() as u16).to_le_bytes());
        for class in &self.classes {
            out.extend_from_slice(&class.module.to_le_bytes());
            out.extend_from_slice(&class.name.to_le_bytes());
        }
        out.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for field in &self.fields {
            out.extend_from_slice(&field.class.to_le_bytes());
            out.extend_from_slice(&field.name.to_le_bytes());
            out.extend_from_slice(&field.descriptor.to_le_bytes());
            out.extend_from_slice(&field.flags.to_le_bytes());
        }
        out.extend_from_slice(&(self.methods.len() as u16).to_le_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.class.to_le_bytes());
            out.extend_from_slice(&method.name.to_le_bytes());
            out.extend_from_slice(&method.descriptor.to_le_bytes());
            out.extend_from_slice(&method.flags.to_le_bytes());
            out.extend_from_slice(&method.locals.to_le_bytes());
            out.extend_from_slice(&(method.code.len() as u32).to_le_bytes());
            out.extend_from_slice(&method.code);
        }
        out.extend_from_slice(&self.name.to_le_bytes());
        out
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
        if self.bytes.len() - self.at < len {
            return Err(LoadError::Truncated { what });
        }
        let out = &self.bytes[self.at..self.at + len];
        self.at += len;
        Ok(out)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, LoadError> {
        let raw = self.take(2, what)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, LoadError> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

/// Assembles a [`ModuleImage`] in memory, deduplicating the string pool.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    image: ModuleImage,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = ModuleBuilder {
            image: ModuleImage::default(),
        };
        builder.image.name = builder.string(name);
        builder
    }

    /// Interns `value` in the string pool, returning its 1-based index.
    pub fn string(&mut self, value: &str) -> u16 {
        if let Some(at) = self.image.strings.iter().position(|s| s == value) {
            return (at + 1) as u16;
        }
        self.image.strings.push(value.to_owned());
        self.image.strings.len() as u16
    }

    /// Declares a class owned by `module`, returning its 1-based class pool
    /// index. Referencing a class of another module works the same way; the
    /// loader marks it external.
    pub fn class(&mut self, module: &str, name: &str) -> u16 {
        let module = self.string(module);
        let name = self.string(name);
        if let Some(at) = self
            .image
            .classes
            .iter()
            .position(|c| c.module == module && c.name == name)
        {
            return (at + 1) as u16;
        }
        self.image.classes.push(ClassConst { module, name });
        self.image.classes.len() as u16
    }

    /// Declares a field of `class`, returning its 1-based field pool index.
    pub fn field(&mut self, class: u16, name: &str, descriptor: &str, field_flags: u16) -> u16 {
        let name = self.string(name);
        let descriptor = self.string(descriptor);
        self.image.fields.push(FieldConst {
            class,
            name,
            descriptor,
            flags: field_flags,
        });
        self.image.fields.len() as u16
    }

    /// Declares a method of `class` with its code, returning its 1-based
    /// method pool index.
    pub fn method(
        &mut self,
        class: u16,
        name: &str,
        descriptor: &str,
        locals: &str,
        code: Vec<u8>,
    ) -> u16 {
        let name = self.string(name);
        let descriptor = self.string(descriptor);
        let locals = self.string(locals);
        self.image.methods.push(MethodConst {
            class,
            name,
            descriptor,
            flags: 0,
            locals,
            code,
        });
        self.image.methods.len() as u16
    }

    pub fn build(self) -> ModuleImage {
        self.image
    }

    pub fn encode(self) -> Vec<u8> {
        self.image.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut builder = ModuleBuilder::new("main");
        let class = builder.class("main", "Main");
        builder.field(class, "counter", "I", flags::STATIC);
        builder.method(class, "main", "()V", "", vec![0x41]);
        let image = builder.build();

        let decoded = ModuleImage::decode(&image.encode()).unwrap();
        assert_eq!(decoded.name_or_unknown(), "main");
        assert_eq!(decoded.classes, image.classes);
        assert_eq!(decoded.fields, image.fields);
        assert_eq!(decoded.methods, image.methods);
        assert_eq!(decoded.strings, image.strings);
    }

    #[test]
    fn string_pool_deduplicates() {
        let mut builder = ModuleBuilder::new("main");
        let a = builder.string("Main");
        let b = builder.string("Main");
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = ModuleBuilder::new("main").encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ModuleImage::decode(&bytes),
            Err(LoadError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = ModuleBuilder::new("main").encode();
        assert!(matches!(
            ModuleImage::decode(&bytes[..bytes.len() - 1]),
            Err(LoadError::Truncated { .. })
        ));
    }

    #[test]
    fn string_indices_are_one_based() {
        let mut builder = ModuleBuilder::new("main");
        let idx = builder.string("hello");
        let image = builder.build();
        assert_eq!(image.string(idx).unwrap(), "hello");
        assert!(image.string(0).is_err());
        assert!(image.string(99).is_err());
    }
}
