//! The module loader and cross-module linker.
//!
//! Loading a module walks a fixed sequence: intern the string pool, split
//! the class pool into local definitions and external references, assign
//! every local field its permanent layout slot, allocate static blocks
//! (fixing each class's type identity), realize methods into the method
//! area, then load referenced modules breadth-first and resolve every
//! deferred entry by exact (module, class, member, descriptor) match.
//!
//! A module is registered only after its own pools fully materialize, and a
//! failed load wave unregisters everything it brought in, so no partial
//! module is ever left resident. Bytes already appended to the static and
//! method areas by a failed wave are unreachable but not reclaimed; both
//! areas are append-only by design.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::classes::{FieldLayout, FieldRef, ModuleRecord, RuntimeClass, RuntimeMethod};
use crate::descriptor;
use crate::error::{LoadError, VmError, VmResult};
use crate::heap::OBJECT_HEADER_SIZE;
use crate::memory::{self, Region};
use crate::module::{ModuleImage, flags};
use crate::vm::Vm;

/// Load-time diagnostics: the root module's own load time and the cumulative
/// time spent loading its transitive dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    pub root: Duration,
    pub dependencies: Duration,
}

/// Where a constant pool entry must be patched once its module is resident.
#[derive(Debug)]
enum Pending {
    Class {
        index: usize,
        module: String,
        class: String,
    },
    Field {
        index: usize,
        module: String,
        class: String,
        name: String,
        descriptor: String,
    },
    Method {
        index: usize,
        module: String,
        class: String,
        name: String,
        descriptor: String,
    },
}

struct ClassBuilder {
    name: String,
    instance_size: u32,
    static_size: u32,
    instance_fields: Vec<FieldLayout>,
    static_fields: Vec<FieldLayout>,
    methods: HashMap<(String, String), Rc<RuntimeMethod>>,
    statics_addr: u32,
}

enum PoolClass {
    Local(usize),
    External { module: String, name: String },
}

pub struct Loader<'vm> {
    vm: &'vm mut Vm,
    /// Modules registered by the current load wave, for rollback.
    registered: Vec<String>,
    added_types: Vec<u32>,
    added_methods: Vec<u32>,
    pending: Vec<(String, Pending)>,
    stats: LoadStats,
}

impl<'vm> Loader<'vm> {
    pub fn new(vm: &'vm mut Vm) -> Self {
        Loader {
            vm,
            registered: Vec::new(),
            added_types: Vec::new(),
            added_methods: Vec::new(),
            pending: Vec::new(),
            stats: LoadStats::default(),
        }
    }

    /// Loads a root module and, breadth-first, every module it transitively
    /// references, then resolves all deferred references. Returns the root
    /// module's name.
    pub fn load(mut self, bytes: &[u8]) -> VmResult<(String, LoadStats)> {
        match self.load_wave(bytes) {
            Ok(name) => {
                info!(
                    "loaded {}: root {:?}, dependencies {:?}",
                    name, self.stats.root, self.stats.dependencies
                );
                Ok((name, self.stats))
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn load_wave(&mut self, bytes: &[u8]) -> VmResult<String> {
        let started = Instant::now();
        let image = ModuleImage::decode(bytes)?;
        let (root, mut queue) = self.load_image(image)?;
        self.stats.root = started.elapsed();

        let dep_start = Instant::now();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(dep) = queue.pop_front() {
            if self.vm.modules.contains_key(&dep) || !seen.insert(dep.clone()) {
                continue;
            }
            debug!("loading dependency {dep}");
            let bytes = self.vm.fetch_module_bytes(&dep)?;
            let image = ModuleImage::decode(&bytes)?;
            let loaded = image.name_or_unknown().to_owned();
            if loaded != dep {
                return Err(LoadError::ModuleNotFound { name: dep }.into());
            }
            let (_, deps) = self.load_image(image)?;
            queue.extend(deps);
        }
        self.resolve_pending()?;
        self.stats.dependencies = dep_start.elapsed();
        Ok(root)
    }

    /// Realizes one module image into runtime records and registers it.
    /// Returns the module name and the names of modules it references.
    fn load_image(&mut self, image: ModuleImage) -> VmResult<(String, VecDeque<String>)> {
        let module_name = image.string(image.name)?.to_owned();
        if self.vm.modules.contains_key(&module_name) {
            return Ok((module_name, VecDeque::new()));
        }
        debug!("loading module {module_name}");

        // (1) Intern the string pool.
        let mut strings = Vec::with_capacity(image.strings.len());
        for value in &image.strings {
            strings.push(self.vm.methods.add_constant_string(value)?);
        }

        // (2) Split the class pool into local definitions and external
        // references.
        let mut builders: Vec<ClassBuilder> = Vec::new();
        let mut pool_classes: Vec<PoolClass> = Vec::new();
        let mut deps: VecDeque<String> = VecDeque::new();
        for entry in &image.classes {
            let owner = image.string(entry.module)?;
            let class_name = image.string(entry.name)?;
            if owner == module_name {
                if builders.iter().any(|b| b.name == class_name) {
                    return Err(LoadError::DuplicateClass {
                        module: module_name,
                        class: class_name.to_owned(),
                    }
                    .into());
                }
                pool_classes.push(PoolClass::Local(builders.len()));
                builders.push(ClassBuilder {
                    name: class_name.to_owned(),
                    instance_size: OBJECT_HEADER_SIZE,
                    static_size: OBJECT_HEADER_SIZE,
                    instance_fields: Vec::new(),
                    static_fields: Vec::new(),
                    methods: HashMap::new(),
                    statics_addr: 0,
                });
            } else {
                deps.push_back(owner.to_owned());
                pool_classes.push(PoolClass::External {
                    module: owner.to_owned(),
                    name: class_name.to_owned(),
                });
            }
        }

        // (3) Assign every field of a local class its permanent layout slot;
        // fields of external classes are deferred.
        struct LocalField {
            builder: usize,
            name: String,
            descriptor: String,
            kind: descriptor::SlotKind,
            is_static: bool,
            offset: u32,
        }
        let mut field_links: Vec<Option<LocalField>> = Vec::new();
        let mut pending_here: Vec<Pending> = Vec::new();
        for (index, field) in image.fields.iter().enumerate() {
            let pool_class = pool_class(&pool_classes, field.class, &module_name, "class")?;
            let name = image.string(field.name)?.to_owned();
            let desc = image.string(field.descriptor)?.to_owned();
            match pool_class {
                PoolClass::Local(at) => {
                    let builder = &mut builders[*at];
                    if builder
                        .instance_fields
                        .iter()
                        .chain(&builder.static_fields)
                        .any(|f| f.name == name && f.descriptor == desc)
                    {
                        return Err(LoadError::DuplicateMember {
                            class: builder.name.clone(),
                            name,
                            descriptor: desc,
                        }
                        .into());
                    }
                    let kind = descriptor::parse_field(&desc)?;
                    let size = kind.byte_size();
                    let is_static = field.flags & flags::STATIC != 0;
                    let (cursor, layout) = if is_static {
                        (&mut builder.static_size, &mut builder.static_fields)
                    } else {
                        (&mut builder.instance_size, &mut builder.instance_fields)
                    };
                    let offset = *cursor;
                    *cursor += size;
                    layout.push(FieldLayout {
                        name: name.clone(),
                        descriptor: desc.clone(),
                        kind,
                        offset,
                    });
                    field_links.push(Some(LocalField {
                        builder: *at,
                        name,
                        descriptor: desc,
                        kind,
                        is_static,
                        offset,
                    }));
                }
                PoolClass::External { module, name: class } => {
                    pending_here.push(Pending::Field {
                        index,
                        module: module.clone(),
                        class: class.clone(),
                        name,
                        descriptor: desc,
                    });
                    field_links.push(None);
                }
            }
        }

        // (4) Sizes are final; allocate each local class's static block.
        // The block's address is the class's permanent type identity.
        for builder in &mut builders {
            let offset = self.vm.statics.malloc(builder.static_size)?;
            let addr = memory::encode(offset, Region::Static)?;
            // Static block header: type info refers to the block itself.
            self.vm.statics.write_u32(offset, addr)?;
            builder.statics_addr = addr;
        }

        // (5) Realize methods of local classes into the method area and
        // their class dispatch tables.
        let mut method_links: Vec<Option<Rc<RuntimeMethod>>> = Vec::new();
        for (index, method) in image.methods.iter().enumerate() {
            let pool_class = pool_class(&pool_classes, method.class, &module_name, "class")?;
            let name = image.string(method.name)?.to_owned();
            let desc = image.string(method.descriptor)?.to_owned();
            match pool_class {
                PoolClass::Local(at) => {
                    let builder = &mut builders[*at];
                    descriptor::parse_method(&desc)?;
                    let locals = if method.locals == 0 {
                        String::new()
                    } else {
                        image.string(method.locals)?.to_owned()
                    };
                    descriptor::parse_locals(&locals)?;
                    let code_addr = self.vm.methods.malloc(&method.code)?;
                    let record = Rc::new(RuntimeMethod {
                        owner: builder.name.clone(),
                        module: module_name.clone(),
                        name: name.clone(),
                        descriptor: desc.clone(),
                        locals,
                        flags: method.flags,
                        code_addr,
                        code_len: method.code.len() as u32,
                    });
                    if builder
                        .methods
                        .insert((name.clone(), desc.clone()), record.clone())
                        .is_some()
                    {
                        return Err(LoadError::DuplicateMember {
                            class: builder.name.clone(),
                            name,
                            descriptor: desc,
                        }
                        .into());
                    }
                    self.vm.methods_by_addr.insert(code_addr, record.clone());
                    self.added_methods.push(code_addr);
                    method_links.push(Some(record));
                }
                PoolClass::External { module, name: class } => {
                    pending_here.push(Pending::Method {
                        index,
                        module: module.clone(),
                        class: class.clone(),
                        name,
                        descriptor: desc,
                    });
                    method_links.push(None);
                }
            }
        }

        // Freeze the local classes and assemble the link tables.
        let mut own_classes = HashMap::new();
        let classes: Vec<Rc<RuntimeClass>> = builders
            .into_iter()
            .map(|builder| {
                let class = Rc::new(RuntimeClass {
                    name: builder.name.clone(),
                    module: module_name.clone(),
                    statics_addr: builder.statics_addr,
                    instance_size: builder.instance_size,
                    static_size: builder.static_size,
                    instance_fields: builder.instance_fields,
                    static_fields: builder.static_fields,
                    methods: builder.methods,
                });
                self.vm
                    .classes_by_type
                    .insert(class.statics_addr, class.clone());
                self.added_types.push(class.statics_addr);
                own_classes.insert(builder.name, class.clone());
                class
            })
            .collect();

        let class_links: Vec<Option<Rc<RuntimeClass>>> = pool_classes
            .iter()
            .enumerate()
            .map(|(index, pool_class)| match pool_class {
                PoolClass::Local(at) => Some(classes[*at].clone()),
                PoolClass::External { module, name } => {
                    pending_here.push(Pending::Class {
                        index,
                        module: module.clone(),
                        class: name.clone(),
                    });
                    None
                }
            })
            .collect();

        let field_refs: Vec<Option<FieldRef>> = field_links
            .into_iter()
            .map(|link| {
                link.map(|local| FieldRef {
                    class: classes[local.builder].clone(),
                    name: local.name,
                    descriptor: local.descriptor,
                    kind: local.kind,
                    is_static: local.is_static,
                    offset: local.offset,
                })
            })
            .collect();

        self.vm.modules.insert(
            module_name.clone(),
            ModuleRecord {
                name: module_name.clone(),
                strings,
                classes: class_links,
                fields: field_refs,
                methods: method_links,
                own_classes,
            },
        );
        self.registered.push(module_name.clone());
        self.pending
            .extend(pending_here.into_iter().map(|p| (module_name.clone(), p)));

        Ok((module_name, deps))
    }

    /// Step (7): every deferred entry must resolve against a now-resident
    /// module by exact match; anything unresolved is a fatal link error.
    fn resolve_pending(&mut self) -> VmResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for (owner, entry) in pending {
            match entry {
                Pending::Class {
                    index,
                    module,
                    class,
                } => {
                    let target = self.find_class(&module, &class)?;
                    self.vm
                        .modules
                        .get_mut(&owner)
                        .expect("owner module is resident")
                        .classes[index] = Some(target);
                }
                Pending::Field {
                    index,
                    module,
                    class,
                    name,
                    descriptor,
                } => {
                    let target = self.find_class(&module, &class)?;
                    let (layout, is_static) =
                        target.field(&name, &descriptor).ok_or_else(|| {
                            LoadError::UnresolvedSymbol {
                                module: module.clone(),
                                class: class.clone(),
                                member: format!(".{name}:{descriptor}"),
                            }
                        })?;
                    let field_ref = FieldRef {
                        class: target.clone(),
                        name,
                        descriptor,
                        kind: layout.kind,
                        is_static,
                        offset: layout.offset,
                    };
                    self.vm
                        .modules
                        .get_mut(&owner)
                        .expect("owner module is resident")
                        .fields[index] = Some(field_ref);
                }
                Pending::Method {
                    index,
                    module,
                    class,
                    name,
                    descriptor,
                } => {
                    let target = self.find_class(&module, &class)?;
                    let record = target.method(&name, &descriptor).cloned().ok_or_else(|| {
                        LoadError::UnresolvedSymbol {
                            module: module.clone(),
                            class: class.clone(),
                            member: format!(".{name}{descriptor}"),
                        }
                    })?;
                    self.vm
                        .modules
                        .get_mut(&owner)
                        .expect("owner module is resident")
                        .methods[index] = Some(record);
                }
            }
        }
        Ok(())
    }

    fn find_class(&self, module: &str, class: &str) -> Result<Rc<RuntimeClass>, LoadError> {
        self.vm
            .modules
            .get(module)
            .and_then(|record| record.own_classes.get(class).cloned())
            .ok_or_else(|| LoadError::UnresolvedSymbol {
                module: module.to_owned(),
                class: class.to_owned(),
                member: String::new(),
            })
    }

    fn rollback(&mut self) {
        for name in self.registered.drain(..) {
            debug!("unregistering {name} after failed load");
            self.vm.modules.remove(&name);
        }
        for addr in self.added_types.drain(..) {
            self.vm.classes_by_type.remove(&addr);
        }
        for addr in self.added_methods.drain(..) {
            self.vm.methods_by_addr.remove(&addr);
        }
    }
}

fn pool_class<'a>(
    pool: &'a [PoolClass],
    index: u16,
    module: &str,
    what: &'static str,
) -> Result<&'a PoolClass, VmError> {
    if index == 0 || index as usize > pool.len() {
        return Err(LoadError::UnresolvedSymbol {
            module: module.to_owned(),
            class: format!("<{what} pool index {index}>"),
            member: String::new(),
        }
        .into());
    }
    Ok(&pool[index as usize - 1])
}
