//! The virtual machine instance.
//!
//! A [`Vm`] owns every store of the unified address space: the execution
//! stack, heap, static area, method area, and the module registry. The
//! loader, interpreter, and collector all borrow it; there are no process
//! globals, so any number of independent instances can coexist.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

use log::info;

use crate::classes::{ModuleRecord, RuntimeClass, RuntimeMethod};
use crate::descriptor::{self, SlotKind};
use crate::error::{LoadError, MemoryError, VmResult};
use crate::gc::{self, CollectionStats};
use crate::heap::Heap;
use crate::interpreter::Interpreter;
use crate::loader::{LoadStats, Loader};
use crate::memory::{self, Region};
use crate::methods::{ENTRY_CLASS, ENTRY_DESCRIPTOR, ENTRY_METHOD, MethodArea};
use crate::stack::Stack;
use crate::statics::StaticArea;

/// When the collector runs. Explicit collection through [`Vm::collect`] is
/// always available; this knob only picks the automatic trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcPolicy {
    /// Only explicit collections.
    #[default]
    Never,
    /// Collect and retry once when a heap allocation fails.
    OnAllocFailure,
    /// Collect every n executed instructions.
    Periodic(u64),
}

/// Construction parameters. Capacities may be lowered below the fixed
/// region sizes but never raised past them, since the region sizes are part
/// of the address encoding.
#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    pub stack_slots: u32,
    pub heap_size: u32,
    pub static_size: u32,
    pub method_size: u32,
    pub gc: GcPolicy,
    /// Directories searched for `<name>.rx` dependency modules.
    pub module_paths: Vec<PathBuf>,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        VmCreateInfo {
            stack_slots: memory::STACK_SIZE,
            heap_size: memory::HEAP_SIZE,
            static_size: memory::STATIC_SIZE,
            method_size: memory::METHOD_SIZE,
            gc: GcPolicy::default(),
            module_paths: Vec::new(),
        }
    }
}

pub struct Vm {
    pub stack: Stack,
    pub heap: Heap,
    pub statics: StaticArea,
    pub methods: MethodArea,
    /// Resident modules by name.
    pub modules: HashMap<String, ModuleRecord>,
    /// Runtime classes keyed by their type identity address.
    pub classes_by_type: HashMap<u32, Rc<RuntimeClass>>,
    /// Method records keyed by code address, the identity saved in frames.
    pub methods_by_addr: HashMap<u32, Rc<RuntimeMethod>>,
    pub gc: GcPolicy,
    pub(crate) out: Box<dyn Write>,
    pending_sources: HashMap<String, Vec<u8>>,
    module_paths: Vec<PathBuf>,
    load_stats: LoadStats,
}

impl Vm {
    pub fn new(info: VmCreateInfo) -> VmResult<Self> {
        for (size, region) in [
            (info.stack_slots, Region::Stack),
            (info.heap_size, Region::Heap),
            (info.static_size, Region::Static),
            (info.method_size, Region::Method),
        ] {
            if size > region.limit() {
                return Err(MemoryError::RegionOverflow {
                    region,
                    offset: size,
                }
                .into());
            }
        }
        Ok(Vm {
            stack: Stack::new(info.stack_slots),
            heap: Heap::new(info.heap_size),
            statics: StaticArea::new(info.static_size),
            methods: MethodArea::new(info.method_size)?,
            modules: HashMap::new(),
            classes_by_type: HashMap::new(),
            methods_by_addr: HashMap::new(),
            gc: info.gc,
            out: Box::new(io::stdout()),
            pending_sources: HashMap::new(),
            module_paths: info.module_paths,
            load_stats: LoadStats::default(),
        })
    }

    /// Redirects console port output, e.g. into a buffer for tests.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    /// Registers module bytes under a name so dependency resolution can find
    /// them without touching the filesystem.
    pub fn provide_module(&mut self, name: &str, bytes: Vec<u8>) {
        self.pending_sources.insert(name.to_owned(), bytes);
    }

    /// Finds the bytes for a dependency: provided sources first, then
    /// `<name>.rx` on the module path.
    pub(crate) fn fetch_module_bytes(&self, name: &str) -> Result<Vec<u8>, LoadError> {
        if let Some(bytes) = self.pending_sources.get(name) {
            return Ok(bytes.clone());
        }
        for dir in &self.module_paths {
            let candidate = dir.join(format!("{name}.rx"));
            if candidate.exists() {
                return std::fs::read(&candidate).map_err(|source| LoadError::Io {
                    name: name.to_owned(),
                    source,
                });
            }
        }
        Err(LoadError::ModuleNotFound {
            name: name.to_owned(),
        })
    }

    /// Loads a module and its transitive dependencies, returning the root
    /// module's name.
    pub fn load_module(&mut self, bytes: &[u8]) -> VmResult<String> {
        let (name, stats) = Loader::new(self).load(bytes)?;
        self.load_stats = stats;
        Ok(name)
    }

    /// Diagnostics from the most recent load.
    pub fn load_stats(&self) -> LoadStats {
        self.load_stats
    }

    /// Runs one explicit collection cycle.
    pub fn collect(&mut self) -> VmResult<CollectionStats> {
        let Vm {
            stack,
            heap,
            classes_by_type,
            ..
        } = self;
        Ok(gc::collect(stack, heap, classes_by_type)?)
    }

    /// Locates the conventional entry point of a resident module and runs it
    /// to completion.
    pub fn run(&mut self, module: &str) -> VmResult<()> {
        let entry = self.entry_method(module)?;
        info!("running {module}/{ENTRY_CLASS}.{ENTRY_METHOD}{ENTRY_DESCRIPTOR}");
        // The entry frame: identity 0 marks it as the bottom of the call
        // stack, so its return ends execution.
        self.stack.push_frame(0, 0)?;
        for kind in descriptor::parse_locals(&entry.locals)? {
            match kind {
                SlotKind::Byte => self.stack.push_byte(0)?,
                SlotKind::Int => self.stack.push_int(0)?,
                SlotKind::Double => self.stack.push_double(0.0)?,
                SlotKind::Address => self.stack.push_address(0)?,
            }
        }
        Interpreter::new(self, entry)?.run()
    }

    /// Loads a root module and immediately runs its entry point.
    pub fn load_and_run(&mut self, bytes: &[u8]) -> VmResult<()> {
        let name = self.load_module(bytes)?;
        self.run(&name)
    }

    fn entry_method(&self, module: &str) -> Result<Rc<RuntimeMethod>, LoadError> {
        let missing = || LoadError::MissingEntryPoint {
            class: ENTRY_CLASS.to_owned(),
            method: ENTRY_METHOD.to_owned(),
            descriptor: ENTRY_DESCRIPTOR.to_owned(),
        };
        let record = self.modules.get(module).ok_or_else(|| {
            LoadError::ModuleNotFound {
                name: module.to_owned(),
            }
        })?;
        let class = record.own_classes.get(ENTRY_CLASS).ok_or_else(missing)?;
        class
            .method(ENTRY_METHOD, ENTRY_DESCRIPTOR)
            .cloned()
            .ok_or_else(missing)
    }
}
