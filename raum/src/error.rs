//! Error taxonomy for the virtual machine.
//!
//! Three kinds of failure are distinguished so a host embedding the VM can
//! decide per kind whether to abort or isolate:
//!
//! - [`LoadError`]: a module is malformed or unlinkable, surfaced before any
//!   instruction executes.
//! - [`MemoryError`]: a capacity or addressing violation, surfaced mid-execution.
//! - [`ExecutionError`]: unsupported or structurally invalid bytecode; this
//!   indicates a producer bug, not a runtime-data bug.
//!
//! None of these are caught and retried internally, with one exception: heap
//! exhaustion under [`GcPolicy::OnAllocFailure`](crate::GcPolicy) triggers a
//! collection and retries the allocation once.

use thiserror::Error;

use crate::memory::Region;

pub type VmResult<T> = std::result::Result<T, VmError>;

/// A module could not be loaded or linked.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("incorrect magic number: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("module truncated while reading {what}")]
    Truncated { what: &'static str },

    #[error("string index {index} out of range in module {module}")]
    BadStringIndex { module: String, index: u16 },

    #[error("malformed descriptor {descriptor:?}")]
    BadDescriptor { descriptor: String },

    #[error("duplicate definition of {class}.{name}{descriptor}")]
    DuplicateMember {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("duplicate class {class} in module {module}")]
    DuplicateClass { module: String, class: String },

    #[error("unresolved reference to {module}/{class}{member}")]
    UnresolvedSymbol {
        module: String,
        class: String,
        /// `.name` plus descriptor for members, empty for bare class references.
        member: String,
    },

    #[error("module {name} not found on the module path")]
    ModuleNotFound { name: String },

    #[error("no entry point: expected class {class} with method {method}{descriptor}")]
    MissingEntryPoint {
        class: String,
        method: String,
        descriptor: String,
    },

    #[error("module {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A capacity or addressing violation in one of the memory regions.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("offset {offset} overflows region {region:?}")]
    RegionOverflow { region: Region, offset: u32 },

    #[error("invalid address {addr:#010x}")]
    InvalidAddress { addr: u32 },

    #[error("stack overflow: slot limit {limit} exceeded")]
    StackOverflow { limit: u32 },

    #[error("corrupt call stack: {reason}")]
    CorruptCallStack { reason: &'static str },

    #[error("heap exhausted: {requested} bytes requested, limit {limit}")]
    HeapExhausted { requested: u32, limit: u32 },

    #[error("static area exhausted: {requested} bytes requested, limit {limit}")]
    StaticExhausted { requested: u32, limit: u32 },

    #[error("method area exhausted: {requested} bytes requested, limit {limit}")]
    MethodExhausted { requested: u32, limit: u32 },
}

/// The interpreter met bytecode it cannot execute.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unknown opcode {opcode:#04x} at ip {ip}")]
    UnknownOpcode { opcode: u8, ip: u32 },

    #[error("code ended inside an instruction at ip {ip}")]
    TruncatedCode { ip: u32 },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("integer division by zero at ip {ip}")]
    DivisionByZero { ip: u32 },

    #[error("constant pool index {index} out of range for {pool} pool of module {module}")]
    BadPoolIndex {
        module: String,
        pool: &'static str,
        index: u16,
    },

    #[error("console write failed: {0}")]
    ConsoleWrite(#[from] std::io::Error),
}

/// Top-level error type returned by [`Vm`](crate::Vm) operations.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
