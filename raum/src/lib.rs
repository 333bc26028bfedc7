mod bytecode;
mod classes;
mod descriptor;
mod error;
mod gc;
mod heap;
mod interpreter;
mod loader;
mod memory;
mod methods;
mod module;
mod stack;
mod statics;
mod vm;

pub use bytecode::{CodeWriter, Op};
pub use classes::{FieldLayout, FieldRef, ModuleRecord, RuntimeClass, RuntimeMethod};
pub use descriptor::{
    MethodDescriptor, SlotKind, field_byte_size, parse_field, parse_locals, parse_method,
};
pub use error::{ExecutionError, LoadError, MemoryError, VmError, VmResult};
pub use gc::CollectionStats;
pub use heap::{ARRAY_HEADER_SIZE, GcFlags, Heap, OBJECT_HEADER_SIZE};
pub use loader::{LoadStats, Loader};
pub use memory::{
    HEAP_SIZE, METHOD_SIZE, PORT_CHAR_OUT, PORT_INT_OUT, PORT_STRING_OUT, PRESERVED_SIZE,
    Region, STACK_SIZE, STATIC_SIZE, Target, decode, encode,
};
pub use methods::{ENTRY_CLASS, ENTRY_DESCRIPTOR, ENTRY_METHOD, MethodArea, Strings};
pub use module::{
    ClassConst, FieldConst, MAGIC, MethodConst, ModuleBuilder, ModuleImage, flags,
};
pub use stack::{FRAME_HEADER_SLOTS, Slot, SlotTag, Stack};
pub use statics::StaticArea;
pub use vm::{GcPolicy, Vm, VmCreateInfo};
