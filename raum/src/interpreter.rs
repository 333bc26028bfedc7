//! The fetch-decode-execute loop.
//!
//! The interpreter reads one opcode byte at a time from the current method's
//! code block in the method area, with an instruction pointer local to that
//! method. An address carries no type information, so every load and store
//! decodes the popped address first and dispatches on the region it falls
//! in; the preserved region turns stores into console output.

use std::io::Write;
use std::rc::Rc;

use log::trace;

use crate::bytecode::Op;
use crate::classes::{FieldRef, RuntimeClass, RuntimeMethod};
use crate::descriptor::{self, SlotKind};
use crate::error::{ExecutionError, MemoryError, VmResult};
use crate::gc;
use crate::heap::GcFlags;
use crate::memory::{
    self, PORT_CHAR_OUT, PORT_INT_OUT, PORT_STRING_OUT, Region, Target,
};
use crate::stack::{FRAME_HEADER_SLOTS, Slot};
use crate::vm::{GcPolicy, Vm};

/// A value popped for a store, before the target region is known.
#[derive(Debug, Clone, Copy)]
enum StoreValue {
    Byte(u8),
    Int(i32),
    Double(f64),
    Address(u32),
}

pub struct Interpreter<'vm> {
    vm: &'vm mut Vm,
    method: Rc<RuntimeMethod>,
    /// Method area offset of the current code block.
    code_off: u32,
    ip: u32,
    executed: u64,
}

impl<'vm> Interpreter<'vm> {
    pub fn new(vm: &'vm mut Vm, method: Rc<RuntimeMethod>) -> VmResult<Self> {
        let code_off = code_offset(&method)?;
        Ok(Interpreter {
            vm,
            method,
            code_off,
            ip: 0,
            executed: 0,
        })
    }

    /// Runs the current method to completion. The caller must already have
    /// pushed its frame header and default locals.
    pub fn run(&mut self) -> VmResult<()> {
        loop {
            if let GcPolicy::Periodic(every) = self.vm.gc {
                self.executed += 1;
                if self.executed % every.max(1) == 0 {
                    self.vm.collect()?;
                }
            }
            let op_ip = self.ip;
            let byte = self.fetch_u8()?;
            let op = Op::from_byte(byte).ok_or(ExecutionError::UnknownOpcode {
                opcode: byte,
                ip: op_ip,
            })?;
            trace!("{}.{} ip {} {:?}", self.method.owner, self.method.name, op_ip, op);
            match op {
                Op::PushByte => {
                    let value = self.fetch_u8()?;
                    self.vm.stack.push_byte(value)?;
                }
                Op::PushInt => {
                    let value = self.fetch_i32()?;
                    self.vm.stack.push_int(value)?;
                }
                Op::PushDouble => {
                    let value = self.fetch_f64()?;
                    self.vm.stack.push_double(value)?;
                }
                Op::PushNull => self.vm.stack.push_address(0)?,
                Op::Pop => self.vm.stack.pop()?,
                Op::Dup => {
                    let n = self.fetch_u8()?;
                    self.vm.stack.dup(n as u32)?;
                }

                Op::LocalAddr => {
                    let offset = self.fetch_i16()?;
                    let fp = self.vm.stack.fp() as i64;
                    // Non-negative offsets address locals above the frame
                    // header; negative offsets address the caller's argument
                    // slots below it.
                    let slot = if offset >= 0 {
                        fp + FRAME_HEADER_SLOTS as i64 + offset as i64
                    } else {
                        fp + offset as i64
                    };
                    if slot < 0 || slot >= self.vm.stack.sp() as i64 {
                        return Err(MemoryError::InvalidAddress { addr: 0 }.into());
                    }
                    let addr = memory::encode(slot as u32, Region::Stack)?;
                    self.vm.stack.push_address(addr)?;
                }
                Op::ConstStrAddr => {
                    let index = self.fetch_u16()?;
                    let addr = self.string_link(index)?;
                    self.vm.stack.push_address(addr)?;
                }
                Op::StaticAddr => {
                    let index = self.fetch_u16()?;
                    let field = self.field_link(index_of(index))?;
                    if !field.is_static {
                        return Err(ExecutionError::InvalidOperation {
                            reason: format!(
                                "static address of instance field {}.{}",
                                field.class.name, field.name
                            ),
                        }
                        .into());
                    }
                    self.vm
                        .stack
                        .push_address(field.class.statics_addr + field.offset)?;
                }
                Op::FieldAddr => {
                    let index = self.fetch_u16()?;
                    let field = self.field_link(index_of(index))?;
                    if field.is_static {
                        return Err(ExecutionError::InvalidOperation {
                            reason: format!(
                                "field address of static field {}.{}",
                                field.class.name, field.name
                            ),
                        }
                        .into());
                    }
                    let base = self.vm.stack.pop_address()?;
                    if base == 0 {
                        return Err(MemoryError::InvalidAddress { addr: 0 }.into());
                    }
                    self.vm.stack.push_address(base + field.offset)?;
                }

                Op::LoadByte | Op::LoadInt | Op::LoadDouble | Op::LoadAddr => {
                    self.load(op)?;
                }
                Op::StoreByte | Op::StoreInt | Op::StoreDouble | Op::StoreAddr => {
                    self.store(op)?;
                }

                Op::AddInt | Op::SubInt | Op::MulInt | Op::DivInt | Op::RemInt => {
                    let b = self.vm.stack.pop_int()?;
                    let a = self.vm.stack.pop_int()?;
                    let value = match op {
                        Op::AddInt => a.wrapping_add(b),
                        Op::SubInt => a.wrapping_sub(b),
                        Op::MulInt => a.wrapping_mul(b),
                        Op::DivInt | Op::RemInt => {
                            if b == 0 {
                                return Err(ExecutionError::DivisionByZero { ip: op_ip }.into());
                            }
                            if op == Op::DivInt {
                                a.wrapping_div(b)
                            } else {
                                a.wrapping_rem(b)
                            }
                        }
                        _ => unreachable!(),
                    };
                    self.vm.stack.push_int(value)?;
                }
                Op::NegInt => {
                    let a = self.vm.stack.pop_int()?;
                    self.vm.stack.push_int(a.wrapping_neg())?;
                }

                Op::CmpEq | Op::CmpNe | Op::CmpLt | Op::CmpLe | Op::CmpGt | Op::CmpGe => {
                    let b = self.vm.stack.pop_int()?;
                    let a = self.vm.stack.pop_int()?;
                    let hit = match op {
                        Op::CmpEq => a == b,
                        Op::CmpNe => a != b,
                        Op::CmpLt => a < b,
                        Op::CmpLe => a <= b,
                        Op::CmpGt => a > b,
                        Op::CmpGe => a >= b,
                        _ => unreachable!(),
                    };
                    self.vm.stack.push_int(hit as i32)?;
                }

                Op::IntToDouble => {
                    let a = self.vm.stack.pop_int()?;
                    self.vm.stack.push_double(a as f64)?;
                }
                Op::DoubleToInt => {
                    let a = self.vm.stack.pop_double()?;
                    self.vm.stack.push_int(a as i32)?;
                }

                Op::Jump => {
                    let disp = self.fetch_i16()?;
                    self.branch(disp)?;
                }
                Op::JumpIf => {
                    let disp = self.fetch_i16()?;
                    if self.vm.stack.pop_int()? != 0 {
                        self.branch(disp)?;
                    }
                }
                Op::JumpIfZero => {
                    let disp = self.fetch_i16()?;
                    if self.vm.stack.pop_int()? == 0 {
                        self.branch(disp)?;
                    }
                }

                Op::Call => {
                    let index = self.fetch_u16()?;
                    self.call(index)?;
                }
                Op::Ret => {
                    if self.ret()? {
                        return Ok(());
                    }
                }

                Op::NewObject => {
                    let index = self.fetch_u16()?;
                    let class = self.class_link(index)?;
                    let offset = self.alloc(|heap| {
                        heap.malloc_object(class.statics_addr, class.instance_size)
                    })?;
                    let addr = memory::encode(offset, Region::Heap)?;
                    self.vm.stack.push_address(addr)?;
                }
                Op::NewArray => {
                    let letter = self.fetch_u8()? as char;
                    let kind = match letter {
                        'B' => SlotKind::Byte,
                        'I' => SlotKind::Int,
                        'D' => SlotKind::Double,
                        'L' | '[' => SlotKind::Address,
                        other => {
                            return Err(ExecutionError::InvalidOperation {
                                reason: format!("array element descriptor {other:?}"),
                            }
                            .into());
                        }
                    };
                    let length = self.vm.stack.pop_int()?;
                    if length < 0 {
                        return Err(ExecutionError::InvalidOperation {
                            reason: format!("negative array length {length}"),
                        }
                        .into());
                    }
                    let element_size = kind.byte_size();
                    let addressy = kind == SlotKind::Address;
                    let offset = self.alloc(|heap| {
                        heap.malloc_array(element_size, length as u32, addressy)
                    })?;
                    let addr = memory::encode(offset, Region::Heap)?;
                    self.vm.stack.push_address(addr)?;
                }
                Op::ArrayLen => {
                    let addr = self.vm.stack.pop_address()?;
                    let Target::At(Region::Heap, offset) = memory::decode(addr) else {
                        return Err(MemoryError::InvalidAddress { addr }.into());
                    };
                    let base = self.vm.heap.object_base(offset)?;
                    if !self.vm.heap.gc_flags(base)?.contains(GcFlags::ARRAY) {
                        return Err(ExecutionError::InvalidOperation {
                            reason: "array length of a non-array object".to_owned(),
                        }
                        .into());
                    }
                    let length = self.vm.heap.read_u32(base + 8)?;
                    self.vm.stack.push_int(length as i32)?;
                }

                Op::PutChar => {
                    let value = self.vm.stack.pop_int()?;
                    self.write_port(PORT_CHAR_OUT, StoreValue::Int(value))?;
                }
                Op::PutInt => {
                    let value = self.vm.stack.pop_int()?;
                    self.write_port(PORT_INT_OUT, StoreValue::Int(value))?;
                }
                Op::PutString => {
                    let addr = self.vm.stack.pop_address()?;
                    self.write_port(PORT_STRING_OUT, StoreValue::Address(addr))?;
                }
            }
        }
    }

    fn fetch_u8(&mut self) -> VmResult<u8> {
        if self.ip >= self.method.code_len {
            return Err(ExecutionError::TruncatedCode { ip: self.ip }.into());
        }
        let byte = self.vm.methods.read_u8(self.code_off + self.ip)?;
        self.ip += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> VmResult<u16> {
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        Ok(u16::from_le_bytes([a, b]))
    }

    fn fetch_i16(&mut self) -> VmResult<i16> {
        Ok(self.fetch_u16()? as i16)
    }

    fn fetch_i32(&mut self) -> VmResult<i32> {
        let mut raw = [0u8; 4];
        for byte in &mut raw {
            *byte = self.fetch_u8()?;
        }
        Ok(i32::from_le_bytes(raw))
    }

    fn fetch_f64(&mut self) -> VmResult<f64> {
        let mut raw = [0u8; 8];
        for byte in &mut raw {
            *byte = self.fetch_u8()?;
        }
        Ok(f64::from_le_bytes(raw))
    }

    /// Applies a branch displacement; the ip already sits past the operand.
    fn branch(&mut self, disp: i16) -> VmResult<()> {
        let target = self.ip as i64 + disp as i64;
        if target < 0 || target > self.method.code_len as i64 {
            return Err(ExecutionError::InvalidOperation {
                reason: format!("branch to {target} outside the code block"),
            }
            .into());
        }
        self.ip = target as u32;
        Ok(())
    }

    fn module_record(&self) -> VmResult<&crate::classes::ModuleRecord> {
        self.vm
            .modules
            .get(&self.method.module)
            .ok_or_else(|| {
                ExecutionError::InvalidOperation {
                    reason: format!("module {} not resident", self.method.module),
                }
                .into()
            })
    }

    fn string_link(&self, index: u16) -> VmResult<u32> {
        let record = self.module_record()?;
        record
            .strings
            .get(index_of(index))
            .copied()
            .ok_or_else(|| bad_pool(&self.method.module, "string", index))
    }

    fn class_link(&self, index: u16) -> VmResult<Rc<RuntimeClass>> {
        let record = self.module_record()?;
        record
            .classes
            .get(index_of(index))
            .and_then(|link| link.clone())
            .ok_or_else(|| bad_pool(&self.method.module, "class", index))
    }

    fn field_link(&self, index: usize) -> VmResult<FieldRef> {
        let record = self.module_record()?;
        record
            .fields
            .get(index)
            .and_then(|link| link.clone())
            .ok_or_else(|| bad_pool(&self.method.module, "field", index as u16))
    }

    fn method_link(&self, index: u16) -> VmResult<Rc<RuntimeMethod>> {
        let record = self.module_record()?;
        record
            .methods
            .get(index_of(index))
            .and_then(|link| link.clone())
            .ok_or_else(|| bad_pool(&self.method.module, "method", index))
    }

    /// Pushes the frame header, default-initializes the callee's locals from
    /// its local-variable descriptor, and transfers control.
    fn call(&mut self, index: u16) -> VmResult<()> {
        let callee = self.method_link(index)?;
        self.vm.stack.push_frame(self.method.code_addr, self.ip)?;
        for kind in descriptor::parse_locals(&callee.locals)? {
            match kind {
                SlotKind::Byte => self.vm.stack.push_byte(0)?,
                SlotKind::Int => self.vm.stack.push_int(0)?,
                SlotKind::Double => self.vm.stack.push_double(0.0)?,
                SlotKind::Address => self.vm.stack.push_address(0)?,
            }
        }
        self.code_off = code_offset(&callee)?;
        self.method = callee;
        self.ip = 0;
        Ok(())
    }

    /// Unwinds the current frame per the method's own descriptor. Returns
    /// true when the entry frame returned and execution is complete.
    fn ret(&mut self) -> VmResult<bool> {
        let desc = descriptor::parse_method(&self.method.descriptor)?;
        let value = match desc.ret {
            None => None,
            Some(SlotKind::Byte) => Some(StoreValue::Byte(self.vm.stack.pop_byte()?)),
            Some(SlotKind::Int) => Some(StoreValue::Int(self.vm.stack.pop_int()?)),
            Some(SlotKind::Double) => Some(StoreValue::Double(self.vm.stack.pop_double()?)),
            Some(SlotKind::Address) => Some(StoreValue::Address(self.vm.stack.pop_address()?)),
        };
        let (identity, ip) = self.vm.stack.pop_frame()?;
        self.vm.stack.drop_slots(desc.param_slots())?;
        match value {
            None => {}
            Some(StoreValue::Byte(v)) => self.vm.stack.push_byte(v)?,
            Some(StoreValue::Int(v)) => self.vm.stack.push_int(v)?,
            Some(StoreValue::Double(v)) => self.vm.stack.push_double(v)?,
            Some(StoreValue::Address(v)) => self.vm.stack.push_address(v)?,
        }
        if identity == 0 {
            return Ok(true);
        }
        let caller = self
            .vm
            .methods_by_addr
            .get(&identity)
            .cloned()
            .ok_or_else(|| ExecutionError::InvalidOperation {
                reason: format!("unknown caller identity {identity:#010x}"),
            })?;
        self.code_off = code_offset(&caller)?;
        self.method = caller;
        self.ip = ip;
        Ok(false)
    }

    /// Typed load: pop the address, decode it, dispatch on the region.
    fn load(&mut self, op: Op) -> VmResult<()> {
        let addr = self.vm.stack.pop_address()?;
        match memory::decode(addr) {
            Target::Null | Target::Invalid => {
                Err(MemoryError::InvalidAddress { addr }.into())
            }
            Target::At(Region::Preserved, _) | Target::At(Region::Method, _) => {
                Err(ExecutionError::InvalidOperation {
                    reason: format!("load from address {addr:#010x}"),
                }
                .into())
            }
            Target::At(Region::Stack, slot) => {
                let low = self.vm.stack.get(slot)?;
                match op {
                    Op::LoadByte => self.vm.stack.push_byte(low.value as u8)?,
                    Op::LoadInt => self.vm.stack.push_int(low.value as i32)?,
                    Op::LoadAddr => self.vm.stack.push_address(low.value)?,
                    Op::LoadDouble => {
                        let high = self.vm.stack.get(slot + 1)?;
                        let bits = ((high.value as u64) << 32) | low.value as u64;
                        self.vm.stack.push_double(f64::from_bits(bits))?;
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
            Target::At(Region::Heap, offset) => {
                match op {
                    Op::LoadByte => {
                        let v = self.vm.heap.read_u8(offset)?;
                        self.vm.stack.push_byte(v)?;
                    }
                    Op::LoadInt => {
                        let v = self.vm.heap.read_u32(offset)?;
                        self.vm.stack.push_int(v as i32)?;
                    }
                    Op::LoadAddr => {
                        let v = self.vm.heap.read_u32(offset)?;
                        self.vm.stack.push_address(v)?;
                    }
                    Op::LoadDouble => {
                        let v = self.vm.heap.read_f64(offset)?;
                        self.vm.stack.push_double(v)?;
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
            Target::At(Region::Static, offset) => {
                match op {
                    Op::LoadByte => {
                        let v = self.vm.statics.read_u8(offset)?;
                        self.vm.stack.push_byte(v)?;
                    }
                    Op::LoadInt => {
                        let v = self.vm.statics.read_u32(offset)?;
                        self.vm.stack.push_int(v as i32)?;
                    }
                    Op::LoadAddr => {
                        let v = self.vm.statics.read_u32(offset)?;
                        self.vm.stack.push_address(v)?;
                    }
                    Op::LoadDouble => {
                        let v = self.vm.statics.read_f64(offset)?;
                        self.vm.stack.push_double(v)?;
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
        }
    }

    /// Typed store: pop the address, then the value below it.
    fn store(&mut self, op: Op) -> VmResult<()> {
        let addr = self.vm.stack.pop_address()?;
        let value = match op {
            Op::StoreByte => StoreValue::Byte(self.vm.stack.pop_byte()?),
            Op::StoreInt => StoreValue::Int(self.vm.stack.pop_int()?),
            Op::StoreDouble => StoreValue::Double(self.vm.stack.pop_double()?),
            Op::StoreAddr => StoreValue::Address(self.vm.stack.pop_address()?),
            _ => unreachable!(),
        };
        match memory::decode(addr) {
            Target::Null | Target::Invalid => {
                Err(MemoryError::InvalidAddress { addr }.into())
            }
            Target::At(Region::Method, _) => Err(ExecutionError::InvalidOperation {
                reason: format!("store to method area address {addr:#010x}"),
            }
            .into()),
            Target::At(Region::Preserved, port) => self.write_port(port, value),
            Target::At(Region::Stack, slot) => {
                match value {
                    StoreValue::Byte(v) => self.vm.stack.set(slot, Slot::scalar(v as u32))?,
                    StoreValue::Int(v) => self.vm.stack.set(slot, Slot::scalar(v as u32))?,
                    StoreValue::Address(v) => self.vm.stack.set(slot, Slot::address(v))?,
                    StoreValue::Double(v) => {
                        let bits = v.to_bits();
                        self.vm.stack.set(slot, Slot::scalar(bits as u32))?;
                        self.vm
                            .stack
                            .set(slot + 1, Slot::scalar((bits >> 32) as u32))?;
                    }
                }
                Ok(())
            }
            Target::At(Region::Heap, offset) => {
                match value {
                    StoreValue::Byte(v) => self.vm.heap.write_u8(offset, v)?,
                    StoreValue::Int(v) => self.vm.heap.write_u32(offset, v as u32)?,
                    StoreValue::Address(v) => self.vm.heap.write_u32(offset, v)?,
                    StoreValue::Double(v) => self.vm.heap.write_f64(offset, v)?,
                }
                Ok(())
            }
            Target::At(Region::Static, offset) => {
                match value {
                    StoreValue::Byte(v) => self.vm.statics.write_u8(offset, v)?,
                    StoreValue::Int(v) => self.vm.statics.write_u32(offset, v as u32)?,
                    StoreValue::Address(v) => self.vm.statics.write_u32(offset, v)?,
                    StoreValue::Double(v) => self.vm.statics.write_f64(offset, v)?,
                }
                Ok(())
            }
        }
    }

    /// The console I/O surface: stores into the preserved region map onto
    /// the output ports. There is no input port.
    fn write_port(&mut self, port: u32, value: StoreValue) -> VmResult<()> {
        let vm = &mut *self.vm;
        match (port, value) {
            (PORT_CHAR_OUT, StoreValue::Int(v)) => {
                let ch = char::from_u32(v as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                write!(vm.out, "{ch}").map_err(ExecutionError::ConsoleWrite)?;
            }
            (PORT_CHAR_OUT, StoreValue::Byte(v)) => {
                write!(vm.out, "{}", v as char).map_err(ExecutionError::ConsoleWrite)?;
            }
            (PORT_INT_OUT, StoreValue::Int(v)) => {
                write!(vm.out, "{v}").map_err(ExecutionError::ConsoleWrite)?;
            }
            (PORT_STRING_OUT, StoreValue::Address(addr)) => {
                let Target::At(Region::Method, offset) = memory::decode(addr) else {
                    return Err(MemoryError::InvalidAddress { addr }.into());
                };
                let value = vm.methods.load_string(offset)?;
                write!(vm.out, "{value}").map_err(ExecutionError::ConsoleWrite)?;
            }
            _ => {
                return Err(ExecutionError::InvalidOperation {
                    reason: format!("unsupported preserved port write at offset {port}"),
                }
                .into());
            }
        }
        vm.out.flush().map_err(ExecutionError::ConsoleWrite)?;
        Ok(())
    }

    /// Heap allocation honoring the collect-and-retry policy.
    fn alloc(
        &mut self,
        allocate: impl Fn(&mut crate::heap::Heap) -> Result<u32, MemoryError>,
    ) -> VmResult<u32> {
        match allocate(&mut self.vm.heap) {
            Err(MemoryError::HeapExhausted { .. })
                if self.vm.gc == GcPolicy::OnAllocFailure =>
            {
                self.vm.collect()?;
                Ok(allocate(&mut self.vm.heap)?)
            }
            other => Ok(other?),
        }
    }
}

fn code_offset(method: &RuntimeMethod) -> VmResult<u32> {
    match memory::decode(method.code_addr) {
        Target::At(Region::Method, offset) => Ok(offset),
        _ => Err(ExecutionError::InvalidOperation {
            reason: format!(
                "method {}.{} has no code in the method area",
                method.owner, method.name
            ),
        }
        .into()),
    }
}

fn index_of(index: u16) -> usize {
    // Constant pool indices are 1-based; 0 means "none" and underflows to
    // an out-of-range usize rejected by the link lookup.
    (index as usize).wrapping_sub(1)
}

fn bad_pool(module: &str, pool: &'static str, index: u16) -> crate::error::VmError {
    ExecutionError::BadPoolIndex {
        module: module.to_owned(),
        pool,
        index,
    }
    .into()
}
