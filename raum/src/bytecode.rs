//! The instruction set.
//!
//! One opcode byte followed by its immediate operands, little-endian.
//! Branch displacements are signed and applied to the instruction pointer
//! after the branch's own operand bytes have been consumed.

/// Operation codes. The numeric values are part of the binary format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push an immediate byte as one scalar slot. `[u8]`
    PushByte = 0x01,
    /// Push an immediate 4-byte int. `[i32]`
    PushInt = 0x02,
    /// Push an immediate double as two slots. `[f64]`
    PushDouble = 0x03,
    /// Push the null address.
    PushNull = 0x04,
    /// Discard the top slot.
    Pop = 0x05,
    /// Duplicate the top n slots. `[u8]`
    Dup = 0x06,

    /// Push the address of a local slot. A non-negative operand counts from
    /// the frame's locals base (just above the header); a negative operand
    /// counts back from the frame pointer, reaching the caller-pushed
    /// argument slots. `[i16]`
    LocalAddr = 0x10,
    /// Push the interned address of a string constant. `[u16 string index]`
    ConstStrAddr = 0x11,
    /// Push the address of a static field. `[u16 field index]`
    StaticAddr = 0x12,
    /// Pop an object address, push the address of one of its fields.
    /// `[u16 field index]`
    FieldAddr = 0x13,

    /// Pop an address, load the value it refers to.
    LoadByte = 0x18,
    LoadInt = 0x19,
    LoadDouble = 0x1A,
    LoadAddr = 0x1B,
    /// Pop an address, then the value below it, and store.
    StoreByte = 0x1C,
    StoreInt = 0x1D,
    StoreDouble = 0x1E,
    StoreAddr = 0x1F,

    AddInt = 0x20,
    SubInt = 0x21,
    MulInt = 0x22,
    DivInt = 0x23,
    RemInt = 0x24,
    NegInt = 0x25,

    /// Comparisons pop two ints and push 1 or 0.
    CmpEq = 0x28,
    CmpNe = 0x29,
    CmpLt = 0x2A,
    CmpLe = 0x2B,
    CmpGt = 0x2C,
    CmpGe = 0x2D,

    IntToDouble = 0x30,
    DoubleToInt = 0x31,

    /// Unconditional branch. `[i16 displacement]`
    Jump = 0x38,
    /// Pop an int, branch if nonzero. `[i16]`
    JumpIf = 0x39,
    /// Pop an int, branch if zero. `[i16]`
    JumpIfZero = 0x3A,

    /// Call through the current module's method pool. `[u16 method index]`
    Call = 0x40,
    /// Return per the current method's descriptor.
    Ret = 0x41,

    /// Allocate an instance. `[u16 class index]`
    NewObject = 0x48,
    /// Pop a length, allocate an array. `[u8 element descriptor letter]`
    NewArray = 0x49,
    /// Pop an array address, push its length.
    ArrayLen = 0x4A,

    /// Pop an int and write it to the character output port.
    PutChar = 0x50,
    /// Pop an int and write its decimal form to the integer output port.
    PutInt = 0x51,
    /// Pop a string constant address and write the payload to the string
    /// output port.
    PutString = 0x52,
}

impl Op {
    pub fn from_byte(byte: u8) -> Option<Op> {
        use Op::*;
        Some(match byte {
            0x01 => PushByte,
            0x02 => PushInt,
            0x03 => PushDouble,
            0x04 => PushNull,
            0x05 => Pop,
            0x06 => Dup,
            0x10 => LocalAddr,
            0x11 => ConstStrAddr,
            0x12 => StaticAddr,
            0x13 => FieldAddr,
            0x18 => LoadByte,
            0x19 => LoadInt,
            0x1A => LoadDouble,
            0x1B => LoadAddr,
            0x1C => StoreByte,
            0x1D => StoreInt,
            0x1E => StoreDouble,
            0x1F => StoreAddr,
            0x20 => AddInt,
            0x21 => SubInt,
            0x22 => MulInt,
            0x23 => DivInt,
            0x24 => RemInt,
            0x25 => NegInt,
            0x28 => CmpEq,
            0x29 => CmpNe,
            0x2A => CmpLt,
            0x2B => CmpLe,
            0x2C => CmpGt,
            0x2D => CmpGe,
            0x30 => IntToDouble,
            0x31 => DoubleToInt,
            0x38 => Jump,
            0x39 => JumpIf,
            0x3A => JumpIfZero,
            0x40 => Call,
            0x41 => Ret,
            0x48 => NewObject,
            0x49 => NewArray,
            0x4A => ArrayLen,
            0x50 => PutChar,
            0x51 => PutInt,
            0x52 => PutString,
            _ => return None,
        })
    }
}

/// Emits instruction streams for [`ModuleBuilder`](crate::ModuleBuilder)
/// methods.
#[derive(Debug, Default)]
pub struct CodeWriter {
    code: Vec<u8>,
}

impl CodeWriter {
    pub fn new() -> Self {
        CodeWriter::default()
    }

    /// Current length of the stream, usable as a branch target.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    fn op(&mut self, op: Op) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    pub fn push_byte(&mut self, value: u8) -> &mut Self {
        self.op(Op::PushByte);
        self.code.push(value);
        self
    }

    pub fn push_int(&mut self, value: i32) -> &mut Self {
        self.op(Op::PushInt);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_double(&mut self, value: f64) -> &mut Self {
        self.op(Op::PushDouble);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_null(&mut self) -> &mut Self {
        self.op(Op::PushNull)
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(Op::Pop)
    }

    pub fn dup(&mut self, n: u8) -> &mut Self {
        self.op(Op::Dup);
        self.code.push(n);
        self
    }

    pub fn local_addr(&mut self, offset: i16) -> &mut Self {
        self.op(Op::LocalAddr);
        self.code.extend_from_slice(&offset.to_le_bytes());
        self
    }

    pub fn const_str_addr(&mut self, index: u16) -> &mut Self {
        self.op(Op::ConstStrAddr);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn static_addr(&mut self, index: u16) -> &mut Self {
        self.op(Op::StaticAddr);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn field_addr(&mut self, index: u16) -> &mut Self {
        self.op(Op::FieldAddr);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn simple(&mut self, op: Op) -> &mut Self {
        self.op(op)
    }

    /// Emits a branch with a placeholder displacement; returns the position
    /// to hand to [`CodeWriter::patch`] once the target is known.
    pub fn branch(&mut self, op: Op) -> usize {
        self.op(op);
        let at = self.code.len();
        self.code.extend_from_slice(&0i16.to_le_bytes());
        at
    }

    /// Patches the displacement at `at` so the branch lands on `target`.
    /// Displacements are relative to the end of the operand.
    pub fn patch(&mut self, at: usize, target: usize) {
        let disp = target as i64 - (at as i64 + 2);
        self.code[at..at + 2].copy_from_slice(&(disp as i16).to_le_bytes());
    }

    pub fn call(&mut self, index: u16) -> &mut Self {
        self.op(Op::Call);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Op::Ret)
    }

    pub fn new_object(&mut self, index: u16) -> &mut Self {
        self.op(Op::NewObject);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn new_array(&mut self, element: char) -> &mut Self {
        self.op(Op::NewArray);
        self.code.push(element as u8);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_emitted_opcode_decodes() {
        for byte in 0u8..=0xFF {
            if let Some(op) = Op::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Op::from_byte(0x41), Some(Op::Ret));
        assert_eq!(Op::from_byte(0xFF), None);
    }

    #[test]
    fn branch_patching_is_relative_to_operand_end() {
        let mut writer = CodeWriter::new();
        writer.push_int(1);
        let at = writer.branch(Op::JumpIfZero);
        writer.push_int(2);
        let target = writer.here();
        writer.patch(at, target);
        let code = writer.finish();
        // Operand ends at `at + 2`; the displacement must skip push_int(2).
        let disp = i16::from_le_bytes([code[at], code[at + 1]]);
        assert_eq!(disp, 5);
    }
}
