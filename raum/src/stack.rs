//! The execution stack.
//!
//! A flat array of 4-byte slots managed through a stack pointer and a frame
//! pointer. Each slot carries a tag telling the collector whether it holds an
//! address; no other type metadata is associated with stack contents. A
//! 64-bit double occupies two consecutive slots with the more significant
//! half in the upper slot.
//!
//! Invariant: `0 <= FP <= SP`, and the frame pointer increases monotonically
//! with call depth. Violating either is a corrupt call stack and fatal.

use crate::error::MemoryError;

/// Slots written by [`Stack::push_frame`] at the start of every call:
/// saved frame pointer, caller method identity, caller instruction pointer.
pub const FRAME_HEADER_SLOTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTag {
    /// The slot holds a logical address; the collector treats it as a root.
    Address,
    /// Scalar payload, opaque to the collector.
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub value: u32,
    pub tag: SlotTag,
}

impl Slot {
    pub fn scalar(value: u32) -> Self {
        Slot {
            value,
            tag: SlotTag::Other,
        }
    }

    pub fn address(value: u32) -> Self {
        Slot {
            value,
            tag: SlotTag::Address,
        }
    }
}

#[derive(Debug)]
pub struct Stack {
    slots: Vec<Slot>,
    sp: u32,
    fp: u32,
}

impl Stack {
    pub fn new(limit: u32) -> Self {
        Stack {
            slots: vec![Slot::scalar(0); limit as usize],
            sp: 0,
            fp: 0,
        }
    }

    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub fn fp(&self) -> u32 {
        self.fp
    }

    /// The live portion of the stack, root set for the collector.
    pub fn live_slots(&self) -> &[Slot] {
        &self.slots[..self.sp as usize]
    }

    fn push_slot(&mut self, slot: Slot) -> Result<(), MemoryError> {
        let limit = self.slots.len() as u32;
        if self.sp == limit {
            return Err(MemoryError::StackOverflow { limit });
        }
        self.slots[self.sp as usize] = slot;
        self.sp += 1;
        Ok(())
    }

    fn pop_slot(&mut self) -> Result<Slot, MemoryError> {
        if self.sp == self.fp {
            return Err(MemoryError::CorruptCallStack {
                reason: "pop below the active frame",
            });
        }
        self.sp -= 1;
        Ok(self.slots[self.sp as usize])
    }

    pub fn push_byte(&mut self, value: u8) -> Result<(), MemoryError> {
        self.push_slot(Slot::scalar(value as u32))
    }

    pub fn push_int(&mut self, value: i32) -> Result<(), MemoryError> {
        self.push_slot(Slot::scalar(value as u32))
    }

    pub fn push_address(&mut self, addr: u32) -> Result<(), MemoryError> {
        self.push_slot(Slot::address(addr))
    }

    /// Pushes a double as two slots, high word in the upper slot.
    pub fn push_double(&mut self, value: f64) -> Result<(), MemoryError> {
        let bits = value.to_bits();
        self.push_slot(Slot::scalar(bits as u32))?;
        self.push_slot(Slot::scalar((bits >> 32) as u32))
    }

    pub fn pop_byte(&mut self) -> Result<u8, MemoryError> {
        Ok(self.pop_slot()?.value as u8)
    }

    pub fn pop_int(&mut self) -> Result<i32, MemoryError> {
        Ok(self.pop_slot()?.value as i32)
    }

    pub fn pop_address(&mut self) -> Result<u32, MemoryError> {
        Ok(self.pop_slot()?.value)
    }

    pub fn pop_double(&mut self) -> Result<f64, MemoryError> {
        let high = self.pop_slot()?.value as u64;
        let low = self.pop_slot()?.value as u64;
        Ok(f64::from_bits((high << 32) | low))
    }

    /// Discards one slot.
    pub fn pop(&mut self) -> Result<(), MemoryError> {
        self.pop_slot().map(|_| ())
    }

    /// Duplicates the top `n` slots, tags included.
    pub fn dup(&mut self, n: u32) -> Result<(), MemoryError> {
        if self.sp < self.fp + n {
            return Err(MemoryError::CorruptCallStack {
                reason: "dup reaches below the active frame",
            });
        }
        let from = (self.sp - n) as usize;
        for i in 0..n as usize {
            let slot = self.slots[from + i];
            self.push_slot(slot)?;
        }
        Ok(())
    }

    /// Reads the slot at an absolute offset. Only live slots are addressable.
    pub fn get(&self, offset: u32) -> Result<Slot, MemoryError> {
        if offset >= self.sp {
            return Err(MemoryError::InvalidAddress {
                addr: crate::memory::encode(offset, crate::memory::Region::Stack).unwrap_or(0),
            });
        }
        Ok(self.slots[offset as usize])
    }

    /// Writes the slot at an absolute offset.
    pub fn set(&mut self, offset: u32, slot: Slot) -> Result<(), MemoryError> {
        if offset >= self.sp {
            return Err(MemoryError::InvalidAddress {
                addr: crate::memory::encode(offset, crate::memory::Region::Stack).unwrap_or(0),
            });
        }
        self.slots[offset as usize] = slot;
        Ok(())
    }

    /// Writes the 3-slot frame header and moves the frame pointer onto it.
    ///
    /// `identity` is the caller method's code address, 0 for the entry frame;
    /// `ip` is the caller's instruction pointer to resume at.
    pub fn push_frame(&mut self, identity: u32, ip: u32) -> Result<(), MemoryError> {
        let header = self.sp;
        self.push_slot(Slot::scalar(self.fp))?;
        self.push_slot(Slot::scalar(identity))?;
        self.push_slot(Slot::scalar(ip))?;
        self.fp = header;
        Ok(())
    }

    /// Tears the active frame down: restores SP to the header position and FP
    /// to the saved value, returning the caller identity and instruction
    /// pointer stored at the call.
    pub fn pop_frame(&mut self) -> Result<(u32, u32), MemoryError> {
        if self.sp < self.fp + FRAME_HEADER_SLOTS {
            return Err(MemoryError::CorruptCallStack {
                reason: "frame header missing",
            });
        }
        let header = self.fp as usize;
        let saved_fp = self.slots[header].value;
        let identity = self.slots[header + 1].value;
        let ip = self.slots[header + 2].value;
        if saved_fp > self.fp {
            return Err(MemoryError::CorruptCallStack {
                reason: "saved frame pointer above the current frame",
            });
        }
        self.sp = self.fp;
        self.fp = saved_fp;
        Ok((identity, ip))
    }

    /// Drops `n` slots below the torn-down frame, used to discard the
    /// caller's argument slots on return.
    pub fn drop_slots(&mut self, n: u32) -> Result<(), MemoryError> {
        if self.sp < self.fp + n {
            return Err(MemoryError::CorruptCallStack {
                reason: "argument slots missing on return",
            });
        }
        self.sp -= n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_push_pop() {
        let mut stack = Stack::new(64);
        stack.push_byte(7).unwrap();
        stack.push_int(-5).unwrap();
        stack.push_address(0x1234).unwrap();
        assert_eq!(stack.pop_address().unwrap(), 0x1234);
        assert_eq!(stack.pop_int().unwrap(), -5);
        assert_eq!(stack.pop_byte().unwrap(), 7);
    }

    #[test]
    fn double_occupies_two_slots_high_word_up() {
        let mut stack = Stack::new(64);
        stack.push_double(1.5).unwrap();
        assert_eq!(stack.sp(), 2);
        let bits = 1.5f64.to_bits();
        assert_eq!(stack.get(0).unwrap().value, bits as u32);
        assert_eq!(stack.get(1).unwrap().value, (bits >> 32) as u32);
        assert_eq!(stack.pop_double().unwrap(), 1.5);
    }

    #[test]
    fn address_slots_are_tagged() {
        let mut stack = Stack::new(8);
        stack.push_int(1).unwrap();
        stack.push_address(2).unwrap();
        assert_eq!(stack.live_slots()[0].tag, SlotTag::Other);
        assert_eq!(stack.live_slots()[1].tag, SlotTag::Address);
    }

    #[test]
    fn dup_copies_top_slots() {
        let mut stack = Stack::new(16);
        stack.push_int(1).unwrap();
        stack.push_int(2).unwrap();
        stack.dup(2).unwrap();
        assert_eq!(stack.pop_int().unwrap(), 2);
        assert_eq!(stack.pop_int().unwrap(), 1);
        assert_eq!(stack.pop_int().unwrap(), 2);
        assert_eq!(stack.pop_int().unwrap(), 1);
    }

    #[test]
    fn frame_round_trip_restores_pointers() {
        let mut stack = Stack::new(64);
        stack.push_int(11).unwrap();
        let (sp0, fp0) = (stack.sp(), stack.fp());

        stack.push_frame(0xC0DE, 42).unwrap();
        assert_eq!(stack.fp(), sp0);
        stack.push_int(1).unwrap();
        stack.push_double(2.0).unwrap();

        let (identity, ip) = stack.pop_frame().unwrap();
        assert_eq!((identity, ip), (0xC0DE, 42));
        assert_eq!(stack.sp(), sp0);
        assert_eq!(stack.fp(), fp0);
        assert_eq!(stack.pop_int().unwrap(), 11);
    }

    #[test]
    fn nested_frames_isolate_locals() {
        let mut stack = Stack::new(64);
        stack.push_int(99).unwrap();
        stack.push_frame(0, 0).unwrap();
        stack.push_int(1).unwrap();
        let outer_fp = stack.fp();
        stack.push_frame(1, 10).unwrap();
        assert!(stack.fp() > outer_fp);
        stack.push_int(2).unwrap();
        stack.pop_frame().unwrap();
        assert_eq!(stack.fp(), outer_fp);
        assert_eq!(stack.pop_int().unwrap(), 1);
        stack.pop_frame().unwrap();
        assert_eq!(stack.pop_int().unwrap(), 99);
    }

    #[test]
    fn pop_below_frame_is_fatal() {
        let mut stack = Stack::new(16);
        assert!(matches!(
            stack.pop_int(),
            Err(MemoryError::CorruptCallStack { .. })
        ));
        stack.push_int(1).unwrap();
        stack.push_frame(0, 0).unwrap();
        assert!(matches!(
            stack.pop_int(),
            Err(MemoryError::CorruptCallStack { .. })
        ));
    }

    #[test]
    fn overflow_is_reported() {
        let mut stack = Stack::new(2);
        stack.push_int(1).unwrap();
        stack.push_int(2).unwrap();
        assert!(matches!(
            stack.push_int(3),
            Err(MemoryError::StackOverflow { limit: 2 })
        ));
    }
}
