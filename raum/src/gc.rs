//! The mark-sweep collector.
//!
//! One explicit stop-the-world cycle. Roots are the address-tagged live
//! stack slots whose addresses decode into the heap; marking follows only
//! the slots the class layouts declare as addresses, plus the elements of
//! address-element arrays. The static and method areas are process-lifetime
//! and never scanned. Objects are never moved.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::classes::RuntimeClass;
use crate::descriptor::SlotKind;
use crate::error::MemoryError;
use crate::heap::{ARRAY_HEADER_SIZE, GcFlags, Heap};
use crate::memory::{self, Region, Target};
use crate::stack::{SlotTag, Stack};

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    /// Objects reachable from the root set.
    pub marked: usize,
    /// Objects reclaimed by the sweep.
    pub swept: usize,
}

/// Runs one full collection cycle over the heap.
pub fn collect(
    stack: &Stack,
    heap: &mut Heap,
    classes: &HashMap<u32, Rc<RuntimeClass>>,
) -> Result<CollectionStats, MemoryError> {
    let mut worklist: Vec<u32> = Vec::new();
    let mut marked = 0usize;

    for slot in stack.live_slots() {
        if slot.tag == SlotTag::Address {
            enqueue(heap, slot.value, &mut worklist, &mut marked)?;
        }
    }

    while let Some(base) = worklist.pop() {
        let flags = heap.gc_flags(base)?;
        if flags.contains(GcFlags::ARRAY) {
            if flags.contains(GcFlags::ADDRESS_ELEMENTS) {
                let length = heap.read_u32(base + 8)?;
                for i in 0..length {
                    let addr = heap.read_u32(base + ARRAY_HEADER_SIZE + i * 4)?;
                    enqueue(heap, addr, &mut worklist, &mut marked)?;
                }
            }
            continue;
        }
        // Plain objects expose their reference slots through the class
        // layout keyed by the type info word.
        let Some(class) = classes.get(&heap.type_info(base)?) else {
            continue;
        };
        for field in &class.instance_fields {
            if field.kind == SlotKind::Address {
                let addr = heap.read_u32(base + field.offset)?;
                enqueue(heap, addr, &mut worklist, &mut marked)?;
            }
        }
    }

    let swept = heap.sweep();
    debug!("collection: {marked} marked, {swept} swept");
    Ok(CollectionStats { marked, swept })
}

/// Marks the object containing `addr` if the address points into the heap,
/// queueing it for tracing the first time it is seen. Interior addresses
/// mark their containing object.
fn enqueue(
    heap: &mut Heap,
    addr: u32,
    worklist: &mut Vec<u32>,
    marked: &mut usize,
) -> Result<(), MemoryError> {
    let Target::At(Region::Heap, offset) = memory::decode(addr) else {
        return Ok(());
    };
    let base = heap.object_base(offset)?;
    let flags = heap.gc_flags(base)?;
    if !flags.contains(GcFlags::MARKED) {
        heap.set_gc_flags(base, flags | GcFlags::MARKED)?;
        *marked += 1;
        worklist.push(base);
    }
    Ok(())
}
