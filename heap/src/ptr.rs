use std::ptr;

use crate::heap::Heap;
use crate::WORD_SIZE;

/// A word-aligned pointer cell inside a heap block.
///
/// Every store goes through the write barrier: the owning chunk's pointer
/// bit for the slot is set before the word itself is written, so the
/// collector never observes a pointer the bitmap doesn't know about.
/// Loads do not participate in barriers. Clearing a slot to null keeps
/// the bit set; the collector treats zero as "not a pointer" at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ptr {
    slot: usize,
}

impl Ptr {
    /// View the word at `slot` as a pointer cell.
    ///
    /// # Safety
    ///
    /// `slot` must be a word-aligned address inside a live block of the
    /// heap that is later passed to [`store`](Ptr::store).
    pub unsafe fn at(slot: usize) -> Ptr {
        debug_assert!(slot % WORD_SIZE == 0);
        Ptr { slot }
    }

    /// Address of the cell itself.
    pub fn address(&self) -> usize {
        self.slot
    }

    /// Current value of the cell.
    pub fn load(&self) -> usize {
        unsafe { ptr::read_volatile(self.slot as *const usize) }
    }

    /// Store `value` and record the write with the heap.
    pub fn store(&self, heap: &Heap, value: usize) {
        heap.record_write(self.slot, value);
        unsafe { ptr::write_volatile(self.slot as *mut usize, value) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Heap;

    #[test]
    fn store_records_the_pointer_bit() {
        let heap = Heap::new();
        let block = heap.allocate(64).expect("allocation failed");
        let target = heap.allocate(64).expect("allocation failed");
        let slot = unsafe { Ptr::at(block + 16) };
        assert_eq!(slot.load(), 0);
        slot.store(&heap, target);
        assert_eq!(slot.load(), target);
        assert!(heap.is_pointer(block + 16));
    }

    #[test]
    fn null_store_keeps_the_bit() {
        let heap = Heap::new();
        let block = heap.allocate(64).expect("allocation failed");
        let target = heap.allocate(64).expect("allocation failed");
        let slot = unsafe { Ptr::at(block) };
        slot.store(&heap, target);
        slot.store(&heap, 0);
        assert_eq!(slot.load(), 0);
        // The bit stays set; a zero value means "not a pointer" to the
        // collector.
        assert!(heap.is_pointer(block));
    }

    #[test]
    fn every_written_slot_is_bit_or_zero() {
        // After an arbitrary write sequence, each slot either has its
        // pointer bit set or holds zero.
        let heap = Heap::new();
        let block = heap.allocate(128).expect("allocation failed");
        let targets: Vec<usize> = (0..4)
            .map(|_| heap.allocate(32).expect("allocation failed"))
            .collect();
        for (i, &target) in targets.iter().enumerate() {
            let slot = unsafe { Ptr::at(block + i * WORD_SIZE) };
            slot.store(&heap, target);
            if i % 2 == 0 {
                slot.store(&heap, 0);
            }
        }
        for i in 0..16 {
            let addr = block + i * WORD_SIZE;
            let value = unsafe { std::ptr::read(addr as *const usize) };
            assert!(heap.is_pointer(addr) || value == 0);
        }
    }
}
