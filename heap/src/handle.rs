use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

/// Slots per storage segment. Segments are boxed so slot addresses stay
/// stable while the segment list grows.
const SEGMENT_CAPACITY: usize = 64;

/// Low bit of a slot value marks it free; the rest is the tagged next
/// link of the free list.
const FREE_TAG: usize = 1;

struct Segment {
    len: usize,
    slots: [usize; SEGMENT_CAPACITY],
}

struct Slots {
    segments: Vec<Box<Segment>>,
    /// Address of the first free slot, or 0. Free slots chain through
    /// their own cells with [`FREE_TAG`] set.
    free_head: usize,
}

/// Off-heap storage for handle slots.
///
/// Each live slot holds a block address and anchors it as a GC root.
/// Freed slots are recycled through an intrusive free list tagged in the
/// low bit, so the root scan can tell them apart from live slots without
/// auxiliary bookkeeping.
pub struct HandleStorage {
    slots: Mutex<Slots>,
}

impl HandleStorage {
    pub fn new() -> HandleStorage {
        HandleStorage {
            slots: Mutex::new(Slots {
                segments: Vec::new(),
                free_head: 0,
            }),
        }
    }

    /// Allocate a slot holding `value`. Pops the free list when possible,
    /// otherwise appends to the last segment.
    pub fn alloc_slot(&self, value: usize) -> NonNull<usize> {
        let mut slots = self.slots.lock();
        if slots.free_head != 0 {
            let slot = slots.free_head as *mut usize;
            let tagged = unsafe { *slot };
            debug_assert_eq!(tagged & FREE_TAG, FREE_TAG);
            slots.free_head = tagged & !FREE_TAG;
            unsafe { *slot = value };
            return unsafe { NonNull::new_unchecked(slot) };
        }

        let needs_segment = slots
            .segments
            .last()
            .map(|segment| segment.len == SEGMENT_CAPACITY)
            .unwrap_or(true);
        if needs_segment {
            slots.segments.push(Box::new(Segment {
                len: 0,
                slots: [0; SEGMENT_CAPACITY],
            }));
        }
        let segment = slots.segments.last_mut().unwrap_or_else(|| {
            unreachable!("segment pushed above")
        });
        let index = segment.len;
        segment.len += 1;
        segment.slots[index] = value;
        unsafe { NonNull::new_unchecked(&mut segment.slots[index]) }
    }

    /// Return a slot to the free list.
    pub fn free_slot(&self, slot: NonNull<usize>) {
        let mut slots = self.slots.lock();
        unsafe { *slot.as_ptr() = slots.free_head | FREE_TAG };
        slots.free_head = slot.as_ptr() as usize;
    }

    /// Visit the value of every live slot. Registered with the heap as a
    /// root acceptor; free slots are skipped by their tag bit.
    pub fn accept(&self, visit: &mut dyn FnMut(usize)) {
        let slots = self.slots.lock();
        for segment in &slots.segments {
            for &value in &segment.slots[..segment.len] {
                if value & FREE_TAG == 0 {
                    visit(value);
                }
            }
        }
    }

    /// Number of live slots, for tests.
    pub fn live_slots(&self) -> usize {
        let slots = self.slots.lock();
        let mut live = 0;
        for segment in &slots.segments {
            live += segment.slots[..segment.len]
                .iter()
                .filter(|&&value| value & FREE_TAG == 0)
                .count();
        }
        live
    }
}

impl Default for HandleStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// An owning root for one block.
///
/// Construction allocates a slot in the storage and stores the block
/// address; dropping the handle returns the slot. Cloning duplicates the
/// slot, so two handles never share a cell. The type parameter is the
/// layout the block is viewed through by [`Deref`].
pub struct Handle<T> {
    slot: NonNull<usize>,
    storage: Arc<HandleStorage>,
    _marker: PhantomData<*mut T>,
}

impl<T> Handle<T> {
    pub fn new(storage: &Arc<HandleStorage>, address: usize) -> Handle<T> {
        Handle {
            slot: storage.alloc_slot(address),
            storage: storage.clone(),
            _marker: PhantomData,
        }
    }

    /// The rooted block address.
    pub fn address(&self) -> usize {
        unsafe { *self.slot.as_ptr() }
    }

    /// Point the handle at a different block. Only the owning handle may
    /// mutate its cell.
    pub fn set_address(&mut self, address: usize) {
        unsafe { *self.slot.as_ptr() = address };
    }

    pub fn as_ptr(&self) -> *mut T {
        self.address() as *mut T
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle::new(&self.storage, self.address())
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        self.storage.free_slot(self.slot);
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*(self.address() as *const T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_recycled_in_lifo_order() {
        let storage = Arc::new(HandleStorage::new());
        let a = storage.alloc_slot(0x1000);
        let b = storage.alloc_slot(0x2000);
        storage.free_slot(a);
        storage.free_slot(b);
        // Most recently freed first.
        assert_eq!(storage.alloc_slot(0x3000), b);
        assert_eq!(storage.alloc_slot(0x4000), a);
    }

    #[test]
    fn accept_skips_free_slots() {
        let storage = Arc::new(HandleStorage::new());
        let _live = storage.alloc_slot(0x1000);
        let freed = storage.alloc_slot(0x2000);
        storage.free_slot(freed);
        let mut seen = Vec::new();
        storage.accept(&mut |addr| seen.push(addr));
        assert_eq!(seen, vec![0x1000]);
    }

    #[test]
    fn storage_grows_past_one_segment() {
        let storage = Arc::new(HandleStorage::new());
        let handles: Vec<Handle<u64>> = (0..SEGMENT_CAPACITY * 2 + 3)
            .map(|i| Handle::new(&storage, 0x1000 + i * 16))
            .collect();
        assert_eq!(storage.live_slots(), SEGMENT_CAPACITY * 2 + 3);
        let mut seen = Vec::new();
        storage.accept(&mut |addr| seen.push(addr));
        assert_eq!(seen.len(), handles.len());
        // Slot addresses stay valid across growth.
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.address(), 0x1000 + i * 16);
        }
    }

    #[test]
    fn clone_duplicates_the_slot() {
        let storage = Arc::new(HandleStorage::new());
        let mut a: Handle<u64> = Handle::new(&storage, 0x1000);
        let b = a.clone();
        a.set_address(0x2000);
        assert_eq!(a.address(), 0x2000);
        assert_eq!(b.address(), 0x1000);
        assert_eq!(storage.live_slots(), 2);
    }

    #[test]
    fn drop_returns_the_slot() {
        let storage = Arc::new(HandleStorage::new());
        {
            let _h: Handle<u64> = Handle::new(&storage, 0x1000);
            assert_eq!(storage.live_slots(), 1);
        }
        assert_eq!(storage.live_slots(), 0);
    }
}
