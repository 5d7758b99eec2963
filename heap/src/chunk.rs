use std::ptr::{self, NonNull};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use crate::bitmap::Bitmap;
use crate::{is_aligned, system, BLOCK_ALIGNMENT, WORD_SIZE};

/// Size and alignment of a chunk.
pub const CHUNK_SIZE: usize = 1 << 20;

/// Byte offset of the block pool within a chunk. Everything below this is
/// metadata: the header words and the two bitmaps.
pub const DATA_OFFSET: usize = 32 * 1024;

/// Largest block size a chunk can serve.
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

/// One bit per word of the chunk.
const CHUNK_WORD_COUNT: usize = CHUNK_SIZE / WORD_SIZE;

/// The pointer bitmap occupies the first 16 KiB of the chunk. Its leading
/// words double as the header below; the corresponding bits describe the
/// metadata region itself and are never queried.
const POINTER_BITMAP_OFFSET: usize = 0;

/// The mark bitmap occupies the second 16 KiB.
const MARK_BITMAP_OFFSET: usize = 16 * 1024;

// Header fields, overlapping the pointer bitmap's first words.
const MUTEX_OFFSET: usize = 0;
const BLOCK_SIZE_OFFSET: usize = WORD_SIZE;
const BYTES_ALLOCATED_OFFSET: usize = 2 * WORD_SIZE;
const FREE_LIST_OFFSET: usize = 3 * WORD_SIZE;
const FREE_SPACE_OFFSET: usize = 4 * WORD_SIZE;

/// A 1 MiB aligned region backing one block size class.
///
/// `Chunk` is a copyable view over the mapped region; ownership and
/// lifetime are managed by the [`Heap`](crate::Heap). The region layout is:
/// header words and two bitmaps (one pointer bit and one mark bit per
/// chunk word) in the first 32 KiB, then a contiguous pool of equally
/// sized blocks. Free blocks are either threaded on a singly linked free
/// list (first word is the next link, the rest zero) or form the all-zero
/// free tail at the end of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    base: usize,
}

/// Guard for the mutex embedded in the chunk header.
struct ChunkLock<'a> {
    mutex: &'a RawMutex,
}

impl Drop for ChunkLock<'_> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock() };
    }
}

impl Chunk {
    /// Map a fresh chunk serving blocks of `block_size` bytes.
    ///
    /// Returns `None` when the kernel refuses the mapping. The region
    /// comes back zeroed, which establishes the free-tail invariant for
    /// the whole data area at once.
    pub fn create(block_size: usize) -> Option<Chunk> {
        debug_assert!(is_aligned(block_size, BLOCK_ALIGNMENT));
        debug_assert!(block_size > 0 && block_size <= MAX_BLOCK_SIZE);

        let region = system::map_aligned(CHUNK_SIZE, CHUNK_SIZE)?;
        let base = region.as_ptr() as usize;
        let chunk = Chunk { base };
        unsafe {
            ptr::write((base + MUTEX_OFFSET) as *mut RawMutex, RawMutex::INIT);
            chunk.write_header(BLOCK_SIZE_OFFSET, block_size);
            chunk.write_header(BYTES_ALLOCATED_OFFSET, 0);
            chunk.write_header(FREE_LIST_OFFSET, 0);
            chunk.write_header(FREE_SPACE_OFFSET, base + DATA_OFFSET);
        }
        Some(chunk)
    }

    /// Return the chunk's region to the kernel. The view must not be used
    /// afterwards.
    pub(crate) fn destroy(self) {
        let ptr = self.base as *mut u8;
        if let Some(ptr) = NonNull::new(ptr) {
            system::unmap(ptr, CHUNK_SIZE);
        }
    }

    /// The chunk containing `addr`, recovered by masking the low bits.
    /// Chunks are mapped at [`CHUNK_SIZE`] alignment exactly so this works.
    #[inline(always)]
    pub fn from_address(addr: usize) -> Chunk {
        Chunk {
            base: addr & !(CHUNK_SIZE - 1),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn block_size(&self) -> usize {
        unsafe { self.read_header(BLOCK_SIZE_OFFSET) }
    }

    pub fn bytes_allocated(&self) -> usize {
        let _lock = self.lock();
        unsafe { self.read_header(BYTES_ALLOCATED_OFFSET) }
    }

    /// Hand out one zeroed block, or 0 when the chunk is full.
    ///
    /// The free list is preferred over the free tail; both sources
    /// guarantee the block comes back all zero except for the list link,
    /// which is cleared here.
    pub fn allocate(&self) -> usize {
        let _lock = self.lock();
        let block_size = unsafe { self.read_header(BLOCK_SIZE_OFFSET) };

        let head = unsafe { self.read_header(FREE_LIST_OFFSET) };
        if head != 0 {
            let next = unsafe { ptr::read(head as *const usize) };
            unsafe {
                self.write_header(FREE_LIST_OFFSET, next);
                ptr::write(head as *mut usize, 0);
                self.write_header(
                    BYTES_ALLOCATED_OFFSET,
                    self.read_header(BYTES_ALLOCATED_OFFSET) + block_size,
                );
            }
            return head;
        }

        let free_space = unsafe { self.read_header(FREE_SPACE_OFFSET) };
        if free_space + block_size <= self.base + CHUNK_SIZE {
            unsafe {
                self.write_header(FREE_SPACE_OFFSET, free_space + block_size);
                self.write_header(
                    BYTES_ALLOCATED_OFFSET,
                    self.read_header(BYTES_ALLOCATED_OFFSET) + block_size,
                );
            }
            return free_space;
        }

        0
    }

    pub fn is_pointer(&self, addr: usize) -> bool {
        let _lock = self.lock();
        self.pointer_bitmap().get(self.word_index(addr))
    }

    pub fn set_pointer(&self, addr: usize, value: bool) {
        let _lock = self.lock();
        self.pointer_bitmap().set(self.word_index(addr), value);
    }

    /// Only the bit for the first word of a block is meaningful.
    pub fn is_marked(&self, addr: usize) -> bool {
        let _lock = self.lock();
        self.mark_bitmap().get(self.word_index(addr))
    }

    pub fn set_marked(&self, addr: usize, value: bool) {
        let _lock = self.lock();
        self.mark_bitmap().set(self.word_index(addr), value);
    }

    /// Base address of the block containing `p`.
    #[inline]
    pub fn block_containing(&self, p: usize) -> usize {
        debug_assert!(p >= self.base + DATA_OFFSET && p < self.base + CHUNK_SIZE);
        let block_size = self.block_size();
        let data = self.base + DATA_OFFSET;
        data + (p - data) / block_size * block_size
    }

    /// Whether any block in the chunk is marked.
    pub fn has_mark(&self) -> bool {
        let _lock = self.lock();
        let marks = self.mark_bitmap();
        (0..marks.word_count()).any(|i| marks.word_at(i) != 0)
    }

    /// Reclaim every unmarked block and clear the mark bitmap.
    ///
    /// Runs in three steps: grow the free tail downward over trailing
    /// unmarked blocks (zeroing them and their bits), rebuild the free
    /// list from the remaining unmarked blocks, and recount
    /// `bytes_allocated`. Pointer bits of surviving blocks stay set.
    pub fn sweep(&self) {
        let _lock = self.lock();
        let marks = self.mark_bitmap();
        let pointers = self.pointer_bitmap();
        let block_size = unsafe { self.read_header(BLOCK_SIZE_OFFSET) };
        let words_per_block = block_size / WORD_SIZE;
        let begin_index = DATA_OFFSET / WORD_SIZE;

        // Absorb trailing unmarked blocks into the free tail.
        let orig_free_index =
            (unsafe { self.read_header(FREE_SPACE_OFFSET) } - self.base)
                / WORD_SIZE;
        let mut free_index = orig_free_index;
        while free_index > begin_index {
            let prev = free_index - words_per_block;
            if marks.get(prev) {
                break;
            }
            free_index = prev;
        }
        for i in free_index..orig_free_index {
            unsafe { ptr::write((self.base + i * WORD_SIZE) as *mut usize, 0) };
            pointers.set(i, false);
        }
        unsafe {
            self.write_header(
                FREE_SPACE_OFFSET,
                self.base + free_index * WORD_SIZE,
            );
        }

        // Rebuild the free list below the tail.
        let mut bytes_allocated = 0;
        let mut free_list = 0usize;
        let mut block_index = free_index;
        while block_index > begin_index {
            block_index -= words_per_block;
            if marks.get(block_index) {
                bytes_allocated += block_size;
                continue;
            }
            pointers.set(block_index, false);
            unsafe {
                ptr::write(
                    (self.base + block_index * WORD_SIZE) as *mut usize,
                    free_list,
                );
            }
            free_list = self.base + block_index * WORD_SIZE;
            for i in 1..words_per_block {
                pointers.set(block_index + i, false);
                unsafe {
                    ptr::write(
                        (self.base + (block_index + i) * WORD_SIZE)
                            as *mut usize,
                        0,
                    );
                }
            }
        }
        unsafe {
            self.write_header(FREE_LIST_OFFSET, free_list);
            self.write_header(BYTES_ALLOCATED_OFFSET, bytes_allocated);
        }

        // Pointer bits in freed blocks were cleared above; bits in live
        // blocks stay set.
        marks.clear();
    }

    /// Consistency check over the whole chunk. Every word with a pointer
    /// bit in a live block must be zero or point into a marked block of a
    /// live chunk; free-list blocks carry only the link word; the free
    /// tail is entirely zero. Meaningful only while mark bits are in
    /// place, i.e. between the mark and sweep phases of a collection.
    pub fn validate(&self, is_on_heap: &dyn Fn(usize) -> bool) {
        let _lock = self.lock();
        let marks = self.mark_bitmap();
        let pointers = self.pointer_bitmap();
        let block_size = unsafe { self.read_header(BLOCK_SIZE_OFFSET) };
        let words_per_block = block_size / WORD_SIZE;
        let begin_index = DATA_OFFSET / WORD_SIZE;
        let free_space_index =
            (unsafe { self.read_header(FREE_SPACE_OFFSET) } - self.base)
                / WORD_SIZE;

        let mut free = unsafe { self.read_header(FREE_LIST_OFFSET) };
        let mut bytes_allocated = 0;
        let mut index = begin_index;
        while index < free_space_index {
            let block = self.base + index * WORD_SIZE;
            if marks.get(index) {
                // Live block: pointer-bit words hold null or a pointer to
                // a marked block.
                bytes_allocated += block_size;
                for i in 0..words_per_block {
                    if !pointers.get(index + i) {
                        continue;
                    }
                    let value = unsafe {
                        ptr::read((block + i * WORD_SIZE) as *const usize)
                    };
                    if value == 0 {
                        continue;
                    }
                    assert!(is_on_heap(value));
                    let target = Chunk::from_address(value);
                    assert!(
                        target.base + DATA_OFFSET <= value
                            && value < target.base + CHUNK_SIZE
                    );
                    let target_block = if target.base == self.base {
                        let b = self.block_containing(value);
                        marks.get(self.word_index(b))
                    } else {
                        target.is_marked(target.block_containing(value))
                    };
                    assert!(target_block);
                }
            } else if free == block {
                // Free-list block: link word plus zeroes, no bits.
                free = unsafe { ptr::read(block as *const usize) };
                assert!(!pointers.get(index));
                for i in 1..words_per_block {
                    let word = unsafe {
                        ptr::read((block + i * WORD_SIZE) as *const usize)
                    };
                    assert_eq!(word, 0);
                    assert!(!pointers.get(index + i));
                    assert!(!marks.get(index + i));
                }
            } else {
                // Dead block, about to be swept. Nothing to check beyond
                // the absence of interior mark bits.
                for i in 1..words_per_block {
                    assert!(!marks.get(index + i));
                }
                bytes_allocated += block_size;
            }
            index += words_per_block;
        }
        assert_eq!(bytes_allocated, unsafe {
            self.read_header(BYTES_ALLOCATED_OFFSET)
        });

        // The free tail must be all zero with no bits set.
        for index in free_space_index..CHUNK_SIZE / WORD_SIZE {
            let word = unsafe {
                ptr::read((self.base + index * WORD_SIZE) as *const usize)
            };
            assert_eq!(word, 0);
            assert!(!pointers.get(index));
            assert!(!marks.get(index));
        }
    }

    #[inline(always)]
    fn word_index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base && addr < self.base + CHUNK_SIZE);
        (addr - self.base) / WORD_SIZE
    }

    fn pointer_bitmap(&self) -> Bitmap {
        unsafe {
            Bitmap::from_raw(
                (self.base + POINTER_BITMAP_OFFSET) as *mut usize,
                CHUNK_WORD_COUNT,
            )
        }
    }

    fn mark_bitmap(&self) -> Bitmap {
        unsafe {
            Bitmap::from_raw(
                (self.base + MARK_BITMAP_OFFSET) as *mut usize,
                CHUNK_WORD_COUNT,
            )
        }
    }

    fn lock(&self) -> ChunkLock<'_> {
        let mutex = unsafe { &*((self.base + MUTEX_OFFSET) as *const RawMutex) };
        mutex.lock();
        ChunkLock { mutex }
    }

    unsafe fn read_header(&self, offset: usize) -> usize {
        ptr::read((self.base + offset) as *const usize)
    }

    unsafe fn write_header(&self, offset: usize, value: usize) {
        ptr::write((self.base + offset) as *mut usize, value);
    }
}

// SAFETY: a Chunk is an address; all mutation goes through the embedded
// mutex (or the owning heap's lock during collection).
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_chunk(block_size: usize, f: impl FnOnce(Chunk)) {
        let chunk = Chunk::create(block_size).expect("mapping failed");
        f(chunk);
        chunk.destroy();
    }

    #[test]
    fn create_initializes_header() {
        with_chunk(64, |chunk| {
            assert_eq!(chunk.base() & (CHUNK_SIZE - 1), 0);
            assert_eq!(chunk.block_size(), 64);
            assert_eq!(chunk.bytes_allocated(), 0);
        });
    }

    #[test]
    fn from_address_masks_low_bits() {
        with_chunk(32, |chunk| {
            let addr = chunk.base() + DATA_OFFSET + 1000;
            assert_eq!(Chunk::from_address(addr), chunk);
        });
    }

    #[test]
    fn allocate_bumps_through_the_data_area() {
        with_chunk(128, |chunk| {
            let a = chunk.allocate();
            let b = chunk.allocate();
            assert_eq!(a, chunk.base() + DATA_OFFSET);
            assert_eq!(b, a + 128);
            assert_eq!(chunk.bytes_allocated(), 256);
        });
    }

    #[test]
    fn allocate_returns_zero_when_full() {
        with_chunk(MAX_BLOCK_SIZE, |chunk| {
            let blocks = (CHUNK_SIZE - DATA_OFFSET) / MAX_BLOCK_SIZE;
            for _ in 0..blocks {
                assert_ne!(chunk.allocate(), 0);
            }
            assert_eq!(chunk.allocate(), 0);
        });
    }

    #[test]
    fn block_containing_rounds_to_block_base() {
        with_chunk(64, |chunk| {
            let block = chunk.allocate();
            assert_eq!(chunk.block_containing(block), block);
            assert_eq!(chunk.block_containing(block + 63), block);
            let second = chunk.allocate();
            assert_eq!(chunk.block_containing(second + 8), second);
        });
    }

    #[test]
    fn mark_and_pointer_bits_are_independent() {
        with_chunk(64, |chunk| {
            let block = chunk.allocate();
            assert!(!chunk.is_marked(block));
            assert!(!chunk.is_pointer(block));
            chunk.set_marked(block, true);
            assert!(chunk.is_marked(block));
            assert!(!chunk.is_pointer(block));
            chunk.set_pointer(block + 8, true);
            assert!(chunk.is_pointer(block + 8));
            assert!(!chunk.is_marked(block + 8));
        });
    }

    #[test]
    fn has_mark_scans_the_mark_bitmap() {
        with_chunk(64, |chunk| {
            let block = chunk.allocate();
            assert!(!chunk.has_mark());
            chunk.set_marked(block, true);
            assert!(chunk.has_mark());
        });
    }

    #[test]
    fn sweep_coalesces_the_free_tail() {
        with_chunk(64, |chunk| {
            let a = chunk.allocate();
            let b = chunk.allocate();
            let c = chunk.allocate();
            chunk.set_marked(a, true);
            // b and c are unmarked and sit at the end of the data area, so
            // the tail swallows both.
            chunk.sweep();
            assert_eq!(chunk.bytes_allocated(), 64);
            assert!(!chunk.is_marked(a));
            let d = chunk.allocate();
            assert_eq!(d, b);
            let e = chunk.allocate();
            assert_eq!(e, c);
        });
    }

    #[test]
    fn sweep_builds_a_free_list_for_interior_holes() {
        with_chunk(64, |chunk| {
            let a = chunk.allocate();
            let b = chunk.allocate();
            let c = chunk.allocate();
            unsafe { ptr::write(b as *mut usize, 0xDEAD) };
            chunk.set_marked(a, true);
            chunk.set_marked(c, true);
            chunk.sweep();
            assert_eq!(chunk.bytes_allocated(), 128);
            // b was zeroed and is served again from the free list.
            let reused = chunk.allocate();
            assert_eq!(reused, b);
            assert_eq!(unsafe { ptr::read(b as *const usize) }, 0);
        });
    }

    #[test]
    fn sweep_clears_pointer_bits_of_dead_blocks_only() {
        with_chunk(64, |chunk| {
            let live = chunk.allocate();
            let dead = chunk.allocate();
            chunk.set_pointer(live + 8, true);
            chunk.set_pointer(dead + 8, true);
            chunk.set_marked(live, true);
            chunk.sweep();
            assert!(chunk.is_pointer(live + 8));
            assert!(!chunk.is_pointer(dead + 8));
        });
    }

    #[test]
    fn validate_accepts_a_consistent_chunk() {
        with_chunk(64, |chunk| {
            let a = chunk.allocate();
            let b = chunk.allocate();
            let _hole = chunk.allocate();
            // a points at b; record the pointer bit by hand as the write
            // barrier would.
            unsafe { ptr::write(a as *mut usize, b) };
            chunk.set_pointer(a, true);
            chunk.set_marked(a, true);
            chunk.set_marked(b, true);
            let base = chunk.base();
            chunk.validate(&move |addr| {
                Chunk::from_address(addr).base() == base
            });
        });
    }
}
