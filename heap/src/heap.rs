use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::ptr;

use log::debug;
use parking_lot::Mutex;

use crate::chunk::{Chunk, CHUNK_SIZE, DATA_OFFSET, MAX_BLOCK_SIZE};
use crate::{align_up, BLOCK_ALIGNMENT, WORD_SIZE};

/// Blocks are never allocated below this address, so lesser values can
/// carry encodings. The address returned for a zero-byte request.
pub const ZERO_ALLOC_ADDRESS: usize = 1 << 20;

/// Initial collection trigger. Doubled from live bytes after each cycle.
const INITIAL_ALLOCATION_LIMIT: usize = 1 << 20;

/// Raised when memory can't be allocated from the heap. The flag says
/// whether the request is worth retrying after an explicit collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationError {
    pub should_retry_after_gc: bool,
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation error")
    }
}

impl Error for AllocationError {}

/// Raised when an indexed access lands outside the block it started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundsCheckError;

impl fmt::Display for BoundsCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bounds check error")
    }
}

impl Error for BoundsCheckError {}

/// A registered source of GC roots. Called with a visitor that receives
/// every root address; the heap ignores values that are not block
/// addresses it owns, so acceptors may pass through foreign pointers and
/// encodings like [`ZERO_ALLOC_ADDRESS`] unfiltered.
pub type RootAcceptor = Box<dyn Fn(&mut dyn FnMut(usize)) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcPhase {
    None,
    Locked,
}

struct HeapInner {
    /// Owned chunks, segregated by block size.
    chunks_by_size: HashMap<usize, Vec<Chunk>>,
    /// Base addresses of every live chunk, for the on-heap check.
    chunk_bases: HashSet<usize>,
    bytes_allocated: usize,
    allocation_limit: usize,
    gc_phase: GcPhase,
    mark_stack: Vec<usize>,
}

/// The block allocator and mark-sweep collector.
///
/// All state is behind one mutex; chunks additionally carry their own
/// header mutex. Consumers register [`RootAcceptor`]s for handle storage,
/// stacks, and well-known blocks; collection walks those roots and marks
/// through the per-word pointer bitmaps maintained by
/// [`record_write`](Heap::record_write).
pub struct Heap {
    inner: Mutex<HeapInner>,
    roots: Mutex<Vec<RootAcceptor>>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            inner: Mutex::new(HeapInner {
                chunks_by_size: HashMap::new(),
                chunk_bases: HashSet::new(),
                bytes_allocated: 0,
                allocation_limit: INITIAL_ALLOCATION_LIMIT,
                gc_phase: GcPhase::None,
                mark_stack: Vec::new(),
            }),
            roots: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a zeroed block of `size` bytes and return its address.
    ///
    /// Zero-byte requests return [`ZERO_ALLOC_ADDRESS`]. The size is
    /// rounded up to [`BLOCK_ALIGNMENT`]; requests above
    /// [`MAX_BLOCK_SIZE`] fail without retry. Crossing the allocation
    /// limit triggers a collection first.
    pub fn allocate(&self, size: usize) -> Result<usize, AllocationError> {
        if size == 0 {
            return Ok(ZERO_ALLOC_ADDRESS);
        }
        let size = align_up(size, BLOCK_ALIGNMENT);
        if size > MAX_BLOCK_SIZE {
            return Err(AllocationError {
                should_retry_after_gc: false,
            });
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.bytes_allocated + size >= inner.allocation_limit {
            self.collect_garbage_locked(inner);
        }

        if let Some(chunks) = inner.chunks_by_size.get(&size) {
            for chunk in chunks {
                let addr = chunk.allocate();
                if addr != 0 {
                    inner.bytes_allocated += size;
                    return Ok(addr);
                }
            }
        }

        let chunk = Chunk::create(size).ok_or(AllocationError {
            should_retry_after_gc: true,
        })?;
        debug!(
            "new chunk at {:#x} for block size {}",
            chunk.base(),
            size
        );
        let addr = chunk.allocate();
        inner.chunk_bases.insert(chunk.base());
        inner.chunks_by_size.entry(size).or_default().push(chunk);
        inner.bytes_allocated += size;
        Ok(addr)
    }

    /// Record that a pointer was written to the word at `from`.
    ///
    /// Must be called for every pointer store into a block; `to == 0`
    /// still records the slot as pointer-valued (the collector skips zero
    /// slots when scanning).
    pub fn record_write(&self, from: usize, to: usize) {
        let inner = self.inner.lock();
        debug_assert!(
            inner.chunk_bases.contains(&(from & !(CHUNK_SIZE - 1))),
            "write barrier outside the heap"
        );
        let _ = to;
        Chunk::from_address(from).set_pointer(from, true);
        drop(inner);
    }

    /// Reclaim memory used by blocks no longer reachable from any root.
    pub fn collect_garbage(&self) {
        let mut inner = self.inner.lock();
        self.collect_garbage_locked(&mut inner);
    }

    /// While locked, [`collect_garbage`](Heap::collect_garbage) is a
    /// silent no-op. Bootstrap code uses this to allocate well-known
    /// blocks before their acceptor exists.
    pub fn set_gc_lock(&self, locked: bool) {
        let mut inner = self.inner.lock();
        inner.gc_phase = if locked { GcPhase::Locked } else { GcPhase::None };
    }

    /// Register a source of roots for future collections.
    pub fn register_roots(&self, acceptor: RootAcceptor) {
        self.roots.lock().push(acceptor);
    }

    pub fn is_pointer(&self, addr: usize) -> bool {
        Chunk::from_address(addr).is_pointer(addr)
    }

    pub fn set_pointer(&self, addr: usize, value: bool) {
        Chunk::from_address(addr).set_pointer(addr, value);
    }

    pub fn is_marked(&self, addr: usize) -> bool {
        Chunk::from_address(addr).is_marked(addr)
    }

    pub fn set_marked(&self, addr: usize, value: bool) {
        Chunk::from_address(addr).set_marked(addr, value);
    }

    /// Base address of the block containing `p`.
    pub fn block_containing(&self, p: usize) -> usize {
        if p == ZERO_ALLOC_ADDRESS {
            return p;
        }
        Chunk::from_address(p).block_containing(p)
    }

    /// Size of the block containing `p`; zero-byte allocations have none.
    pub fn block_size(&self, p: usize) -> usize {
        if p == ZERO_ALLOC_ADDRESS {
            return 0;
        }
        Chunk::from_address(p).block_size()
    }

    /// Check that `offset` stays inside the block at `base`.
    pub fn check_bound(
        &self,
        base: usize,
        offset: usize,
    ) -> Result<(), BoundsCheckError> {
        if offset >= self.block_size(base) {
            return Err(BoundsCheckError);
        }
        Ok(())
    }

    /// Total bytes in live and not-yet-collected blocks.
    pub fn bytes_allocated(&self) -> usize {
        self.inner.lock().bytes_allocated
    }

    /// Whether `addr` is a block address inside a chunk this heap owns.
    pub fn is_on_heap(&self, addr: usize) -> bool {
        let inner = self.inner.lock();
        Self::is_block_address(&inner, addr)
    }

    fn is_block_address(inner: &HeapInner, addr: usize) -> bool {
        let base = addr & !(CHUNK_SIZE - 1);
        inner.chunk_bases.contains(&base)
            && addr >= base + DATA_OFFSET
            && addr < base + CHUNK_SIZE
    }

    fn collect_garbage_locked(&self, inner: &mut HeapInner) {
        if inner.gc_phase == GcPhase::Locked {
            return;
        }

        let mut stack = std::mem::take(&mut inner.mark_stack);
        stack.clear();

        // Gather roots. The visitor drops anything that is not a block
        // address of this heap: null, the zero-allocation encoding, and
        // foreign pointers an acceptor passes through.
        {
            let acceptors = self.roots.lock();
            let inner_ref: &HeapInner = inner;
            let mut visit = |addr: usize| {
                if !Self::is_block_address(inner_ref, addr) {
                    return;
                }
                let chunk = Chunk::from_address(addr);
                if !chunk.is_marked(chunk.block_containing(addr)) {
                    stack.push(addr);
                }
            };
            for acceptor in acceptors.iter() {
                acceptor(&mut visit);
            }
        }

        // Mark: pop an address, mark its block, scan the block's words
        // and follow every pointer-bit slot holding a non-zero value.
        let mut marked = 0usize;
        while let Some(p) = stack.pop() {
            let chunk = Chunk::from_address(p);
            let block = chunk.block_containing(p);
            if chunk.is_marked(block) {
                continue;
            }
            chunk.set_marked(block, true);
            marked += 1;

            let words = chunk.block_size() / WORD_SIZE;
            for i in 0..words {
                let slot = block + i * WORD_SIZE;
                if !chunk.is_pointer(slot) {
                    continue;
                }
                let value = unsafe { ptr::read(slot as *const usize) };
                if value == 0 || !Self::is_block_address(inner, value) {
                    continue;
                }
                let target = Chunk::from_address(value);
                if !target.is_marked(target.block_containing(value)) {
                    stack.push(value);
                }
            }
        }
        inner.mark_stack = stack;

        #[cfg(debug_assertions)]
        {
            let inner_ref: &HeapInner = inner;
            let is_on_heap =
                |addr: usize| Self::is_block_address(inner_ref, addr);
            for chunks in inner_ref.chunks_by_size.values() {
                for chunk in chunks {
                    chunk.validate(&is_on_heap);
                }
            }
        }

        // Sweep every chunk; chunks with no marked block at all are
        // returned to the kernel.
        let mut live = 0usize;
        let mut dead_chunks = Vec::new();
        for chunks in inner.chunks_by_size.values_mut() {
            chunks.retain(|chunk| {
                if chunk.has_mark() {
                    chunk.sweep();
                    live += chunk.bytes_allocated();
                    true
                } else {
                    dead_chunks.push(*chunk);
                    false
                }
            });
        }
        inner.chunks_by_size.retain(|_, chunks| !chunks.is_empty());
        for chunk in dead_chunks {
            inner.chunk_bases.remove(&chunk.base());
            debug!("releasing empty chunk at {:#x}", chunk.base());
            chunk.destroy();
        }

        inner.bytes_allocated = live;
        inner.allocation_limit = 2 * live;
        debug!("collection: {} blocks marked, {} bytes live", marked, live);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for chunks in inner.chunks_by_size.values() {
            for chunk in chunks {
                chunk.destroy();
            }
        }
        inner.chunks_by_size.clear();
        inner.chunk_bases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_byte_requests_share_one_address() {
        let heap = Heap::new();
        assert_eq!(heap.allocate(0), Ok(ZERO_ALLOC_ADDRESS));
        assert_eq!(heap.allocate(0), Ok(ZERO_ALLOC_ADDRESS));
        assert_eq!(heap.block_size(ZERO_ALLOC_ADDRESS), 0);
        assert_eq!(
            heap.block_containing(ZERO_ALLOC_ADDRESS),
            ZERO_ALLOC_ADDRESS
        );
    }

    #[test]
    fn oversize_requests_fail_without_retry() {
        let heap = Heap::new();
        assert_eq!(
            heap.allocate(MAX_BLOCK_SIZE + 1),
            Err(AllocationError {
                should_retry_after_gc: false
            })
        );
    }

    #[test]
    fn allocate_various_sizes() {
        let heap = Heap::new();
        for size in [1usize, 7, 31, 65, 256, 555, 2001, 62000] {
            let addr = heap.allocate(size).expect("allocation failed");
            assert_ne!(addr, 0);
            assert!(heap.block_size(addr) >= size);
        }
    }

    #[test]
    fn blocks_come_back_zeroed() {
        let heap = Heap::new();
        let addr = heap.allocate(64).expect("allocation failed");
        let words =
            unsafe { std::slice::from_raw_parts(addr as *const usize, 8) };
        assert!(words.iter().all(|&w| w == 0));
    }

    #[test]
    fn record_write_sets_the_pointer_bit() {
        let heap = Heap::new();
        let a = heap.allocate(64).expect("allocation failed");
        let b = heap.allocate(64).expect("allocation failed");
        assert!(!heap.is_pointer(a));
        unsafe { ptr::write(a as *mut usize, b) };
        heap.record_write(a, b);
        assert!(heap.is_pointer(a));
        // Null stores still leave the slot recorded as pointer-valued.
        unsafe { ptr::write(a as *mut usize, 0) };
        heap.record_write(a, 0);
        assert!(heap.is_pointer(a));
    }

    #[test]
    fn check_bound_rejects_offsets_past_the_block() {
        let heap = Heap::new();
        let addr = heap.allocate(64).expect("allocation failed");
        assert_eq!(heap.check_bound(addr, 0), Ok(()));
        assert_eq!(heap.check_bound(addr, 63), Ok(()));
        assert_eq!(heap.check_bound(addr, 64), Err(BoundsCheckError));
    }

    #[test]
    fn collection_reclaims_unrooted_blocks() {
        let heap = Heap::new();
        let rooted = heap.allocate(128).expect("allocation failed");
        let doomed = heap.allocate(128).expect("allocation failed");
        unsafe { ptr::write(doomed as *mut usize, 0x1234) };
        let root = Arc::new(Mutex::new(vec![rooted]));
        let acceptor_roots = root.clone();
        heap.register_roots(Box::new(move |visit| {
            for &addr in acceptor_roots.lock().iter() {
                visit(addr);
            }
        }));

        heap.collect_garbage();

        assert_eq!(heap.bytes_allocated(), 128);
        // The dead block was zeroed and its space is served again.
        let again = heap.allocate(128).expect("allocation failed");
        assert_eq!(again, doomed);
        assert_eq!(unsafe { ptr::read(again as *const usize) }, 0);
    }

    #[test]
    fn collection_traces_through_pointer_slots() {
        let heap = Heap::new();
        let a = heap.allocate(64).expect("allocation failed");
        let b = heap.allocate(64).expect("allocation failed");
        let c = heap.allocate(64).expect("allocation failed");
        // a -> b -> c, with only a rooted.
        unsafe { ptr::write(a as *mut usize, b) };
        heap.record_write(a, b);
        unsafe { ptr::write((b + 8) as *mut usize, c) };
        heap.record_write(b + 8, c);
        heap.register_roots(Box::new(move |visit| visit(a)));

        heap.collect_garbage();

        assert_eq!(heap.bytes_allocated(), 3 * 64);
        assert_eq!(unsafe { ptr::read(a as *const usize) }, b);
        assert_eq!(unsafe { ptr::read((b + 8) as *const usize) }, c);
    }

    #[test]
    fn collection_handles_cycles() {
        let heap = Heap::new();
        let a = heap.allocate(64).expect("allocation failed");
        let b = heap.allocate(64).expect("allocation failed");
        unsafe { ptr::write(a as *mut usize, b) };
        heap.record_write(a, b);
        unsafe { ptr::write(b as *mut usize, a) };
        heap.record_write(b, a);
        heap.register_roots(Box::new(move |visit| visit(a)));

        heap.collect_garbage();
        assert_eq!(heap.bytes_allocated(), 128);

        // Unroot the cycle: both blocks go.
        let unrooted = Heap::new();
        let c = unrooted.allocate(64).expect("allocation failed");
        let d = unrooted.allocate(64).expect("allocation failed");
        unsafe { ptr::write(c as *mut usize, d) };
        unrooted.record_write(c, d);
        unsafe { ptr::write(d as *mut usize, c) };
        unrooted.record_write(d, c);
        unrooted.collect_garbage();
        assert_eq!(unrooted.bytes_allocated(), 0);
    }

    #[test]
    fn empty_chunks_are_released() {
        let heap = Heap::new();
        let addr = heap.allocate(64).expect("allocation failed");
        assert!(heap.is_on_heap(addr));
        heap.collect_garbage();
        assert!(!heap.is_on_heap(addr));
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn gc_lock_suppresses_collection() {
        let heap = Heap::new();
        let addr = heap.allocate(64).expect("allocation failed");
        heap.set_gc_lock(true);
        heap.collect_garbage();
        // Nothing was reclaimed even though the block has no root.
        assert_eq!(heap.bytes_allocated(), 64);
        assert!(heap.is_on_heap(addr));
        heap.set_gc_lock(false);
        heap.collect_garbage();
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn visitors_ignore_foreign_addresses() {
        let heap = Heap::new();
        let addr = heap.allocate(64).expect("allocation failed");
        heap.register_roots(Box::new(move |visit| {
            visit(0);
            visit(ZERO_ALLOC_ADDRESS);
            visit(0xDEAD_BEE8);
            visit(addr);
        }));
        heap.collect_garbage();
        assert_eq!(heap.bytes_allocated(), 64);
    }
}
