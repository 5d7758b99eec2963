//! The CodeSwitch virtual machine runtime.
//!
//! [`Vm`] wires the pieces together: a managed [`Heap`], the
//! [`HandleStorage`] whose live slots root blocks, the [`StackPool`]
//! holding the single executor's stack, and the canonical type
//! descriptor [`Roots`]. The interpreter in [`interpreter`] runs
//! verified functions against this runtime.

pub mod interpreter;

use std::sync::Arc;

use heap::{AllocationError, Handle, HandleStorage, Heap, StackPool};
use package::Roots;

/// One virtual machine instance: a heap and everything registered as a
/// source of its roots.
pub struct Vm {
    heap: Arc<Heap>,
    handles: Arc<HandleStorage>,
    stack_pool: Arc<StackPool>,
    roots: Roots,
}

impl Vm {
    /// Build a runtime: handle storage and stack pool register their
    /// acceptors first, then the type descriptors are allocated under
    /// the GC lock and pinned.
    pub fn new() -> Result<Vm, AllocationError> {
        let heap = Arc::new(Heap::new());

        let handles = Arc::new(HandleStorage::new());
        {
            let handles = handles.clone();
            heap.register_roots(Box::new(move |visit| handles.accept(visit)));
        }

        let stack_pool = Arc::new(StackPool::new());
        {
            let stack_pool = stack_pool.clone();
            heap.register_roots(Box::new(move |visit| {
                stack_pool.accept(visit)
            }));
        }

        let roots = Roots::new(&heap)?;

        Ok(Vm {
            heap,
            handles,
            stack_pool,
            roots,
        })
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn handles(&self) -> &Arc<HandleStorage> {
        &self.handles
    }

    pub fn stack_pool(&self) -> &StackPool {
        &self.stack_pool
    }

    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// Root a block for as long as the returned handle lives.
    pub fn root_block<T>(&self, address: usize) -> Handle<T> {
        Handle::new(&self.handles, address)
    }
}
