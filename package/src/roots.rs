use std::sync::Arc;

use heap::{AllocationError, Heap, WORD_SIZE};

use crate::ty::{Type, TypeKind};

/// The well-known singleton blocks: one canonical descriptor per type
/// kind, allocated at VM startup and registered as GC roots. All `Type`
/// values in packages point to one of these three descriptors.
#[derive(Debug, Clone, Copy)]
pub struct Roots {
    unit_type: Type,
    bool_type: Type,
    int64_type: Type,
}

impl Roots {
    /// Allocate the descriptors and register their acceptor.
    ///
    /// The heap's GC lock is held while the blocks are created so a
    /// collection triggered mid-construction cannot trace the partially
    /// built root set.
    pub fn new(heap: &Arc<Heap>) -> Result<Roots, AllocationError> {
        heap.set_gc_lock(true);
        let result = Self::alloc_descriptors(heap);
        if let Ok(roots) = &result {
            let (unit, boolean, int64) = (
                roots.unit_type.address(),
                roots.bool_type.address(),
                roots.int64_type.address(),
            );
            heap.register_roots(Box::new(move |visit| {
                visit(unit);
                visit(boolean);
                visit(int64);
            }));
        }
        heap.set_gc_lock(false);
        result
    }

    fn alloc_descriptors(heap: &Heap) -> Result<Roots, AllocationError> {
        Ok(Roots {
            unit_type: Self::make_type(heap, TypeKind::Unit)?,
            bool_type: Self::make_type(heap, TypeKind::Bool)?,
            int64_type: Self::make_type(heap, TypeKind::Int64)?,
        })
    }

    fn make_type(heap: &Heap, kind: TypeKind) -> Result<Type, AllocationError> {
        let addr = heap.allocate(WORD_SIZE)?;
        unsafe { std::ptr::write(addr as *mut usize, kind as usize) };
        Ok(Type::from_block(addr))
    }

    pub fn unit_type(&self) -> Type {
        self.unit_type
    }

    pub fn bool_type(&self) -> Type {
        self.bool_type
    }

    pub fn int64_type(&self) -> Type {
        self.int64_type
    }

    pub fn type_for(&self, kind: TypeKind) -> Type {
        match kind {
            TypeKind::Unit => self.unit_type,
            TypeKind::Bool => self.bool_type,
            TypeKind::Int64 => self.int64_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_carry_their_kinds() {
        let heap = Arc::new(Heap::new());
        let roots = Roots::new(&heap).expect("roots");
        assert_eq!(roots.unit_type().kind(), TypeKind::Unit);
        assert_eq!(roots.bool_type().kind(), TypeKind::Bool);
        assert_eq!(roots.int64_type().kind(), TypeKind::Int64);
        for kind in [TypeKind::Unit, TypeKind::Bool, TypeKind::Int64] {
            assert_eq!(roots.type_for(kind).kind(), kind);
        }
    }

    #[test]
    fn descriptors_survive_collection() {
        let heap = Arc::new(Heap::new());
        let roots = Roots::new(&heap).expect("roots");
        heap.collect_garbage();
        heap.collect_garbage();
        assert_eq!(roots.bool_type().kind(), TypeKind::Bool);
        assert!(heap.is_on_heap(roots.int64_type().address()));
        // Three one-word descriptors stay accounted for.
        assert_eq!(heap.bytes_allocated(), 3 * WORD_SIZE);
    }
}
