//! The managed heap as the writer sees it: a single mmapped bump arena of
//! 8-byte-aligned objects with an allocation-ordered visitor. The writer runs
//! against a paused runtime, so there is no reclamation and no concurrent
//! mutation; once layout starts, allocation is disabled entirely.

use crate::error::ImageError;
use crate::mirror::HeapRef;
use crate::util::constants::OBJECT_ALIGNMENT;
use crate::util::conversions::raw_align_up;
use crate::util::{Address, ObjectReference};
use log::trace;

/// An anonymous-mmap bump arena. Also used by the class linker for native
/// structure storage, where pointer identity must be stable for the lifetime
/// of the writer.
pub struct Arena {
    base: Address,
    size: usize,
    cursor: Address,
}

impl Arena {
    pub fn new(capacity: usize) -> Result<Arena, ImageError> {
        let capacity = raw_align_up(capacity, crate::util::constants::BYTES_IN_PAGE);
        // SAFETY: anonymous mapping, never unmapped until Drop.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ImageError::ResourceExhausted(format!(
                "mmap of {} byte arena failed",
                capacity
            )));
        }
        let base = Address::from_mut_ptr(ptr);
        Ok(Arena {
            base,
            size: capacity,
            cursor: base,
        })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn used(&self) -> usize {
        self.cursor - self.base
    }

    /// Bump-allocate `size` bytes at `align`. The mapping is zero-filled.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<Address> {
        let start = self.cursor.align_up(align);
        let end = start + size;
        if end > self.base + self.size {
            return None;
        }
        self.cursor = end;
        Some(start)
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.cursor
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/size are the exact mapping created in new().
        unsafe {
            libc::munmap(self.base.to_mut_ptr(), self.size);
        }
    }
}

/// The managed heap.
pub struct Heap {
    arena: Arena,
    /// Allocation-ordered object log; doubles as the heap visitor order.
    objects: Vec<ObjectReference>,
    allocation_enabled: bool,
}

impl Heap {
    pub fn new(capacity: usize) -> Result<Heap, ImageError> {
        let mut arena = Arena::new(capacity)?;
        // Heap references are arena offsets with 0 reserved for null, so the
        // first object must not sit at offset 0.
        arena
            .alloc(OBJECT_ALIGNMENT, OBJECT_ALIGNMENT)
            .ok_or_else(|| ImageError::ResourceExhausted("empty heap arena".to_string()))?;
        Ok(Heap {
            arena,
            objects: Vec::new(),
            allocation_enabled: true,
        })
    }

    pub fn base(&self) -> Address {
        self.arena.base()
    }

    /// Allocate a zeroed mirror object of `size` bytes.
    pub fn allocate_object(&mut self, size: usize) -> Result<ObjectReference, ImageError> {
        assert!(
            self.allocation_enabled,
            "managed allocation after the writer entered its no-allocation phase"
        );
        let addr = self
            .arena
            .alloc(raw_align_up(size, OBJECT_ALIGNMENT), OBJECT_ALIGNMENT)
            .ok_or_else(|| {
                ImageError::ResourceExhausted(format!("heap arena exhausted allocating {}", size))
            })?;
        let obj = ObjectReference::from_raw_address(addr);
        self.objects.push(obj);
        trace!("allocated {} bytes at {}", size, obj);
        Ok(obj)
    }

    /// From this point on, any managed allocation is a bug.
    pub fn disable_allocation(&mut self) {
        self.allocation_enabled = false;
    }

    /// Visit every live object in allocation order.
    pub fn visit_objects<F: FnMut(ObjectReference)>(&self, mut f: F) {
        for &obj in &self.objects {
            f(obj);
        }
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn contains(&self, obj: ObjectReference) -> bool {
        self.arena.contains(obj.to_raw_address())
    }

    /// Turn a heap reference into an object reference; null maps to null.
    pub fn resolve(&self, r: HeapRef) -> ObjectReference {
        if r.is_null() {
            ObjectReference::NULL
        } else {
            ObjectReference::from_raw_address(self.arena.base() + r.0 as usize)
        }
    }

    pub fn try_resolve(&self, r: HeapRef) -> Option<ObjectReference> {
        if r.is_null() {
            None
        } else {
            Some(self.resolve(r))
        }
    }

    /// Turn an object reference into the heap reference stored in fields.
    pub fn heap_ref(&self, obj: ObjectReference) -> HeapRef {
        if obj.is_null() {
            return HeapRef::NULL;
        }
        debug_assert!(self.contains(obj), "foreign object {}", obj);
        let offset = obj.to_raw_address() - self.arena.base();
        debug_assert!(offset <= u32::MAX as usize);
        HeapRef(offset as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_aligned_and_logged() {
        let mut heap = Heap::new(1 << 20).unwrap();
        let a = heap.allocate_object(12).unwrap();
        let b = heap.allocate_object(8).unwrap();
        assert!(a.to_raw_address().is_aligned_to(OBJECT_ALIGNMENT));
        assert!(b.to_raw_address().is_aligned_to(OBJECT_ALIGNMENT));
        assert_eq!(b.to_raw_address() - a.to_raw_address(), 16);
        let mut seen = Vec::new();
        heap.visit_objects(|o| seen.push(o));
        assert_eq!(seen, vec![a, b]);
    }

    #[test]
    fn heap_refs_round_trip() {
        let mut heap = Heap::new(1 << 20).unwrap();
        let a = heap.allocate_object(8).unwrap();
        let r = heap.heap_ref(a);
        assert!(!r.is_null());
        assert_eq!(heap.resolve(r), a);
        assert_eq!(heap.resolve(HeapRef::NULL), ObjectReference::NULL);
    }

    #[test]
    #[should_panic]
    fn allocation_disabled_is_fatal() {
        let mut heap = Heap::new(1 << 20).unwrap();
        heap.disable_allocation();
        let _ = heap.allocate_object(8);
    }
}
