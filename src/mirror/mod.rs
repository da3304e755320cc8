//! The managed (mirror) object model.
//!
//! Mirror objects are raw, 8-byte-aligned records in the heap arena. Each
//! starts with a class pointer and a lock word; the `repr(C)` structs here
//! overlay that raw storage. Heap references are 32-bit offsets from the
//! arena base (null is 0), so the serialised image can rewrite them in place
//! to 32-bit image addresses.

pub mod array;
pub mod class;
pub mod lock_word;
pub mod misc;
pub mod object;
pub mod string;

pub use array::{Array, ObjectArray, PointerArray};
pub use class::{Class, ClassStatus, Primitive};
pub use lock_word::{LockState, LockWord};
pub use misc::{ClassLoader, DexCache, Executable, FieldVarHandle};
pub use object::{object_size, visit_reference_slots, Object, OBJECT_HEADER_SIZE};
pub use string::ArtString;

/// A managed reference as stored in object fields: a 32-bit offset from the
/// heap arena base. In the copied image the same slots hold 32-bit image
/// addresses instead.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct HeapRef(pub u32);

impl HeapRef {
    pub const NULL: HeapRef = HeapRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}
