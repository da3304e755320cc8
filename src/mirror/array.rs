//! Mirror arrays: reference arrays, primitive arrays, and pointer arrays
//! (vtables and other method pointer arrays, whose elements are native
//! pointers rather than heap references).

use crate::mirror::HeapRef;
use crate::util::conversions::raw_align_up;
use crate::util::{Address, ObjectReference};
use memoffset::offset_of;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Array {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    pub(crate) length: i32,
}

impl Array {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a Array {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn length(&self) -> usize {
        debug_assert!(self.length >= 0);
        self.length as usize
    }

    /// Byte offset of the first element for the given component size.
    pub fn data_offset(component_size: usize) -> usize {
        debug_assert!(component_size.is_power_of_two());
        raw_align_up(offset_of!(Array, length) + std::mem::size_of::<i32>(), component_size)
    }

    /// Total byte size given the component size shift from the class flags.
    pub fn size_of(&self, component_size_shift: u32) -> usize {
        Self::data_offset(1 << component_size_shift) + (self.length() << component_size_shift)
    }
}

/// Accessors for reference arrays.
pub struct ObjectArray;

impl ObjectArray {
    pub fn element_offset(index: usize) -> usize {
        Array::data_offset(std::mem::size_of::<HeapRef>()) + index * std::mem::size_of::<HeapRef>()
    }

    pub fn element(obj: ObjectReference, index: usize) -> HeapRef {
        debug_assert!(index < Array::from_obj(obj).length());
        unsafe { (obj.to_raw_address() + Self::element_offset(index)).load() }
    }

    pub fn set_element(obj: ObjectReference, index: usize, value: HeapRef) {
        debug_assert!(index < Array::from_obj(obj).length());
        unsafe { (obj.to_raw_address() + Self::element_offset(index)).store(value) }
    }

    /// Byte size of a reference array of `length` elements.
    pub fn size_for(length: usize) -> usize {
        Array::data_offset(std::mem::size_of::<HeapRef>())
            + length * std::mem::size_of::<HeapRef>()
    }
}

/// Accessors for pointer arrays. Elements are 64-bit native pointers.
pub struct PointerArray;

impl PointerArray {
    pub const ELEMENT_SIZE: usize = std::mem::size_of::<u64>();

    pub fn element_offset(index: usize) -> usize {
        Array::data_offset(Self::ELEMENT_SIZE) + index * Self::ELEMENT_SIZE
    }

    pub fn element_address(obj: ObjectReference, index: usize) -> Address {
        obj.to_raw_address() + Self::element_offset(index)
    }

    pub fn element(obj: ObjectReference, index: usize) -> u64 {
        debug_assert!(index < Array::from_obj(obj).length());
        unsafe { Self::element_address(obj, index).load() }
    }

    pub fn set_element(obj: ObjectReference, index: usize, value: u64) {
        debug_assert!(index < Array::from_obj(obj).length());
        unsafe { Self::element_address(obj, index).store(value) }
    }

    /// Byte size of a pointer array of `length` elements.
    pub fn size_for(length: usize) -> usize {
        Array::data_offset(Self::ELEMENT_SIZE) + length * Self::ELEMENT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_offsets() {
        // 4-byte components start right after the 12-byte array header;
        // 8-byte components are realigned.
        assert_eq!(Array::data_offset(4), 12);
        assert_eq!(Array::data_offset(8), 16);
        assert_eq!(Array::data_offset(1), 12);
    }

    #[test]
    fn sizes() {
        assert_eq!(ObjectArray::size_for(0), 12);
        assert_eq!(ObjectArray::size_for(3), 24);
        assert_eq!(PointerArray::size_for(2), 32);
    }
}
