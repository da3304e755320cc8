//! Native (non-mirror) runtime structures referenced from classes: field and
//! method arrays, interface method tables and their conflict tables. These
//! carry no lock word, so their image relocations live in a side map keyed by
//! the original pointer rather than in a forwarding word.

use crate::mirror::HeapRef;
use crate::options::InstructionSet;
use crate::util::Address;
use memoffset::offset_of;

pub mod method;

pub use method::ArtMethod;

/// Mirror of a field record. The serialised form is exactly this struct.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ArtField {
    /// The field's declaring class.
    pub declaring_class: HeapRef,
    pub access_flags: u32,
    /// Index of the field id in its dex file.
    pub field_dex_idx: u32,
    /// Byte offset of the field within an instance, or within the declaring
    /// class object for statics.
    pub offset: u32,
}

impl ArtField {
    pub fn declaring_class_offset() -> usize {
        offset_of!(ArtField, declaring_class)
    }
}

/// A length-prefixed native array of `T` with the layout
/// `{ length: u32, pad: u32, elements: [T] }`.
pub struct LengthPrefixedArray<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T> LengthPrefixedArray<T> {
    pub const DATA_OFFSET: usize = 8;

    /// Total byte size of an array of `length` elements.
    pub fn size_for(length: usize) -> usize {
        Self::DATA_OFFSET + length * std::mem::size_of::<T>()
    }

    /// Read the length prefix at `array`.
    pub fn length(array: Address) -> usize {
        unsafe { array.load::<u32>() as usize }
    }

    /// Write the length prefix at `array`.
    pub fn set_length(array: Address, length: usize) {
        unsafe {
            array.store(length as u32);
            (array + std::mem::size_of::<u32>()).store(0u32);
        }
    }

    /// Address of the `index`-th element.
    pub fn element(array: Address, index: usize) -> Address {
        array + Self::DATA_OFFSET + index * std::mem::size_of::<T>()
    }

    /// Total byte size of the existing array at `array`.
    pub fn size_of(array: Address) -> usize {
        Self::size_for(Self::length(array))
    }
}

/// An interface method table: a fixed-arity table of native method pointers
/// resolving virtual dispatch on interface calls. Slots hold either the
/// single implementation, the unimplemented marker method, or the conflict
/// method whose data points at an [`ImtConflictTable`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImTable {
    pub entries: [u64; ImTable::SIZE],
}

impl ImTable {
    /// Fixed number of IMT slots.
    pub const SIZE: usize = 43;

    pub fn from_addr<'a>(addr: Address) -> &'a ImTable {
        unsafe { addr.as_ref() }
    }

    pub fn from_addr_mut<'a>(addr: Address) -> &'a mut ImTable {
        unsafe { addr.as_mut_ref() }
    }

    /// Deterministic slot for an interface method's IMT index.
    pub fn slot_for(imt_index: u16) -> usize {
        imt_index as usize % Self::SIZE
    }
}

/// A null-terminated array of `(interface_method, implementation)` pointer
/// pairs hanging off an IMT conflict method.
pub struct ImtConflictTable;

impl ImtConflictTable {
    pub const ENTRY_SIZE: usize = 2 * std::mem::size_of::<u64>();

    /// Byte size of a table with `entries` pairs plus the null terminator.
    pub fn size_for(entries: usize) -> usize {
        (entries + 1) * Self::ENTRY_SIZE
    }

    /// Count the pairs before the null terminator.
    pub fn num_entries(table: Address) -> usize {
        let mut count = 0;
        loop {
            let interface: u64 = unsafe { (table + count * Self::ENTRY_SIZE).load() };
            if interface == 0 {
                return count;
            }
            count += 1;
        }
    }

    /// Byte size of the existing table at `table`.
    pub fn size_of(table: Address) -> usize {
        Self::size_for(Self::num_entries(table))
    }

    pub fn entry(table: Address, index: usize) -> (u64, u64) {
        unsafe {
            (
                (table + index * Self::ENTRY_SIZE).load(),
                (table + index * Self::ENTRY_SIZE + std::mem::size_of::<u64>()).load(),
            )
        }
    }

    pub fn set_entry(table: Address, index: usize, interface_method: u64, implementation: u64) {
        unsafe {
            (table + index * Self::ENTRY_SIZE).store(interface_method);
            (table + index * Self::ENTRY_SIZE + std::mem::size_of::<u64>()).store(implementation);
        }
    }
}

/// Identity of a JNI stub: two native methods share one boot-image stub
/// exactly when their key matches.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct JniStubKey {
    pub shorty: String,
    pub flags: u32,
    pub isa: InstructionSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_array_layout() {
        assert_eq!(LengthPrefixedArray::<ArtField>::size_for(0), 8);
        assert_eq!(LengthPrefixedArray::<ArtField>::size_for(2), 8 + 32);
    }

    #[test]
    fn conflict_table_sizes() {
        assert_eq!(ImtConflictTable::size_for(0), 16);
        assert_eq!(ImtConflictTable::size_for(3), 64);
    }
}
