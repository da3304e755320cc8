//! Bins partition the image so objects with correlated post-load write
//! behaviour share OS pages, minimising private-dirty pages after the
//! runtime forks. Mirror bins come first and hold managed objects; native
//! bins hold runtime structures without lock words.

use crate::mirror::{Class, LockState, Object};
use crate::runtime::heap::Heap;
use crate::util::constants::{LOG_OBJECT_ALIGNMENT, OBJECT_ALIGNMENT};
use crate::util::{Address, ObjectReference};
use enum_map::Enum;
use std::collections::HashMap;
use strum_macros::EnumIter;

/// The image bins, in layout order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Enum, EnumIter)]
pub enum Bin {
    /// Ordinary heap objects not otherwise classified.
    Regular,
    /// Class objects not yet visibly initialised.
    ClassVerified,
    /// Visibly-initialised classes with at least one non-final static.
    ClassInitialized,
    /// Visibly-initialised classes whose statics are all final.
    ClassInitializedFinalStatics,
    /// Strings; immutable.
    String,
    /// Internal arrays likely to stay clean (method pointer arrays).
    InternalClean,
    /// Internal structures likely to be dirtied (class loaders).
    InternalDirty,
    /// Objects listed in the dirty-image-objects input.
    KnownDirty,
    /// Heuristically dirty objects: bare lock targets and dex caches.
    MiscDirty,
    // Native bins follow the mirror bins.
    ArtField,
    ArtMethodClean,
    ArtMethodDirty,
    RuntimeMethod,
    ImTable,
    ImtConflictTable,
    JniStubMethod,
    Metadata,
}

impl Bin {
    /// Number of mirror bins; only these receive bin slots.
    pub const MIRROR_COUNT: usize = Bin::MiscDirty as usize + 1;

    pub fn is_mirror(self) -> bool {
        (self as usize) < Self::MIRROR_COUNT
    }

    pub fn mirror_bins() -> impl Iterator<Item = Bin> {
        use strum::IntoEnumIterator;
        Bin::iter().take(Self::MIRROR_COUNT)
    }

    pub fn all_bins() -> impl Iterator<Item = Bin> {
        use strum::IntoEnumIterator;
        Bin::iter()
    }

    fn from_index(index: u32) -> Bin {
        use strum::IntoEnumIterator;
        Bin::iter()
            .nth(index as usize)
            .unwrap_or_else(|| panic!("invalid bin index {}", index))
    }
}

/// Bits reserved for the bin index in a bin slot.
pub const BIN_BITS: u32 = 4;
/// Shift applied to the bin index; the low bits carry the byte offset.
pub const BIN_SHIFT: u32 = 32 - BIN_BITS;
/// Maximum byte offset representable within one bin.
pub const MAX_BIN_OFFSET: u32 = 1 << BIN_SHIFT;

/// A `(bin, offset)` pair packed into 32 bits: the top [`BIN_BITS`] encode
/// the bin, the rest the byte offset. Object alignment keeps the low bits
/// clear so the whole value fits a forwarding-address lock word.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BinSlot(u32);

impl BinSlot {
    pub fn new(bin: Bin, offset: u32) -> BinSlot {
        debug_assert!(bin.is_mirror());
        debug_assert!(offset < MAX_BIN_OFFSET, "bin offset {:#x} overflows", offset);
        debug_assert_eq!(offset as usize % OBJECT_ALIGNMENT, 0);
        BinSlot(((bin as u32) << BIN_SHIFT) | offset)
    }

    pub fn from_raw(raw: u32) -> BinSlot {
        BinSlot(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn bin(self) -> Bin {
        Bin::from_index(self.0 >> BIN_SHIFT)
    }

    pub fn offset(self) -> u32 {
        self.0 & (MAX_BIN_OFFSET - 1)
    }
}

/// Classify a mirror object into its bin. Rules are evaluated in order;
/// first match wins. Explicit overrides (method pointer arrays, class
/// loaders) are applied by the layout engine, not here.
pub fn classify(heap: &Heap, known_dirty: &HashMap<ObjectReference, u32>, obj: ObjectReference) -> Bin {
    let class_obj = heap.resolve(Object::from_obj(obj).klass());
    let class = Class::from_obj(class_obj);

    if class.is_string_class() {
        return Bin::String;
    }
    if known_dirty.contains_key(&obj) {
        return Bin::KnownDirty;
    }
    if class.is_class_class() {
        let as_class = Class::from_obj(obj);
        if !as_class.is_visibly_initialized() {
            return Bin::ClassVerified;
        }
        if statics_all_final(obj) {
            return Bin::ClassInitializedFinalStatics;
        }
        return Bin::ClassInitialized;
    }
    // A bare Object: its class has no super class and is not a root kind
    // handled above. Commonly a lock target, so expected dirty.
    if class.super_class().is_null() && !class.is_primitive() {
        return Bin::MiscDirty;
    }
    if class.is_dex_cache_class() {
        return Bin::MiscDirty;
    }
    Bin::Regular
}

/// Are all static fields of the class object `class` final? Vacuously true
/// for classes without statics.
fn statics_all_final(class: ObjectReference) -> bool {
    use crate::mirror::class::access_flags::ACC_FINAL;
    use crate::native::{ArtField, LengthPrefixedArray};
    let sfields = Class::from_obj(class).sfields_ptr();
    if sfields == 0 {
        return true;
    }
    let array = unsafe { Address::from_usize(sfields as usize) };
    (0..LengthPrefixedArray::<ArtField>::length(array)).all(|i| {
        let field: ArtField =
            unsafe { LengthPrefixedArray::<ArtField>::element(array, i).load() };
        field.access_flags & ACC_FINAL != 0
    })
}

/// The forwarding state stashed in an object's lock word.
pub fn bin_slot_of(obj: ObjectReference) -> Option<BinSlot> {
    let lock = Object::from_obj(obj).lock_word();
    match lock.state() {
        LockState::ForwardingAddress => Some(BinSlot::from_raw(lock.forwarding_address())),
        _ => None,
    }
}

const _: () = assert!(Bin::MIRROR_COUNT <= 1 << BIN_BITS);
// A full 32-bit slot shifted by the object alignment must fit the 30-bit
// forwarding payload.
const _: () = assert!(32 - LOG_OBJECT_ALIGNMENT as u32 <= 30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_bins_precede_native_bins() {
        assert_eq!(Bin::MIRROR_COUNT, 9);
        assert!(Bin::MiscDirty.is_mirror());
        assert!(!Bin::ArtField.is_mirror());
        assert_eq!(Bin::mirror_bins().count(), 9);
    }

    #[test]
    fn bin_slot_round_trip() {
        for bin in Bin::mirror_bins() {
            let slot = BinSlot::new(bin, 0x1238 & !7);
            assert_eq!(slot.bin(), bin);
            assert_eq!(slot.offset(), 0x1238 & !7);
        }
    }
}
