//! Mirror of a managed string. Strings are immutable; the character payload
//! follows the header, one byte per character when every character is Latin-1
//! (the compressed form), two otherwise.

use crate::mirror::HeapRef;
use crate::util::constants::OBJECT_ALIGNMENT;
use crate::util::conversions::raw_align_up;
use crate::util::ObjectReference;
use memoffset::offset_of;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ArtString {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    /// length << 1 | (compressed ? 0 : 1)
    pub(crate) count: i32,
    pub(crate) hash_code: u32,
}

impl ArtString {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a ArtString {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn from_obj_mut<'a>(obj: ObjectReference) -> &'a mut ArtString {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_mut_ref() }
    }

    pub fn hash_offset() -> usize {
        offset_of!(ArtString, hash_code)
    }

    pub fn data_offset() -> usize {
        std::mem::size_of::<ArtString>()
    }

    pub fn is_compressed(&self) -> bool {
        self.count & 1 == 0
    }

    pub fn length(&self) -> usize {
        (self.count >> 1) as usize
    }

    /// Pack a length and compression flag into the count field.
    pub fn count_for(length: usize, compressed: bool) -> i32 {
        ((length as i32) << 1) | i32::from(!compressed)
    }

    pub fn size_of(&self) -> usize {
        let char_size = if self.is_compressed() { 1 } else { 2 };
        raw_align_up(Self::data_offset() + self.length() * char_size, OBJECT_ALIGNMENT)
    }

    /// Read the characters back as UTF-16 code units.
    pub fn code_units(&self, obj: ObjectReference) -> Vec<u16> {
        let data = obj.to_raw_address() + Self::data_offset();
        (0..self.length())
            .map(|i| unsafe {
                if self.is_compressed() {
                    (data + i).load::<u8>() as u16
                } else {
                    (data + i * 2).load::<u16>()
                }
            })
            .collect()
    }

    /// The canonical content hash, also used for the serialised intern table.
    pub fn compute_hash(units: &[u16]) -> u32 {
        let mut hash: u32 = 0;
        for &unit in units {
            hash = hash.wrapping_mul(31).wrapping_add(unit as u32);
        }
        hash
    }

    pub fn hash_code(&self) -> u32 {
        self.hash_code
    }

    pub fn set_hash_code(&mut self, hash: u32) {
        self.hash_code = hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_packing() {
        let count = ArtString::count_for(5, true);
        assert_eq!(count & 1, 0);
        assert_eq!(count >> 1, 5);
        let count = ArtString::count_for(5, false);
        assert_eq!(count & 1, 1);
    }

    #[test]
    fn hash_matches_reference() {
        // Same recurrence as the managed string hash.
        let units: Vec<u16> = "hi".encode_utf16().collect();
        assert_eq!(
            ArtString::compute_hash(&units),
            31 * ('h' as u32) + ('i' as u32)
        );
        assert_eq!(ArtString::compute_hash(&[]), 0);
    }
}
