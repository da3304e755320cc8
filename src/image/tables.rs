//! Serialised hash sets for the interned-strings and class-table sections.
//!
//! Each set is sized for its exact entry count at the maximum load factor
//! and is never resized: the loader maps it read-only and probes in place.
//! Layout: `u32 bucket_count, u32 entry_count, u32 slots[bucket_count]`,
//! with 0 marking an empty slot (no image entity lives at offset 0).

use crate::error::ImageError;

/// Maximum load factor, as a ratio. Bucket counts are derived from entry
/// counts with this and nothing else, so table sizes are deterministic.
const MAX_LOAD_NUMERATOR: usize = 7;
const MAX_LOAD_DENOMINATOR: usize = 10;

fn buckets_for(count: usize) -> usize {
    if count == 0 {
        1
    } else {
        (count * MAX_LOAD_DENOMINATOR).div_ceil(MAX_LOAD_NUMERATOR)
    }
}

/// Serialised byte size of a set holding `count` entries.
pub fn serialized_size(count: usize) -> usize {
    2 * std::mem::size_of::<u32>() + buckets_for(count) * std::mem::size_of::<u32>()
}

/// Serialise `(hash, value)` entries in the given deterministic order.
/// Values must be non-zero.
pub fn serialize(entries: &[(u32, u32)]) -> Vec<u8> {
    let buckets = buckets_for(entries.len());
    let mut slots = vec![0u32; buckets];
    for &(hash, value) in entries {
        debug_assert_ne!(value, 0);
        let mut index = hash as usize % buckets;
        loop {
            if slots[index] == 0 {
                slots[index] = value;
                break;
            }
            index = (index + 1) % buckets;
        }
    }
    let mut out = Vec::with_capacity(serialized_size(entries.len()));
    out.extend_from_slice(&(buckets as u32).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for slot in slots {
        out.extend_from_slice(&slot.to_le_bytes());
    }
    out
}

/// Probe a serialised set for an entry with `hash` satisfying `matches`.
pub fn lookup<F: Fn(u32) -> bool>(
    bytes: &[u8],
    hash: u32,
    matches: F,
) -> Result<Option<u32>, ImageError> {
    let header_len = 2 * std::mem::size_of::<u32>();
    if bytes.len() < header_len {
        return Err(ImageError::Consistency(
            "serialised hash set shorter than its header".to_string(),
        ));
    }
    let buckets = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if bytes.len() < header_len + buckets * 4 {
        return Err(ImageError::Consistency(
            "serialised hash set truncated".to_string(),
        ));
    }
    let slot = |i: usize| {
        let at = header_len + i * 4;
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    };
    let mut index = hash as usize % buckets;
    for _ in 0..buckets {
        let value = slot(index);
        if value == 0 {
            return Ok(None);
        }
        if matches(value) {
            return Ok(Some(value));
        }
        index = (index + 1) % buckets;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_track_load_factor() {
        assert_eq!(serialized_size(0), 12);
        // 7 entries at 0.7 load -> 10 buckets.
        assert_eq!(serialized_size(7), 8 + 40);
    }

    #[test]
    fn round_trip_lookup() {
        let entries = [(3u32, 0x30u32), (13, 0x130), (7, 0x70)];
        let bytes = serialize(&entries);
        for &(hash, value) in &entries {
            assert_eq!(lookup(&bytes, hash, |v| v == value).unwrap(), Some(value));
        }
        assert_eq!(lookup(&bytes, 99, |_| false).unwrap(), None);
    }

    #[test]
    fn collisions_probe_linearly() {
        // Same bucket for all three; probing must still find each.
        let buckets = buckets_for(3);
        let h = buckets as u32;
        let entries = [(h, 1u32), (h * 2, 2), (h * 3, 3)];
        let bytes = serialize(&entries);
        for &(hash, value) in &entries {
            assert_eq!(lookup(&bytes, hash, |v| v == value).unwrap(), Some(value));
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(lookup(&[0, 0, 0], 0, |_| true).is_err());
    }
}
