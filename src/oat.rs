//! The companion code file, modelled only by its contract: a data range, a
//! checksum recorded in the image header, a table of well-known trampolines,
//! and oat-relative code offsets that the copier translates into final
//! addresses.

use enum_map::{Enum, EnumMap};

/// Well-known entry points provided by the oat file.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Enum)]
pub enum Trampoline {
    /// Resolves and links a method on first call.
    QuickResolution,
    /// Dispatches through an IMT conflict table.
    QuickImtConflict,
    /// Bridges into the interpreter for methods without code.
    QuickToInterpreterBridge,
    /// Generic JNI dispatch for native methods without a compiled stub.
    QuickGenericJni,
    /// Lazy native-symbol lookup.
    JniDlsymLookup,
    /// Lazy native-symbol lookup for critical natives.
    JniDlsymLookupCritical,
    /// Shared boot-image JNI stub.
    BootJniStub,
}

/// One oat file backing one image.
#[derive(Clone, Debug)]
pub struct OatFile {
    data_begin: u64,
    data_end: u64,
    checksum: u32,
    trampoline_offsets: EnumMap<Trampoline, u32>,
}

impl OatFile {
    pub fn new(
        data_begin: u64,
        data_size: u64,
        checksum: u32,
        trampoline_offsets: EnumMap<Trampoline, u32>,
    ) -> OatFile {
        OatFile {
            data_begin,
            data_end: data_begin + data_size,
            checksum,
            trampoline_offsets,
        }
    }

    /// Convenience constructor from `(trampoline, offset)` pairs.
    pub fn with_trampolines(
        data_begin: u64,
        data_size: u64,
        checksum: u32,
        offsets: &[(Trampoline, u32)],
    ) -> OatFile {
        let mut trampoline_offsets: EnumMap<Trampoline, u32> = EnumMap::default();
        for &(trampoline, offset) in offsets {
            trampoline_offsets[trampoline] = offset;
        }
        OatFile::new(data_begin, data_size, checksum, trampoline_offsets)
    }

    pub fn data_begin(&self) -> u64 {
        self.data_begin
    }

    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Final address of a well-known trampoline.
    pub fn trampoline_address(&self, trampoline: Trampoline) -> u64 {
        self.data_begin + self.trampoline_offsets[trampoline] as u64
    }

    /// Final address of compiled code at an oat-relative offset.
    pub fn code_address(&self, code_offset: u32) -> u64 {
        debug_assert!(code_offset != 0);
        self.data_begin + code_offset as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_oat_relative() {
        let mut trampolines = EnumMap::default();
        trampolines[Trampoline::QuickResolution] = 0x100;
        let oat = OatFile::new(0x7100_0000, 0x1000, 0xDEAD_BEEF, trampolines);
        assert_eq!(oat.trampoline_address(Trampoline::QuickResolution), 0x7100_0100);
        assert_eq!(oat.code_address(0x40), 0x7100_0040);
        assert_eq!(oat.data_end(), 0x7100_1000);
    }
}
