//! The on-disk header and section table. Every struct here is `Pod` and is
//! written byte-for-byte; the loader maps the file and reads these in place.

use bytemuck::{Pod, Zeroable};
use enum_map::Enum;
use strum_macros::EnumIter;

/// File magic; bumped with the version bytes on incompatible changes.
pub const IMAGE_MAGIC: [u8; 4] = *b"aim\n";
pub const IMAGE_VERSION: [u8; 4] = *b"001\0";

/// Sections of one image, in file order.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Enum, EnumIter)]
pub enum SectionKind {
    /// Header plus all mirror bins.
    Objects,
    ArtFields,
    /// Clean then dirty method arrays.
    ArtMethods,
    ImTables,
    IMTConflictTables,
    RuntimeMethods,
    JniStubMethods,
    InternedStrings,
    ClassTable,
    /// App images only: `(base offset, field offset)` pairs.
    StringReferenceOffsets,
    /// Always empty in this layout; retained so section indices stay stable
    /// for the loader.
    DexCacheArrays,
    Metadata,
    ImageBitmap,
}

impl SectionKind {
    pub const COUNT: usize = SectionKind::ImageBitmap as usize + 1;
}

/// An `(offset, size)` byte range within the image.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Pod, Zeroable)]
pub struct ImageSection {
    pub offset: u32,
    pub size: u32,
}

impl ImageSection {
    pub fn new(offset: u32, size: u32) -> ImageSection {
        ImageSection { offset, size }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// One compressed (or raw) block of the data section.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ImageBlock {
    /// `StorageMode` as u32.
    pub storage_mode: u32,
    /// Absolute file offset of the stored bytes.
    pub data_offset: u32,
    /// Stored (possibly compressed) byte count.
    pub data_size: u32,
    /// Offset of the uncompressed bytes within the memory image.
    pub image_offset: u32,
    /// Uncompressed byte count.
    pub image_size: u32,
}

/// The fixed-size image header. Written last for the primary image of a
/// multi-image set so no partial-but-consistent set can appear on disk.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ImageHeader {
    pub magic: [u8; 4],
    pub version: [u8; 4],
    /// Address the image expects to be mapped at.
    pub image_begin: u64,
    /// In-memory image size (header + data sections, ELF-segment aligned).
    pub image_size: u64,
    /// Range of the companion oat file's data.
    pub oat_data_begin: u64,
    pub oat_data_end: u64,
    /// The boot image range this image was compiled against (app images and
    /// extensions; zero otherwise).
    pub boot_image_begin: u64,
    pub boot_image_size: u64,
    /// Address of the image-roots array once mapped.
    pub image_roots: u64,
    /// Bytes reserved for the whole (possibly multi-) image mapping; only
    /// meaningful on the primary image.
    pub image_reservation_size: u32,
    /// Number of components (dex files) bundled in this image.
    pub component_count: u32,
    /// Data+bitmap checksum; on the primary image, the XOR of every image's
    /// data checksum.
    pub image_checksum: u32,
    pub oat_checksum: u32,
    pub boot_image_checksum: u32,
    pub pointer_size: u32,
    pub flags: u32,
    /// `StorageMode` as u32.
    pub storage_mode: u32,
    /// Stored byte count of the data region (compressed size when
    /// compressed).
    pub data_size: u32,
    pub blocks_offset: u32,
    pub blocks_count: u32,
    pub reserved: u32,
    pub sections: [ImageSection; SectionKind::COUNT],
}

pub mod header_flags {
    pub const APP_IMAGE: u32 = 1 << 0;
    pub const BOOT_IMAGE_EXTENSION: u32 = 1 << 1;
}

/// Size of the serialised header; mirror objects start at this image offset.
pub const IMAGE_HEADER_SIZE: usize = std::mem::size_of::<ImageHeader>();

// The header layout must stay free of implicit padding for Pod to hold and
// the first mirror bin to start object-aligned.
static_assertions::const_assert_eq!(IMAGE_HEADER_SIZE, 216);
static_assertions::const_assert_eq!(IMAGE_HEADER_SIZE % 8, 0);

impl ImageHeader {
    pub fn section(&self, kind: SectionKind) -> ImageSection {
        self.sections[kind as usize]
    }

    pub fn is_valid(&self) -> bool {
        self.magic == IMAGE_MAGIC && self.version == IMAGE_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let mut header = ImageHeader::zeroed();
        header.magic = IMAGE_MAGIC;
        header.version = IMAGE_VERSION;
        header.image_begin = 0x7000_0000;
        header.sections[SectionKind::Objects as usize] = ImageSection::new(0, 0x1000);
        let bytes: &[u8] = bytemuck::bytes_of(&header);
        assert_eq!(bytes.len(), IMAGE_HEADER_SIZE);
        let copy: ImageHeader = bytemuck::pod_read_unaligned(bytes);
        assert!(copy.is_valid());
        assert_eq!(copy.section(SectionKind::Objects).size, 0x1000);
    }
}
