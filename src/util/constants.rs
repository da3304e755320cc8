/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the alignment of every mirror object
pub const LOG_OBJECT_ALIGNMENT: u8 = 3;
/// Mirror objects are 8-byte aligned; bin slots and the image bitmap are
/// expressed in this granule.
pub const OBJECT_ALIGNMENT: usize = 1 << LOG_OBJECT_ALIGNMENT;

/// The number of bytes in a managed heap reference field
pub const BYTES_IN_HEAP_REFERENCE: usize = 4;

/// Image files are rounded up to this alignment, and the bitmap section
/// starts at a file offset aligned to it. Must match the segment alignment
/// the loader maps images with.
pub const ELF_SEGMENT_ALIGNMENT: usize = BYTES_IN_PAGE;

/// Default upper bound on the byte size of one compressed block.
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1 << 20;
