//! The image writer pipeline: pruning, bin classification, layout, native
//! relocation planning, string-reference collection, section planning,
//! copying/fixup and serialisation.

pub mod bin;
pub mod copy;
pub mod dirty;
pub mod layout;
pub mod native_layout;
pub mod prune;
pub mod sections;
pub mod serialize;
pub mod string_refs;
pub mod tables;
pub mod writer;

use std::fs::File;
use std::path::PathBuf;

pub use bin::{Bin, BinSlot};
pub use sections::{ImageBlock, ImageHeader, ImageSection, SectionKind, IMAGE_HEADER_SIZE};
pub use writer::{ImageInfo, ImageWriter, NativeRelocation, NativeRelocationKind};

/// Destination for one image: a path to create, or an already-open file
/// descriptor handed over by the caller.
pub enum ImageOutput {
    Path(PathBuf),
    File(File),
}

impl ImageOutput {
    pub fn path(p: impl Into<PathBuf>) -> ImageOutput {
        ImageOutput::Path(p.into())
    }
}

/// Outcome of writing one image file.
#[derive(Copy, Clone, Debug)]
pub struct ImageWriteResult {
    /// The checksum recorded in this image's header.
    pub checksum: u32,
    pub bytes_written: u64,
}
