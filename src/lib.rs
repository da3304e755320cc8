//! An ahead-of-time image writer for a managed, garbage-collected runtime.
//!
//! The writer serialises a live in-memory object graph — classes, methods,
//! fields, interned strings, dispatch tables, and runtime-allocated objects
//! — into one or more position-independent, memory-mappable image files.
//! Images are paired with a companion code ("oat") file and loaded at
//! process start to skip class loading and linking for a fixed set of
//! classes.
//!
//! The pipeline, over a paused single-mutator runtime:
//!
//! 1. prune classes and dex caches that must not enter the image;
//! 2. promote every weak intern to a strong one;
//! 3. classify objects into bins, assign bin slots in a deterministic
//!    order, and stash each slot in the object's lock word as a forwarding
//!    address;
//! 4. plan image offsets for native structures (field/method arrays, IMTs,
//!    conflict tables, JNI stubs);
//! 5. finalise sections, inserting padding so no object straddles a GC
//!    region boundary;
//! 6. copy everything into the output buffers and rewrite every embedded
//!    reference and pointer to its final image-relative form;
//! 7. emit checksum-validated files, the primary header last.
//!
//! ```no_run
//! use aot_image::options::{CompilerOptions, ImageKind, InstructionSet};
//! use aot_image::image::{ImageOutput, ImageWriter};
//!
//! # fn main() -> Result<(), aot_image::ImageError> {
//! # let mut runtime = aot_image::runtime::Runtime::new(1 << 24, 1 << 20)?;
//! # let options = CompilerOptions::new(ImageKind::BootImage, InstructionSet::X86_64);
//! # let oat_files = vec![];
//! # let dex_map = std::collections::HashMap::new();
//! let mut writer =
//!     ImageWriter::new(&mut runtime, &options, 0x7000_0000, oat_files, dex_map, None)?;
//! writer.prepare_image_address_space()?;
//! writer.write(vec![ImageOutput::path("boot.img")])?;
//! # Ok(())
//! # }
//! ```

pub mod dex;
pub mod error;
pub mod image;
pub mod mirror;
pub mod native;
pub mod oat;
pub mod options;
pub mod runtime;
pub mod util;

pub use error::ImageError;
pub use image::{ImageOutput, ImageWriteResult, ImageWriter};
pub use options::{CompilerOptions, ImageKind, InstructionSet, StorageMode};
