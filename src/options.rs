//! Compiler options consumed by the image writer.

use crate::error::ImageError;
use crate::util::constants::{DEFAULT_MAX_BLOCK_SIZE, OBJECT_ALIGNMENT};
use std::collections::HashSet;
use std::str::FromStr;

/// Which flavour of image is being produced. Exactly one applies per build.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImageKind {
    /// A self-contained boot image.
    BootImage,
    /// An extension on top of an existing boot image.
    BootImageExtension,
    /// An app image layered over a loaded boot image.
    AppImage,
}

impl ImageKind {
    pub fn is_boot_image(self) -> bool {
        matches!(self, ImageKind::BootImage | ImageKind::BootImageExtension)
    }

    pub fn is_app_image(self) -> bool {
        self == ImageKind::AppImage
    }
}

/// How the data section is stored on disk.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum StorageMode {
    #[default]
    Uncompressed,
    Lz4,
    /// Higher-effort LZ4; same frame as [`StorageMode::Lz4`].
    Lz4hc,
}

impl StorageMode {
    pub fn is_compressed(self) -> bool {
        self != StorageMode::Uncompressed
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncompressed" => Ok(StorageMode::Uncompressed),
            "lz4" => Ok(StorageMode::Lz4),
            "lz4hc" => Ok(StorageMode::Lz4hc),
            _ => Err(format!("unknown image storage mode: {}", s)),
        }
    }
}

/// Width of native pointers on the target.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PointerSize {
    P32 = 4,
    P64 = 8,
}

impl PointerSize {
    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// Target instruction set.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum InstructionSet {
    Arm,
    Arm64,
    X86,
    X86_64,
    Riscv64,
}

impl InstructionSet {
    pub fn pointer_size(self) -> PointerSize {
        match self {
            InstructionSet::Arm | InstructionSet::X86 => PointerSize::P32,
            InstructionSet::Arm64 | InstructionSet::X86_64 | InstructionSet::Riscv64 => {
                PointerSize::P64
            }
        }
    }
}

impl FromStr for InstructionSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" => Ok(InstructionSet::Arm),
            "arm64" => Ok(InstructionSet::Arm64),
            "x86" => Ok(InstructionSet::X86),
            "x86_64" => Ok(InstructionSet::X86_64),
            "riscv64" => Ok(InstructionSet::Riscv64),
            _ => Err(format!("unknown instruction set: {}", s)),
        }
    }
}

/// Options controlling one image-writer invocation.
#[derive(Clone, Debug)]
pub struct CompilerOptions {
    pub image_kind: ImageKind,
    pub instruction_set: InstructionSet,
    pub debuggable: bool,
    /// Generate shared boot-image JNI stubs for native methods.
    pub jni_compilation: bool,
    /// Classes eligible for the image; `None` admits every class. Boot images
    /// normally pass an explicit profile-derived set.
    pub image_classes: Option<HashSet<String>>,
    /// Whether app-image classes were pre-initialised by the compiler.
    pub initialize_app_image_classes: bool,
    pub storage_mode: StorageMode,
    pub max_image_block_size: u32,
    /// GC region size; non-zero only for app images, where mirror objects
    /// must not straddle region boundaries.
    pub region_size: usize,
}

impl CompilerOptions {
    pub fn new(image_kind: ImageKind, instruction_set: InstructionSet) -> CompilerOptions {
        CompilerOptions {
            image_kind,
            instruction_set,
            debuggable: false,
            jni_compilation: image_kind.is_boot_image(),
            image_classes: None,
            initialize_app_image_classes: false,
            storage_mode: StorageMode::Uncompressed,
            max_image_block_size: DEFAULT_MAX_BLOCK_SIZE,
            region_size: 0,
        }
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.instruction_set.pointer_size()
    }

    /// Is `descriptor` eligible for the image?
    pub fn is_image_class(&self, descriptor: &str) -> bool {
        match &self.image_classes {
            Some(set) => set.contains(descriptor),
            None => true,
        }
    }

    pub fn validate(&self) -> Result<(), ImageError> {
        if self.region_size != 0 {
            if !self.image_kind.is_app_image() {
                return Err(ImageError::InvalidOptions(
                    "region alignment applies only to app images".to_string(),
                ));
            }
            if self.region_size % OBJECT_ALIGNMENT != 0 {
                return Err(ImageError::InvalidOptions(format!(
                    "region size {} is not object aligned",
                    self.region_size
                )));
            }
        }
        if self.max_image_block_size == 0 {
            return Err(ImageError::InvalidOptions(
                "max image block size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_from_str() {
        assert_eq!("lz4".parse::<StorageMode>().unwrap(), StorageMode::Lz4);
        assert_eq!("lz4hc".parse::<StorageMode>().unwrap(), StorageMode::Lz4hc);
        assert!("zstd".parse::<StorageMode>().is_err());
    }

    #[test]
    fn region_size_requires_app_image() {
        let mut options = CompilerOptions::new(ImageKind::BootImage, InstructionSet::X86_64);
        options.region_size = 256;
        assert!(options.validate().is_err());
        options.image_kind = ImageKind::AppImage;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn unaligned_region_size_rejected() {
        let mut options = CompilerOptions::new(ImageKind::AppImage, InstructionSet::Arm64);
        options.region_size = 100;
        assert!(options.validate().is_err());
    }
}
