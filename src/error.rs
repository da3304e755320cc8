use std::fmt;
use std::io;

/// Errors surfaced by `prepare_image_address_space` and `write`.
///
/// Unrecoverable state violations (for example a thin- or fat-locked object
/// reaching the copy phase) are not represented here: those abort the process
/// with a descriptive panic, because continuing would serialise a corrupt
/// image.
#[derive(Debug)]
pub enum ImageError {
    /// Out of memory while allocating image roots, live-object arrays or
    /// output buffers. The operation is abandoned.
    ResourceExhausted(String),
    /// Opening, writing or flushing an image file failed.
    Io(io::Error),
    /// The produced bytes disagree with the header (checksum or section
    /// bookkeeping mismatch).
    Consistency(String),
    /// Invalid writer configuration.
    InvalidOptions(String),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::ResourceExhausted(what) => write!(f, "out of memory: {}", what),
            ImageError::Io(e) => write!(f, "image i/o failure: {}", e),
            ImageError::Consistency(what) => write!(f, "image consistency failure: {}", what),
            ImageError::InvalidOptions(what) => write!(f, "invalid image writer options: {}", what),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(e: io::Error) -> Self {
        ImageError::Io(e)
    }
}
