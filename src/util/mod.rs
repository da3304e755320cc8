//! Utilities used across the image writer: address arithmetic, alignment,
//! checksums, the image object bitmap and the optional builtin logger.

pub mod address;
pub mod bitmap;
pub mod checksum;
pub mod constants;
pub mod conversions;
pub mod logger;

pub use address::Address;
pub use address::ObjectReference;
