//! Mirror of a native method record and the entry-point vocabulary the
//! copier uses when wiring methods to trampolines or compiled code.

use crate::mirror::HeapRef;
use memoffset::offset_of;
use static_assertions::const_assert_eq;

/// Method access flags inspected by the writer. The low 16 bits follow the
/// bytecode format; the high bits are runtime-internal.
pub mod method_flags {
    pub const ACC_STATIC: u32 = 0x0008;
    pub const ACC_NATIVE: u32 = 0x0100;
    pub const ACC_ABSTRACT: u32 = 0x0400;
    /// Compiled code performs its own class-initialisation check.
    pub const ACC_CLINIT_CHECKED_CODE: u32 = 0x0010_0000;
    /// Interpreter fast-path bits, recomputed for the target ISA on copy.
    pub const ACC_NTERP_INVOKE_FAST_PATH: u32 = 0x0020_0000;
    pub const ACC_NTERP_ENTRY_POINT_FAST_PATH: u32 = 0x0040_0000;
    /// Critical native, resolved through the critical lookup stub.
    pub const ACC_CRITICAL_NATIVE: u32 = 0x0080_0000;
}

/// A native method record. The serialised form is exactly this struct, with
/// the two native pointers rewritten by the copier.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ArtMethod {
    /// The method's declaring class.
    pub declaring_class: HeapRef,
    pub access_flags: u32,
    /// Index into the method ids of the declaring dex file.
    pub dex_method_index: u32,
    /// Entry within the vtable, for virtual dispatch.
    pub method_index: u16,
    /// IMT index for interface methods, hotness otherwise.
    pub imt_index: u16,
    /// Offset of compiled code within the companion oat file; 0 when the
    /// method has no compiled code.
    pub code_offset: u32,
    pub _padding: u32,
    /// Kind-dependent payload: a conflict table for IMT-conflict methods, a
    /// JNI stub anchor for native methods.
    pub data: u64,
    /// Dispatch target from compiled code.
    pub entry_point: u64,
}

const_assert_eq!(std::mem::size_of::<ArtMethod>(), 40);

impl ArtMethod {
    pub fn declaring_class_offset() -> usize {
        offset_of!(ArtMethod, declaring_class)
    }

    pub fn data_offset() -> usize {
        offset_of!(ArtMethod, data)
    }

    pub fn entry_point_offset() -> usize {
        offset_of!(ArtMethod, entry_point)
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & method_flags::ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & method_flags::ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & method_flags::ACC_ABSTRACT != 0
    }

    pub fn is_critical_native(&self) -> bool {
        self.access_flags & method_flags::ACC_CRITICAL_NATIVE != 0
    }

    pub fn has_code(&self) -> bool {
        self.code_offset != 0
    }

    /// Does compiled code for this method perform its own clinit check?
    pub fn code_handles_clinit_check(&self) -> bool {
        self.access_flags & method_flags::ACC_CLINIT_CHECKED_CODE != 0
    }
}
