//! Mirror of a managed class object.
//!
//! A class carries its fields, methods, vtable, iftable and dex-cache
//! pointer, plus the layout metadata the reference visitor and the image
//! writer need. Static fields are embedded at the end of the class object,
//! reference statics first.

use crate::mirror::HeapRef;
use crate::util::ObjectReference;
use memoffset::offset_of;
use static_assertions::const_assert_eq;

/// Primitive type of a class, `Not` for reference types.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Primitive {
    Not = 0,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
}

impl Primitive {
    pub const fn from_u32(value: u32) -> Primitive {
        match value {
            0 => Primitive::Not,
            1 => Primitive::Boolean,
            2 => Primitive::Byte,
            3 => Primitive::Char,
            4 => Primitive::Short,
            5 => Primitive::Int,
            6 => Primitive::Long,
            7 => Primitive::Float,
            8 => Primitive::Double,
            9 => Primitive::Void,
            _ => panic!("invalid primitive type value"),
        }
    }

    /// log2 of the array component size for this primitive type.
    pub const fn component_size_shift(self) -> u32 {
        match self {
            Primitive::Void | Primitive::Boolean | Primitive::Byte => 0,
            Primitive::Char | Primitive::Short => 1,
            Primitive::Int | Primitive::Float | Primitive::Not => 2,
            Primitive::Long | Primitive::Double => 3,
        }
    }

    /// Size in bytes of a field of this primitive type.
    pub const fn field_size(self) -> usize {
        match self {
            Primitive::Boolean | Primitive::Byte => 1,
            Primitive::Char | Primitive::Short => 2,
            Primitive::Int | Primitive::Float | Primitive::Not => 4,
            Primitive::Long | Primitive::Double => 8,
            Primitive::Void => 0,
        }
    }
}

/// Class linkage status. Numeric values mirror the runtime's class state
/// machine; only the states the image writer inspects are represented.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum ClassStatus {
    NotReady = 0,
    ErrorResolved = 2,
    ErrorUnresolved = 3,
    Resolved = 7,
    RetryVerificationAtRuntime = 9,
    Verified = 11,
    Initialized = 14,
    VisiblyInitialized = 15,
}

impl ClassStatus {
    pub fn from_u32(value: u32) -> ClassStatus {
        match value {
            0 => ClassStatus::NotReady,
            2 => ClassStatus::ErrorResolved,
            3 => ClassStatus::ErrorUnresolved,
            7 => ClassStatus::Resolved,
            9 => ClassStatus::RetryVerificationAtRuntime,
            11 => ClassStatus::Verified,
            14 => ClassStatus::Initialized,
            15 => ClassStatus::VisiblyInitialized,
            other => panic!("invalid class status value {}", other),
        }
    }
}

/// Class flags, used to speed up reference visiting and object-kind checks.
pub mod class_flags {
    /// No reference fields other than the class pointer.
    pub const NO_REFERENCE_FIELDS: u32 = 1 << 0;
    /// The class is the string class.
    pub const STRING: u32 = 1 << 2;
    /// Arrays of references.
    pub const OBJECT_ARRAY: u32 = 1 << 3;
    /// The class is the class class.
    pub const CLASS: u32 = 1 << 4;
    /// The class loader class or a subclass.
    pub const CLASS_LOADER: u32 = 1 << 5;
    /// The dex cache class.
    pub const DEX_CACHE: u32 = 1 << 6;
    /// Arrays of primitives.
    pub const PRIMITIVE_ARRAY: u32 = 1 << 12;
    /// Arrays of native pointers (vtables, method pointer arrays).
    pub const POINTER_ARRAY: u32 = 1 << 13;
    /// Reflective Method/Constructor objects carrying a native method pointer.
    pub const EXECUTABLE: u32 = 1 << 14;
    /// VarHandle objects carrying a native field pointer.
    pub const FIELD_VAR_HANDLE: u32 = 1 << 15;
    /// The top two bits store the array component size shift.
    pub const COMPONENT_SIZE_SHIFT_SHIFT: u32 = 30;
}

/// Access flags; the subset the writer inspects.
pub mod access_flags {
    pub const ACC_STATIC: u32 = 0x0008;
    pub const ACC_FINAL: u32 = 0x0010;
    pub const ACC_NATIVE: u32 = 0x0100;
    pub const ACC_INTERFACE: u32 = 0x0200;
    pub const ACC_ABSTRACT: u32 = 0x0400;
    pub const ACC_CONSTRUCTOR: u32 = 0x0001_0000;
}

/// Mirror of a class object. Embedded static fields follow the struct,
/// reference statics first, then primitive statics; `class_size` covers the
/// whole object.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Class {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    // Managed reference fields, visited in declaration order.
    pub(crate) class_loader: HeapRef,
    pub(crate) component_type: HeapRef,
    pub(crate) dex_cache: HeapRef,
    pub(crate) iftable: HeapRef,
    pub(crate) name: HeapRef,
    pub(crate) super_class: HeapRef,
    pub(crate) vtable: HeapRef,
    pub(crate) access_flags: u32,
    pub(crate) class_flags: u32,
    pub(crate) class_size: u32,
    pub(crate) clinit_thread_id: u32,
    pub(crate) dex_class_def_idx: u32,
    pub(crate) dex_type_idx: u32,
    pub(crate) num_reference_instance_fields: u32,
    pub(crate) num_reference_static_fields: u32,
    pub(crate) object_size: u32,
    pub(crate) primitive_type: u32,
    pub(crate) status: u32,
    pub(crate) _padding: u32,
    // Native pointers, pointer-aligned.
    pub(crate) ifields: u64,
    pub(crate) methods: u64,
    pub(crate) sfields: u64,
    pub(crate) imt: u64,
}

// The embedded statics offset below relies on this.
const_assert_eq!(std::mem::size_of::<Class>(), 120);

impl Class {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a Class {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn from_obj_mut<'a>(obj: ObjectReference) -> &'a mut Class {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_mut_ref() }
    }

    /// Byte offset of the first embedded static field.
    pub fn embedded_statics_offset() -> usize {
        std::mem::size_of::<Class>()
    }

    /// Byte offset of the `i`-th embedded reference static field.
    pub fn static_ref_offset(i: usize) -> usize {
        Self::embedded_statics_offset() + i * std::mem::size_of::<HeapRef>()
    }

    pub fn clinit_thread_id_offset() -> usize {
        offset_of!(Class, clinit_thread_id)
    }

    pub fn status_offset() -> usize {
        offset_of!(Class, status)
    }

    pub fn super_class(&self) -> HeapRef {
        self.super_class
    }

    pub fn component_type(&self) -> HeapRef {
        self.component_type
    }

    pub fn dex_cache(&self) -> HeapRef {
        self.dex_cache
    }

    pub fn iftable(&self) -> HeapRef {
        self.iftable
    }

    pub fn vtable(&self) -> HeapRef {
        self.vtable
    }

    pub fn name(&self) -> HeapRef {
        self.name
    }

    pub fn class_loader(&self) -> HeapRef {
        self.class_loader
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags
    }

    pub fn class_flags(&self) -> u32 {
        self.class_flags
    }

    pub fn class_size(&self) -> usize {
        self.class_size as usize
    }

    pub fn object_size(&self) -> usize {
        self.object_size as usize
    }

    pub fn dex_class_def_index(&self) -> u32 {
        self.dex_class_def_idx
    }

    pub fn dex_type_index(&self) -> u32 {
        self.dex_type_idx
    }

    pub fn num_reference_instance_fields(&self) -> usize {
        self.num_reference_instance_fields as usize
    }

    pub fn num_reference_static_fields(&self) -> usize {
        self.num_reference_static_fields as usize
    }

    /// Native pointer to the field array (`LengthPrefixedArray<ArtField>`),
    /// instance fields.
    pub fn ifields_ptr(&self) -> u64 {
        self.ifields
    }

    /// Native pointer to the static field array.
    pub fn sfields_ptr(&self) -> u64 {
        self.sfields
    }

    /// Native pointer to the method array (`LengthPrefixedArray<ArtMethod>`).
    pub fn methods_ptr(&self) -> u64 {
        self.methods
    }

    /// Native pointer to the interface method table.
    pub fn imt_ptr(&self) -> u64 {
        self.imt
    }

    pub fn status(&self) -> ClassStatus {
        ClassStatus::from_u32(self.status)
    }

    pub fn set_status(&mut self, status: ClassStatus) {
        self.status = status as u32;
    }

    pub fn primitive_type(&self) -> Primitive {
        Primitive::from_u32(self.primitive_type)
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive_type() != Primitive::Not
    }

    pub fn is_erroneous(&self) -> bool {
        matches!(
            self.status(),
            ClassStatus::ErrorResolved | ClassStatus::ErrorUnresolved
        )
    }

    pub fn is_resolved(&self) -> bool {
        self.status() >= ClassStatus::Resolved || self.status() == ClassStatus::ErrorResolved
    }

    pub fn is_initialized(&self) -> bool {
        self.status() >= ClassStatus::Initialized
    }

    pub fn is_visibly_initialized(&self) -> bool {
        self.status() == ClassStatus::VisiblyInitialized
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access_flags::ACC_INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & access_flags::ACC_ABSTRACT != 0
    }

    pub fn is_array_class(&self) -> bool {
        !self.component_type.is_null()
    }

    pub fn is_class_class(&self) -> bool {
        self.class_flags & class_flags::CLASS != 0
    }

    pub fn is_string_class(&self) -> bool {
        self.class_flags & class_flags::STRING != 0
    }

    pub fn is_dex_cache_class(&self) -> bool {
        self.class_flags & class_flags::DEX_CACHE != 0
    }

    pub fn is_class_loader_class(&self) -> bool {
        self.class_flags & class_flags::CLASS_LOADER != 0
    }

    pub fn is_instantiable(&self) -> bool {
        (!self.is_primitive() && !self.is_interface() && !self.is_abstract())
            || (self.is_abstract() && self.is_array_class())
    }

    /// log2 of the array component size, stored in the top class-flag bits.
    pub fn component_size_shift(&self) -> u32 {
        self.class_flags >> class_flags::COMPONENT_SIZE_SHIFT_SHIFT
    }

    /// Number of dimensions for array classes, 0 otherwise. Used by the
    /// deterministic class sort.
    pub fn array_dimension(&self, resolve: impl Fn(HeapRef) -> Option<&'static Class>) -> u32 {
        let mut dims = 0;
        let mut component = self.component_type;
        while let Some(c) = resolve(component) {
            dims += 1;
            component = c.component_type;
        }
        dims
    }
}
