//! Remaining mirror kinds the writer treats specially: dex caches, class
//! loaders, reflective executables (Method/Constructor), and field
//! var-handles. Each carries native pointers the copier must translate or
//! null out.

use crate::mirror::HeapRef;
use crate::util::ObjectReference;
use memoffset::offset_of;

/// Mirror of a dex cache. The native arrays cache per-dex resolution state;
/// they are reset by pruning and nulled on the image copy.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DexCache {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    pub(crate) class_loader: HeapRef,
    pub(crate) location: HeapRef,
    /// Native cookie identifying the backing dex file.
    pub(crate) dex_file: u64,
    pub(crate) resolved_fields: u64,
    pub(crate) resolved_methods: u64,
    pub(crate) resolved_types: u64,
    pub(crate) strings: u64,
}

impl DexCache {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a DexCache {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn from_obj_mut<'a>(obj: ObjectReference) -> &'a mut DexCache {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_mut_ref() }
    }

    pub fn location(&self) -> HeapRef {
        self.location
    }

    pub fn dex_file_cookie(&self) -> u64 {
        self.dex_file
    }

    pub fn clear_dex_file_cookie(&mut self) {
        self.dex_file = 0;
    }

    /// Reset every native resolution array.
    pub fn reset_native_arrays(&mut self) {
        self.resolved_fields = 0;
        self.resolved_methods = 0;
        self.resolved_types = 0;
        self.strings = 0;
    }

    pub fn native_array_offsets() -> [usize; 4] {
        [
            offset_of!(DexCache, resolved_fields),
            offset_of!(DexCache, resolved_methods),
            offset_of!(DexCache, resolved_types),
            offset_of!(DexCache, strings),
        ]
    }
}

/// Mirror of a class loader. The class-table and allocator pointers refer to
/// host-side linker state and are nulled on the copy.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ClassLoader {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    pub(crate) name: HeapRef,
    pub(crate) packages: HeapRef,
    pub(crate) parent: HeapRef,
    pub(crate) proxy_cache: HeapRef,
    pub(crate) allocator: u64,
    pub(crate) class_table: u64,
}

impl ClassLoader {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a ClassLoader {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn allocator_offset() -> usize {
        offset_of!(ClassLoader, allocator)
    }

    pub fn class_table_offset() -> usize {
        offset_of!(ClassLoader, class_table)
    }
}

/// Mirror of a reflective Method or Constructor: carries a native method
/// pointer that must be relocated with the method it names.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Executable {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    pub(crate) declaring_class: HeapRef,
    pub(crate) access_flags: u32,
    pub(crate) art_method: u64,
}

impl Executable {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a Executable {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn art_method(&self) -> u64 {
        self.art_method
    }

    pub fn art_method_offset() -> usize {
        offset_of!(Executable, art_method)
    }
}

/// Mirror of a field var-handle: carries a native field pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FieldVarHandle {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
    pub(crate) art_field: u64,
}

impl FieldVarHandle {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a FieldVarHandle {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn art_field(&self) -> u64 {
        self.art_field
    }

    pub fn art_field_offset() -> usize {
        offset_of!(FieldVarHandle, art_field)
    }
}
