//! The common mirror object header plus the generic reference visitor and
//! size computation that the layout, copy and pruning passes are built on.

use crate::mirror::class::{class_flags, Class};
use crate::mirror::lock_word::LockWord;
use crate::mirror::{array, misc, string, HeapRef};
use crate::runtime::heap::Heap;
use crate::util::{Address, ObjectReference};
use memoffset::offset_of;
use static_assertions::const_assert_eq;

/// Every mirror object starts with a class pointer and a lock word.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Object {
    pub(crate) klass: HeapRef,
    pub(crate) monitor: u32,
}

/// Size of the common object header in bytes.
pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<Object>();
const_assert_eq!(OBJECT_HEADER_SIZE, 8);

impl Object {
    pub fn from_obj<'a>(obj: ObjectReference) -> &'a Object {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_ref() }
    }

    pub fn from_obj_mut<'a>(obj: ObjectReference) -> &'a mut Object {
        debug_assert!(!obj.is_null());
        unsafe { obj.to_raw_address().as_mut_ref() }
    }

    pub fn klass_offset() -> usize {
        offset_of!(Object, klass)
    }

    pub fn monitor_offset() -> usize {
        offset_of!(Object, monitor)
    }

    pub fn klass(&self) -> HeapRef {
        self.klass
    }

    pub fn set_klass(&mut self, klass: HeapRef) {
        self.klass = klass;
    }

    pub fn lock_word(&self) -> LockWord {
        LockWord::from_raw(self.monitor)
    }

    pub fn set_lock_word(&mut self, lock: LockWord) {
        self.monitor = lock.raw();
    }

}

/// Compute the byte size of a mirror object from its class.
pub fn object_size(heap: &Heap, obj: ObjectReference) -> usize {
    let o = Object::from_obj(obj);
    let class = Class::from_obj(heap.resolve(o.klass()));
    let flags = class.class_flags();
    if flags & class_flags::CLASS != 0 {
        Class::from_obj(obj).class_size()
    } else if flags & class_flags::STRING != 0 {
        string::ArtString::from_obj(obj).size_of()
    } else if flags
        & (class_flags::OBJECT_ARRAY | class_flags::PRIMITIVE_ARRAY | class_flags::POINTER_ARRAY)
        != 0
    {
        array::Array::from_obj(obj).size_of(class.component_size_shift())
    } else {
        class.object_size()
    }
}

/// Visit every declared reference slot of `obj` in field-declaration order,
/// the class pointer first. The visitor receives the slot address in the
/// live heap and the raw heap reference stored there (possibly null).
///
/// The visitor shape is deliberately generic so each pass (layout queue,
/// pruning walk, string-reference collection, fixup) monomorphises its own
/// copy instead of dispatching virtually in the inner loop.
pub fn visit_reference_slots<F: FnMut(Address, HeapRef)>(
    heap: &Heap,
    obj: ObjectReference,
    mut f: F,
) {
    let addr = obj.to_raw_address();
    let o = Object::from_obj(obj);
    f(addr + Object::klass_offset(), o.klass());

    let class = Class::from_obj(heap.resolve(o.klass()));
    let flags = class.class_flags();

    let read = |offset: usize| -> HeapRef { unsafe { (addr + offset).load::<HeapRef>() } };

    if flags & class_flags::CLASS != 0 {
        // `obj` is itself a class: fixed reference fields, then embedded
        // reference statics.
        let as_class = Class::from_obj(obj);
        for offset in [
            offset_of!(Class, class_loader),
            offset_of!(Class, component_type),
            offset_of!(Class, dex_cache),
            offset_of!(Class, iftable),
            offset_of!(Class, name),
            offset_of!(Class, super_class),
            offset_of!(Class, vtable),
        ] {
            f(addr + offset, read(offset));
        }
        for i in 0..as_class.num_reference_static_fields() {
            let offset = Class::static_ref_offset(i);
            f(addr + offset, read(offset));
        }
    } else if flags & class_flags::OBJECT_ARRAY != 0 {
        let arr = array::Array::from_obj(obj);
        let data = array::Array::data_offset(std::mem::size_of::<HeapRef>());
        for i in 0..arr.length() {
            let offset = data + i * std::mem::size_of::<HeapRef>();
            f(addr + offset, read(offset));
        }
    } else if flags
        & (class_flags::STRING
            | class_flags::PRIMITIVE_ARRAY
            | class_flags::POINTER_ARRAY
            | class_flags::NO_REFERENCE_FIELDS)
        != 0
    {
        // Only the class pointer.
    } else if flags & class_flags::DEX_CACHE != 0 {
        for offset in [
            offset_of!(misc::DexCache, class_loader),
            offset_of!(misc::DexCache, location),
        ] {
            f(addr + offset, read(offset));
        }
    } else if flags & class_flags::CLASS_LOADER != 0 {
        for offset in [
            offset_of!(misc::ClassLoader, name),
            offset_of!(misc::ClassLoader, packages),
            offset_of!(misc::ClassLoader, parent),
            offset_of!(misc::ClassLoader, proxy_cache),
        ] {
            f(addr + offset, read(offset));
        }
    } else if flags & class_flags::EXECUTABLE != 0 {
        let offset = offset_of!(misc::Executable, declaring_class);
        f(addr + offset, read(offset));
    } else {
        // Normal instance: each class's own reference fields sit directly
        // after its super class's fields. Visit most-rooted class first so
        // slots come out in declaration order.
        let mut chain = Vec::new();
        let mut c = heap.resolve(o.klass());
        while !c.is_null() {
            chain.push(c);
            c = heap.resolve(Class::from_obj(c).super_class());
        }
        for &class_obj in chain.iter().rev() {
            let cl = Class::from_obj(class_obj);
            let refs = cl.num_reference_instance_fields();
            if refs == 0 {
                continue;
            }
            let start = match heap.try_resolve(cl.super_class()) {
                Some(s) => Class::from_obj(s).object_size(),
                None => OBJECT_HEADER_SIZE,
            };
            for i in 0..refs {
                let offset = start + i * std::mem::size_of::<HeapRef>();
                f(addr + offset, read(offset));
            }
        }
    }
}
