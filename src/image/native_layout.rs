//! The native relocation planner: assigns image offsets to runtime
//! structures that carry no lock word. Relocations live in a map keyed by
//! the original pointer.

use crate::image::bin::Bin;
use crate::image::writer::{ImageWriter, JniStubRelocation, NativeRelocation, NativeRelocationKind};
use crate::mirror::Class;
use crate::native::method::ArtMethod;
use crate::native::{ArtField, ImTable, ImtConflictTable, JniStubKey, LengthPrefixedArray};
use crate::util::{Address, ObjectReference};
use log::trace;

impl<'r> ImageWriter<'r> {
    /// Reserve space in a native bin for `ptr` and record its relocation.
    /// Returns false if the pointer is null, already placed, or lives in
    /// the boot image.
    pub(crate) fn emplace_native(
        &mut self,
        ptr: u64,
        oat_index: usize,
        kind: NativeRelocationKind,
        size: usize,
    ) -> bool {
        if ptr == 0 || self.native_relocations.contains_key(&ptr) {
            return false;
        }
        if let Some(boot) = self.runtime.boot_image() {
            if boot.contains_native(ptr) {
                return false;
            }
        }
        let info = &mut self.image_infos[oat_index];
        let bin = kind.bin();
        let offset = info.bin_slot_sizes[bin];
        info.bin_slot_sizes[bin] += size;
        info.bin_slot_counts[bin] += 1;
        self.native_relocations.insert(
            ptr,
            NativeRelocation {
                oat_index,
                offset,
                kind,
            },
        );
        trace!("native {:?} {:#x} at bin offset {:#x}", kind, ptr, offset);
        true
    }

    /// Record a relocation for a structure embedded in an already-placed
    /// region (an element of a placed array). Does not grow any bin.
    fn insert_sub_relocation(
        &mut self,
        ptr: u64,
        oat_index: usize,
        offset: usize,
        kind: NativeRelocationKind,
    ) {
        debug_assert!(!self.native_relocations.contains_key(&ptr));
        self.native_relocations.insert(
            ptr,
            NativeRelocation {
                oat_index,
                offset,
                kind,
            },
        );
    }

    /// The shared runtime methods go into the primary image once.
    pub(crate) fn record_runtime_method_relocations(&mut self) {
        for method in self.runtime.runtime_methods().all() {
            self.emplace_native(
                method,
                0,
                NativeRelocationKind::RuntimeMethod,
                std::mem::size_of::<ArtMethod>(),
            );
        }
    }

    /// Plan relocations for one class: its field arrays, its method array
    /// (split clean/dirty), its JNI stubs and its IMT.
    pub(crate) fn record_class_native_relocations(
        &mut self,
        class: ObjectReference,
        oat_index: usize,
    ) {
        let c = Class::from_obj(class);

        for array_ptr in [c.ifields_ptr(), c.sfields_ptr()] {
            self.record_field_array(array_ptr, oat_index);
        }

        let methods_ptr = c.methods_ptr();
        if methods_ptr != 0 && !self.native_relocations.contains_key(&methods_ptr) {
            self.record_method_array(class, methods_ptr, oat_index);
        }

        let imt_ptr = c.imt_ptr();
        if imt_ptr != 0 {
            self.record_imt(imt_ptr, oat_index);
        }
    }

    fn record_field_array(&mut self, array_ptr: u64, oat_index: usize) {
        if array_ptr == 0 || self.native_relocations.contains_key(&array_ptr) {
            return;
        }
        let array = unsafe { Address::from_usize(array_ptr as usize) };
        let length = LengthPrefixedArray::<ArtField>::length(array);
        let size = LengthPrefixedArray::<ArtField>::size_for(length);
        if !self.emplace_native(array_ptr, oat_index, NativeRelocationKind::ArtFieldArray, size) {
            return;
        }
        let array_offset = self.native_relocations[&array_ptr].offset;
        for i in 0..length {
            let field_ptr = LengthPrefixedArray::<ArtField>::element(array, i).as_usize() as u64;
            self.insert_sub_relocation(
                field_ptr,
                oat_index,
                array_offset
                    + LengthPrefixedArray::<ArtField>::DATA_OFFSET
                    + i * std::mem::size_of::<ArtField>(),
                NativeRelocationKind::ArtField,
            );
        }
    }

    fn record_method_array(&mut self, class: ObjectReference, methods_ptr: u64, oat_index: usize) {
        let c = Class::from_obj(class);
        let array = unsafe { Address::from_usize(methods_ptr as usize) };
        let length = LengthPrefixedArray::<ArtMethod>::length(array);
        let size = LengthPrefixedArray::<ArtMethod>::size_for(length);

        // A method is dirty if it is native or its declaring class is not
        // visibly initialised; the array keeps its methods contiguous, so
        // one dirty method moves the whole array.
        let class_clean = c.is_visibly_initialized();
        let mut any_dirty = !class_clean;
        for i in 0..length {
            let method: ArtMethod =
                unsafe { LengthPrefixedArray::<ArtMethod>::element(array, i).load() };
            any_dirty |= method.is_native();
        }
        let (array_kind, method_kind) = if any_dirty {
            (
                NativeRelocationKind::ArtMethodArrayDirty,
                NativeRelocationKind::ArtMethodDirty,
            )
        } else {
            (
                NativeRelocationKind::ArtMethodArrayClean,
                NativeRelocationKind::ArtMethodClean,
            )
        };
        if !self.emplace_native(methods_ptr, oat_index, array_kind, size) {
            return;
        }
        let array_offset = self.native_relocations[&methods_ptr].offset;
        for i in 0..length {
            let slot = LengthPrefixedArray::<ArtMethod>::element(array, i);
            let method_ptr = slot.as_usize() as u64;
            self.insert_sub_relocation(
                method_ptr,
                oat_index,
                array_offset
                    + LengthPrefixedArray::<ArtMethod>::DATA_OFFSET
                    + i * std::mem::size_of::<ArtMethod>(),
                method_kind,
            );
            let method: ArtMethod = unsafe { slot.load() };
            if method.is_native() && method.has_code() {
                self.record_jni_stub(method_ptr, &method, oat_index);
            }
        }
    }

    /// Boot images share one JNI stub per `(shorty, flags, isa)` identity.
    fn record_jni_stub(&mut self, method_ptr: u64, method: &ArtMethod, oat_index: usize) {
        if !self.options.image_kind.is_boot_image() || !self.options.jni_compilation {
            return;
        }
        let Some(meta) = self.runtime.class_linker.method_meta(method_ptr) else {
            return;
        };
        use crate::native::method::method_flags;
        let key = JniStubKey {
            shorty: meta.shorty.clone(),
            flags: method.access_flags
                & (method_flags::ACC_STATIC
                    | method_flags::ACC_NATIVE
                    | method_flags::ACC_CRITICAL_NATIVE),
            isa: self.options.instruction_set,
        };
        if self.jni_stub_map.contains_key(&key) {
            return;
        }
        let info = &mut self.image_infos[oat_index];
        let offset = info.bin_slot_sizes[Bin::JniStubMethod];
        info.bin_slot_sizes[Bin::JniStubMethod] += std::mem::size_of::<ArtMethod>();
        info.bin_slot_counts[Bin::JniStubMethod] += 1;
        self.jni_stub_map.insert(
            key,
            JniStubRelocation {
                method: method_ptr,
                oat_index,
                offset,
            },
        );
    }

    /// Place an IMT; any previously-unseen runtime method in its slots is
    /// emplaced along with its conflict table.
    fn record_imt(&mut self, imt_ptr: u64, oat_index: usize) {
        if !self.emplace_native(
            imt_ptr,
            oat_index,
            NativeRelocationKind::ImTable,
            std::mem::size_of::<ImTable>(),
        ) {
            return;
        }
        let imt = ImTable::from_addr(unsafe { Address::from_usize(imt_ptr as usize) });
        for &entry in imt.entries.iter() {
            if entry == 0 || self.native_relocations.contains_key(&entry) {
                continue;
            }
            if self.runtime.class_linker.method_meta(entry).is_some() {
                // A regular method of a class that has not been visited yet;
                // its own class emplaces it.
                continue;
            }
            self.emplace_native(
                entry,
                oat_index,
                NativeRelocationKind::RuntimeMethod,
                std::mem::size_of::<ArtMethod>(),
            );
            let method: ArtMethod =
                unsafe { Address::from_usize(entry as usize).load() };
            if method.data != 0 {
                let table = unsafe { Address::from_usize(method.data as usize) };
                self.emplace_native(
                    method.data,
                    oat_index,
                    NativeRelocationKind::ImtConflictTable,
                    ImtConflictTable::size_of(table),
                );
            }
        }
    }
}
