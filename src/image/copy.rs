//! The copier & fixer-upper: copies every placed entity into the output
//! buffers byte-for-byte, then rewrites every embedded reference and native
//! pointer to its final image-relative form.

use crate::image::bin::Bin;
use crate::image::sections::SectionKind;
use crate::image::tables;
use crate::image::writer::{ImageWriter, NativeRelocationKind};
use crate::mirror::class::class_flags;
use crate::mirror::{
    object_size, visit_reference_slots, Array, ArtString, Class, ClassLoader, ClassStatus,
    DexCache, Executable, FieldVarHandle, HeapRef, LockWord, Object, PointerArray,
    OBJECT_HEADER_SIZE,
};
use crate::native::method::ArtMethod;
use crate::native::{ArtField, ImTable, ImtConflictTable, LengthPrefixedArray};
use crate::oat::Trampoline;
use crate::util::bitmap::ImageBitmap;
use crate::util::checksum::Adler32;
use crate::util::{Address, ObjectReference};
use log::{debug, info};

/// Write a little-endian value into a buffer at `offset`.
fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl<'r> ImageWriter<'r> {
    fn take_buffers(&mut self) -> Vec<Vec<u8>> {
        self.image_infos
            .iter_mut()
            .map(|info| std::mem::take(&mut info.image_data))
            .collect()
    }

    fn restore_buffers(&mut self, buffers: Vec<Vec<u8>>) {
        for (info, buffer) in self.image_infos.iter_mut().zip(buffers) {
            info.image_data = buffer;
        }
    }

    fn take_bitmaps(&mut self) -> Vec<ImageBitmap> {
        self.image_infos
            .iter_mut()
            .map(|info| info.image_bitmap.take().expect("bitmap not allocated"))
            .collect()
    }

    fn restore_bitmaps(&mut self, bitmaps: Vec<ImageBitmap>) {
        for (info, bitmap) in self.image_infos.iter_mut().zip(bitmaps) {
            info.image_bitmap = Some(bitmap);
        }
    }

    /// Copy every native structure into its bin and rewrite its pointers.
    pub(crate) fn copy_and_fixup_native_data(&mut self) {
        let mut buffers = self.take_buffers();

        let relocations: Vec<(u64, crate::image::writer::NativeRelocation)> = self
            .native_relocations
            .iter()
            .map(|(&ptr, &reloc)| (ptr, reloc))
            .collect();
        for (ptr, relocation) in relocations {
            let info = &self.image_infos[relocation.oat_index];
            let dst =
                info.bin_slot_offsets[relocation.kind.bin()] + relocation.offset;
            let buffer = &mut buffers[relocation.oat_index];
            let src = unsafe { Address::from_usize(ptr as usize) };
            match relocation.kind {
                NativeRelocationKind::ArtFieldArray => {
                    // Header only; elements are covered by their own
                    // relocations.
                    let length = LengthPrefixedArray::<ArtField>::length(src);
                    put_u32(buffer, dst, length as u32);
                    put_u32(buffer, dst + 4, 0);
                }
                NativeRelocationKind::ArtMethodArrayClean
                | NativeRelocationKind::ArtMethodArrayDirty => {
                    let length = LengthPrefixedArray::<ArtMethod>::length(src);
                    put_u32(buffer, dst, length as u32);
                    put_u32(buffer, dst + 4, 0);
                }
                NativeRelocationKind::ArtField => {
                    let field: ArtField = unsafe { src.load() };
                    let declaring = self.runtime.heap.resolve(field.declaring_class);
                    put_u32(buffer, dst, self.relocated_ref(declaring));
                    put_u32(buffer, dst + 4, field.access_flags);
                    put_u32(buffer, dst + 8, field.field_dex_idx);
                    put_u32(buffer, dst + 12, field.offset);
                }
                NativeRelocationKind::ArtMethodClean
                | NativeRelocationKind::ArtMethodDirty
                | NativeRelocationKind::RuntimeMethod => {
                    self.copy_and_fixup_method(ptr, relocation.kind, relocation.oat_index, buffer, dst);
                }
                NativeRelocationKind::JniStubMethod => {
                    unreachable!("jni stubs are placed through the stub map")
                }
                NativeRelocationKind::ImTable => {
                    let imt = ImTable::from_addr(src);
                    for (i, &entry) in imt.entries.iter().enumerate() {
                        put_u64(buffer, dst + i * 8, self.native_relocated_address(entry));
                    }
                }
                NativeRelocationKind::ImtConflictTable => {
                    let entries = ImtConflictTable::num_entries(src);
                    for i in 0..entries {
                        let (interface_method, implementation) = ImtConflictTable::entry(src, i);
                        put_u64(
                            buffer,
                            dst + i * ImtConflictTable::ENTRY_SIZE,
                            self.native_relocated_address(interface_method),
                        );
                        put_u64(
                            buffer,
                            dst + i * ImtConflictTable::ENTRY_SIZE + 8,
                            self.native_relocated_address(implementation),
                        );
                    }
                    put_u64(buffer, dst + entries * ImtConflictTable::ENTRY_SIZE, 0);
                    put_u64(buffer, dst + entries * ImtConflictTable::ENTRY_SIZE + 8, 0);
                }
            }
        }

        // Shared JNI stub anchors: one method copy per stub identity.
        let stubs: Vec<crate::image::writer::JniStubRelocation> =
            self.jni_stub_map.values().copied().collect();
        for stub in stubs {
            let info = &self.image_infos[stub.oat_index];
            let dst = info.bin_slot_offsets[Bin::JniStubMethod] + stub.offset;
            self.copy_and_fixup_method(
                stub.method,
                NativeRelocationKind::JniStubMethod,
                stub.oat_index,
                &mut buffers[stub.oat_index],
                dst,
            );
        }

        self.restore_buffers(buffers);
        info!("native data copied: {} relocations", self.native_relocations.len());
    }

    /// Copy one method record and select its entry points.
    fn copy_and_fixup_method(
        &self,
        src_ptr: u64,
        kind: NativeRelocationKind,
        oat_index: usize,
        buffer: &mut [u8],
        dst: usize,
    ) {
        use crate::native::method::method_flags;
        let method: ArtMethod = unsafe { Address::from_usize(src_ptr as usize).load() };
        let mut copy = method;
        let declaring = self.runtime.heap.resolve(method.declaring_class);
        copy.declaring_class = HeapRef(self.relocated_ref(declaring));

        let oat = &self.image_infos[oat_index].oat_file;
        let runtime_methods = self.runtime.runtime_methods();

        if kind == NativeRelocationKind::RuntimeMethod {
            if method.data != 0 {
                // A cloned IMT conflict method: trampoline plus its table.
                copy.entry_point = oat.trampoline_address(Trampoline::QuickImtConflict);
                copy.data = self.native_relocated_address(method.data);
            } else if src_ptr == runtime_methods.resolution_method {
                copy.entry_point = oat.trampoline_address(Trampoline::QuickResolution);
                copy.data = oat.trampoline_address(Trampoline::JniDlsymLookupCritical);
            } else {
                copy.entry_point = oat.trampoline_address(Trampoline::QuickImtConflict);
                copy.data = 0;
            }
        } else {
            let visibly_initialized = declaring.is_null()
                || Class::from_obj(declaring).is_visibly_initialized();
            let needs_clinit_check = method.is_static() && !visibly_initialized;
            if method.is_abstract() || !method.has_code() {
                copy.entry_point = oat.trampoline_address(Trampoline::QuickToInterpreterBridge);
            } else if method.is_native() {
                if needs_clinit_check && !method.code_handles_clinit_check() {
                    copy.entry_point = oat.trampoline_address(Trampoline::QuickResolution);
                } else if let Some(stub) = self.boot_jni_stub_address(src_ptr, &method) {
                    copy.entry_point = oat.trampoline_address(Trampoline::BootJniStub);
                    copy.data = stub;
                } else {
                    copy.entry_point = oat.trampoline_address(Trampoline::QuickGenericJni);
                    copy.data = if method.is_critical_native() {
                        oat.trampoline_address(Trampoline::JniDlsymLookupCritical)
                    } else {
                        oat.trampoline_address(Trampoline::JniDlsymLookup)
                    };
                }
            } else if needs_clinit_check && !method.code_handles_clinit_check() {
                copy.entry_point = oat.trampoline_address(Trampoline::QuickResolution);
            } else {
                copy.entry_point = oat.code_address(method.code_offset);
            }

            // Interpreter fast-path bits are target-specific; recompute.
            // Debuggable builds stay on the slow paths.
            copy.access_flags &= !(method_flags::ACC_NTERP_INVOKE_FAST_PATH
                | method_flags::ACC_NTERP_ENTRY_POINT_FAST_PATH);
            if method.has_code()
                && !method.is_native()
                && !needs_clinit_check
                && !self.options.debuggable
            {
                copy.access_flags |= method_flags::ACC_NTERP_INVOKE_FAST_PATH;
            }
        }

        put_u32(buffer, dst, copy.declaring_class.0);
        put_u32(buffer, dst + 4, copy.access_flags);
        put_u32(buffer, dst + 8, copy.dex_method_index);
        put_u32(
            buffer,
            dst + 12,
            (copy.method_index as u32) | ((copy.imt_index as u32) << 16),
        );
        put_u32(buffer, dst + 16, copy.code_offset);
        put_u32(buffer, dst + 20, 0);
        put_u64(buffer, dst + 24, copy.data);
        put_u64(buffer, dst + 32, copy.entry_point);
    }

    /// The final address of the shared boot JNI stub for `method`, if one
    /// was planned.
    fn boot_jni_stub_address(&self, method_ptr: u64, method: &ArtMethod) -> Option<u64> {
        use crate::native::method::method_flags;
        let meta = self.runtime.class_linker.method_meta(method_ptr)?;
        let key = crate::native::JniStubKey {
            shorty: meta.shorty.clone(),
            flags: method.access_flags
                & (method_flags::ACC_STATIC
                    | method_flags::ACC_NATIVE
                    | method_flags::ACC_CRITICAL_NATIVE),
            isa: self.options.instruction_set,
        };
        let stub = self.jni_stub_map.get(&key)?;
        let info = &self.image_infos[stub.oat_index];
        Some(info.image_begin + (info.bin_slot_offsets[Bin::JniStubMethod] + stub.offset) as u64)
    }

    /// Copy every mirror object: the method-pointer-array pass first, then
    /// the general heap pass, then region padding filled with bare objects.
    pub(crate) fn copy_and_fixup_objects(&mut self) {
        let mut buffers = self.take_buffers();
        let mut bitmaps = self.take_bitmaps();

        // Pass 1: method pointer arrays reached through the class tables.
        let mut vtables: Vec<ObjectReference> = Vec::new();
        for (_, table) in self.runtime.class_linker.tables() {
            for &class in table.classes() {
                let c = Class::from_obj(class);
                if let Some(vtable) = self.runtime.heap.try_resolve(c.vtable()) {
                    let inherited = match self.runtime.heap.try_resolve(c.super_class()) {
                        Some(s) => Class::from_obj(s).vtable() == c.vtable(),
                        None => false,
                    };
                    if !inherited && self.has_bin_slot(vtable) && !self.copied.contains(&vtable)
                    {
                        vtables.push(vtable);
                    }
                }
            }
        }
        for vtable in vtables {
            self.copy_object_raw(vtable, &mut buffers, &mut bitmaps);
            self.fixup_pointer_array(vtable, &mut buffers);
            self.copied.insert(vtable);
        }

        // Pass 2: everything else with a bin slot, via the heap visitor.
        let mut objects: Vec<ObjectReference> = Vec::new();
        self.runtime.heap.visit_objects(|obj| objects.push(obj));
        let mut copied_count = 0usize;
        for obj in objects {
            if !self.has_bin_slot(obj) || self.copied.contains(&obj) {
                continue;
            }
            self.copy_object_raw(obj, &mut buffers, &mut bitmaps);
            self.fixup_object(obj, &mut buffers);
            copied_count += 1;
        }

        // Region padding becomes bare objects so the loader's bitmap walk
        // sees a fully-parsable object stream.
        let object_class = self.runtime.class_roots().object_class;
        let object_class_ref = self.relocated_ref(object_class);
        for (info_index, info) in self.image_infos.iter().enumerate() {
            for &(offset, size) in &info.padding_offsets {
                debug_assert_eq!(size % OBJECT_HEADER_SIZE, 0);
                let buffer = &mut buffers[info_index];
                let mut at = offset;
                while at < offset + size {
                    put_u32(buffer, at, object_class_ref);
                    put_u32(buffer, at + 4, LockWord::new().raw());
                    bitmaps[info_index].set(at);
                    at += OBJECT_HEADER_SIZE;
                }
            }
        }

        self.restore_buffers(buffers);
        self.restore_bitmaps(bitmaps);
        debug!("copied {} heap objects", copied_count);
    }

    /// Raw byte copy plus lock-word restoration and bitmap marking.
    fn copy_object_raw(
        &self,
        obj: ObjectReference,
        buffers: &mut [Vec<u8>],
        bitmaps: &mut [ImageBitmap],
    ) {
        let oat_index = self.get_oat_index(obj);
        let offset = self.image_offset(obj);
        let size = object_size(&self.runtime.heap, obj);
        let src: &[u8] = unsafe {
            std::slice::from_raw_parts(obj.to_raw_address().to_ptr::<u8>(), size)
        };
        buffers[oat_index][offset..offset + size].copy_from_slice(src);

        // The live lock word holds the forwarding address; the copy gets
        // the saved hash back, or the default word.
        let restored = match self.saved_hashcodes.get(&obj) {
            Some(&hash) => LockWord::from_hash_code(hash),
            None => LockWord::new(),
        };
        put_u32(
            &mut buffers[oat_index],
            offset + Object::monitor_offset(),
            restored.raw(),
        );
        bitmaps[oat_index].set(offset);
    }

    /// Rewrite the element pointers of a copied pointer array.
    fn fixup_pointer_array(&self, obj: ObjectReference, buffers: &mut [Vec<u8>]) {
        let oat_index = self.get_oat_index(obj);
        let offset = self.image_offset(obj);
        let buffer = &mut buffers[oat_index];
        self.fixup_reference_slots(obj, offset, buffer);
        let length = Array::from_obj(obj).length();
        for i in 0..length {
            let element = PointerArray::element(obj, i);
            put_u64(
                buffer,
                offset + PointerArray::element_offset(i),
                self.native_relocated_address(element),
            );
        }
    }

    /// Rewrite every declared reference slot of the copy through the
    /// generic visitor.
    fn fixup_reference_slots(&self, obj: ObjectReference, offset: usize, buffer: &mut [u8]) {
        visit_reference_slots(&self.runtime.heap, obj, |slot, referred| {
            let field_offset = slot - obj.to_raw_address();
            let target = match self.runtime.heap.try_resolve(referred) {
                Some(child) => self.relocated_ref(child),
                None => 0,
            };
            put_u32(buffer, offset + field_offset, target);
        });
    }

    /// Class-specific and kind-specific fixups on top of the raw copy.
    fn fixup_object(&self, obj: ObjectReference, buffers: &mut [Vec<u8>]) {
        let oat_index = self.get_oat_index(obj);
        let offset = self.image_offset(obj);

        let class_obj = self.runtime.heap.resolve(Object::from_obj(obj).klass());
        let flags = Class::from_obj(class_obj).class_flags();

        {
            let buffer = &mut buffers[oat_index];
            self.fixup_reference_slots(obj, offset, buffer);
        }
        let buffer = &mut buffers[oat_index];

        if flags & class_flags::CLASS != 0 {
            let as_class = Class::from_obj(obj);
            for (field_offset, ptr) in [
                (memoffset::offset_of!(Class, ifields), as_class.ifields_ptr()),
                (memoffset::offset_of!(Class, methods), as_class.methods_ptr()),
                (memoffset::offset_of!(Class, sfields), as_class.sfields_ptr()),
                (memoffset::offset_of!(Class, imt), as_class.imt_ptr()),
            ] {
                put_u64(buffer, offset + field_offset, self.native_relocated_address(ptr));
            }
            // The initialising thread id is host state; zero it for
            // determinism.
            put_u32(buffer, offset + Class::clinit_thread_id_offset(), 0);
            // Compile-time verification retries demote to resolved; the
            // runtime re-verifies on load.
            if as_class.status() == ClassStatus::RetryVerificationAtRuntime {
                put_u32(
                    buffer,
                    offset + Class::status_offset(),
                    ClassStatus::Resolved as u32,
                );
            }
        } else if flags & class_flags::STRING != 0 {
            // Force the hash so the loader never computes it lazily.
            let string = ArtString::from_obj(obj);
            let hash = ArtString::compute_hash(&string.code_units(obj));
            put_u32(buffer, offset + ArtString::hash_offset(), hash);
        } else if flags & class_flags::POINTER_ARRAY != 0 {
            // Shared arrays missed by the first pass still need their
            // elements translated.
            let length = Array::from_obj(obj).length();
            for i in 0..length {
                let element = PointerArray::element(obj, i);
                put_u64(
                    buffer,
                    offset + PointerArray::element_offset(i),
                    self.native_relocated_address(element),
                );
            }
        } else if flags & class_flags::DEX_CACHE != 0 {
            put_u64(buffer, offset + memoffset::offset_of!(DexCache, dex_file), 0);
            for field_offset in DexCache::native_array_offsets() {
                put_u64(buffer, offset + field_offset, 0);
            }
        } else if flags & class_flags::CLASS_LOADER != 0 {
            // Host-side linker state never enters the image.
            put_u64(buffer, offset + ClassLoader::allocator_offset(), 0);
            put_u64(buffer, offset + ClassLoader::class_table_offset(), 0);
        } else if flags & class_flags::EXECUTABLE != 0 {
            let executable = Executable::from_obj(obj);
            put_u64(
                buffer,
                offset + Executable::art_method_offset(),
                self.native_relocated_address(executable.art_method()),
            );
        } else if flags & class_flags::FIELD_VAR_HANDLE != 0 {
            let handle = FieldVarHandle::from_obj(obj);
            put_u64(
                buffer,
                offset + FieldVarHandle::art_field_offset(),
                self.native_relocated_address(handle.art_field()),
            );
        }
    }

    /// Serialise the intern and class tables into their sections, write the
    /// string-reference pairs, and compute each image's data checksum.
    pub(crate) fn serialize_tables(&mut self) {
        let mut buffers = self.take_buffers();
        for (info_index, buffer) in buffers.iter_mut().enumerate() {
            let info = &self.image_infos[info_index];

            let intern_entries: Vec<(u32, u32)> = info
                .intern_entries
                .iter()
                .map(|&string| {
                    let units = ArtString::from_obj(string).code_units(string);
                    (ArtString::compute_hash(&units), self.relocated_ref(string))
                })
                .collect();
            let intern_bytes = tables::serialize(&intern_entries);
            let section = info.sections[SectionKind::InternedStrings];
            debug_assert_eq!(intern_bytes.len(), section.size as usize);
            buffer[section.offset as usize..section.end() as usize]
                .copy_from_slice(&intern_bytes);

            let class_entries: Vec<(u32, u32)> = info
                .class_entries
                .iter()
                .map(|&class| {
                    (
                        Class::from_obj(class).dex_type_index(),
                        self.relocated_ref(class),
                    )
                })
                .collect();
            let class_bytes = tables::serialize(&class_entries);
            let section = info.sections[SectionKind::ClassTable];
            debug_assert_eq!(class_bytes.len(), section.size as usize);
            buffer[section.offset as usize..section.end() as usize]
                .copy_from_slice(&class_bytes);

            let section = info.sections[SectionKind::StringReferenceOffsets];
            let mut at = section.offset as usize;
            for &(base, field) in &info.string_reference_offsets {
                put_u32(buffer, at, base);
                put_u32(buffer, at + 4, field);
                at += 8;
            }
            debug_assert_eq!(at, section.end() as usize);

            let info = &mut self.image_infos[info_index];
            info.intern_table_bytes = intern_bytes;
            info.class_table_bytes = class_bytes;
        }
        self.restore_buffers(buffers);

        // Data checksums cover the post-header data and the bitmap.
        for info in &mut self.image_infos {
            let mut checksum = Adler32::new();
            checksum.update(&info.image_data[crate::image::IMAGE_HEADER_SIZE..]);
            checksum.update(&info.image_bitmap.as_ref().expect("bitmap").to_bytes());
            info.data_checksum = checksum.value();
        }
    }
}
