//! The layout engine: assigns every image-bound mirror object a bin slot in
//! a deterministic order, sorts the known-dirty bin, converts bin slots to
//! absolute image offsets with region padding, and plans the section table.
//!
//! Output bytes are a function only of dex-file registration order,
//! class-def indices, string-id indices and the dirty-objects input; no
//! clock, RNG or host address feeds into them.

use crate::error::ImageError;
use crate::image::bin::{classify, Bin, BinSlot};
use crate::image::sections::{ImageSection, SectionKind, IMAGE_HEADER_SIZE};
use crate::image::tables;
use crate::image::writer::ImageWriter;
use crate::mirror::{
    object_size, visit_reference_slots, Class, LockWord, Object, ObjectArray,
};
use crate::util::bitmap::ImageBitmap;
use crate::util::constants::{BYTES_IN_PAGE, OBJECT_ALIGNMENT};
use crate::util::conversions::raw_align_up;
use crate::util::ObjectReference;
use itertools::Itertools;
use log::{debug, info};
use std::collections::VecDeque;

impl<'r> ImageWriter<'r> {
    /// Allocate the image-roots arrays: per image, its dex caches, the
    /// class roots, and the pre-allocated sentinels. This is the last
    /// managed allocation of the build.
    pub(crate) fn create_image_roots(&mut self) -> Result<(), ImageError> {
        let image_count = self.image_infos.len();
        for oat_index in 0..image_count {
            let dex_caches: Vec<ObjectReference> = self
                .runtime
                .class_linker
                .dex_files()
                .iter()
                .zip(self.runtime.class_linker.dex_caches().iter())
                .filter(|(dex, _)| self.oat_index_for_dex(dex.location()) == oat_index)
                .map(|(_, &dc)| dc)
                .collect();

            let dex_caches_array = self.runtime.alloc_object_array(dex_caches.len())?;
            for (i, &dc) in dex_caches.iter().enumerate() {
                let r = self.runtime.heap.heap_ref(dc);
                ObjectArray::set_element(dex_caches_array, i, r);
            }

            let roots = self.runtime.class_roots().clone();
            let mut root_classes = vec![
                roots.object_class,
                roots.class_class,
                roots.string_class,
                roots.object_array_class,
                roots.pointer_array_class,
                roots.dex_cache_class,
                roots.class_loader_class,
                roots.method_class,
                roots.constructor_class,
                roots.field_var_handle_class,
            ];
            root_classes.extend(roots.primitive_classes.iter().filter(|c| !c.is_null()));
            let class_roots_array = self.runtime.alloc_object_array(root_classes.len())?;
            for (i, &class) in root_classes.iter().enumerate() {
                let r = self.runtime.heap.heap_ref(class);
                ObjectArray::set_element(class_roots_array, i, r);
            }

            // Special roots: the pre-allocated error sentinels, plus the app
            // class loader for app images.
            let app_loader = if self.options.image_kind.is_app_image() {
                self.runtime
                    .class_linker
                    .tables()
                    .iter()
                    .map(|(loader, _)| *loader)
                    .find(|l| !l.is_null())
            } else {
                None
            };
            let mut specials = vec![
                self.runtime.oome_sentinel(),
                self.runtime.ncdfe_sentinel(),
            ];
            specials.extend(app_loader);
            let special_array = self.runtime.alloc_object_array(specials.len())?;
            for (i, &s) in specials.iter().enumerate() {
                let r = self.runtime.heap.heap_ref(s);
                ObjectArray::set_element(special_array, i, r);
            }

            let image_roots = self.runtime.alloc_object_array(3)?;
            for (i, &part) in [dex_caches_array, class_roots_array, special_array]
                .iter()
                .enumerate()
            {
                let r = self.runtime.heap.heap_ref(part);
                ObjectArray::set_element(image_roots, i, r);
            }

            let info = &mut self.image_infos[oat_index];
            info.image_roots = image_roots;
            info.dex_caches = dex_caches;
            info.component_count = info.dex_caches.len() as u32;
        }
        Ok(())
    }

    /// Assign a bin slot (§4.4.2): classify, take the bin's current size as
    /// the offset, grow the bin, and stomp the forwarding address into the
    /// object's lock word.
    pub(crate) fn assign_image_bin_slot(
        &mut self,
        obj: ObjectReference,
        oat_index: usize,
        bin_override: Option<Bin>,
    ) {
        debug_assert!(!self.has_bin_slot(obj), "bin slot assigned twice for {}", obj);
        debug_assert!(self.runtime.heap.contains(obj));
        let bin = bin_override.unwrap_or_else(|| {
            classify(&self.runtime.heap, &self.known_dirty, obj)
        });
        let size = raw_align_up(object_size(&self.runtime.heap, obj), OBJECT_ALIGNMENT);

        self.record_lock_word(obj);
        let info = &mut self.image_infos[oat_index];
        let offset = info.bin_slot_sizes[bin];
        let slot = BinSlot::new(bin, offset as u32);
        Object::from_obj_mut(obj).set_lock_word(LockWord::from_forwarding_address(slot.raw()));
        info.bin_slot_sizes[bin] += size;
        info.bin_slot_counts[bin] += 1;
        info.bin_objects[bin].push(obj);
        self.oat_index_map.insert(obj, oat_index);
    }

    /// C3+C4+C5: walk the graph in the deterministic order and hand every
    /// entity its location.
    pub(crate) fn calculate_new_object_offsets(&mut self) -> Result<(), ImageError> {
        self.record_runtime_method_relocations();

        // 1. Classes, sorted by (dex file, class def, array dimension).
        let app_image = self.options.image_kind.is_app_image();
        let mut classes: Vec<ObjectReference> = self
            .runtime
            .class_linker
            .tables()
            .iter()
            .filter(|(loader, _)| !(app_image && loader.is_null()))
            .flat_map(|(_, table)| table.classes().iter().copied())
            .filter(|&c| !self.is_in_boot_image(c))
            .collect();
        classes.sort_by_key(|&class| self.class_sort_key(class));

        // Everything assigned below is also a queue seed: assignment fixes
        // an object's slot, visiting walks its fields.
        let mut queue: VecDeque<(ObjectReference, usize)> = VecDeque::new();

        for class in classes {
            let oat_index = self.class_oat_index(class);
            queue.push_back((class, oat_index));
            self.record_class_native_relocations(class, oat_index);
            self.assign_image_bin_slot(class, oat_index, None);
            self.image_infos[oat_index].class_entries.push(class);

            // Method pointer arrays owned by the class, not inherited.
            let c = Class::from_obj(class);
            if let Some(vtable) = self.runtime.heap.try_resolve(c.vtable()) {
                let inherited = match self.runtime.heap.try_resolve(c.super_class()) {
                    Some(s) => Class::from_obj(s).vtable() == c.vtable(),
                    None => false,
                };
                if !inherited && !self.has_bin_slot(vtable) && !self.is_in_boot_image(vtable) {
                    self.assign_image_bin_slot(vtable, oat_index, Some(Bin::InternalClean));
                }
            }
        }

        // 2. Dex caches, in registration order.
        let dex_caches: Vec<(ObjectReference, usize)> = self
            .runtime
            .class_linker
            .dex_files()
            .iter()
            .zip(self.runtime.class_linker.dex_caches().iter())
            .map(|(dex, &dc)| (dc, self.oat_index_for_dex(dex.location())))
            .collect();
        for (dex_cache, oat_index) in dex_caches {
            if !self.has_bin_slot(dex_cache) {
                self.assign_image_bin_slot(dex_cache, oat_index, None);
            }
            queue.push_back((dex_cache, oat_index));
        }

        // 3. Interns with a string id in some input dex file, in dex-file
        // then string-id order.
        let dex_files: Vec<_> = self.runtime.class_linker.dex_files().to_vec();
        for dex in &dex_files {
            let oat_index = self.oat_index_for_dex(dex.location());
            for string_id in 0..dex.num_string_ids() as u32 {
                let units: Vec<u16> = dex.string(string_id).encode_utf16().collect();
                let Some(string) = self.runtime.intern_table.lookup_strong(&units) else {
                    continue;
                };
                if self.has_bin_slot(string) || self.is_in_boot_image(string) {
                    continue;
                }
                self.assign_image_bin_slot(string, oat_index, None);
                self.image_infos[oat_index].intern_entries.push(string);
            }
        }

        // 4. The work queue drains every remaining reachable object.
        // Interns without a dex string id ride the queue like everything
        // else, picking up the image of whichever parent reaches them.
        for (oat_index, info) in self.image_infos.iter().enumerate() {
            queue.push_back((info.image_roots, oat_index));
        }
        for &global in self.runtime.jni_globals() {
            queue.push_back((global, 0));
        }
        for &string in self.runtime.intern_table.strong_strings() {
            queue.push_back((string, 0));
        }
        self.process_work_queue(&mut queue);

        // Interns not backed by a dex file, grouped by assignment.
        let mut held_aside: Vec<(usize, u32, ObjectReference)> = Vec::new();
        let already: std::collections::HashSet<ObjectReference> = self
            .image_infos
            .iter()
            .flat_map(|i| i.intern_entries.iter().copied())
            .collect();
        for &string in self.runtime.intern_table.strong_strings() {
            if already.contains(&string) || self.is_in_boot_image(string) {
                continue;
            }
            let oat_index = self.get_oat_index(string);
            held_aside.push((oat_index, self.bin_slot(string).raw(), string));
        }
        for (oat_index, _, string) in held_aside.into_iter().sorted() {
            self.image_infos[oat_index].intern_entries.push(string);
        }

        // 5. Re-sort the known-dirty bin by the supplied sort keys.
        self.sort_dirty_bins();

        let assigned: usize = self.oat_index_map.len();
        info!("layout assigned {} objects", assigned);
        Ok(())
    }

    fn class_sort_key(&self, class: ObjectReference) -> (u32, u32, u32) {
        let c = Class::from_obj(class);
        let dex_file_index = self
            .runtime
            .class_linker
            .dex_index_of(class)
            .map(|i| i + 1)
            .unwrap_or(0);
        let dimension = c.array_dimension(|r| {
            self.runtime.heap.try_resolve(r).map(Class::from_obj)
        });
        (dex_file_index, c.dex_class_def_index(), dimension)
    }

    fn class_oat_index(&self, class: ObjectReference) -> usize {
        match self.runtime.class_linker.dex_index_of(class) {
            Some(dex_index) => {
                let location = self.runtime.class_linker.dex_files()[dex_index as usize].location();
                self.oat_index_for_dex(location)
            }
            None => 0,
        }
    }

    /// Drain the FIFO queue. Children found while visiting one object are
    /// pushed to the front in reverse so they run in field-declaration
    /// order, keeping class-local clusters together.
    fn process_work_queue(&mut self, queue: &mut VecDeque<(ObjectReference, usize)>) {
        let mut visited: std::collections::HashSet<ObjectReference> = Default::default();
        while let Some((obj, mut oat_index)) = queue.pop_front() {
            if !visited.insert(obj) {
                continue;
            }
            if self.is_in_boot_image(obj) {
                continue;
            }
            if self.has_bin_slot(obj) {
                // Assigned earlier (class, dex cache, intern): children
                // inherit its image, not the discoverer's.
                oat_index = self.get_oat_index(obj);
            } else {
                let bin_override = self.queue_bin_override(obj);
                self.assign_image_bin_slot(obj, oat_index, bin_override);
            }

            let mut children: Vec<ObjectReference> = Vec::new();
            visit_reference_slots(&self.runtime.heap, obj, |_, referred| {
                if let Some(child) = self.runtime.heap.try_resolve(referred) {
                    children.push(child);
                }
            });
            for child in children.into_iter().rev() {
                if visited.contains(&child) || self.is_in_boot_image(child) {
                    continue;
                }
                queue.push_front((child, oat_index));
            }
        }
    }

    /// Layout-time bin overrides: pointer arrays are internal and expected
    /// clean; class loaders are internal linker state and expected dirty.
    fn queue_bin_override(&self, obj: ObjectReference) -> Option<Bin> {
        use crate::mirror::class::class_flags;
        let class_obj = self.runtime.heap.resolve(Object::from_obj(obj).klass());
        let flags = Class::from_obj(class_obj).class_flags();
        if flags & class_flags::POINTER_ARRAY != 0 {
            Some(Bin::InternalClean)
        } else if flags & class_flags::CLASS_LOADER != 0 {
            Some(Bin::InternalDirty)
        } else {
            None
        }
    }

    /// §4.4.3: stable re-sort of each image's known-dirty bin by
    /// `(sort_key, original_offset)`, rewriting only offsets within the bin.
    fn sort_dirty_bins(&mut self) {
        if self.known_dirty.is_empty() {
            return;
        }
        for info_index in 0..self.image_infos.len() {
            let mut objects = std::mem::take(
                &mut self.image_infos[info_index].bin_objects[Bin::KnownDirty],
            );
            if objects.is_empty() {
                continue;
            }
            objects.sort_by_key(|&obj| {
                let key = self.known_dirty.get(&obj).copied().unwrap_or(u32::MAX);
                (key, self.bin_slot(obj).offset())
            });
            let mut cursor = 0usize;
            for &obj in &objects {
                self.update_bin_slot_offset(obj, cursor);
                cursor += raw_align_up(
                    object_size(&self.runtime.heap, obj),
                    OBJECT_ALIGNMENT,
                );
            }
            debug!(
                "dirty bin of image {} resorted: {} objects",
                info_index,
                objects.len()
            );
            self.image_infos[info_index].bin_objects[Bin::KnownDirty] = objects;
        }
    }

    /// C7 (+ the tail of C4): convert bin offsets to absolute image
    /// offsets, inserting region padding; collect app-image string
    /// references; then lay out native bins, tables and the bitmap, and
    /// allocate the output buffers.
    pub(crate) fn finalize_image_layout(&mut self) -> Result<(), ImageError> {
        let region = self.options.region_size;
        let pointer_align = self.options.pointer_size().bytes();

        for info_index in 0..self.image_infos.len() {
            let mut cursor = IMAGE_HEADER_SIZE;
            for bin in Bin::mirror_bins() {
                cursor = raw_align_up(cursor, OBJECT_ALIGNMENT);
                self.image_infos[info_index].bin_slot_offsets[bin] = cursor;
                let objects = self.image_infos[info_index].bin_objects[bin].clone();
                for obj in objects {
                    let size = raw_align_up(
                        object_size(&self.runtime.heap, obj),
                        OBJECT_ALIGNMENT,
                    );
                    let mut offset = cursor;
                    if region > 0 {
                        if size <= region {
                            // Never straddle a region boundary.
                            if offset / region != (offset + size - 1) / region {
                                let pad = raw_align_up(offset, region) - offset;
                                self.image_infos[info_index]
                                    .padding_offsets
                                    .push((offset, pad));
                                offset += pad;
                            }
                        } else if offset % region != 0 {
                            // Multi-region objects start on a boundary.
                            let pad = raw_align_up(offset, region) - offset;
                            self.image_infos[info_index]
                                .padding_offsets
                                .push((offset, pad));
                            offset += pad;
                        }
                    }
                    self.update_bin_slot_offset(obj, offset);
                    cursor = offset + size;
                    if region > 0 && size > region {
                        // Round the remaining space of a multi-region
                        // object up to the next region multiple.
                        let pad = raw_align_up(cursor, region) - cursor;
                        if pad > 0 {
                            self.image_infos[info_index]
                                .padding_offsets
                                .push((cursor, pad));
                            cursor += pad;
                        }
                    }
                }
            }
            self.image_infos[info_index].image_end = cursor;
        }

        if self.options.image_kind.is_app_image() {
            self.collect_string_reference_info();
        }

        for info in &mut self.image_infos {
            let mut cursor = info.image_end;

            let native_bins = [
                Bin::ArtField,
                Bin::ArtMethodClean,
                Bin::ArtMethodDirty,
                Bin::RuntimeMethod,
                Bin::ImTable,
                Bin::ImtConflictTable,
                Bin::JniStubMethod,
            ];
            for bin in native_bins {
                let align = match bin {
                    Bin::ArtMethodClean
                    | Bin::ArtMethodDirty
                    | Bin::RuntimeMethod
                    | Bin::JniStubMethod
                    | Bin::ImTable
                    | Bin::ImtConflictTable => pointer_align,
                    _ => OBJECT_ALIGNMENT,
                };
                cursor = raw_align_up(cursor, align);
                info.bin_slot_offsets[bin] = cursor;
                cursor += info.bin_slot_sizes[bin];
            }

            let mut sections: enum_map::EnumMap<SectionKind, ImageSection> = Default::default();
            sections[SectionKind::Objects] = ImageSection::new(0, info.image_end as u32);
            sections[SectionKind::ArtFields] = ImageSection::new(
                info.bin_slot_offsets[Bin::ArtField] as u32,
                info.bin_slot_sizes[Bin::ArtField] as u32,
            );
            let methods_begin = info.bin_slot_offsets[Bin::ArtMethodClean];
            let methods_end = info.bin_slot_offsets[Bin::ArtMethodDirty]
                + info.bin_slot_sizes[Bin::ArtMethodDirty];
            sections[SectionKind::ArtMethods] = ImageSection::new(
                methods_begin as u32,
                (methods_end - methods_begin) as u32,
            );
            sections[SectionKind::ImTables] = ImageSection::new(
                info.bin_slot_offsets[Bin::ImTable] as u32,
                info.bin_slot_sizes[Bin::ImTable] as u32,
            );
            sections[SectionKind::IMTConflictTables] = ImageSection::new(
                info.bin_slot_offsets[Bin::ImtConflictTable] as u32,
                info.bin_slot_sizes[Bin::ImtConflictTable] as u32,
            );
            sections[SectionKind::RuntimeMethods] = ImageSection::new(
                info.bin_slot_offsets[Bin::RuntimeMethod] as u32,
                info.bin_slot_sizes[Bin::RuntimeMethod] as u32,
            );
            sections[SectionKind::JniStubMethods] = ImageSection::new(
                info.bin_slot_offsets[Bin::JniStubMethod] as u32,
                info.bin_slot_sizes[Bin::JniStubMethod] as u32,
            );

            cursor = raw_align_up(cursor, 8);
            let intern_size = tables::serialized_size(info.intern_entries.len());
            sections[SectionKind::InternedStrings] =
                ImageSection::new(cursor as u32, intern_size as u32);
            cursor += intern_size;

            cursor = raw_align_up(cursor, 8);
            let class_table_size = tables::serialized_size(info.class_entries.len());
            sections[SectionKind::ClassTable] =
                ImageSection::new(cursor as u32, class_table_size as u32);
            cursor += class_table_size;

            cursor = raw_align_up(cursor, 4);
            let string_refs_size = info.string_reference_offsets.len() * 8;
            sections[SectionKind::StringReferenceOffsets] =
                ImageSection::new(cursor as u32, string_refs_size as u32);
            cursor += string_refs_size;

            // Dex-cache arrays are empty in this layout.
            sections[SectionKind::DexCacheArrays] = ImageSection::new(cursor as u32, 0);

            cursor = raw_align_up(cursor, 4);
            info.bin_slot_offsets[Bin::Metadata] = cursor;
            sections[SectionKind::Metadata] = ImageSection::new(
                cursor as u32,
                info.bin_slot_sizes[Bin::Metadata] as u32,
            );
            cursor += info.bin_slot_sizes[Bin::Metadata];

            // The bitmap starts at the next page boundary; everything before
            // it is the mapped image.
            let bitmap = ImageBitmap::new(info.image_end);
            let bitmap_offset = raw_align_up(cursor, BYTES_IN_PAGE);
            sections[SectionKind::ImageBitmap] =
                ImageSection::new(bitmap_offset as u32, bitmap.size_in_bytes() as u32);

            info.sections = sections;
            info.image_size = bitmap_offset;
            info.image_bitmap = Some(bitmap);

            let mut data = Vec::new();
            data.try_reserve_exact(info.image_size).map_err(|_| {
                ImageError::ResourceExhausted(format!(
                    "image buffer of {} bytes",
                    info.image_size
                ))
            })?;
            data.resize(info.image_size, 0u8);
            info.image_data = data;
        }

        // Per-image begin addresses are contiguous from the global begin.
        let mut begin = self.global_image_begin;
        for info in &mut self.image_infos {
            info.image_begin = begin;
            begin += info.image_size as u64;
        }
        if begin > u32::MAX as u64 {
            return Err(ImageError::InvalidOptions(format!(
                "image set ends at {:#x}, beyond the 32-bit reference range",
                begin
            )));
        }
        Ok(())
    }
}
