//! App-image string reference collection: the byte offsets of every managed
//! reference pointing at a string this image strongly interns. The loader
//! uses them to patch references quickly after deduplicating against
//! already-loaded boot-image strings.

use crate::image::bin::Bin;
use crate::image::writer::ImageWriter;
use crate::mirror::{visit_reference_slots, Class, Object};
use crate::util::ObjectReference;
use log::debug;

impl<'r> ImageWriter<'r> {
    /// Record `(base_offset, field_offset)` pairs for every reference from
    /// an image object to a string strongly interned in the same image.
    /// Runs after mirror offsets are absolute.
    pub(crate) fn collect_string_reference_info(&mut self) {
        debug_assert!(self.options.image_kind.is_app_image());
        for info_index in 0..self.image_infos.len() {
            let mut pairs: Vec<(u32, u32)> = Vec::new();
            let objects: Vec<ObjectReference> = Bin::mirror_bins()
                .flat_map(|bin| self.image_infos[info_index].bin_objects[bin].clone())
                .collect();
            for obj in objects {
                let base = self.image_offset(obj) as u32;
                visit_reference_slots(&self.runtime.heap, obj, |slot, referred| {
                    let Some(child) = self.runtime.heap.try_resolve(referred) else {
                        return;
                    };
                    if !self.is_interned_in_image(child, info_index) {
                        return;
                    }
                    let field_offset = slot - obj.to_raw_address();
                    pairs.push((base, field_offset as u32));
                });
            }
            debug!(
                "image {}: {} string references recorded",
                info_index,
                pairs.len()
            );
            self.image_infos[info_index].string_reference_offsets = pairs;
        }
    }

    fn is_interned_in_image(&self, obj: ObjectReference, info_index: usize) -> bool {
        let class_obj = self.runtime.heap.resolve(Object::from_obj(obj).klass());
        if !Class::from_obj(class_obj).is_string_class() {
            return false;
        }
        self.runtime.intern_table.is_strong_interned(obj)
            && self.has_bin_slot(obj)
            && self.get_oat_index(obj) == info_index
    }
}
