//! Pruning (the first pipeline stage): removes from the class tables and
//! dex-cache registry everything that must not enter the image, and severs
//! references that would leak non-image state.
//!
//! `prune_image_class` walks the class-dependency graph with an explicit
//! stack and an on-stack marker set. Dependency cycles are answered
//! optimistically (not pruned) for the in-progress node; a result reached
//! through such a cycle edge is only memoised for the root of the walk,
//! where the answer is exact.

use crate::image::writer::ImageWriter;
use crate::mirror::{visit_reference_slots, Class, DexCache, Object, ObjectArray};
use crate::util::ObjectReference;
use log::{debug, info};
use std::collections::HashSet;

struct PruneFrame {
    class: ObjectReference,
    deps: Vec<ObjectReference>,
    next_dep: usize,
    result: bool,
    /// Did this walk take a cycle edge? If so the result may be optimistic
    /// and must not be memoised except at the root.
    tainted: bool,
}

impl<'r> ImageWriter<'r> {
    /// Remove non-image classes and foreign dex caches. Idempotent and
    /// total: pruning itself cannot fail.
    pub(crate) fn prune_non_image_classes(&mut self) {
        let app_image = self.options.image_kind.is_app_image();

        // Decide for every class in scope. Boot-loader classes are not part
        // of an app image and keep their runtime state untouched.
        let mut pruned: HashSet<ObjectReference> = HashSet::new();
        let mut retained = 0usize;
        let classes: Vec<ObjectReference> = self
            .runtime
            .class_linker
            .tables()
            .iter()
            .filter(|(loader, _)| !(app_image && loader.is_null()))
            .flat_map(|(_, table)| table.classes().iter().copied())
            .collect();
        for class in classes {
            if self.prune_image_class(class) {
                pruned.insert(class);
            } else {
                retained += 1;
            }
        }
        info!("pruning kept {} classes, dropped {}", retained, pruned.len());

        for (loader, table) in self.runtime.class_linker.tables_mut() {
            if app_image && loader.is_null() {
                continue;
            }
            table.retain(|class| !pruned.contains(&class));
        }

        // Dex caches for dex files outside the image's set are dropped;
        // survivors get their native resolution arrays reset so no stale
        // host pointers survive into layout.
        let image_dex: HashSet<String> = self.dex_file_oat_index.keys().cloned().collect();
        let locations: Vec<String> = self
            .runtime
            .class_linker
            .dex_files()
            .iter()
            .map(|d| d.location().to_string())
            .collect();
        self.runtime
            .class_linker
            .retain_dex_caches(|index, _| image_dex.contains(&locations[index]));
        for &dex_cache in self.runtime.class_linker.dex_caches() {
            let dc = DexCache::from_obj_mut(dex_cache);
            dc.reset_native_arrays();
            if app_image {
                // Host dex-file cookies differ run to run; clear them for
                // determinism.
                dc.clear_dex_file_cookie();
            }
        }

        // The descriptor lookup cache may name pruned classes.
        self.runtime.class_linker.drop_lookup_cache();
    }

    /// Must `class` stay out of the image?
    pub(crate) fn prune_image_class(&mut self, root: ObjectReference) -> bool {
        if let Some(&memoised) = self.prune_memo.get(&root) {
            return memoised;
        }
        let mut on_stack: HashSet<ObjectReference> = HashSet::new();
        let mut stack: Vec<PruneFrame> = Vec::new();
        self.push_prune_frame(root, &mut on_stack, &mut stack);

        loop {
            let top = stack.last_mut().expect("prune walk underflow");
            if top.result || top.next_dep >= top.deps.len() {
                let frame = stack.pop().expect("prune walk underflow");
                on_stack.remove(&frame.class);
                let is_root = stack.is_empty();
                if frame.result || !frame.tainted || is_root {
                    self.prune_memo.insert(frame.class, frame.result);
                }
                if is_root {
                    if frame.result {
                        debug!("pruning class {}", frame.class);
                    }
                    return frame.result;
                }
                let parent = stack.last_mut().expect("prune walk underflow");
                parent.result |= frame.result;
                parent.tainted |= frame.tainted;
                continue;
            }

            let dep = top.deps[top.next_dep];
            top.next_dep += 1;
            if dep.is_null() || self.runtime.is_in_boot_image(dep) {
                continue;
            }
            if let Some(&memoised) = self.prune_memo.get(&dep) {
                top.result |= memoised;
                continue;
            }
            if on_stack.contains(&dep) {
                // Cycle edge: answer optimistically, taint the walk.
                top.tainted = true;
                continue;
            }
            self.push_prune_frame(dep, &mut on_stack, &mut stack);
        }
    }

    fn push_prune_frame(
        &self,
        class: ObjectReference,
        on_stack: &mut HashSet<ObjectReference>,
        stack: &mut Vec<PruneFrame>,
    ) {
        on_stack.insert(class);
        let result = self.prune_base_decision(class);
        let deps = if result {
            Vec::new()
        } else {
            self.prune_dependencies(class)
        };
        stack.push(PruneFrame {
            class,
            deps,
            next_dep: 0,
            result,
            tainted: false,
        });
    }

    /// Immediate prune conditions, before any dependency is considered.
    fn prune_base_decision(&self, class: ObjectReference) -> bool {
        let c = Class::from_obj(class);
        if c.is_erroneous() {
            return true;
        }
        // App-image classes initialised by the compiler but not yet visible
        // are only kept when the initialisation mode vouches for them.
        if self.options.image_kind.is_app_image()
            && !self.options.initialize_app_image_classes
            && c.is_initialized()
            && !c.is_visibly_initialized()
        {
            return true;
        }
        if let Some(descriptor) = self.runtime.class_linker.descriptor_of(class) {
            if !self.options.is_image_class(descriptor) {
                return true;
            }
        }
        if let Some(dex_index) = self.runtime.class_linker.dex_index_of(class) {
            let location = self.runtime.class_linker.dex_files()[dex_index as usize]
                .location()
                .to_string();
            if !self.dex_file_oat_index.contains_key(&location) {
                return true;
            }
        }
        false
    }

    /// Classes this class's image-eligibility depends on: super class,
    /// interfaces, array component, and the classes reachable through its
    /// static reference fields. For static values that are not themselves
    /// classes, a bounded walk flags references to pruned types (reflective
    /// Method/Constructor objects and the like).
    fn prune_dependencies(&self, class: ObjectReference) -> Vec<ObjectReference> {
        let heap = &self.runtime.heap;
        let c = Class::from_obj(class);
        let mut deps = Vec::new();
        deps.push(heap.resolve(c.super_class()));
        deps.push(heap.resolve(c.component_type()));
        if let Some(iftable) = heap.try_resolve(c.iftable()) {
            let len = crate::mirror::Array::from_obj(iftable).length();
            for i in 0..len {
                deps.push(heap.resolve(ObjectArray::element(iftable, i)));
            }
        }
        for i in 0..c.num_reference_static_fields() {
            let value: crate::mirror::HeapRef = unsafe {
                (class.to_raw_address() + Class::static_ref_offset(i)).load()
            };
            let Some(value) = heap.try_resolve(value) else {
                continue;
            };
            let value_class = heap.resolve(Object::from_obj(value).klass());
            if Class::from_obj(value_class).is_class_class() {
                // The static holds a class: depend on that class directly.
                deps.push(value);
            } else {
                deps.push(value_class);
                // Bounded reference walk: one level of the value's fields.
                visit_reference_slots(heap, value, |_, referred| {
                    if let Some(referred) = heap.try_resolve(referred) {
                        deps.push(heap.resolve(Object::from_obj(referred).klass()));
                    }
                });
            }
        }
        deps
    }
}
