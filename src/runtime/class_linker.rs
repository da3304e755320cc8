//! The class-linker surface the image writer depends on: per-loader class
//! tables in insertion order, the dex-cache registry in registration order,
//! class roots, field/method metadata for path resolution, and the linear
//! arena backing native structures.

use crate::dex::DexFile;
use crate::runtime::heap::Arena;
use crate::util::ObjectReference;
use std::collections::HashMap;
use std::sync::Arc;

/// Host-side description of one declared field, used to resolve
/// dirty-object reference paths and by the pruning walk.
#[derive(Clone, Debug)]
pub struct FieldDesc {
    pub name: String,
    pub descriptor: String,
    pub offset: u32,
    pub is_static: bool,
    pub is_final: bool,
}

impl FieldDesc {
    pub fn is_reference(&self) -> bool {
        self.descriptor.starts_with('L') || self.descriptor.starts_with('[')
    }
}

/// Host-side method metadata not carried by the native record.
#[derive(Clone, Debug)]
pub struct MethodMeta {
    pub name: String,
    pub shorty: String,
}

/// An insertion-ordered class table for one class loader.
#[derive(Default)]
pub struct ClassTable {
    classes: Vec<ObjectReference>,
    by_descriptor: HashMap<String, ObjectReference>,
}

impl ClassTable {
    pub fn insert(&mut self, descriptor: String, class: ObjectReference) {
        debug_assert!(!self.by_descriptor.contains_key(&descriptor));
        self.classes.push(class);
        self.by_descriptor.insert(descriptor, class);
    }

    pub fn lookup(&self, descriptor: &str) -> Option<ObjectReference> {
        self.by_descriptor.get(descriptor).copied()
    }

    pub fn classes(&self) -> &[ObjectReference] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Remove every class failing the predicate, preserving order.
    pub fn retain<F: FnMut(ObjectReference) -> bool>(&mut self, mut keep: F) {
        self.classes.retain(|&c| keep(c));
        let kept: std::collections::HashSet<_> = self.classes.iter().copied().collect();
        self.by_descriptor.retain(|_, c| kept.contains(c));
    }
}

/// Well-known classes created during bootstrap.
#[derive(Clone)]
pub struct ClassRoots {
    pub object_class: ObjectReference,
    pub class_class: ObjectReference,
    pub string_class: ObjectReference,
    pub object_array_class: ObjectReference,
    pub pointer_array_class: ObjectReference,
    pub dex_cache_class: ObjectReference,
    pub class_loader_class: ObjectReference,
    pub method_class: ObjectReference,
    pub constructor_class: ObjectReference,
    pub field_var_handle_class: ObjectReference,
    /// Primitive classes indexed by `Primitive as usize`.
    pub primitive_classes: Vec<ObjectReference>,
}

pub struct ClassLinker {
    /// Linear arena for native structures (field/method arrays, IMTs,
    /// conflict tables). Pointers into it are stable for the writer's life.
    pub(crate) native: Arena,
    /// `(loader, table)` pairs; the boot table has a null loader and comes
    /// first.
    tables: Vec<(ObjectReference, ClassTable)>,
    dex_files: Vec<Arc<DexFile>>,
    dex_caches: Vec<ObjectReference>,
    fields: HashMap<(ObjectReference, String), FieldDesc>,
    method_meta: HashMap<u64, MethodMeta>,
    class_dex_index: HashMap<ObjectReference, u32>,
    descriptors: HashMap<ObjectReference, String>,
    /// Descriptor lookup cache, dropped wholesale by the pruner.
    lookup_cache: HashMap<String, ObjectReference>,
}

impl ClassLinker {
    pub fn new(native_capacity: usize) -> Result<ClassLinker, crate::error::ImageError> {
        Ok(ClassLinker {
            native: Arena::new(native_capacity)?,
            tables: vec![(ObjectReference::NULL, ClassTable::default())],
            dex_files: Vec::new(),
            dex_caches: Vec::new(),
            fields: HashMap::new(),
            method_meta: HashMap::new(),
            class_dex_index: HashMap::new(),
            descriptors: HashMap::new(),
            lookup_cache: HashMap::new(),
        })
    }

    pub fn boot_class_table(&self) -> &ClassTable {
        &self.tables[0].1
    }

    /// The table for `loader`, creating it on first use.
    pub fn class_table_mut(&mut self, loader: ObjectReference) -> &mut ClassTable {
        if let Some(i) = self.tables.iter().position(|(l, _)| *l == loader) {
            return &mut self.tables[i].1;
        }
        self.tables.push((loader, ClassTable::default()));
        &mut self.tables.last_mut().unwrap().1
    }

    pub fn tables(&self) -> &[(ObjectReference, ClassTable)] {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut [(ObjectReference, ClassTable)] {
        &mut self.tables
    }

    pub fn register_class(
        &mut self,
        loader: ObjectReference,
        descriptor: String,
        class: ObjectReference,
        dex_index: Option<u32>,
    ) {
        self.lookup_cache.insert(descriptor.clone(), class);
        if let Some(dex) = dex_index {
            self.class_dex_index.insert(class, dex);
        }
        self.descriptors.insert(class, descriptor.clone());
        self.class_table_mut(loader).insert(descriptor, class);
    }

    /// Look a class up across every table, boot table first.
    pub fn find_class(&self, descriptor: &str) -> Option<ObjectReference> {
        if let Some(&class) = self.lookup_cache.get(descriptor) {
            return Some(class);
        }
        self.tables
            .iter()
            .find_map(|(_, table)| table.lookup(descriptor))
    }

    /// Drop the descriptor lookup cache. Pruning invalidates it.
    pub fn drop_lookup_cache(&mut self) {
        self.lookup_cache.clear();
    }

    pub fn register_dex_file(&mut self, dex: Arc<DexFile>, dex_cache: ObjectReference) -> u32 {
        let index = self.dex_files.len() as u32;
        self.dex_files.push(dex);
        self.dex_caches.push(dex_cache);
        index
    }

    pub fn dex_files(&self) -> &[Arc<DexFile>] {
        &self.dex_files
    }

    pub fn dex_caches(&self) -> &[ObjectReference] {
        &self.dex_caches
    }

    /// Remove dex caches failing the predicate, preserving registration
    /// order of the survivors.
    pub fn retain_dex_caches<F: FnMut(usize, ObjectReference) -> bool>(&mut self, mut keep: F) {
        let mut index = 0;
        let keep_flags: Vec<bool> = self
            .dex_caches
            .iter()
            .map(|&dc| {
                let k = keep(index, dc);
                index += 1;
                k
            })
            .collect();
        let mut it = keep_flags.iter();
        self.dex_caches.retain(|_| *it.next().unwrap());
        let mut it = keep_flags.iter();
        self.dex_files.retain(|_| *it.next().unwrap());
    }

    /// The dex registration index of `class`, if it was defined from a dex
    /// file. Primitive and runtime-synthesised classes have none.
    pub fn dex_index_of(&self, class: ObjectReference) -> Option<u32> {
        self.class_dex_index.get(&class).copied()
    }

    pub fn descriptor_of(&self, class: ObjectReference) -> Option<&str> {
        self.descriptors.get(&class).map(|s| s.as_str())
    }

    pub fn record_field(&mut self, class: ObjectReference, desc: FieldDesc) {
        self.fields.insert((class, desc.name.clone()), desc);
    }

    pub fn field(&self, class: ObjectReference, name: &str) -> Option<&FieldDesc> {
        self.fields.get(&(class, name.to_string()))
    }

    /// Fields of `class` visible on instances, including inherited ones.
    pub fn instance_field(
        &self,
        mut class: ObjectReference,
        name: &str,
        super_of: impl Fn(ObjectReference) -> ObjectReference,
    ) -> Option<FieldDesc> {
        loop {
            if let Some(desc) = self.fields.get(&(class, name.to_string())) {
                return Some(desc.clone());
            }
            class = super_of(class);
            if class.is_null() {
                return None;
            }
        }
    }

    pub fn record_method_meta(&mut self, method_ptr: u64, meta: MethodMeta) {
        self.method_meta.insert(method_ptr, meta);
    }

    pub fn method_meta(&self, method_ptr: u64) -> Option<&MethodMeta> {
        self.method_meta.get(&method_ptr)
    }
}
