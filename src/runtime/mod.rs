//! The injected runtime context: heap, class linker, intern table, runtime
//! methods and sentinel objects. The writer receives this capability struct
//! explicitly instead of reaching into process-wide singletons.

pub mod class_linker;
pub mod heap;
pub mod intern_table;

use crate::error::ImageError;
use crate::mirror::class::{access_flags, class_flags};
use crate::mirror::{
    Array, ArtString, Class, ClassStatus, DexCache, HeapRef, Object, ObjectArray, PointerArray,
    Primitive, OBJECT_HEADER_SIZE,
};
use crate::native::method::method_flags;
use crate::native::{ArtMethod, ImTable, ImtConflictTable, LengthPrefixedArray};
use crate::util::conversions::raw_align_up;
use crate::util::{Address, ObjectReference};
use class_linker::{ClassLinker, ClassRoots, FieldDesc, MethodMeta};
use heap::Heap;
use intern_table::InternTable;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Native runtime methods shared by every class: resolution, IMT conflict
/// dispatch, and the unimplemented-IMT-slot marker.
#[derive(Clone, Copy)]
pub struct RuntimeMethods {
    pub resolution_method: u64,
    pub imt_conflict_method: u64,
    pub imt_unimplemented_method: u64,
}

impl RuntimeMethods {
    pub fn all(&self) -> [u64; 3] {
        [
            self.resolution_method,
            self.imt_conflict_method,
            self.imt_unimplemented_method,
        ]
    }
}

/// A previously loaded boot image, as seen by an app-image build: address
/// assignments for the mirror objects and native structures it contains.
#[derive(Default)]
pub struct BootImage {
    pub begin: u64,
    pub size: u64,
    pub checksums: Vec<u32>,
    objects: HashMap<ObjectReference, u64>,
    natives: HashMap<u64, u64>,
}

impl BootImage {
    pub fn new(begin: u64, size: u64, checksums: Vec<u32>) -> BootImage {
        BootImage {
            begin,
            size,
            checksums,
            objects: HashMap::new(),
            natives: HashMap::new(),
        }
    }

    pub fn assign_object(&mut self, obj: ObjectReference, address: u64) {
        debug_assert!(address >= self.begin && address < self.begin + self.size);
        self.objects.insert(obj, address);
    }

    pub fn assign_native(&mut self, ptr: u64, address: u64) {
        self.natives.insert(ptr, address);
    }

    pub fn contains_object(&self, obj: ObjectReference) -> bool {
        self.objects.contains_key(&obj)
    }

    pub fn object_address(&self, obj: ObjectReference) -> Option<u64> {
        self.objects.get(&obj).copied()
    }

    pub fn contains_native(&self, ptr: u64) -> bool {
        self.natives.contains_key(&ptr)
    }

    pub fn native_address(&self, ptr: u64) -> Option<u64> {
        self.natives.get(&ptr).copied()
    }
}

/// Specification of one declared field.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub descriptor: String,
    pub is_final: bool,
}

impl FieldSpec {
    pub fn new(name: &str, descriptor: &str) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_final: false,
        }
    }

    pub fn final_field(name: &str, descriptor: &str) -> FieldSpec {
        FieldSpec {
            is_final: true,
            ..FieldSpec::new(name, descriptor)
        }
    }

    pub fn is_reference(&self) -> bool {
        self.descriptor.starts_with('L') || self.descriptor.starts_with('[')
    }

    fn size(&self) -> usize {
        match self.descriptor.as_str() {
            "J" | "D" => 8,
            "I" | "F" => 4,
            "S" | "C" => 2,
            "B" | "Z" => 1,
            _ => std::mem::size_of::<HeapRef>(),
        }
    }
}

/// Specification of one declared method.
#[derive(Clone, Debug)]
pub struct MethodSpec {
    pub name: String,
    pub shorty: String,
    pub access_flags: u32,
    /// Oat-relative compiled code offset; 0 for no code.
    pub code_offset: u32,
    /// For interface methods, the IMT slot they dispatch through; for class
    /// methods implementing an interface method, the same slot.
    pub imt_slot: Option<u16>,
    /// The interface method record this method implements.
    pub implements: Option<u64>,
}

impl MethodSpec {
    pub fn new(name: &str, shorty: &str) -> MethodSpec {
        MethodSpec {
            name: name.to_string(),
            shorty: shorty.to_string(),
            access_flags: 0,
            code_offset: 0,
            imt_slot: None,
            implements: None,
        }
    }
}

/// Specification of one class to define.
pub struct ClassSpec {
    pub descriptor: String,
    pub super_class: ObjectReference,
    pub interfaces: Vec<ObjectReference>,
    /// Registration index of the defining dex file, if any.
    pub dex_file_index: Option<u32>,
    pub access_flags: u32,
    pub instance_fields: Vec<FieldSpec>,
    pub static_fields: Vec<FieldSpec>,
    pub methods: Vec<MethodSpec>,
    pub status: ClassStatus,
    pub loader: ObjectReference,
}

impl ClassSpec {
    pub fn new(descriptor: &str, super_class: ObjectReference) -> ClassSpec {
        ClassSpec {
            descriptor: descriptor.to_string(),
            super_class,
            interfaces: Vec::new(),
            dex_file_index: None,
            access_flags: 0,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: Vec::new(),
            status: ClassStatus::VisiblyInitialized,
            loader: ObjectReference::NULL,
        }
    }
}

/// The paused, single-mutator runtime the writer is constructed around.
pub struct Runtime {
    pub heap: Heap,
    pub class_linker: ClassLinker,
    pub intern_table: InternTable,
    class_roots: ClassRoots,
    runtime_methods: RuntimeMethods,
    oome_sentinel: ObjectReference,
    ncdfe_sentinel: ObjectReference,
    cleared_weak_sentinel: ObjectReference,
    jni_globals: Vec<ObjectReference>,
    boot_image: Option<BootImage>,
}

impl Runtime {
    /// Create a runtime with bootstrapped class roots, runtime methods and
    /// sentinel objects.
    pub fn new(heap_capacity: usize, native_capacity: usize) -> Result<Runtime, ImageError> {
        let mut heap = Heap::new(heap_capacity)?;
        let mut linker = ClassLinker::new(native_capacity)?;

        let base_size = std::mem::size_of::<Class>() as u32;

        // The class class describes itself; everything else hangs off it.
        let class_class = heap.allocate_object(base_size as usize)?;
        {
            let self_ref = heap.heap_ref(class_class);
            let c = Class::from_obj_mut(class_class);
            c.klass = self_ref;
            c.class_flags = class_flags::CLASS;
            c.class_size = base_size;
            c.status = ClassStatus::VisiblyInitialized as u32;
        }

        let mut define_root = |heap: &mut Heap,
                               flags: u32,
                               object_size: u32,
                               primitive: Primitive|
         -> Result<ObjectReference, ImageError> {
            let class = heap.allocate_object(base_size as usize)?;
            let klass = heap.heap_ref(class_class);
            let c = Class::from_obj_mut(class);
            c.klass = klass;
            c.class_flags = flags;
            c.class_size = base_size;
            c.object_size = object_size;
            c.primitive_type = primitive as u32;
            c.status = ClassStatus::VisiblyInitialized as u32;
            Ok(class)
        };

        let object_class = define_root(
            &mut heap,
            class_flags::NO_REFERENCE_FIELDS,
            OBJECT_HEADER_SIZE as u32,
            Primitive::Not,
        )?;
        let string_class = define_root(&mut heap, class_flags::STRING, 0, Primitive::Not)?;

        let mut primitive_classes = Vec::new();
        for i in 0..=Primitive::Void as u32 {
            let primitive = Primitive::from_u32(i);
            if primitive == Primitive::Not {
                primitive_classes.push(ObjectReference::NULL);
                continue;
            }
            primitive_classes.push(define_root(
                &mut heap,
                class_flags::NO_REFERENCE_FIELDS,
                0,
                primitive,
            )?);
        }

        let object_array_class = define_root(
            &mut heap,
            class_flags::OBJECT_ARRAY | (2 << class_flags::COMPONENT_SIZE_SHIFT_SHIFT),
            0,
            Primitive::Not,
        )?;
        Class::from_obj_mut(object_array_class).component_type = heap.heap_ref(object_class);

        let pointer_array_class = define_root(
            &mut heap,
            class_flags::POINTER_ARRAY | (3 << class_flags::COMPONENT_SIZE_SHIFT_SHIFT),
            0,
            Primitive::Not,
        )?;
        Class::from_obj_mut(pointer_array_class).component_type =
            heap.heap_ref(primitive_classes[Primitive::Long as usize]);

        let dex_cache_class = define_root(
            &mut heap,
            class_flags::DEX_CACHE,
            std::mem::size_of::<DexCache>() as u32,
            Primitive::Not,
        )?;
        let class_loader_class = define_root(
            &mut heap,
            class_flags::CLASS_LOADER,
            std::mem::size_of::<crate::mirror::ClassLoader>() as u32,
            Primitive::Not,
        )?;
        let method_class = define_root(
            &mut heap,
            class_flags::EXECUTABLE,
            std::mem::size_of::<crate::mirror::Executable>() as u32,
            Primitive::Not,
        )?;
        let constructor_class = define_root(
            &mut heap,
            class_flags::EXECUTABLE,
            std::mem::size_of::<crate::mirror::Executable>() as u32,
            Primitive::Not,
        )?;
        let field_var_handle_class = define_root(
            &mut heap,
            class_flags::FIELD_VAR_HANDLE,
            std::mem::size_of::<crate::mirror::FieldVarHandle>() as u32,
            Primitive::Not,
        )?;

        // Non-root classes descend from Object; so do the root classes
        // themselves, the class class included.
        let object_ref = heap.heap_ref(object_class);
        for &class in [
            class_class,
            string_class,
            object_array_class,
            pointer_array_class,
            dex_cache_class,
            class_loader_class,
            method_class,
            constructor_class,
            field_var_handle_class,
        ]
        .iter()
        {
            Class::from_obj_mut(class).super_class = object_ref;
        }

        for (descriptor, class) in [
            ("Ljava/lang/Object;", object_class),
            ("Ljava/lang/Class;", class_class),
            ("Ljava/lang/String;", string_class),
            ("[Ljava/lang/Object;", object_array_class),
            ("[J", pointer_array_class),
            ("Ljava/lang/DexCache;", dex_cache_class),
            ("Ljava/lang/ClassLoader;", class_loader_class),
            ("Ljava/lang/reflect/Method;", method_class),
            ("Ljava/lang/reflect/Constructor;", constructor_class),
            ("Ljava/lang/invoke/FieldVarHandle;", field_var_handle_class),
        ] {
            linker.register_class(ObjectReference::NULL, descriptor.to_string(), class, None);
        }
        for (i, &class) in primitive_classes.iter().enumerate() {
            if class.is_null() {
                continue;
            }
            let descriptor = match Primitive::from_u32(i as u32) {
                Primitive::Boolean => "Z",
                Primitive::Byte => "B",
                Primitive::Char => "C",
                Primitive::Short => "S",
                Primitive::Int => "I",
                Primitive::Long => "J",
                Primitive::Float => "F",
                Primitive::Double => "D",
                Primitive::Void => "V",
                Primitive::Not => unreachable!(),
            };
            linker.register_class(ObjectReference::NULL, descriptor.to_string(), class, None);
        }

        let class_roots = ClassRoots {
            object_class,
            class_class,
            string_class,
            object_array_class,
            pointer_array_class,
            dex_cache_class,
            class_loader_class,
            method_class,
            constructor_class,
            field_var_handle_class,
            primitive_classes,
        };

        let mut alloc_runtime_method = |linker: &mut ClassLinker| -> Result<u64, ImageError> {
            let addr = linker
                .native
                .alloc(std::mem::size_of::<ArtMethod>(), 8)
                .ok_or_else(|| {
                    ImageError::ResourceExhausted("native arena exhausted".to_string())
                })?;
            // Zero-filled mapping; only flag it as native-arena resident.
            Ok(addr.as_usize() as u64)
        };
        let runtime_methods = RuntimeMethods {
            resolution_method: alloc_runtime_method(&mut linker)?,
            imt_conflict_method: alloc_runtime_method(&mut linker)?,
            imt_unimplemented_method: alloc_runtime_method(&mut linker)?,
        };

        let mut alloc_sentinel = |heap: &mut Heap| -> Result<ObjectReference, ImageError> {
            let obj = heap.allocate_object(OBJECT_HEADER_SIZE)?;
            Object::from_obj_mut(obj).set_klass(heap.heap_ref(object_class));
            Ok(obj)
        };
        let oome_sentinel = alloc_sentinel(&mut heap)?;
        let ncdfe_sentinel = alloc_sentinel(&mut heap)?;
        let cleared_weak_sentinel = alloc_sentinel(&mut heap)?;

        Ok(Runtime {
            heap,
            class_linker: linker,
            intern_table: InternTable::new(),
            class_roots,
            runtime_methods,
            oome_sentinel,
            ncdfe_sentinel,
            cleared_weak_sentinel,
            jni_globals: Vec::new(),
            boot_image: None,
        })
    }

    pub fn class_roots(&self) -> &ClassRoots {
        &self.class_roots
    }

    pub fn runtime_methods(&self) -> RuntimeMethods {
        self.runtime_methods
    }

    pub fn oome_sentinel(&self) -> ObjectReference {
        self.oome_sentinel
    }

    pub fn ncdfe_sentinel(&self) -> ObjectReference {
        self.ncdfe_sentinel
    }

    pub fn cleared_weak_sentinel(&self) -> ObjectReference {
        self.cleared_weak_sentinel
    }

    /// Register a JNI global root; globals are image roots like any other.
    pub fn add_jni_global(&mut self, obj: ObjectReference) {
        self.jni_globals.push(obj);
    }

    pub fn jni_globals(&self) -> &[ObjectReference] {
        &self.jni_globals
    }

    pub fn boot_image(&self) -> Option<&BootImage> {
        self.boot_image.as_ref()
    }

    pub fn set_boot_image(&mut self, boot: BootImage) {
        self.boot_image = Some(boot);
    }

    pub fn is_in_boot_image(&self, obj: ObjectReference) -> bool {
        self.boot_image
            .as_ref()
            .map(|b| b.contains_object(obj))
            .unwrap_or(false)
    }

    /// The class of `obj`.
    pub fn class_of(&self, obj: ObjectReference) -> ObjectReference {
        self.heap.resolve(Object::from_obj(obj).klass())
    }

    /// The super class of `class`, null for roots.
    pub fn super_of(&self, class: ObjectReference) -> ObjectReference {
        self.heap.resolve(Class::from_obj(class).super_class())
    }

    /// Register a dex file, allocating its dex cache.
    pub fn register_dex_file(
        &mut self,
        dex: Arc<crate::dex::DexFile>,
        loader: ObjectReference,
    ) -> Result<u32, ImageError> {
        let location = self.alloc_string(dex.location())?;
        let dex_cache = self
            .heap
            .allocate_object(std::mem::size_of::<DexCache>())?;
        let index = self.class_linker.dex_files().len() as u32;
        {
            let klass = self.heap.heap_ref(self.class_roots.dex_cache_class);
            let loader_ref = self.heap.heap_ref(loader);
            let location_ref = self.heap.heap_ref(location);
            let dc = DexCache::from_obj_mut(dex_cache);
            dc.klass = klass;
            dc.class_loader = loader_ref;
            dc.location = location_ref;
            // Marker cookies; reset by pruning, nulled on the copy.
            dc.dex_file = 0x1000 + index as u64;
            dc.resolved_fields = 0x2000 + index as u64;
            dc.resolved_methods = 0x3000 + index as u64;
            dc.resolved_types = 0x4000 + index as u64;
            dc.strings = 0x5000 + index as u64;
        }
        Ok(self.class_linker.register_dex_file(dex, dex_cache))
    }

    /// Define a class: compute its layout, allocate the class object, its
    /// native field/method arrays, vtable and IMT, and register it.
    pub fn define_class(&mut self, spec: ClassSpec) -> Result<ObjectReference, ImageError> {
        let is_interface = spec.access_flags & access_flags::ACC_INTERFACE != 0;
        let (super_object_size, inherited_vtable, super_imt) = if spec.super_class.is_null() {
            (OBJECT_HEADER_SIZE, Vec::new(), 0u64)
        } else {
            let sc = Class::from_obj(spec.super_class);
            let vtable = self.heap.try_resolve(sc.vtable());
            let inherited = match vtable {
                Some(v) => {
                    let len = Array::from_obj(v).length();
                    (0..len).map(|i| PointerArray::element(v, i)).collect()
                }
                None => Vec::new(),
            };
            (sc.object_size(), inherited, sc.imt_ptr())
        };

        // Instance layout: this class's reference fields first, directly
        // after the super class's fields, then its primitives.
        let mut cursor = super_object_size;
        debug_assert!(cursor % std::mem::size_of::<HeapRef>() == 0);
        let mut field_descs: Vec<FieldDesc> = Vec::new();
        let refs: Vec<&FieldSpec> = spec.instance_fields.iter().filter(|f| f.is_reference()).collect();
        let mut prims: Vec<&FieldSpec> =
            spec.instance_fields.iter().filter(|f| !f.is_reference()).collect();
        prims.sort_by_key(|f| std::cmp::Reverse(f.size()));
        for f in &refs {
            field_descs.push(FieldDesc {
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
                offset: cursor as u32,
                is_static: false,
                is_final: f.is_final,
            });
            cursor += std::mem::size_of::<HeapRef>();
        }
        for f in &prims {
            cursor = raw_align_up(cursor, f.size());
            field_descs.push(FieldDesc {
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
                offset: cursor as u32,
                is_static: false,
                is_final: f.is_final,
            });
            cursor += f.size();
        }
        let object_size = raw_align_up(cursor, std::mem::size_of::<HeapRef>());
        let num_ref_instance = refs.len();

        // Static layout: embedded in the class object, references first.
        let mut cursor = Class::embedded_statics_offset();
        let srefs: Vec<&FieldSpec> = spec.static_fields.iter().filter(|f| f.is_reference()).collect();
        let mut sprims: Vec<&FieldSpec> =
            spec.static_fields.iter().filter(|f| !f.is_reference()).collect();
        sprims.sort_by_key(|f| std::cmp::Reverse(f.size()));
        for f in &srefs {
            field_descs.push(FieldDesc {
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
                offset: cursor as u32,
                is_static: true,
                is_final: f.is_final,
            });
            cursor += std::mem::size_of::<HeapRef>();
        }
        for f in &sprims {
            cursor = raw_align_up(cursor, f.size());
            field_descs.push(FieldDesc {
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
                offset: cursor as u32,
                is_static: true,
                is_final: f.is_final,
            });
            cursor += f.size();
        }
        let class_size = cursor;

        let class = self.heap.allocate_object(class_size)?;

        // Native field arrays.
        let ifields = self.alloc_field_array(class, &field_descs, false)?;
        let sfields = self.alloc_field_array(class, &field_descs, true)?;

        // Native method array; virtual methods extend the inherited vtable.
        let mut vtable_entries = inherited_vtable.clone();
        let methods_ptr = if spec.methods.is_empty() {
            0u64
        } else {
            let array = self
                .class_linker
                .native
                .alloc(
                    LengthPrefixedArray::<ArtMethod>::size_for(spec.methods.len()),
                    8,
                )
                .ok_or_else(|| {
                    ImageError::ResourceExhausted("native arena exhausted".to_string())
                })?;
            LengthPrefixedArray::<ArtMethod>::set_length(array, spec.methods.len());
            let class_ref = self.heap.heap_ref(class);
            for (i, m) in spec.methods.iter().enumerate() {
                let is_virtual = m.access_flags & method_flags::ACC_STATIC == 0;
                let method_index = if is_virtual {
                    let index = vtable_entries.len() as u16;
                    vtable_entries
                        .push(LengthPrefixedArray::<ArtMethod>::element(array, i).as_usize() as u64);
                    index
                } else {
                    0
                };
                let record = ArtMethod {
                    declaring_class: class_ref,
                    access_flags: m.access_flags,
                    dex_method_index: i as u32,
                    method_index,
                    imt_index: m.imt_slot.unwrap_or(u16::MAX),
                    code_offset: m.code_offset,
                    _padding: 0,
                    data: 0,
                    entry_point: 0,
                };
                let slot = LengthPrefixedArray::<ArtMethod>::element(array, i);
                unsafe { slot.store(record) };
                self.class_linker.record_method_meta(
                    slot.as_usize() as u64,
                    MethodMeta {
                        name: m.name.clone(),
                        shorty: m.shorty.clone(),
                    },
                );
            }
            array.as_usize() as u64
        };

        // Vtable: share the super class's pointer array when this class adds
        // no virtual methods.
        let own_virtuals = vtable_entries.len() > inherited_vtable.len();
        let vtable = if !own_virtuals && !spec.super_class.is_null() {
            self.heap.resolve(Class::from_obj(spec.super_class).vtable())
        } else if vtable_entries.is_empty() {
            ObjectReference::NULL
        } else {
            let vtable = self.alloc_pointer_array(vtable_entries.len())?;
            for (i, &entry) in vtable_entries.iter().enumerate() {
                PointerArray::set_element(vtable, i, entry);
            }
            vtable
        };

        // IMT: instantiable classes dispatch interface calls through one.
        let imt_methods: Vec<(u16, u64, u64)> = spec
            .methods
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                m.implements.map(|interface_method| {
                    let ptr = LengthPrefixedArray::<ArtMethod>::element(
                        unsafe { Address::from_usize(methods_ptr as usize) },
                        i,
                    )
                    .as_usize() as u64;
                    (m.imt_slot.expect("implements requires an imt slot"), interface_method, ptr)
                })
            })
            .collect();
        // Classes without interface methods inherit (or lack) an IMT;
        // only implementing classes build their own.
        let instantiable = !is_interface && spec.access_flags & access_flags::ACC_ABSTRACT == 0;
        let imt = if !instantiable {
            0u64
        } else if imt_methods.is_empty() {
            super_imt
        } else {
            self.build_imt(super_imt, &imt_methods)?
        };

        // Interface table.
        let iftable = if spec.interfaces.is_empty() {
            ObjectReference::NULL
        } else {
            let iftable = self.alloc_object_array(spec.interfaces.len())?;
            for (i, &interface) in spec.interfaces.iter().enumerate() {
                let r = self.heap.heap_ref(interface);
                ObjectArray::set_element(iftable, i, r);
            }
            iftable
        };

        // Fill in the class object.
        {
            let klass = self.heap.heap_ref(self.class_roots.class_class);
            let super_ref = self.heap.heap_ref(spec.super_class);
            let dex_cache_ref = match spec.dex_file_index {
                Some(i) => {
                    let dc = self.class_linker.dex_caches()[i as usize];
                    self.heap.heap_ref(dc)
                }
                None => HeapRef::NULL,
            };
            let vtable_ref = self.heap.heap_ref(vtable);
            let iftable_ref = self.heap.heap_ref(iftable);
            let loader_ref = self.heap.heap_ref(spec.loader);
            let dex_class_def_idx = spec
                .dex_file_index
                .and_then(|i| {
                    self.class_linker.dex_files()[i as usize].class_def_index(&spec.descriptor)
                })
                .unwrap_or(0);
            let total_refs = num_ref_instance
                + if spec.super_class.is_null() {
                    0
                } else {
                    self.total_instance_refs(spec.super_class)
                };
            let c = Class::from_obj_mut(class);
            c.klass = klass;
            c.class_loader = loader_ref;
            c.dex_cache = dex_cache_ref;
            c.iftable = iftable_ref;
            c.super_class = super_ref;
            c.vtable = vtable_ref;
            c.access_flags = spec.access_flags;
            c.class_flags = if total_refs == 0 {
                class_flags::NO_REFERENCE_FIELDS
            } else {
                0
            };
            c.class_size = class_size as u32;
            c.dex_class_def_idx = dex_class_def_idx;
            c.dex_type_idx = dex_class_def_idx;
            c.num_reference_instance_fields = num_ref_instance as u32;
            c.num_reference_static_fields = srefs.len() as u32;
            c.object_size = object_size as u32;
            c.status = spec.status as u32;
            c.clinit_thread_id = if spec.status >= ClassStatus::Initialized {
                // The initialising thread id survives in the live class.
                7
            } else {
                0
            };
            c.ifields = ifields;
            c.sfields = sfields;
            c.methods = methods_ptr;
            c.imt = imt;
        }

        for desc in field_descs {
            self.class_linker.record_field(class, desc);
        }
        self.class_linker
            .register_class(spec.loader, spec.descriptor, class, spec.dex_file_index);
        debug!("defined class {}", class);
        Ok(class)
    }

    fn total_instance_refs(&self, mut class: ObjectReference) -> usize {
        let mut total = 0;
        while !class.is_null() {
            total += Class::from_obj(class).num_reference_instance_fields();
            class = self.super_of(class);
        }
        total
    }

    fn alloc_field_array(
        &mut self,
        class: ObjectReference,
        descs: &[FieldDesc],
        statics: bool,
    ) -> Result<u64, ImageError> {
        let fields: Vec<&FieldDesc> = descs.iter().filter(|d| d.is_static == statics).collect();
        if fields.is_empty() {
            return Ok(0);
        }
        let array = self
            .class_linker
            .native
            .alloc(
                LengthPrefixedArray::<crate::native::ArtField>::size_for(fields.len()),
                8,
            )
            .ok_or_else(|| ImageError::ResourceExhausted("native arena exhausted".to_string()))?;
        LengthPrefixedArray::<crate::native::ArtField>::set_length(array, fields.len());
        let class_ref = self.heap.heap_ref(class);
        for (i, desc) in fields.iter().enumerate() {
            let mut flags = 0;
            if desc.is_static {
                flags |= access_flags::ACC_STATIC;
            }
            if desc.is_final {
                flags |= access_flags::ACC_FINAL;
            }
            let record = crate::native::ArtField {
                declaring_class: class_ref,
                access_flags: flags,
                field_dex_idx: i as u32,
                offset: desc.offset,
            };
            unsafe {
                LengthPrefixedArray::<crate::native::ArtField>::element(array, i).store(record)
            };
        }
        Ok(array.as_usize() as u64)
    }

    fn build_imt(
        &mut self,
        super_imt: u64,
        imt_methods: &[(u16, u64, u64)],
    ) -> Result<u64, ImageError> {
        let table = self
            .class_linker
            .native
            .alloc(std::mem::size_of::<ImTable>(), 8)
            .ok_or_else(|| ImageError::ResourceExhausted("native arena exhausted".to_string()))?;
        let unimplemented = self.runtime_methods.imt_unimplemented_method;
        {
            let imt = ImTable::from_addr_mut(table);
            if super_imt != 0 {
                *imt = *ImTable::from_addr(unsafe { Address::from_usize(super_imt as usize) });
            } else {
                imt.entries = [unimplemented; ImTable::SIZE];
            }
        }
        // Resolve slot collisions through per-slot conflict tables hung off
        // cloned conflict methods.
        let mut slot_entries: HashMap<usize, Vec<(u64, u64)>> = HashMap::new();
        for &(slot, interface_method, implementation) in imt_methods {
            slot_entries
                .entry(ImTable::slot_for(slot))
                .or_default()
                .push((interface_method, implementation));
        }
        let mut slots: Vec<_> = slot_entries.into_iter().collect();
        slots.sort_by_key(|(slot, _)| *slot);
        for (slot, entries) in slots {
            if entries.len() == 1 {
                ImTable::from_addr_mut(table).entries[slot] = entries[0].1;
            } else {
                let conflict_table = self
                    .class_linker
                    .native
                    .alloc(ImtConflictTable::size_for(entries.len()), 8)
                    .ok_or_else(|| {
                        ImageError::ResourceExhausted("native arena exhausted".to_string())
                    })?;
                for (i, &(interface_method, implementation)) in entries.iter().enumerate() {
                    ImtConflictTable::set_entry(
                        conflict_table,
                        i,
                        interface_method,
                        implementation,
                    );
                }
                ImtConflictTable::set_entry(conflict_table, entries.len(), 0, 0);
                let conflict_method = self
                    .class_linker
                    .native
                    .alloc(std::mem::size_of::<ArtMethod>(), 8)
                    .ok_or_else(|| {
                        ImageError::ResourceExhausted("native arena exhausted".to_string())
                    })?;
                unsafe {
                    let mut record: ArtMethod = Address::from_usize(
                        self.runtime_methods.imt_conflict_method as usize,
                    )
                    .load();
                    record.data = conflict_table.as_usize() as u64;
                    conflict_method.store(record);
                }
                ImTable::from_addr_mut(table).entries[slot] = conflict_method.as_usize() as u64;
            }
        }
        Ok(table.as_usize() as u64)
    }

    /// Find the native method record named `name` on `class`.
    pub fn method_ptr(&self, class: ObjectReference, name: &str) -> Option<u64> {
        let methods = Class::from_obj(class).methods_ptr();
        if methods == 0 {
            return None;
        }
        let array = unsafe { Address::from_usize(methods as usize) };
        for i in 0..LengthPrefixedArray::<ArtMethod>::length(array) {
            let ptr = LengthPrefixedArray::<ArtMethod>::element(array, i).as_usize() as u64;
            if let Some(meta) = self.class_linker.method_meta(ptr) {
                if meta.name == name {
                    return Some(ptr);
                }
            }
        }
        None
    }

    /// Allocate a plain instance of `class`.
    pub fn alloc_instance(&mut self, class: ObjectReference) -> Result<ObjectReference, ImageError> {
        let size = Class::from_obj(class).object_size();
        debug_assert!(size >= OBJECT_HEADER_SIZE);
        let obj = self.heap.allocate_object(size)?;
        let klass = self.heap.heap_ref(class);
        Object::from_obj_mut(obj).set_klass(klass);
        Ok(obj)
    }

    /// Allocate a reference array.
    pub fn alloc_object_array(&mut self, length: usize) -> Result<ObjectReference, ImageError> {
        let obj = self.heap.allocate_object(ObjectArray::size_for(length))?;
        let klass = self.heap.heap_ref(self.class_roots.object_array_class);
        let a = unsafe { obj.to_raw_address().as_mut_ref::<Array>() };
        a.klass = klass;
        a.length = length as i32;
        Ok(obj)
    }

    /// Allocate a native pointer array (for vtables and method arrays).
    pub fn alloc_pointer_array(&mut self, length: usize) -> Result<ObjectReference, ImageError> {
        let obj = self.heap.allocate_object(PointerArray::size_for(length))?;
        let klass = self.heap.heap_ref(self.class_roots.pointer_array_class);
        let a = unsafe { obj.to_raw_address().as_mut_ref::<Array>() };
        a.klass = klass;
        a.length = length as i32;
        Ok(obj)
    }

    /// Allocate a string object without interning it.
    pub fn alloc_string(&mut self, s: &str) -> Result<ObjectReference, ImageError> {
        let units: Vec<u16> = s.encode_utf16().collect();
        let compressed = units.iter().all(|&u| u < 256);
        let char_size = if compressed { 1 } else { 2 };
        let size = ArtString::data_offset() + units.len() * char_size;
        let obj = self.heap.allocate_object(size)?;
        let klass = self.heap.heap_ref(self.class_roots.string_class);
        {
            let string = ArtString::from_obj_mut(obj);
            string.klass = klass;
            string.count = ArtString::count_for(units.len(), compressed);
        }
        let data = obj.to_raw_address() + ArtString::data_offset();
        for (i, &unit) in units.iter().enumerate() {
            unsafe {
                if compressed {
                    (data + i).store(unit as u8);
                } else {
                    (data + i * 2).store(unit);
                }
            }
        }
        Ok(obj)
    }

    /// Intern a string, strongly or weakly, returning the canonical object.
    pub fn intern_string(&mut self, s: &str, strong: bool) -> Result<ObjectReference, ImageError> {
        let units: Vec<u16> = s.encode_utf16().collect();
        if let Some(existing) = self.intern_table.lookup(&units) {
            return Ok(existing);
        }
        let obj = self.alloc_string(s)?;
        if strong {
            self.intern_table.insert_strong(units, obj);
        } else {
            self.intern_table.insert_weak(units, obj);
        }
        Ok(obj)
    }

    /// Write a reference-typed instance field by name.
    pub fn set_instance_field_ref(
        &mut self,
        obj: ObjectReference,
        name: &str,
        value: ObjectReference,
    ) {
        let class = self.class_of(obj);
        let desc = self
            .class_linker
            .instance_field(class, name, |c| self.heap.resolve(Class::from_obj(c).super_class()))
            .unwrap_or_else(|| panic!("no instance field {}", name));
        debug_assert!(!desc.is_static && desc.is_reference());
        let r = self.heap.heap_ref(value);
        unsafe { (obj.to_raw_address() + desc.offset as usize).store(r) };
    }

    /// Write a reference-typed static field by name.
    pub fn set_static_field_ref(
        &mut self,
        class: ObjectReference,
        name: &str,
        value: ObjectReference,
    ) {
        let desc = self
            .class_linker
            .field(class, name)
            .unwrap_or_else(|| panic!("no static field {}", name))
            .clone();
        debug_assert!(desc.is_static && desc.is_reference());
        let r = self.heap.heap_ref(value);
        unsafe { (class.to_raw_address() + desc.offset as usize).store(r) };
    }

    /// Read a reference-typed field at a raw offset.
    pub fn ref_at(&self, obj: ObjectReference, offset: u32) -> ObjectReference {
        let r: HeapRef = unsafe { (obj.to_raw_address() + offset as usize).load() };
        self.heap.resolve(r)
    }
}
