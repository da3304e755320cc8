//! The image writer: orchestrates pruning, intern promotion, layout, native
//! relocation planning, copying and serialisation over a paused runtime.
//!
//! The writer is constructed around a `&mut Runtime` — it holds exclusive
//! access to every in-scope object's lock word and to the class and intern
//! tables for its whole lifetime. `prepare_image_address_space` decides what
//! goes where; `write` produces the bytes.

use crate::error::ImageError;
use crate::image::bin::{bin_slot_of, Bin, BinSlot};
use crate::image::dirty::{self, DirtyEntry};
use crate::image::sections::{ImageSection, SectionKind};
use crate::mirror::{LockState, LockWord, Object};
use crate::native::JniStubKey;
use crate::oat::OatFile;
use crate::options::CompilerOptions;
use crate::runtime::Runtime;
use crate::util::bitmap::ImageBitmap;
use crate::util::ObjectReference;
use enum_map::EnumMap;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

/// Kinds of native structures with image relocations.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NativeRelocationKind {
    ArtField,
    ArtFieldArray,
    ArtMethodClean,
    ArtMethodArrayClean,
    ArtMethodDirty,
    ArtMethodArrayDirty,
    RuntimeMethod,
    ImTable,
    ImtConflictTable,
    JniStubMethod,
}

impl NativeRelocationKind {
    pub fn bin(self) -> Bin {
        match self {
            NativeRelocationKind::ArtField | NativeRelocationKind::ArtFieldArray => Bin::ArtField,
            NativeRelocationKind::ArtMethodClean | NativeRelocationKind::ArtMethodArrayClean => {
                Bin::ArtMethodClean
            }
            NativeRelocationKind::ArtMethodDirty | NativeRelocationKind::ArtMethodArrayDirty => {
                Bin::ArtMethodDirty
            }
            NativeRelocationKind::RuntimeMethod => Bin::RuntimeMethod,
            NativeRelocationKind::ImTable => Bin::ImTable,
            NativeRelocationKind::ImtConflictTable => Bin::ImtConflictTable,
            NativeRelocationKind::JniStubMethod => Bin::JniStubMethod,
        }
    }

    pub fn is_method(self) -> bool {
        matches!(
            self,
            NativeRelocationKind::ArtMethodClean
                | NativeRelocationKind::ArtMethodDirty
                | NativeRelocationKind::RuntimeMethod
                | NativeRelocationKind::JniStubMethod
        )
    }
}

/// Image destination of one native structure: `original_ptr -> this`.
#[derive(Copy, Clone, Debug)]
pub struct NativeRelocation {
    pub oat_index: usize,
    /// Byte offset within the destination bin.
    pub offset: usize,
    pub kind: NativeRelocationKind,
}

/// Everything accumulated for one output image.
pub struct ImageInfo {
    pub(crate) image_begin: u64,
    /// Header plus mirror bins plus region padding.
    pub(crate) image_end: usize,
    /// Full in-memory size, ELF-segment aligned.
    pub(crate) image_size: usize,
    pub(crate) oat_file: OatFile,
    pub(crate) bin_slot_sizes: EnumMap<Bin, usize>,
    pub(crate) bin_slot_offsets: EnumMap<Bin, usize>,
    pub(crate) bin_slot_counts: EnumMap<Bin, usize>,
    /// Mirror objects per bin, in offset order; retained until copy time.
    pub(crate) bin_objects: EnumMap<Bin, Vec<ObjectReference>>,
    /// `(image_offset, byte_size)` gaps from region alignment, filled with
    /// bare objects at copy time.
    pub(crate) padding_offsets: Vec<(usize, usize)>,
    pub(crate) image_roots: ObjectReference,
    pub(crate) dex_caches: Vec<ObjectReference>,
    /// Intern-table entries in deterministic insertion order.
    pub(crate) intern_entries: Vec<ObjectReference>,
    pub(crate) class_entries: Vec<ObjectReference>,
    pub(crate) string_reference_offsets: Vec<(u32, u32)>,
    pub(crate) sections: EnumMap<SectionKind, ImageSection>,
    pub(crate) intern_table_bytes: Vec<u8>,
    pub(crate) class_table_bytes: Vec<u8>,
    pub(crate) image_data: Vec<u8>,
    pub(crate) image_bitmap: Option<ImageBitmap>,
    pub(crate) data_checksum: u32,
    pub(crate) component_count: u32,
}

impl ImageInfo {
    fn new(oat_file: OatFile) -> ImageInfo {
        ImageInfo {
            image_begin: 0,
            image_end: 0,
            image_size: 0,
            oat_file,
            bin_slot_sizes: EnumMap::default(),
            bin_slot_offsets: EnumMap::default(),
            bin_slot_counts: EnumMap::default(),
            bin_objects: EnumMap::default(),
            padding_offsets: Vec::new(),
            image_roots: ObjectReference::NULL,
            dex_caches: Vec::new(),
            intern_entries: Vec::new(),
            class_entries: Vec::new(),
            string_reference_offsets: Vec::new(),
            sections: EnumMap::default(),
            intern_table_bytes: Vec::new(),
            class_table_bytes: Vec::new(),
            image_data: Vec::new(),
            image_bitmap: None,
            data_checksum: 0,
            component_count: 0,
        }
    }

    pub fn image_begin(&self) -> u64 {
        self.image_begin
    }

    pub fn image_end(&self) -> usize {
        self.image_end
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn bin_size(&self, bin: Bin) -> usize {
        self.bin_slot_sizes[bin]
    }

    pub fn bin_offset(&self, bin: Bin) -> usize {
        self.bin_slot_offsets[bin]
    }

    pub fn bin_count(&self, bin: Bin) -> usize {
        self.bin_slot_counts[bin]
    }

    pub fn bin_objects(&self, bin: Bin) -> &[ObjectReference] {
        &self.bin_objects[bin]
    }

    pub fn padding_offsets(&self) -> &[(usize, usize)] {
        &self.padding_offsets
    }

    pub fn string_reference_offsets(&self) -> &[(u32, u32)] {
        &self.string_reference_offsets
    }

    pub fn section(&self, kind: SectionKind) -> ImageSection {
        self.sections[kind]
    }

    pub fn data_checksum(&self) -> u32 {
        self.data_checksum
    }

    /// The serialised intern table, as written into its section.
    pub fn intern_table_bytes(&self) -> &[u8] {
        &self.intern_table_bytes
    }

    /// The serialised class table, as written into its section.
    pub fn class_table_bytes(&self) -> &[u8] {
        &self.class_table_bytes
    }

    pub fn total_region_padding(&self) -> usize {
        self.padding_offsets.iter().map(|&(_, size)| size).sum()
    }
}

/// Destination of one `(image, bin)` relocation for a JNI stub anchor.
#[derive(Copy, Clone, Debug)]
pub(crate) struct JniStubRelocation {
    pub method: u64,
    pub oat_index: usize,
    pub offset: usize,
}

pub struct ImageWriter<'r> {
    pub(crate) runtime: &'r mut Runtime,
    pub(crate) options: &'r CompilerOptions,
    pub(crate) global_image_begin: u64,
    pub(crate) image_infos: Vec<ImageInfo>,
    /// Dex-file location to image index.
    pub(crate) dex_file_oat_index: HashMap<String, usize>,
    pub(crate) dirty_entries: Vec<DirtyEntry>,
    /// Matched dirty objects with their sort keys.
    pub(crate) known_dirty: HashMap<ObjectReference, u32>,
    pub(crate) native_relocations: HashMap<u64, NativeRelocation>,
    /// Image index of every object with a bin slot.
    pub(crate) oat_index_map: HashMap<ObjectReference, usize>,
    /// Hash-code lock words displaced by forwarding addresses.
    pub(crate) saved_hashcodes: HashMap<ObjectReference, u32>,
    pub(crate) jni_stub_map: HashMap<JniStubKey, JniStubRelocation>,
    pub(crate) prune_memo: HashMap<ObjectReference, bool>,
    /// Objects copied by the method-pointer-array pass.
    pub(crate) copied: HashSet<ObjectReference>,
    pub(crate) prepared: bool,
    /// The single mutator thread; the pipeline never runs anywhere else.
    owner_thread: std::thread::ThreadId,
}

impl<'r> ImageWriter<'r> {
    pub fn new(
        runtime: &'r mut Runtime,
        options: &'r CompilerOptions,
        global_image_begin: u64,
        oat_files: Vec<OatFile>,
        dex_file_oat_index: HashMap<String, usize>,
        dirty_image_objects: Option<&str>,
    ) -> Result<ImageWriter<'r>, ImageError> {
        options.validate()?;
        if oat_files.is_empty() {
            return Err(ImageError::InvalidOptions(
                "at least one output image is required".to_string(),
            ));
        }
        let image_count = oat_files.len();
        if let Some(&bad) = dex_file_oat_index.values().find(|&&i| i >= image_count) {
            return Err(ImageError::InvalidOptions(format!(
                "dex file mapped to image {} of {}",
                bad, image_count
            )));
        }
        if global_image_begin == 0 || global_image_begin > u32::MAX as u64 {
            return Err(ImageError::InvalidOptions(format!(
                "image begin {:#x} outside the mappable range",
                global_image_begin
            )));
        }
        let dirty_entries = dirty_image_objects
            .map(dirty::parse_dirty_object_lines)
            .unwrap_or_default();
        Ok(ImageWriter {
            runtime,
            options,
            global_image_begin,
            image_infos: oat_files.into_iter().map(ImageInfo::new).collect(),
            dex_file_oat_index,
            dirty_entries,
            known_dirty: HashMap::new(),
            native_relocations: HashMap::new(),
            oat_index_map: HashMap::new(),
            saved_hashcodes: HashMap::new(),
            jni_stub_map: HashMap::new(),
            prune_memo: HashMap::new(),
            copied: HashSet::new(),
            prepared: false,
            owner_thread: std::thread::current().id(),
        })
    }

    /// Decide image membership and assign every reachable entity its final
    /// image-relative location. After this returns successfully the heap is
    /// frozen and `write` may run.
    pub fn prepare_image_address_space(&mut self) -> Result<(), ImageError> {
        self.assert_only_one_thread();
        assert!(!self.prepared, "prepare_image_address_space ran twice");
        info!(
            "preparing image address space at {:#x} for {} image(s)",
            self.global_image_begin,
            self.image_infos.len()
        );

        self.prune_non_image_classes();

        // Image roots are the last managed allocation; after intern
        // promotion no allocation and no collection may occur.
        self.create_image_roots()?;
        self.runtime.intern_table.promote_weak_interns();
        self.runtime.heap.disable_allocation();

        self.known_dirty = dirty::match_dirty_objects(self.runtime, &self.dirty_entries);
        debug!("{} dirty objects matched", self.known_dirty.len());

        self.calculate_new_object_offsets()?;
        self.finalize_image_layout()?;

        self.prepared = true;
        Ok(())
    }

    /// Copy and fix up every entity, then serialise one file per image.
    /// Secondaries are written before the primary; the primary header goes
    /// last so a crash never leaves a consistent-looking partial set.
    pub fn write(
        &mut self,
        outputs: Vec<crate::image::ImageOutput>,
    ) -> Result<Vec<crate::image::ImageWriteResult>, ImageError> {
        self.assert_only_one_thread();
        assert!(self.prepared, "write before prepare_image_address_space");
        if outputs.len() != self.image_infos.len() {
            return Err(ImageError::InvalidOptions(format!(
                "{} outputs for {} images",
                outputs.len(),
                self.image_infos.len()
            )));
        }
        self.copy_and_fixup_native_data();
        self.copy_and_fixup_objects();
        self.serialize_tables();
        self.serialize_images(outputs)
    }

    pub fn image_infos(&self) -> &[ImageInfo] {
        &self.image_infos
    }

    /// The pruning decision memoised for `class`, if one was computed.
    pub fn prune_decision(&self, class: ObjectReference) -> Option<bool> {
        self.prune_memo.get(&class).copied()
    }

    /// The bin of an object that received a slot.
    pub fn object_bin(&self, obj: ObjectReference) -> Option<Bin> {
        bin_slot_of(obj).map(|slot| slot.bin())
    }

    /// The absolute image offset of an object, once layout finalised.
    pub fn object_image_offset(&self, obj: ObjectReference) -> Option<usize> {
        if !self.prepared {
            return None;
        }
        bin_slot_of(obj).map(|slot| slot.offset() as usize)
    }

    /// The final mapped address of an object: in its own image, or in the
    /// boot image it already lives in.
    pub fn object_image_address(&self, obj: ObjectReference) -> Option<u64> {
        if let Some(boot) = self.runtime.boot_image() {
            if let Some(address) = boot.object_address(obj) {
                return Some(address);
            }
        }
        if !self.prepared || !self.has_bin_slot(obj) {
            return None;
        }
        Some(self.relocated_address(obj))
    }

    /* Shared helpers used across the pipeline. */

    pub(crate) fn is_in_boot_image(&self, obj: ObjectReference) -> bool {
        self.runtime.is_in_boot_image(obj)
    }

    pub(crate) fn has_bin_slot(&self, obj: ObjectReference) -> bool {
        bin_slot_of(obj).is_some()
    }

    pub(crate) fn bin_slot(&self, obj: ObjectReference) -> BinSlot {
        bin_slot_of(obj).unwrap_or_else(|| panic!("object {} has no bin slot", obj))
    }

    /// Rewrite the offset of an already-assigned slot, keeping its bin.
    pub(crate) fn update_bin_slot_offset(&mut self, obj: ObjectReference, offset: usize) {
        let slot = self.bin_slot(obj);
        let updated = BinSlot::new(slot.bin(), offset as u32);
        Object::from_obj_mut(obj)
            .set_lock_word(LockWord::from_forwarding_address(updated.raw()));
    }

    pub(crate) fn get_oat_index(&self, obj: ObjectReference) -> usize {
        self.oat_index_map.get(&obj).copied().unwrap_or(0)
    }

    pub(crate) fn oat_index_for_dex(&self, location: &str) -> usize {
        self.dex_file_oat_index.get(location).copied().unwrap_or(0)
    }

    /// The absolute image offset of a mirror object. Only valid after
    /// layout finalisation rewrote every slot to its absolute offset.
    pub(crate) fn image_offset(&self, obj: ObjectReference) -> usize {
        self.bin_slot(obj).offset() as usize
    }

    /// The final mapped address of a mirror object: its own image, or the
    /// boot image it already lives in.
    pub(crate) fn relocated_address(&self, obj: ObjectReference) -> u64 {
        if let Some(boot) = self.runtime.boot_image() {
            if let Some(address) = boot.object_address(obj) {
                return address;
            }
        }
        let oat_index = self.get_oat_index(obj);
        self.image_infos[oat_index].image_begin + self.image_offset(obj) as u64
    }

    /// Mirror addresses are stored in 32-bit reference slots.
    pub(crate) fn relocated_ref(&self, obj: ObjectReference) -> u32 {
        if obj.is_null() {
            return 0;
        }
        let address = self.relocated_address(obj);
        debug_assert!(address <= u32::MAX as u64);
        address as u32
    }

    /// The final address of a native structure.
    pub(crate) fn native_relocated_address(&self, ptr: u64) -> u64 {
        if ptr == 0 {
            return 0;
        }
        if let Some(boot) = self.runtime.boot_image() {
            if let Some(address) = boot.native_address(ptr) {
                return address;
            }
        }
        let relocation = self
            .native_relocations
            .get(&ptr)
            .unwrap_or_else(|| panic!("native pointer {:#x} has no relocation", ptr));
        let info = &self.image_infos[relocation.oat_index];
        info.image_begin
            + (info.bin_slot_offsets[relocation.kind.bin()] + relocation.offset) as u64
    }

    /// Everything except the compression fan-out runs on the thread that
    /// built the writer.
    fn assert_only_one_thread(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.owner_thread,
            "image writer used from a foreign thread"
        );
    }

    /// Save a hash-code lock word before stomping it; thin or fat locks
    /// reaching the writer are unrecoverable.
    pub(crate) fn record_lock_word(&mut self, obj: ObjectReference) {
        let lock = Object::from_obj(obj).lock_word();
        match lock.state() {
            LockState::Unlocked => {}
            LockState::HashCode => {
                self.saved_hashcodes.insert(obj, lock.hash_code());
            }
            LockState::ThinLocked | LockState::FatLocked => {
                panic!("locked object {} cannot enter an image", obj)
            }
            LockState::ForwardingAddress => {
                panic!("object {} already has a forwarding address", obj)
            }
        }
    }

}
