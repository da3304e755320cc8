//! Boot-image scenarios: minimal two-class layout, universal layout
//! properties, file round-trips and intern-table completeness.

mod common;

use aot_image::dex::DexFile;
use aot_image::image::serialize::validate_image_file;
use aot_image::image::{tables, Bin, ImageOutput, ImageWriter, SectionKind, IMAGE_HEADER_SIZE};
use aot_image::mirror::{ArtString, Class, LockState, LockWord, Object};
use aot_image::runtime::{ClassSpec, FieldSpec, Runtime};
use aot_image::util::ObjectReference;

struct AbFixture {
    runtime: Runtime,
    class_a: ObjectReference,
    class_b: ObjectReference,
}

fn ab_runtime() -> AbFixture {
    let mut runtime = common::new_runtime();
    let dex = DexFile::new(
        "core.dex",
        vec!["LA;".to_string(), "LB;".to_string()],
        vec!["hello".to_string()],
    );
    runtime
        .register_dex_file(dex, ObjectReference::NULL)
        .unwrap();

    let object_class = runtime.class_roots().object_class;
    let mut spec = ClassSpec::new("LA;", object_class);
    spec.dex_file_index = Some(0);
    spec.static_fields.push(FieldSpec::final_field("x", "I"));
    let class_a = runtime.define_class(spec).unwrap();

    let mut spec = ClassSpec::new("LB;", class_a);
    spec.dex_file_index = Some(0);
    spec.static_fields.push(FieldSpec::final_field("y", "I"));
    let class_b = runtime.define_class(spec).unwrap();

    AbFixture {
        runtime,
        class_a,
        class_b,
    }
}

#[test]
fn minimal_boot_image_layout() {
    let mut fixture = ab_runtime();
    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 0x1234_5678)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    // Both classes are visibly initialised with only final statics.
    assert_eq!(
        writer.object_bin(fixture.class_a),
        Some(Bin::ClassInitializedFinalStatics)
    );
    assert_eq!(
        writer.object_bin(fixture.class_b),
        Some(Bin::ClassInitializedFinalStatics)
    );
    // B sorts after A (same dex file, later class def).
    assert!(
        writer.object_image_offset(fixture.class_a).unwrap()
            < writer.object_image_offset(fixture.class_b).unwrap()
    );

    let info = &writer.image_infos()[0];
    // No interfaces were defined, so no IMT relocations exist.
    assert_eq!(info.bin_size(Bin::ImTable), 0);
    assert_eq!(info.bin_size(Bin::ImtConflictTable), 0);
    // Field arrays for the two static fields were planned.
    assert!(info.bin_size(Bin::ArtField) > 0);

    // Offset totality: mirror bins plus padding account for the image end.
    let mirror_total: usize = Bin::mirror_bins().map(|bin| info.bin_size(bin)).sum();
    assert_eq!(
        info.image_end() - IMAGE_HEADER_SIZE,
        mirror_total + info.total_region_padding()
    );

    // Bin coverage: every placed object carries a forwarding address.
    for bin in Bin::mirror_bins() {
        for &obj in info.bin_objects(bin) {
            assert_eq!(
                Object::from_obj(obj).lock_word().state(),
                LockState::ForwardingAddress
            );
        }
    }
}

#[test]
fn boot_image_round_trips_through_file() {
    let mut fixture = ab_runtime();
    let hello = fixture.runtime.intern_string("hello", true).unwrap();
    // An object kept alive only through a JNI global still enters the image.
    let global = fixture.runtime.alloc_instance(fixture.class_a).unwrap();
    fixture.runtime.add_jni_global(global);
    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 0xCAFE_F00D)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    let hello_address = writer.object_image_address(hello).unwrap();
    let class_a_address = writer.object_image_address(fixture.class_a).unwrap();
    assert!(writer.object_bin(global).is_some());

    let path = common::temp_image_path("boot-roundtrip.img");
    let results = writer.write(vec![ImageOutput::path(&path)]).unwrap();
    assert_eq!(results.len(), 1);

    let validation = validate_image_file(&path).unwrap();
    // A single-image set: the primary checksum is its own data checksum.
    assert_eq!(validation.header.image_checksum, results[0].checksum);
    assert_eq!(validation.data_checksum, results[0].checksum);
    assert_eq!(validation.header.image_begin, common::IMAGE_BASE);
    assert_eq!(validation.header.oat_checksum, 0xCAFE_F00D);
    assert_eq!(validation.header.pointer_size, 8);

    // Property: re-interning a serialised string finds the same image
    // address through the on-disk intern table.
    let units: Vec<u16> = "hello".encode_utf16().collect();
    let found = tables::lookup(
        validation.section_bytes(SectionKind::InternedStrings),
        ArtString::compute_hash(&units),
        |address| address as u64 == hello_address,
    )
    .unwrap();
    assert_eq!(found, Some(hello_address as u32));

    // The class table resolves A to its image address.
    let a_hash = Class::from_obj(fixture.class_a).dex_type_index();
    let found = tables::lookup(
        validation.section_bytes(SectionKind::ClassTable),
        a_hash,
        |address| address as u64 == class_a_address,
    )
    .unwrap();
    assert_eq!(found, Some(class_a_address as u32));

    std::fs::remove_file(&path).ok();
}

#[test]
fn hash_lock_words_are_preserved_on_the_copy() {
    let mut fixture = ab_runtime();
    // Make an instance of A reachable through a static and give it an
    // identity hash.
    let mut spec = ClassSpec::new("LHolder;", fixture.runtime.class_roots().object_class);
    spec.static_fields.push(FieldSpec::new("held", "LA;"));
    let holder = fixture.runtime.define_class(spec).unwrap();
    let instance = fixture.runtime.alloc_instance(fixture.class_a).unwrap();
    fixture
        .runtime
        .set_static_field_ref(holder, "held", instance);
    Object::from_obj_mut(instance).set_lock_word(LockWord::from_hash_code(0x1357_9BDF & 0x3FFF_FFFF));

    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 1)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();
    let instance_offset = writer.object_image_offset(instance).unwrap();

    let path = common::temp_image_path("boot-hash.img");
    writer.write(vec![ImageOutput::path(&path)]).unwrap();
    let validation = validate_image_file(&path).unwrap();

    let monitor = common::read_u32(
        &validation.data,
        instance_offset - IMAGE_HEADER_SIZE + Object::monitor_offset(),
    );
    assert_eq!(
        LockWord::from_raw(monitor).state(),
        LockState::HashCode
    );
    assert_eq!(
        LockWord::from_raw(monitor).hash_code(),
        0x1357_9BDF & 0x3FFF_FFFF
    );
    std::fs::remove_file(&path).ok();
}

#[test]
fn corrupted_data_fails_checksum_validation() {
    let mut fixture = ab_runtime();
    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 2)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();
    let path = common::temp_image_path("boot-corrupt.img");
    let results = writer.write(vec![ImageOutput::path(&path)]).unwrap();

    // Flip one byte in the data region.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[IMAGE_HEADER_SIZE + 64] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();
    let validation = validate_image_file(&path).unwrap();
    assert_ne!(validation.data_checksum, results[0].checksum);

    // Break the magic: the file is rejected outright.
    bytes[0] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();
    assert!(validate_image_file(&path).is_err());
    std::fs::remove_file(&path).ok();
}
