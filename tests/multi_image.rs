//! Multi-image builds: contiguous begins, cross-image references, prune
//! cycles, and the XOR checksum composition on the primary header.

mod common;

use aot_image::dex::DexFile;
use aot_image::image::serialize::validate_image_file;
use aot_image::image::{ImageOutput, ImageWriter};
use aot_image::runtime::{ClassSpec, FieldSpec, Runtime};
use aot_image::util::ObjectReference;

fn two_dex_runtime() -> (Runtime, ObjectReference, ObjectReference) {
    let mut runtime = common::new_runtime();
    let core = DexFile::new("core.dex", vec!["LA;".to_string()], vec!["one".to_string()]);
    let extra = DexFile::new("extra.dex", vec!["LB;".to_string()], vec!["two".to_string()]);
    runtime
        .register_dex_file(core, ObjectReference::NULL)
        .unwrap();
    runtime
        .register_dex_file(extra, ObjectReference::NULL)
        .unwrap();

    let object_class = runtime.class_roots().object_class;
    let mut spec = ClassSpec::new("LA;", object_class);
    spec.dex_file_index = Some(0);
    let class_a = runtime.define_class(spec).unwrap();

    // B lives in the secondary image but extends A in the primary.
    let mut spec = ClassSpec::new("LB;", class_a);
    spec.dex_file_index = Some(1);
    let class_b = runtime.define_class(spec).unwrap();
    (runtime, class_a, class_b)
}

#[test]
fn primary_checksum_is_xor_of_all_images() {
    let (mut runtime, class_a, class_b) = two_dex_runtime();
    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut runtime,
        &options,
        common::IMAGE_BASE,
        vec![
            common::test_oat(0x7800_0000, 0xAAAA_AAAA),
            common::test_oat(0x7900_0000, 0x5555_5555),
        ],
        common::oat_map(&[("core.dex", 0), ("extra.dex", 1)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    // The two classes land in their own images; begins are contiguous.
    assert_eq!(writer.image_infos().len(), 2);
    let primary_begin = writer.image_infos()[0].image_begin();
    let primary_size = writer.image_infos()[0].image_size();
    let secondary_begin = writer.image_infos()[1].image_begin();
    let secondary_size = writer.image_infos()[1].image_size();
    assert_eq!(
        secondary_begin,
        primary_begin + primary_size as u64
    );
    let a_address = writer.object_image_address(class_a).unwrap();
    let b_address = writer.object_image_address(class_b).unwrap();
    assert!(a_address < primary_begin + primary_size as u64);
    assert!(b_address >= secondary_begin);

    let primary_path = common::temp_image_path("multi-0.img");
    let secondary_path = common::temp_image_path("multi-1.img");
    let results = writer
        .write(vec![
            ImageOutput::path(&primary_path),
            ImageOutput::path(&secondary_path),
        ])
        .unwrap();

    let v0 = validate_image_file(&primary_path).unwrap();
    let v1 = validate_image_file(&secondary_path).unwrap();

    // Secondary carries its own data checksum; the primary the XOR of all.
    assert_eq!(v1.header.image_checksum, v1.data_checksum);
    assert_eq!(
        v0.header.image_checksum,
        v0.data_checksum ^ v1.data_checksum
    );
    assert_eq!(results[0].checksum, v0.header.image_checksum);
    assert_eq!(results[1].checksum, v1.header.image_checksum);

    // The primary reservation spans the whole contiguous range.
    assert_eq!(
        v0.header.image_reservation_size as usize,
        primary_size + secondary_size
    );
    assert_eq!(v1.header.image_reservation_size as usize, secondary_size);

    // B's copied super-class pointer reaches into the primary image.
    let b_offset = writer.object_image_offset(class_b).unwrap();
    let super_offset =
        b_offset - aot_image::image::IMAGE_HEADER_SIZE + memoffset_super_class();
    let copied_super = common::read_u32(&v1.data, super_offset);
    assert_eq!(copied_super as u64, a_address);

    std::fs::remove_file(&primary_path).ok();
    std::fs::remove_file(&secondary_path).ok();
}

/// Byte offset of the super-class field inside a class object: header plus
/// six reference fields.
fn memoffset_super_class() -> usize {
    8 + 5 * 4
}

#[test]
fn prune_cycle_terminates_and_keeps_both_classes() {
    let mut runtime = common::new_runtime();
    let dex = DexFile::new(
        "core.dex",
        vec!["LA;".to_string(), "LB;".to_string()],
        vec![],
    );
    runtime
        .register_dex_file(dex, ObjectReference::NULL)
        .unwrap();

    // A has a static of type B holding class B, and vice versa: a cycle in
    // the pruning dependency graph.
    let object_class = runtime.class_roots().object_class;
    let mut spec = ClassSpec::new("LA;", object_class);
    spec.dex_file_index = Some(0);
    spec.static_fields.push(FieldSpec::new("b", "Ljava/lang/Class;"));
    let class_a = runtime.define_class(spec).unwrap();
    let mut spec = ClassSpec::new("LB;", object_class);
    spec.dex_file_index = Some(0);
    spec.static_fields.push(FieldSpec::new("a", "Ljava/lang/Class;"));
    let class_b = runtime.define_class(spec).unwrap();
    runtime.set_static_field_ref(class_a, "b", class_b);
    runtime.set_static_field_ref(class_b, "a", class_a);

    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 7)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    // Both survive, with exact memoised decisions.
    assert_eq!(writer.prune_decision(class_a), Some(false));
    assert_eq!(writer.prune_decision(class_b), Some(false));
    assert!(writer.object_bin(class_a).is_some());
    assert!(writer.object_bin(class_b).is_some());
}

#[test]
fn erroneous_class_is_pruned_with_its_dependents() {
    let mut runtime = common::new_runtime();
    let dex = DexFile::new(
        "core.dex",
        vec!["LBad;".to_string(), "LUses;".to_string(), "LOk;".to_string()],
        vec![],
    );
    runtime
        .register_dex_file(dex, ObjectReference::NULL)
        .unwrap();

    let object_class = runtime.class_roots().object_class;
    let mut spec = ClassSpec::new("LBad;", object_class);
    spec.dex_file_index = Some(0);
    spec.status = aot_image::mirror::ClassStatus::ErrorResolved;
    let bad = runtime.define_class(spec).unwrap();

    // Uses extends Bad, so it is transitively pruned.
    let mut spec = ClassSpec::new("LUses;", bad);
    spec.dex_file_index = Some(0);
    let uses = runtime.define_class(spec).unwrap();

    let mut spec = ClassSpec::new("LOk;", object_class);
    spec.dex_file_index = Some(0);
    let ok = runtime.define_class(spec).unwrap();

    let options = common::boot_options();
    let mut writer = ImageWriter::new(
        &mut runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 8)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    assert_eq!(writer.prune_decision(bad), Some(true));
    assert_eq!(writer.prune_decision(uses), Some(true));
    assert_eq!(writer.prune_decision(ok), Some(false));
    assert!(writer.object_bin(bad).is_none());
    assert!(writer.object_bin(uses).is_none());
    assert!(writer.object_bin(ok).is_some());
}
