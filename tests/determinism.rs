//! Determinism: identical inputs produce byte-identical files, and the
//! storage mode changes the encoding but never the data checksum.

mod common;

use aot_image::dex::DexFile;
use aot_image::image::serialize::validate_image_file;
use aot_image::image::{ImageOutput, ImageWriter};
use aot_image::options::StorageMode;
use aot_image::runtime::{ClassSpec, FieldSpec, Runtime};
use aot_image::util::ObjectReference;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Build a pseudo-random but seed-determined object graph: a tree of
/// holder classes with string and instance fields.
fn seeded_runtime(seed: u64) -> Runtime {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut runtime = common::new_runtime();
    let class_count = 6usize;
    let descriptors: Vec<String> = (0..class_count).map(|i| format!("LGen{};", i)).collect();
    let strings: Vec<String> = (0..8).map(|i| format!("s{}", i)).collect();
    let dex = DexFile::new("gen.dex", descriptors.clone(), strings.clone());
    runtime
        .register_dex_file(dex, ObjectReference::NULL)
        .unwrap();

    let object_class = runtime.class_roots().object_class;
    let mut classes: Vec<ObjectReference> = Vec::new();
    for descriptor in &descriptors {
        let super_class = if classes.is_empty() || rng.random_bool(0.5) {
            object_class
        } else {
            classes[rng.random_range(0..classes.len())]
        };
        let mut spec = ClassSpec::new(descriptor, super_class);
        spec.dex_file_index = Some(0);
        for f in 0..rng.random_range(0..3usize) {
            spec.instance_fields
                .push(FieldSpec::new(&format!("r{}", f), "Ljava/lang/Object;"));
        }
        for f in 0..rng.random_range(0..2usize) {
            spec.static_fields
                .push(FieldSpec::new(&format!("sr{}", f), "Ljava/lang/Object;"));
        }
        spec.static_fields
            .push(FieldSpec::new("anchor", "Ljava/lang/Object;"));
        classes.push(runtime.define_class(spec).unwrap());
    }

    for s in &strings {
        runtime.intern_string(s, rng.random_bool(0.5)).unwrap();
    }

    // Hang some instances off static anchors so the queue has work to do.
    for &class in &classes {
        let instance = runtime.alloc_instance(class).unwrap();
        runtime.set_static_field_ref(class, "anchor", instance);
    }
    runtime
}

fn write_image(seed: u64, mode: StorageMode, name: &str) -> Vec<u8> {
    let mut runtime = seeded_runtime(seed);
    let mut options = common::boot_options();
    options.storage_mode = mode;
    let mut writer = ImageWriter::new(
        &mut runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 0x1010_2020)],
        common::oat_map(&[("gen.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();
    let path = common::temp_image_path(name);
    writer.write(vec![ImageOutput::path(&path)]).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).ok();
    bytes
}

#[test]
fn identical_inputs_produce_identical_bytes() {
    let first = write_image(42, StorageMode::Uncompressed, "det-a.img");
    let second = write_image(42, StorageMode::Uncompressed, "det-b.img");
    assert_eq!(first, second);
}

#[test]
fn different_graphs_produce_different_bytes() {
    let first = write_image(42, StorageMode::Uncompressed, "det-c.img");
    let second = write_image(43, StorageMode::Uncompressed, "det-d.img");
    assert_ne!(first, second);
}

#[test]
fn storage_mode_preserves_data_and_checksum() {
    let raw_path = common::temp_image_path("det-raw.img");
    let lz4_path = common::temp_image_path("det-lz4.img");
    {
        let mut runtime = seeded_runtime(7);
        let options = common::boot_options();
        let mut writer = ImageWriter::new(
            &mut runtime,
            &options,
            common::IMAGE_BASE,
            vec![common::test_oat(0x7800_0000, 9)],
            common::oat_map(&[("gen.dex", 0)]),
            None,
        )
        .unwrap();
        writer.prepare_image_address_space().unwrap();
        writer.write(vec![ImageOutput::path(&raw_path)]).unwrap();
    }
    {
        let mut runtime = seeded_runtime(7);
        let mut options = common::boot_options();
        options.storage_mode = StorageMode::Lz4;
        options.max_image_block_size = 4096;
        let mut writer = ImageWriter::new(
            &mut runtime,
            &options,
            common::IMAGE_BASE,
            vec![common::test_oat(0x7800_0000, 9)],
            common::oat_map(&[("gen.dex", 0)]),
            None,
        )
        .unwrap();
        writer.prepare_image_address_space().unwrap();
        writer.write(vec![ImageOutput::path(&lz4_path)]).unwrap();
    }

    let raw = validate_image_file(&raw_path).unwrap();
    let lz4 = validate_image_file(&lz4_path).unwrap();
    assert_eq!(raw.data, lz4.data);
    assert_eq!(raw.bitmap, lz4.bitmap);
    assert_eq!(raw.data_checksum, lz4.data_checksum);
    assert_eq!(raw.header.image_checksum, lz4.header.image_checksum);
    assert!(lz4.header.blocks_count > 0);
    assert_eq!(raw.header.blocks_count, 0);

    std::fs::remove_file(&raw_path).ok();
    std::fs::remove_file(&lz4_path).ok();
}
