//! App-image scenarios: string-reference collection, region padding, and
//! references back into the boot image.

mod common;

use aot_image::image::serialize::validate_image_file;
use aot_image::image::{Bin, ImageOutput, ImageWriter, SectionKind, IMAGE_HEADER_SIZE};
use aot_image::dex::DexFile;
use aot_image::mirror::{object_size, LockState, LockWord, OBJECT_HEADER_SIZE};
use aot_image::runtime::{ClassSpec, FieldSpec, Runtime};
use aot_image::util::ObjectReference;

struct AppFixture {
    runtime: Runtime,
    loader: ObjectReference,
    class_c: ObjectReference,
    instance: ObjectReference,
    string_x: ObjectReference,
}

fn app_runtime() -> AppFixture {
    let mut runtime = common::new_runtime();
    common::freeze_as_boot_image(&mut runtime);

    let loader_class = runtime.class_roots().class_loader_class;
    let loader = runtime.alloc_instance(loader_class).unwrap();

    let dex = DexFile::new("app.dex", vec!["LC;".to_string()], vec!["x".to_string()]);
    runtime.register_dex_file(dex, loader).unwrap();

    let object_class = runtime.class_roots().object_class;
    let mut spec = ClassSpec::new("LC;", object_class);
    spec.dex_file_index = Some(0);
    spec.loader = loader;
    spec.instance_fields
        .push(FieldSpec::new("s", "Ljava/lang/String;"));
    spec.static_fields.push(FieldSpec::new("inst", "LC;"));
    let class_c = runtime.define_class(spec).unwrap();

    let instance = runtime.alloc_instance(class_c).unwrap();
    runtime.set_static_field_ref(class_c, "inst", instance);
    // Weakly interned; promotion makes it strong before layout.
    let string_x = runtime.intern_string("x", false).unwrap();
    runtime.set_instance_field_ref(instance, "s", string_x);

    AppFixture {
        runtime,
        loader,
        class_c,
        instance,
        string_x,
    }
}

#[test]
fn app_image_records_string_references() {
    let mut fixture = app_runtime();
    let options = common::app_options();
    // Read-only runtime state captured before the writer takes its exclusive
    // borrow of the runtime.
    let class_class = fixture.runtime.class_roots().class_class;
    let class_class_boot_address = fixture
        .runtime
        .boot_image()
        .unwrap()
        .object_address(class_class)
        .unwrap();
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 5)],
        common::oat_map(&[("app.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    let instance_offset = writer.object_image_offset(fixture.instance).unwrap();
    let string_address = writer.object_image_address(fixture.string_x).unwrap();

    // Exactly one reference points at a string this image strongly
    // interns: C.s, directly after the object header.
    let info = &writer.image_infos()[0];
    assert_eq!(
        info.string_reference_offsets(),
        &[(instance_offset as u32, OBJECT_HEADER_SIZE as u32)]
    );

    // The class loader is internal linker state, expected dirty.
    assert_eq!(writer.object_bin(fixture.loader), Some(Bin::InternalDirty));

    let path = common::temp_image_path("app-string-refs.img");
    writer.write(vec![ImageOutput::path(&path)]).unwrap();
    let validation = validate_image_file(&path).unwrap();

    // The copied C.s holds the image address of "x".
    let copied_field = common::read_u32(
        &validation.data,
        instance_offset - IMAGE_HEADER_SIZE + OBJECT_HEADER_SIZE,
    );
    assert_eq!(copied_field as u64, string_address);

    // The section on disk matches what the writer recorded.
    let section = validation.section_bytes(SectionKind::StringReferenceOffsets);
    assert_eq!(section.len(), 8);
    assert_eq!(common::read_u32(section, 0), instance_offset as u32);
    assert_eq!(common::read_u32(section, 4), OBJECT_HEADER_SIZE as u32);

    // References to boot entities resolve into the boot range: the copied
    // class pointer of C names the boot class class.
    let class_c_offset = writer.object_image_offset(fixture.class_c).unwrap();
    let copied_klass = common::read_u32(&validation.data, class_c_offset - IMAGE_HEADER_SIZE);
    assert_eq!(copied_klass as u64, class_class_boot_address);
    // The app loader rides in the special roots of the image.
    assert!(writer.object_image_offset(fixture.loader).is_some());

    std::fs::remove_file(&path).ok();
}

#[test]
fn region_padding_keeps_objects_inside_regions() {
    let mut fixture = app_runtime();
    // A string bigger than one region forces the multi-region path.
    let big: String = std::iter::repeat('a').take(484).collect();
    let big_string = fixture.runtime.intern_string(&big, false).unwrap();
    let region = 256usize;

    // Read-only runtime state captured before the writer takes its exclusive
    // borrow of the runtime.
    let big_string_size = object_size(&fixture.runtime.heap, big_string);
    let object_class = fixture.runtime.class_roots().object_class;
    let object_class_address = fixture
        .runtime
        .boot_image()
        .unwrap()
        .object_address(object_class)
        .unwrap();

    let mut options = common::app_options();
    options.region_size = region;
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 6)],
        common::oat_map(&[("app.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    assert_eq!(big_string_size, 504);
    let info = &writer.image_infos()[0];
    assert!(!info.padding_offsets().is_empty());

    // Collect every placed object with its image offset. Object sizes need a
    // read-only borrow of the heap, which the live writer holds exclusively,
    // so the straddle check runs after the writer is dropped below. The copy
    // in `write` does not mutate the originals, so sizes are unchanged.
    let placed: Vec<(ObjectReference, usize)> = Bin::mirror_bins()
        .flat_map(|bin| {
            info.bin_objects(bin)
                .iter()
                .map(|&obj| (obj, writer.object_image_offset(obj).unwrap()))
                .collect::<Vec<_>>()
        })
        .collect();

    // Offset totality still holds with padding included.
    let mirror_total: usize = Bin::mirror_bins().map(|bin| info.bin_size(bin)).sum();
    assert_eq!(
        info.image_end() - IMAGE_HEADER_SIZE,
        mirror_total + info.total_region_padding()
    );

    let padding: Vec<(usize, usize)> = info.padding_offsets().to_vec();

    let path = common::temp_image_path("app-region.img");
    writer.write(vec![ImageOutput::path(&path)]).unwrap();
    drop(writer);
    let validation = validate_image_file(&path).unwrap();

    // Region non-straddling for every placed object.
    for (obj, offset) in placed {
        let size = object_size(&fixture.runtime.heap, obj);
        if size <= region {
            assert_eq!(
                offset / region,
                (offset + size - 1) / region,
                "object {} straddles a region boundary",
                obj
            );
        } else {
            assert_eq!(offset % region, 0);
        }
    }

    // Padding is filled with bare objects of the boot Object class, each
    // marked in the bitmap.
    for (offset, size) in padding {
        let mut at = offset;
        while at < offset + size {
            let klass = common::read_u32(&validation.data, at - IMAGE_HEADER_SIZE);
            assert_eq!(klass as u64, object_class_address);
            let monitor =
                common::read_u32(&validation.data, at - IMAGE_HEADER_SIZE + 4);
            assert_eq!(LockWord::from_raw(monitor).state(), LockState::Unlocked);
            let bit = at / OBJECT_HEADER_SIZE;
            let byte = validation.bitmap[bit / 8];
            assert_ne!(byte & (1 << (bit % 8)), 0, "padding object unmarked");
            at += OBJECT_HEADER_SIZE;
        }
    }
    std::fs::remove_file(&path).ok();
}
