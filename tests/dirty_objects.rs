//! Dirty-object list handling: path resolution, the known-dirty bin sort,
//! and tolerance of malformed input lines.

mod common;

use aot_image::dex::DexFile;
use aot_image::image::{Bin, ImageWriter, IMAGE_HEADER_SIZE};
use aot_image::mirror::Class;
use aot_image::runtime::{ClassSpec, FieldSpec, Runtime};
use aot_image::util::ObjectReference;

struct DirtyFixture {
    runtime: Runtime,
    app_class: ObjectReference,
    field_value: ObjectReference,
}

fn dirty_runtime() -> DirtyFixture {
    let mut runtime = common::new_runtime();
    let dex = DexFile::new(
        "core.dex",
        vec!["LObj;".to_string(), "LApp;".to_string()],
        vec![],
    );
    runtime
        .register_dex_file(dex, ObjectReference::NULL)
        .unwrap();

    let object_class = runtime.class_roots().object_class;
    let mut spec = ClassSpec::new("LObj;", object_class);
    spec.dex_file_index = Some(0);
    let obj_class = runtime.define_class(spec).unwrap();

    let mut spec = ClassSpec::new("LApp;", object_class);
    spec.dex_file_index = Some(0);
    spec.static_fields.push(FieldSpec::new("field", "LObj;"));
    let app_class = runtime.define_class(spec).unwrap();

    let field_value = runtime.alloc_instance(obj_class).unwrap();
    runtime.set_static_field_ref(app_class, "field", field_value);
    DirtyFixture {
        runtime,
        app_class,
        field_value,
    }
}

#[test]
fn dirty_sort_orders_by_sort_key() {
    let mut fixture = dirty_runtime();
    let options = common::boot_options();
    let dirty = "LApp; 100\nLApp;.field:LObj; 50\n";
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 3)],
        common::oat_map(&[("core.dex", 0)]),
        Some(dirty),
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    assert_eq!(writer.object_bin(fixture.app_class), Some(Bin::KnownDirty));
    assert_eq!(writer.object_bin(fixture.field_value), Some(Bin::KnownDirty));

    let info = &writer.image_infos()[0];
    // Sort key 50 precedes 100: the field value sits before the class.
    assert_eq!(
        info.bin_objects(Bin::KnownDirty),
        &[fixture.field_value, fixture.app_class]
    );
    assert!(
        writer.object_image_offset(fixture.field_value).unwrap()
            < writer.object_image_offset(fixture.app_class).unwrap()
    );

    // The bin holds exactly the aligned sizes of those two objects.
    let value_size = 8usize; // header-only instance
    let class_size = Class::from_obj(fixture.app_class).class_size();
    let aligned = |n: usize| (n + 7) & !7;
    assert_eq!(
        info.bin_size(Bin::KnownDirty),
        aligned(value_size) + aligned(class_size)
    );

    // Offsets are contiguous from the bin start.
    let bin_start = info.bin_offset(Bin::KnownDirty);
    assert_eq!(
        writer.object_image_offset(fixture.field_value).unwrap(),
        bin_start
    );
    assert_eq!(
        writer.object_image_offset(fixture.app_class).unwrap(),
        bin_start + aligned(value_size)
    );
    assert!(bin_start >= IMAGE_HEADER_SIZE);
}

#[test]
fn malformed_dirty_lines_are_skipped() {
    let mut fixture = dirty_runtime();
    let options = common::boot_options();
    // Two broken lines, one good one; the build still succeeds and only
    // the good line matches.
    let dirty = "garbage without descriptor\nLApp;.nosuch:LObj; 9\nLApp; 7\n";
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(0x7800_0000, 4)],
        common::oat_map(&[("core.dex", 0)]),
        Some(dirty),
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    assert_eq!(writer.object_bin(fixture.app_class), Some(Bin::KnownDirty));
    assert_ne!(
        writer.object_bin(fixture.field_value),
        Some(Bin::KnownDirty)
    );
    let info = &writer.image_infos()[0];
    assert_eq!(info.bin_count(Bin::KnownDirty), 1);
}
