//! Native-structure relocation: clean/dirty method arrays, entry-point
//! selection, IMT conflict tables and shared boot JNI stubs.

mod common;

use aot_image::dex::DexFile;
use aot_image::image::serialize::validate_image_file;
use aot_image::image::{Bin, ImageOutput, ImageWriter, IMAGE_HEADER_SIZE};
use aot_image::mirror::class::access_flags;
use aot_image::mirror::ClassStatus;
use aot_image::native::method::method_flags;
use aot_image::native::{ImTable, ImtConflictTable};
use aot_image::runtime::{ClassSpec, MethodSpec, Runtime};
use aot_image::util::ObjectReference;

const OAT_BEGIN: u64 = 0x7800_0000;

struct NativeFixture {
    runtime: Runtime,
    class_x: ObjectReference,
}

fn native_runtime() -> NativeFixture {
    let mut runtime = common::new_runtime();
    let dex = DexFile::new(
        "core.dex",
        vec![
            "LI1;".to_string(),
            "LI2;".to_string(),
            "LX;".to_string(),
            "LN;".to_string(),
            "LS;".to_string(),
        ],
        vec![],
    );
    runtime
        .register_dex_file(dex, ObjectReference::NULL)
        .unwrap();
    let object_class = runtime.class_roots().object_class;

    let interface = |descriptor: &str, method: &str| {
        let mut spec = ClassSpec::new(descriptor, object_class);
        spec.dex_file_index = Some(0);
        spec.access_flags = access_flags::ACC_INTERFACE | access_flags::ACC_ABSTRACT;
        let mut m = MethodSpec::new(method, "V");
        m.access_flags = method_flags::ACC_ABSTRACT;
        m.imt_slot = Some(5);
        spec.methods.push(m);
        spec
    };
    let i1 = runtime.define_class(interface("LI1;", "ia")).unwrap();
    let i2 = runtime.define_class(interface("LI2;", "ib")).unwrap();
    let ia = runtime.method_ptr(i1, "ia").unwrap();
    let ib = runtime.method_ptr(i2, "ib").unwrap();

    // X implements both interface methods on the same IMT slot: conflict.
    let mut spec = ClassSpec::new("LX;", object_class);
    spec.dex_file_index = Some(0);
    spec.interfaces = vec![i1, i2];
    let mut xa = MethodSpec::new("xa", "V");
    xa.code_offset = 0x1000;
    xa.imt_slot = Some(5);
    xa.implements = Some(ia);
    let mut xb = MethodSpec::new("xb", "V");
    xb.code_offset = 0x2000;
    xb.imt_slot = Some(5);
    xb.implements = Some(ib);
    spec.methods.push(xa);
    spec.methods.push(xb);
    let class_x = runtime.define_class(spec).unwrap();

    // N carries native methods: two sharing one JNI stub identity, one
    // without compiled code.
    let mut spec = ClassSpec::new("LN;", object_class);
    spec.dex_file_index = Some(0);
    for (name, code) in [("n1", 0x3000u32), ("n2", 0x3100), ("n3", 0)] {
        let mut m = MethodSpec::new(name, "V");
        m.access_flags = method_flags::ACC_NATIVE;
        m.code_offset = code;
        spec.methods.push(m);
    }
    runtime.define_class(spec).unwrap();

    // S is only verified: its static method needs a clinit check.
    let mut spec = ClassSpec::new("LS;", object_class);
    spec.dex_file_index = Some(0);
    spec.status = ClassStatus::Verified;
    let mut sm = MethodSpec::new("sm", "V");
    sm.access_flags = method_flags::ACC_STATIC;
    sm.code_offset = 0x4000;
    spec.methods.push(sm);
    runtime.define_class(spec).unwrap();

    NativeFixture { runtime, class_x }
}

#[test]
fn entry_points_and_imt_relocation() {
    let mut fixture = native_runtime();
    let options = common::boot_options();
    assert!(options.jni_compilation);
    let mut writer = ImageWriter::new(
        &mut fixture.runtime,
        &options,
        common::IMAGE_BASE,
        vec![common::test_oat(OAT_BEGIN, 0xBEEF)],
        common::oat_map(&[("core.dex", 0)]),
        None,
    )
    .unwrap();
    writer.prepare_image_address_space().unwrap();

    let info = &writer.image_infos()[0];
    // Clean arrays: I1 (48), I2 (48), X (8 + 2*40 = 88).
    assert_eq!(info.bin_size(Bin::ArtMethodClean), 184);
    // Dirty arrays: N (8 + 3*40), S (8 + 40).
    assert_eq!(info.bin_size(Bin::ArtMethodDirty), 176);
    // Three shared runtime methods plus X's cloned conflict method.
    assert_eq!(info.bin_size(Bin::RuntimeMethod), 160);
    assert_eq!(info.bin_size(Bin::ImTable), std::mem::size_of::<ImTable>());
    assert_eq!(
        info.bin_size(Bin::ImtConflictTable),
        ImtConflictTable::size_for(2)
    );
    // n1 and n2 share one stub identity.
    assert_eq!(info.bin_size(Bin::JniStubMethod), 40);

    let image_begin = info.image_begin();
    let clean = info.bin_offset(Bin::ArtMethodClean);
    let dirty = info.bin_offset(Bin::ArtMethodDirty);
    let runtime_bin = info.bin_offset(Bin::RuntimeMethod);
    let imt_bin = info.bin_offset(Bin::ImTable);
    let conflict_bin = info.bin_offset(Bin::ImtConflictTable);
    let jni_bin = info.bin_offset(Bin::JniStubMethod);
    let x_address = writer.object_image_address(fixture.class_x).unwrap();

    let path = common::temp_image_path("native.img");
    writer.write(vec![ImageOutput::path(&path)]).unwrap();
    let v = validate_image_file(&path).unwrap();
    let data = |offset: usize| offset - IMAGE_HEADER_SIZE;
    let entry_of = |method_offset: usize| common::read_u64(&v.data, data(method_offset) + 32);
    let data_of = |method_offset: usize| common::read_u64(&v.data, data(method_offset) + 24);
    let flags_of = |method_offset: usize| common::read_u32(&v.data, data(method_offset) + 4);

    // Abstract interface method: interpreter bridge.
    let ia_offset = clean + 8;
    assert_eq!(
        entry_of(ia_offset),
        OAT_BEGIN + common::INTERPRETER_BRIDGE_OFFSET as u64
    );
    // Compiled virtual method: oat-relative code, nterp fast path set.
    let xa_offset = clean + 96 + 8;
    assert_eq!(entry_of(xa_offset), OAT_BEGIN + 0x1000);
    assert_ne!(flags_of(xa_offset) & method_flags::ACC_NTERP_INVOKE_FAST_PATH, 0);
    // Its declaring-class pointer reaches X's image address.
    assert_eq!(
        common::read_u32(&v.data, data(xa_offset)) as u64,
        x_address
    );

    // Native methods with code share the boot JNI stub.
    let n1_offset = dirty + 8;
    let n2_offset = dirty + 48;
    let n3_offset = dirty + 88;
    let stub_address = image_begin + jni_bin as u64;
    assert_eq!(
        entry_of(n1_offset),
        OAT_BEGIN + common::BOOT_JNI_STUB_OFFSET as u64
    );
    assert_eq!(data_of(n1_offset), stub_address);
    assert_eq!(data_of(n2_offset), stub_address);
    // Native without code: interpreter bridge.
    assert_eq!(
        entry_of(n3_offset),
        OAT_BEGIN + common::INTERPRETER_BRIDGE_OFFSET as u64
    );
    // Static method of a not-visibly-initialised class: resolution.
    let sm_offset = dirty + 128 + 8;
    assert_eq!(
        entry_of(sm_offset),
        OAT_BEGIN + common::RESOLUTION_OFFSET as u64
    );

    // The resolution runtime method: resolution trampoline plus the
    // critical-native lookup stub as data.
    let resolution_offset = runtime_bin;
    assert_eq!(
        entry_of(resolution_offset),
        OAT_BEGIN + common::RESOLUTION_OFFSET as u64
    );
    assert_eq!(
        data_of(resolution_offset),
        OAT_BEGIN + common::DLSYM_LOOKUP_CRITICAL_OFFSET as u64
    );

    // IMT slot 5 points at the cloned conflict method; other slots at the
    // unimplemented marker.
    let slot = |i: usize| common::read_u64(&v.data, data(imt_bin) + i * 8);
    let conflict_clone_address = image_begin + (runtime_bin + 120) as u64;
    let unimplemented_address = image_begin + (runtime_bin + 80) as u64;
    assert_eq!(slot(5), conflict_clone_address);
    assert_eq!(slot(0), unimplemented_address);
    assert_eq!(slot(42), unimplemented_address);
    // The clone's data points at the relocated conflict table.
    let clone_offset = runtime_bin + 120;
    assert_eq!(
        data_of(clone_offset),
        image_begin + conflict_bin as u64
    );
    assert_eq!(
        entry_of(clone_offset),
        OAT_BEGIN + common::IMT_CONFLICT_OFFSET as u64
    );

    // Conflict table pairs: (interface method, implementation), then the
    // null terminator.
    let pair = |i: usize| {
        (
            common::read_u64(&v.data, data(conflict_bin) + i * 16),
            common::read_u64(&v.data, data(conflict_bin) + i * 16 + 8),
        )
    };
    let ia_address = image_begin + (clean + 8) as u64;
    let ib_address = image_begin + (clean + 48 + 8) as u64;
    let xa_address = image_begin + (clean + 96 + 8) as u64;
    let xb_address = image_begin + (clean + 96 + 48) as u64;
    assert_eq!(pair(0), (ia_address, xa_address));
    assert_eq!(pair(1), (ib_address, xb_address));
    assert_eq!(pair(2), (0, 0));

    std::fs::remove_file(&path).ok();
}
