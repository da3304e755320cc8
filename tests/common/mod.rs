//! Shared fixtures: a bootstrapped runtime, oat-file stand-ins with a full
//! trampoline table, and temp-file helpers.
#![allow(dead_code)]

use aot_image::oat::{OatFile, Trampoline};
use aot_image::options::{CompilerOptions, ImageKind, InstructionSet};
use aot_image::runtime::{BootImage, Runtime};
use std::collections::HashMap;
use std::path::PathBuf;

pub const IMAGE_BASE: u64 = 0x7000_0000;
pub const BOOT_BASE: u64 = 0x6000_0000;

pub const RESOLUTION_OFFSET: u32 = 0x100;
pub const IMT_CONFLICT_OFFSET: u32 = 0x110;
pub const INTERPRETER_BRIDGE_OFFSET: u32 = 0x120;
pub const GENERIC_JNI_OFFSET: u32 = 0x130;
pub const DLSYM_LOOKUP_OFFSET: u32 = 0x140;
pub const DLSYM_LOOKUP_CRITICAL_OFFSET: u32 = 0x150;
pub const BOOT_JNI_STUB_OFFSET: u32 = 0x160;

pub fn test_oat(data_begin: u64, checksum: u32) -> OatFile {
    OatFile::with_trampolines(
        data_begin,
        0x1_0000,
        checksum,
        &[
            (Trampoline::QuickResolution, RESOLUTION_OFFSET),
            (Trampoline::QuickImtConflict, IMT_CONFLICT_OFFSET),
            (Trampoline::QuickToInterpreterBridge, INTERPRETER_BRIDGE_OFFSET),
            (Trampoline::QuickGenericJni, GENERIC_JNI_OFFSET),
            (Trampoline::JniDlsymLookup, DLSYM_LOOKUP_OFFSET),
            (Trampoline::JniDlsymLookupCritical, DLSYM_LOOKUP_CRITICAL_OFFSET),
            (Trampoline::BootJniStub, BOOT_JNI_STUB_OFFSET),
        ],
    )
}

pub fn new_runtime() -> Runtime {
    Runtime::new(1 << 24, 1 << 20).expect("runtime bootstrap")
}

pub fn boot_options() -> CompilerOptions {
    CompilerOptions::new(ImageKind::BootImage, InstructionSet::X86_64)
}

pub fn app_options() -> CompilerOptions {
    CompilerOptions::new(ImageKind::AppImage, InstructionSet::X86_64)
}

pub fn oat_map(entries: &[(&str, usize)]) -> HashMap<String, usize> {
    entries
        .iter()
        .map(|&(location, index)| (location.to_string(), index))
        .collect()
}

pub fn temp_image_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("aot-image-test-{}-{}", std::process::id(), name));
    path
}

/// Pretend everything allocated so far was loaded from a boot image, giving
/// each object a synthetic boot address. Runtime methods become boot
/// natives too. Used to set up app-image builds.
pub fn freeze_as_boot_image(runtime: &mut Runtime) {
    let mut boot = BootImage::new(BOOT_BASE, 0x0100_0000, vec![0x1111_2222]);
    let mut objects = Vec::new();
    runtime.heap.visit_objects(|obj| objects.push(obj));
    let base = runtime.heap.base();
    for obj in objects {
        let offset = obj.to_raw_address() - base;
        boot.assign_object(obj, BOOT_BASE + offset as u64);
    }
    for (i, method) in runtime.runtime_methods().all().iter().enumerate() {
        boot.assign_native(*method, 0x6800_0000 + (i as u64) * 0x40);
    }
    runtime.set_boot_image(boot);
}

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}
