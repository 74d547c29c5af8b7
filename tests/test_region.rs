// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory objects and regions: lifetime, offsets, modes and bounded I/O.

mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread;

use common::{init_tracing, unique_name};
use ipc_objects::{
    Config, IpcError, MemoryObject, MemoryRegion, OpenMode, RegionMode, RegionReader, RegionWriter,
};

const RW_CREATE: OpenMode = OpenMode::CREATE_ONLY.union(OpenMode::READ_WRITE);

fn fresh_object(prefix: &str, size: u64) -> (String, MemoryObject) {
    init_tracing();
    let name = unique_name(prefix);
    MemoryObject::destroy(&name).expect("destroy");
    let obj = MemoryObject::create(&name, RW_CREATE, size).expect("create");
    (name, obj)
}

#[test]
fn create_open_destroy() {
    let (name, obj) = fresh_object("shm_lifecycle", 1024);
    assert!(obj.created());
    assert_eq!(obj.len().unwrap(), 1024);
    assert_eq!(obj.name(), name);

    let again = MemoryObject::open(&name, OpenMode::CREATE_OR_OPEN | OpenMode::READ_WRITE).unwrap();
    assert!(!again.created());
    assert_eq!(again.len().unwrap(), 1024);

    let err = MemoryObject::open(&name, RW_CREATE).unwrap_err();
    assert!(matches!(err, IpcError::AlreadyExists { .. }));

    MemoryObject::destroy(&name).unwrap();
    let err = MemoryObject::open(&name, OpenMode::OPEN_ONLY | OpenMode::READ_ONLY).unwrap_err();
    assert!(err.is_not_found());
    // Destroying a missing name succeeds.
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn created_objects_get_the_requested_permissions() {
    init_tracing();
    let name = unique_name("shm_perm");
    MemoryObject::destroy(&name).unwrap();
    // Other-write is stripped by the usual umask unless set explicitly.
    let cfg = Config::default().with_permissions(0o646).unwrap();
    let obj = MemoryObject::create_with(&name, RW_CREATE, 64, &cfg).unwrap();
    let file = std::fs::File::from(obj.as_fd().try_clone_to_owned().unwrap());
    assert_eq!(file.metadata().unwrap().permissions().mode() & 0o777, 0o646);
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn invalid_flags_fail_before_any_os_call() {
    let name = unique_name("shm_flags");
    let err = MemoryObject::open(&name, OpenMode::CREATE_ONLY).unwrap_err();
    assert!(matches!(err, IpcError::InvalidFlags(_)));
    let err = MemoryObject::open(&name, OpenMode::CREATE_ONLY | OpenMode::OPEN_ONLY | OpenMode::READ_ONLY)
        .unwrap_err();
    assert!(matches!(err, IpcError::InvalidFlags(_)));
    // Nothing was created.
    assert!(MemoryObject::open(&name, OpenMode::OPEN_ONLY | OpenMode::READ_ONLY)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn two_mappings_share_bytes() {
    let (name, obj) = fresh_object("shm_share", 4096);
    let mut a = MemoryRegion::map(&obj, RegionMode::ReadWrite, 0, 0).unwrap();
    assert_eq!(a.len(), 4096);
    a.data_mut().unwrap()[..5].copy_from_slice(b"hello");

    let other = MemoryObject::open(&name, OpenMode::OPEN_ONLY | OpenMode::READ_ONLY).unwrap();
    let b = MemoryRegion::map(&other, RegionMode::ReadOnly, 0, 5).unwrap();
    assert_eq!(&*b.data().unwrap(), b"hello");
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn unaligned_offset_is_fixed_up() {
    let (name, obj) = fresh_object("shm_offset", 8192);
    let mut whole = MemoryRegion::map(&obj, RegionMode::ReadWrite, 0, 0).unwrap();
    for (i, b) in whole.data_mut().unwrap().iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let offset = 4096 + 17;
    let part = MemoryRegion::map(&obj, RegionMode::ReadOnly, offset, 100).unwrap();
    assert_eq!(part.len(), 100);
    let bytes = part.data().unwrap();
    for (i, b) in bytes.iter().enumerate() {
        assert_eq!(*b, ((offset as usize + i) % 251) as u8);
    }
    drop(bytes);

    // size 0 maps to the end of the object.
    let tail = MemoryRegion::map(&obj, RegionMode::ReadOnly, 100, 0).unwrap();
    assert_eq!(tail.len(), 8192 - 100);
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn zero_size_needs_a_sized_object() {
    let (name, obj) = fresh_object("shm_zero", 0);
    let err = MemoryRegion::map(&obj, RegionMode::ReadWrite, 0, 0).unwrap_err();
    assert!(matches!(err, IpcError::InvalidSize(_)));
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn read_only_region_rejects_writes() {
    let (name, obj) = fresh_object("shm_ro", 64);
    let mut ro = MemoryRegion::map(&obj, RegionMode::ReadOnly, 0, 64).unwrap();
    assert!(matches!(ro.data_mut(), Err(IpcError::ReadOnly)));
    assert!(matches!(RegionWriter::new(Arc::new(ro)), Err(IpcError::ReadOnly)));

    let ro_obj = MemoryObject::open(&name, OpenMode::OPEN_ONLY | OpenMode::READ_ONLY).unwrap();
    let err = MemoryRegion::map(&ro_obj, RegionMode::ReadWrite, 0, 64).unwrap_err();
    assert!(matches!(err, IpcError::MapFailed(_)));
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn copy_on_write_stays_private() {
    let (name, obj) = fresh_object("shm_cow", 64);
    let mut cow = MemoryRegion::map(&obj, RegionMode::CopyOnWrite, 0, 64).unwrap();
    cow.data_mut().unwrap()[0] = 0xAB;
    let shared = MemoryRegion::map(&obj, RegionMode::ReadOnly, 0, 64).unwrap();
    assert_eq!(shared.data().unwrap()[0], 0);
    assert_eq!(cow.data().unwrap()[0], 0xAB);
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn close_is_idempotent() {
    let (name, obj) = fresh_object("shm_close", 64);
    let region = MemoryRegion::map(&obj, RegionMode::ReadWrite, 0, 64).unwrap();
    region.flush(false).unwrap();
    region.close().unwrap();
    assert!(region.is_closed());
    region.close().unwrap();
    assert!(matches!(region.data(), Err(IpcError::Closed)));
    assert!(matches!(region.flush(true), Err(IpcError::Closed)));
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn close_waits_for_views() {
    let (name, obj) = fresh_object("shm_close_wait", 64);
    let region = Arc::new(MemoryRegion::map(&obj, RegionMode::ReadWrite, 0, 64).unwrap());
    let view = region.data().unwrap();

    let r2 = Arc::clone(&region);
    let closer = thread::spawn(move || r2.close());
    thread::sleep(std::time::Duration::from_millis(30));
    assert!(!closer.is_finished());
    assert_eq!(view.len(), 64);
    drop(view);
    closer.join().unwrap().unwrap();
    assert!(region.is_closed());
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn reader_and_writer_are_bounded() {
    let (name, obj) = fresh_object("shm_rw_views", 16);
    let region = Arc::new(MemoryRegion::map(&obj, RegionMode::ReadWrite, 0, 16).unwrap());

    let mut w = RegionWriter::new(Arc::clone(&region)).unwrap();
    assert_eq!(w.write_at(b"0123456789", 10).unwrap(), 6);
    assert!(matches!(w.write_at(b"x", 16), Err(IpcError::OutOfRange { offset: 16, len: 16 })));
    // Empty writes never touch the mapping, wherever they point.
    assert_eq!(w.write_at(b"", 16).unwrap(), 0);
    assert_eq!(w.write_at(b"", u64::MAX).unwrap(), 0);
    w.seek(SeekFrom::Start(0)).unwrap();
    w.write_all(b"abcd").unwrap();
    w.seek(SeekFrom::End(-2)).unwrap();
    assert_eq!(w.write(b"zzzz").unwrap(), 2);
    assert_eq!(w.write(b"more").unwrap(), 0);
    w.flush().unwrap();

    let mut r = RegionReader::new(Arc::clone(&region));
    let mut all = Vec::new();
    r.read_to_end(&mut all).unwrap();
    assert_eq!(all.len(), 16);
    assert_eq!(&all[..4], b"abcd");
    assert_eq!(&all[10..14], b"0123");
    assert_eq!(&all[14..], b"zz");

    let mut buf = [0u8; 8];
    assert_eq!(r.read_at(&mut buf, 12).unwrap(), 4);
    assert_eq!(r.read_at(&mut buf, 16).unwrap(), 0);
    assert!(matches!(r.read_at(&mut buf, 17), Err(IpcError::OutOfRange { .. })));
    MemoryObject::destroy(&name).unwrap();
}

#[test]
fn files_are_mappable() {
    init_tracing();
    let path = std::env::temp_dir().join(unique_name("region_file"));
    std::fs::write(&path, b"file backed bytes").unwrap();
    let file = std::fs::File::open(&path).unwrap();
    let region = MemoryRegion::map(&file, RegionMode::ReadOnly, 5, 0).unwrap();
    assert_eq!(&*region.data().unwrap(), b"backed bytes");
    drop(region);
    std::fs::remove_file(&path).unwrap();
}
