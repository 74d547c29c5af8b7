// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Layout validation and raw transcoding of flat values.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use ipc_objects::layout::{
    footprint, read_from, read_slice_into, validate, write_into, write_slice_into,
};
use ipc_objects::{flat_struct, Complex, IpcError};

flat_struct! {
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    struct Point {
        x: f32,
        y: f32,
    }
}

flat_struct! {
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    struct Frame {
        id: u8,
        stamp: u64,
        corners: [Point; 4],
        phase: Complex<f64>,
        flags: i16,
    }
}

flat_struct! {
    struct WithLock {
        lock: libc::pthread_mutex_t,
        hits: AtomicU32,
    }
}

flat_struct! {
    struct WithVec {
        id: u32,
        items: Vec<u8>,
    }
}

flat_struct! {
    struct Inner {
        label: String,
    }
}

flat_struct! {
    struct Outer {
        a: u64,
        nested: [Inner; 2],
    }
}

flat_struct! {
    struct WithRef {
        target: Box<u64>,
    }
}

fn assert_rejected<T>(path: &str, kind_fragment: &str)
where
    T: ipc_objects::Describe,
{
    match validate::<T>() {
        Err(IpcError::UnsupportedLayout { path: p, kind }) => {
            assert_eq!(p, path);
            assert!(kind.contains(kind_fragment), "{kind}");
        }
        other => panic!("expected UnsupportedLayout, got {other:?}"),
    }
}

#[test]
fn scalars_and_arrays_are_flat() {
    assert_eq!(footprint::<u8>().unwrap(), 1);
    assert_eq!(footprint::<i64>().unwrap(), 8);
    assert_eq!(footprint::<f64>().unwrap(), 8);
    assert_eq!(footprint::<Complex<f32>>().unwrap(), 8);
    assert_eq!(footprint::<Complex<f64>>().unwrap(), 16);
    assert_eq!(footprint::<[u16; 7]>().unwrap(), 14);
    assert_eq!(footprint::<[[i32; 3]; 2]>().unwrap(), 24);
}

#[test]
fn struct_footprint_includes_padding() {
    let fp = validate::<Frame>().unwrap();
    assert_eq!(fp.size, size_of::<Frame>());
    assert!(fp.data_bytes() < fp.size);
    assert_eq!(fp.data_bytes(), 1 + 8 + 4 * 8 + 16 + 2);
}

#[test]
fn opaque_sync_types_are_flat() {
    assert_eq!(footprint::<WithLock>().unwrap(), size_of::<WithLock>());
}

#[test]
fn non_flat_types_are_rejected_with_a_path() {
    assert_rejected::<String>("String", "text");
    assert_rejected::<Vec<Vec<i32>>>("Vec", "sequence");
    assert_rejected::<HashMap<u32, u32>>("HashMap", "associative");
    assert_rejected::<&u64>("&u64", "pointer");
    assert_rejected::<[String; 3]>("[String; 3][0]", "text");
    assert_rejected::<WithVec>("WithVec.items", "sequence");
    assert_rejected::<Outer>("Outer.nested[0].label", "text");
    assert_rejected::<WithRef>("WithRef.target", "pointer");
}

#[test]
fn round_trip_at_exact_and_larger_buffers() {
    let frame = Frame {
        id: 7,
        stamp: 0x0102_0304_0506_0708,
        corners: [
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.5, y: 0.0 },
            Point { x: 1.5, y: -2.0 },
            Point { x: 0.0, y: -2.0 },
        ],
        phase: Complex::new(0.25, -0.75),
        flags: -3,
    };
    let size = footprint::<Frame>().unwrap();

    let mut exact = vec![0u8; size];
    assert_eq!(write_into(&mut exact, &frame).unwrap(), size);
    assert_eq!(read_from::<Frame>(&exact).unwrap(), frame);

    let mut larger = vec![0xEEu8; size + 32];
    assert_eq!(write_into(&mut larger, &frame).unwrap(), size);
    assert!(larger[size..].iter().all(|&b| b == 0xEE));
    assert_eq!(read_from::<Frame>(&larger).unwrap(), frame);
}

#[test]
fn short_buffers_are_rejected() {
    let mut buf = [0u8; 7];
    let err = write_into(&mut buf, &0u64).unwrap_err();
    assert!(matches!(err, IpcError::BufferTooSmall { needed: 8, actual: 7 }));
    assert!(buf.iter().all(|&b| b == 0));
    let err = read_from::<u64>(&buf).unwrap_err();
    assert!(matches!(err, IpcError::BufferTooSmall { needed: 8, actual: 7 }));
}

#[test]
fn rejected_values_write_nothing() {
    let mut buf = [0xAAu8; 64];
    let err = write_into(&mut buf, &String::from("text")).unwrap_err();
    assert!(matches!(err, IpcError::UnsupportedLayout { .. }));
    assert!(buf.iter().all(|&b| b == 0xAA));
}

#[test]
fn atomics_copy_their_current_value() {
    let v = AtomicU32::new(41);
    v.fetch_add(1, Ordering::Relaxed);
    let mut buf = [0u8; 4];
    write_into(&mut buf, &v).unwrap();
    assert_eq!(read_from::<AtomicU32>(&buf).unwrap().into_inner(), 42);
}

#[test]
fn slices_of_flat_values() {
    let points: Vec<Point> = (0..5)
        .map(|i| Point {
            x: i as f32,
            y: -(i as f32),
        })
        .collect();
    let mut buf = vec![0u8; 5 * size_of::<Point>()];
    assert_eq!(write_slice_into(&mut buf, &points).unwrap(), buf.len());

    let mut back = [Point::default(); 5];
    assert_eq!(read_slice_into(&buf, &mut back).unwrap(), buf.len());
    assert_eq!(&back[..], &points[..]);

    let mut short = vec![0u8; 4 * size_of::<Point>()];
    assert!(matches!(
        write_slice_into(&mut short, &points),
        Err(IpcError::BufferTooSmall { .. })
    ));
    let nested = vec![vec![1u8]];
    assert!(matches!(
        write_slice_into(&mut buf, &nested),
        Err(IpcError::UnsupportedLayout { .. })
    ));
}
