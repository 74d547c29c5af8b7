// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Layout validation and raw transcoding of flat values.
//
// Shared memory has no type system: a value whose bytes contain a pointer
// is meaningless in another process. Every type that may cross the boundary
// describes its structure as a `Shape`; validation walks that shape and only
// accepts scalars, fixed arrays, structs and whitelisted opaque types.
// Transcoding copies field bytes only and zeroes padding, so no
// uninitialised memory ever reaches the buffer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::mem::{align_of, size_of, MaybeUninit};
use std::rc::Rc;
use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicU16, AtomicU32, AtomicU64,
    AtomicU8, AtomicUsize,
};
use std::sync::Arc;

use crate::error::{IpcError, Result};

/// Fixed-width scalar kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U8,
    U16,
    U32,
    U64,
    U128,
    Usize,
    I8,
    I16,
    I32,
    I64,
    I128,
    Isize,
    F32,
    F64,
    Complex32,
    Complex64,
}

impl Scalar {
    pub fn size(self) -> usize {
        match self {
            Scalar::U8 | Scalar::I8 => 1,
            Scalar::U16 | Scalar::I16 => 2,
            Scalar::U32 | Scalar::I32 | Scalar::F32 => 4,
            Scalar::U64 | Scalar::I64 | Scalar::F64 | Scalar::Complex32 => 8,
            Scalar::U128 | Scalar::I128 | Scalar::Complex64 => 16,
            Scalar::Usize => size_of::<usize>(),
            Scalar::Isize => size_of::<isize>(),
        }
    }

    pub fn align(self) -> usize {
        match self {
            Scalar::U8 | Scalar::I8 => 1,
            Scalar::U16 | Scalar::I16 => 2,
            Scalar::U32 | Scalar::I32 | Scalar::F32 | Scalar::Complex32 => 4,
            Scalar::U64 | Scalar::I64 | Scalar::F64 | Scalar::Complex64 => align_of::<u64>(),
            Scalar::U128 => align_of::<u128>(),
            Scalar::I128 => align_of::<i128>(),
            Scalar::Usize => align_of::<usize>(),
            Scalar::Isize => align_of::<isize>(),
        }
    }
}

/// Kinds of indirection that can never be transcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indirect {
    /// References, raw pointers, boxes and shared pointers.
    Pointer,
    /// Growable sequences.
    Sequence,
    /// Owned text.
    Text,
    /// Associative containers.
    Map,
}

impl Indirect {
    fn describe(self) -> &'static str {
        match self {
            Indirect::Pointer => "pointer",
            Indirect::Sequence => "variable-length sequence",
            Indirect::Text => "text",
            Indirect::Map => "associative container",
        }
    }
}

/// A named field of a [`Shape::Struct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub shape: Shape,
}

/// Structural description of a type's memory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Scalar(Scalar),
    Array {
        elem: Box<Shape>,
        len: usize,
    },
    Struct {
        name: &'static str,
        size: usize,
        align: usize,
        fields: Vec<Field>,
    },
    /// Whitelisted fixed-layout type copied as a byte block, e.g. an atomic
    /// or a pthread primitive embedded by value.
    Opaque {
        name: &'static str,
        size: usize,
        align: usize,
    },
    Indirect(Indirect),
}

/// Types that can describe their own layout.
///
/// # Safety
/// The returned [`Shape`] must match the type exactly: sizes, field offsets
/// and field types. Every field must be listed. [`read_from`] relies on this
/// to build values from raw bytes. Prefer [`flat_struct!`](crate::flat_struct)
/// over writing impls by hand.
pub unsafe trait Describe: Sized {
    fn shape() -> Shape;
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    /// Exact byte length of the value, padding included.
    pub size: usize,
    pub align: usize,
    /// Byte ranges holding field data (everything else is padding).
    runs: Vec<(usize, usize)>,
}

impl Footprint {
    /// Number of bytes that carry data rather than padding.
    pub fn data_bytes(&self) -> usize {
        self.runs.iter().map(|&(_, len)| len).sum()
    }

    fn push_run(&mut self, start: usize, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(last) = self.runs.last_mut() {
            if last.0 + last.1 == start {
                last.1 += len;
                return;
            }
        }
        self.runs.push((start, len));
    }
}

struct LayoutError {
    path: Vec<String>,
    kind: &'static str,
}

impl LayoutError {
    fn new(kind: &'static str) -> Self {
        Self {
            path: Vec::new(),
            kind,
        }
    }

    fn within(mut self, segment: String) -> Self {
        self.path.push(segment);
        self
    }

    fn into_error(self, root: &str) -> IpcError {
        let mut path = root.to_string();
        for seg in self.path.iter().rev() {
            path.push_str(seg);
        }
        IpcError::UnsupportedLayout {
            path,
            kind: self.kind,
        }
    }
}

/// Walk `shape` placed at `base`, recording data runs. Returns (size, align).
fn walk(shape: &Shape, base: usize, fp: &mut Footprint) -> std::result::Result<(usize, usize), LayoutError> {
    match shape {
        Shape::Scalar(s) => {
            fp.push_run(base, s.size());
            Ok((s.size(), s.align()))
        }
        Shape::Opaque { size, align, .. } => {
            fp.push_run(base, *size);
            Ok((*size, *align))
        }
        Shape::Array { elem, len } => {
            let mut elem_size = 0;
            let mut elem_align = 1;
            for i in 0..*len {
                let (s, a) = walk(elem, base + i * elem_size, fp)
                    .map_err(|e| e.within(format!("[{i}]")))?;
                elem_size = s;
                elem_align = a;
            }
            if *len == 0 {
                // Still reject `[String; 0]`-style element types.
                let mut scratch = Footprint {
                    size: 0,
                    align: 1,
                    runs: Vec::new(),
                };
                let (_, a) = walk(elem, 0, &mut scratch).map_err(|e| e.within("[]".to_string()))?;
                elem_align = a;
            }
            let size = elem_size
                .checked_mul(*len)
                .ok_or_else(|| LayoutError::new("array size overflows"))?;
            Ok((size, elem_align))
        }
        Shape::Struct {
            size,
            align,
            fields,
            ..
        } => {
            let mut fields: Vec<&Field> = fields.iter().collect();
            fields.sort_by_key(|f| f.offset);
            let mut end = 0;
            for f in fields {
                if f.offset < end {
                    return Err(LayoutError::new("overlapping fields").within(format!(".{}", f.name)));
                }
                let (s, _) =
                    walk(&f.shape, base + f.offset, fp).map_err(|e| e.within(format!(".{}", f.name)))?;
                end = f.offset + s;
            }
            if end > *size {
                return Err(LayoutError::new("fields exceed struct size"));
            }
            Ok((*size, *align))
        }
        Shape::Indirect(kind) => Err(LayoutError::new(kind.describe())),
    }
}

/// `T`'s name without module paths or generic arguments, e.g. `Vec` or
/// `[String; 3]`.
fn type_label<T>() -> String {
    let full = std::any::type_name::<T>();
    let mut out = String::with_capacity(full.len());
    let mut segment = 0;
    let mut chars = full.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' && chars.peek() == Some(&':') {
            chars.next();
            out.truncate(segment);
        } else if c.is_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push(c);
            segment = out.len();
        }
    }
    if let Some(i) = out.find('<') {
        out.truncate(i);
    }
    out
}

/// Check that `T` is flat and compute its footprint.
pub fn validate<T: Describe>() -> Result<Footprint> {
    let mut fp = Footprint {
        size: 0,
        align: 1,
        runs: Vec::new(),
    };
    let (size, align) = walk(&T::shape(), 0, &mut fp).map_err(|e| e.into_error(&type_label::<T>()))?;
    if size != size_of::<T>() || align != align_of::<T>() {
        return Err(IpcError::UnsupportedLayout {
            path: type_label::<T>(),
            kind: "shape does not match the type layout",
        });
    }
    fp.size = size;
    fp.align = align;
    Ok(fp)
}

/// Footprint of `value`'s type. Convenience for callers holding a value.
pub fn validate_value<T: Describe>(_value: &T) -> Result<Footprint> {
    validate::<T>()
}

/// Byte length of a flat `T`.
pub fn footprint<T: Describe>() -> Result<usize> {
    validate::<T>().map(|fp| fp.size)
}

fn copy_runs<T>(fp: &Footprint, value: &T, dst: &mut [u8]) {
    dst.fill(0);
    let src = value as *const T as *const u8;
    for &(start, len) in &fp.runs {
        unsafe {
            std::ptr::copy_nonoverlapping(src.add(start), dst.as_mut_ptr().add(start), len);
        }
    }
}

/// Copy `value` into the start of `buf`. Returns the number of bytes written,
/// which is always the footprint; nothing is written on error.
pub fn write_into<T: Describe>(buf: &mut [u8], value: &T) -> Result<usize> {
    let fp = validate::<T>()?;
    if buf.len() < fp.size {
        return Err(IpcError::BufferTooSmall {
            needed: fp.size,
            actual: buf.len(),
        });
    }
    copy_runs(&fp, value, &mut buf[..fp.size]);
    Ok(fp.size)
}

/// Rebuild a `T` from the first `footprint::<T>()` bytes of `buf`.
pub fn read_from<T: Describe>(buf: &[u8]) -> Result<T> {
    let fp = validate::<T>()?;
    if buf.len() < fp.size {
        return Err(IpcError::BufferTooSmall {
            needed: fp.size,
            actual: buf.len(),
        });
    }
    let mut out = MaybeUninit::<T>::zeroed();
    // Safety: validation guarantees T is composed of types for which every
    // bit pattern is valid, and that size_of::<T>() == fp.size.
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), out.as_mut_ptr() as *mut u8, fp.size);
        Ok(out.assume_init())
    }
}

/// Copy a contiguous slice of flat values. The element type is validated,
/// so nested sequences are still rejected.
pub fn write_slice_into<T: Describe>(buf: &mut [u8], values: &[T]) -> Result<usize> {
    let fp = validate::<T>()?;
    let total = fp
        .size
        .checked_mul(values.len())
        .ok_or(IpcError::InvalidSize("slice footprint overflows"))?;
    if buf.len() < total {
        return Err(IpcError::BufferTooSmall {
            needed: total,
            actual: buf.len(),
        });
    }
    for (v, chunk) in values.iter().zip(buf[..total].chunks_exact_mut(fp.size.max(1))) {
        copy_runs(&fp, v, chunk);
    }
    Ok(total)
}

/// Fill `out` from consecutive elements stored in `buf`.
pub fn read_slice_into<T: Describe>(buf: &[u8], out: &mut [T]) -> Result<usize> {
    let fp = validate::<T>()?;
    let total = fp
        .size
        .checked_mul(out.len())
        .ok_or(IpcError::InvalidSize("slice footprint overflows"))?;
    if buf.len() < total {
        return Err(IpcError::BufferTooSmall {
            needed: total,
            actual: buf.len(),
        });
    }
    for (i, slot) in out.iter_mut().enumerate() {
        let start = i * fp.size;
        // Safety: as in `read_from`; `slot` is a valid, initialised T whose
        // bytes are overwritten with another valid T.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr().add(start), slot as *mut T as *mut u8, fp.size);
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Built-in descriptions
// ---------------------------------------------------------------------------

macro_rules! describe_scalar {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            unsafe impl Describe for $ty {
                fn shape() -> Shape {
                    Shape::Scalar(Scalar::$kind)
                }
            }
        )*
    };
}

describe_scalar! {
    u8 => U8, u16 => U16, u32 => U32, u64 => U64, u128 => U128, usize => Usize,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64, i128 => I128, isize => Isize,
    f32 => F32, f64 => F64,
}

/// A complex number laid out as two consecutive components.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub const fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

unsafe impl Describe for Complex<f32> {
    fn shape() -> Shape {
        Shape::Scalar(Scalar::Complex32)
    }
}

unsafe impl Describe for Complex<f64> {
    fn shape() -> Shape {
        Shape::Scalar(Scalar::Complex64)
    }
}

unsafe impl<T: Describe, const N: usize> Describe for [T; N] {
    fn shape() -> Shape {
        Shape::Array {
            elem: Box::new(T::shape()),
            len: N,
        }
    }
}

macro_rules! describe_opaque {
    ($($ty:ty),* $(,)?) => {
        $(
            unsafe impl Describe for $ty {
                fn shape() -> Shape {
                    Shape::Opaque {
                        name: stringify!($ty),
                        size: size_of::<$ty>(),
                        align: align_of::<$ty>(),
                    }
                }
            }
        )*
    };
}

describe_opaque! {
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    libc::pthread_mutex_t, libc::pthread_rwlock_t, libc::pthread_cond_t,
}

macro_rules! describe_indirect {
    ($kind:ident: $(impl[$($gen:tt)*] $ty:ty),* $(,)?) => {
        $(
            unsafe impl<$($gen)*> Describe for $ty {
                fn shape() -> Shape {
                    Shape::Indirect(Indirect::$kind)
                }
            }
        )*
    };
}

describe_indirect! { Pointer:
    impl['a, T: ?Sized] &'a T,
    impl['a, T: ?Sized] &'a mut T,
    impl[T: ?Sized] *const T,
    impl[T: ?Sized] *mut T,
    impl[T: ?Sized] Box<T>,
    impl[T: ?Sized] Rc<T>,
    impl[T: ?Sized] Arc<T>,
}

describe_indirect! { Sequence:
    impl[T] Vec<T>,
    impl[T] VecDeque<T>,
}

describe_indirect! { Text:
    impl[] String,
    impl[] std::ffi::CString,
    impl[] std::ffi::OsString,
}

describe_indirect! { Map:
    impl[K, V, S] HashMap<K, V, S>,
    impl[K, V] BTreeMap<K, V>,
    impl[T, S] HashSet<T, S>,
    impl[T] BTreeSet<T>,
}

/// Declare a `#[repr(C)]` struct together with its [`Describe`] impl.
///
/// Every field is listed in the generated shape, so validation sees the
/// whole struct. Fields of non-flat types compile but are rejected by
/// [`validate`] at run time.
///
/// ```
/// ipc_objects::flat_struct! {
///     #[derive(Debug, Clone, Copy, PartialEq, Default)]
///     pub struct Sample {
///         pub seq: u64,
///         pub level: [f32; 4],
///     }
/// }
/// assert_eq!(ipc_objects::layout::footprint::<Sample>().unwrap(), 24);
/// ```
#[macro_export]
macro_rules! flat_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(C)]
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field : $fty ),*
        }

        unsafe impl $crate::layout::Describe for $name {
            fn shape() -> $crate::layout::Shape {
                $crate::layout::Shape::Struct {
                    name: ::core::stringify!($name),
                    size: ::core::mem::size_of::<$name>(),
                    align: ::core::mem::align_of::<$name>(),
                    fields: ::std::vec![
                        $(
                            $crate::layout::Field {
                                name: ::core::stringify!($field),
                                offset: ::core::mem::offset_of!($name, $field),
                                shape: <$fty as $crate::layout::Describe>::shape(),
                            }
                        ),*
                    ],
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::flat_struct! {
        #[derive(Debug, Clone, Copy, PartialEq, Default)]
        struct Padded {
            a: u8,
            b: u64,
            c: u16,
        }
    }

    #[test]
    fn padding_is_not_data() {
        let fp = validate::<Padded>().unwrap();
        assert_eq!(fp.size, size_of::<Padded>());
        assert_eq!(fp.data_bytes(), 1 + 8 + 2);
    }

    #[test]
    fn padding_is_zeroed() {
        let v = Padded { a: 0xff, b: u64::MAX, c: 0xffff };
        let mut buf = vec![0xaau8; 64];
        let n = write_into(&mut buf, &v).unwrap();
        assert_eq!(n, size_of::<Padded>());
        // bytes 1..8 are padding before `b`
        assert!(buf[1..8].iter().all(|&b| b == 0));
        // untouched tail
        assert!(buf[n..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn adjacent_runs_merge() {
        let fp = validate::<[u32; 8]>().unwrap();
        assert_eq!(fp.runs, vec![(0, 32)]);
    }

    #[test]
    fn empty_array_of_text_is_rejected() {
        assert!(validate::<[String; 0]>().is_err());
        assert_eq!(footprint::<[u64; 0]>().unwrap(), 0);
    }

    #[test]
    fn type_labels_are_short() {
        assert_eq!(type_label::<Padded>(), "Padded");
        assert_eq!(type_label::<Vec<u8>>(), "Vec");
        assert_eq!(type_label::<[String; 3]>(), "[String; 3]");
        assert_eq!(type_label::<&u64>(), "&u64");
    }
}
