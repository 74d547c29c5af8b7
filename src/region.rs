// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Mappings of `Mappable` objects into the address space.
//
// A region is unmapped exactly once: by `close()` or by `Drop`. Byte views
// hold a read guard on the mapping state, so `close()` waits for in-flight
// reads and writes in this process instead of pulling the pages out from
// under them.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::{IpcError, Result};
use crate::platform::posix;
use crate::shm::Mappable;

/// Protection of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    /// `PROT_READ`, shared.
    ReadOnly,
    /// `PROT_READ | PROT_WRITE`, shared with every process mapping the object.
    ReadWrite,
    /// Writable private copy (`MAP_PRIVATE`); changes never reach the object.
    CopyOnWrite,
}

impl RegionMode {
    fn prot_flags(self) -> (libc::c_int, libc::c_int) {
        match self {
            RegionMode::ReadOnly => (libc::PROT_READ, libc::MAP_SHARED),
            RegionMode::ReadWrite => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED),
            RegionMode::CopyOnWrite => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE),
        }
    }

    pub fn is_writable(self) -> bool {
        self != RegionMode::ReadOnly
    }
}

/// Offset of `offset` past the closest lower multiple of the allocation
/// granularity; `offset - fixup` is a valid `mmap` offset.
pub fn offset_fixup(offset: u64) -> u64 {
    offset % posix::page_size() as u64
}

struct Mapping {
    /// Page-aligned start as returned by `mmap`.
    base: *mut u8,
    map_len: usize,
    /// Distance from `base` to the caller's logical offset.
    fixup: usize,
}

impl Mapping {
    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(self.fixup) }
    }

    fn unmap(self) -> Result<()> {
        unsafe { posix::munmap(self.base, self.map_len) }.map_err(IpcError::from)
    }
}

/// A mapped byte range `[offset, offset + len)` of a [`Mappable`] object.
///
/// The bytes are shared with every other process mapping the same object;
/// callers that need consistency across processes wrap accesses in an
/// [`IpcMutex`](crate::IpcMutex) or [`RwMutex`](crate::RwMutex).
/// To use a region from several owners, wrap it in an [`Arc`] and use
/// [`RegionReader`] / [`RegionWriter`].
pub struct MemoryRegion {
    state: RwLock<Option<Mapping>>,
    len: usize,
    mode: RegionMode,
}

// Safety: the raw mapping pointer is only dereferenced under the state lock.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Map `size` bytes of `object` starting at `offset`.
    ///
    /// A `size` of 0 maps from `offset` to the current end of the object.
    pub fn map<M>(object: &M, mode: RegionMode, offset: u64, size: usize) -> Result<Self>
    where
        M: Mappable + ?Sized,
    {
        let len = if size == 0 {
            match object.size()? {
                Some(total) if total > offset => usize::try_from(total - offset)
                    .map_err(|_| IpcError::InvalidSize("object too large to map"))?,
                _ => return Err(IpcError::InvalidSize("size is 0 and the object has no size")),
            }
        } else {
            size
        };

        let fixup = offset_fixup(offset);
        let map_len = len
            .checked_add(fixup as usize)
            .ok_or(IpcError::InvalidSize("mapping length overflows"))?;
        let (prot, flags) = mode.prot_flags();
        let base = posix::mmap(object.as_fd(), map_len, offset - fixup, prot, flags)
            .map_err(IpcError::MapFailed)?;

        debug!(name = object.name(), offset, len, ?mode, "mapped region");
        Ok(Self {
            state: RwLock::new(Some(Mapping {
                base,
                map_len,
                fixup: fixup as usize,
            })),
            len,
            mode,
        })
    }

    /// Length of the logical byte range.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> RegionMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().is_none()
    }

    /// Scoped view of the mapped bytes. `close()` blocks until it is dropped.
    pub fn data(&self) -> Result<RegionBytes<'_>> {
        let guard = self.state.read();
        if guard.is_none() {
            return Err(IpcError::Closed);
        }
        Ok(RegionBytes {
            guard,
            len: self.len,
        })
    }

    /// Mutable view of the mapped bytes.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if !self.mode.is_writable() {
            return Err(IpcError::ReadOnly);
        }
        let len = self.len;
        let mapping = self.state.get_mut().as_ref().ok_or(IpcError::Closed)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(mapping.data_ptr(), len) })
    }

    /// Run `f` with a raw pointer to the first logical byte while the mapping
    /// is pinned.
    pub(crate) fn with_ptr<R>(&self, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        let guard = self.state.read();
        let mapping = guard.as_ref().ok_or(IpcError::Closed)?;
        Ok(f(mapping.data_ptr()))
    }

    /// Write the mapped pages back to the object. `asynchronous` schedules
    /// the write-back and returns immediately.
    pub fn flush(&self, asynchronous: bool) -> Result<()> {
        let guard = self.state.read();
        let mapping = guard.as_ref().ok_or(IpcError::Closed)?;
        unsafe { posix::msync(mapping.base, mapping.map_len, asynchronous) }?;
        Ok(())
    }

    /// Unmap the region. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let mapping = self.state.write().take();
        match mapping {
            Some(m) => {
                m.unmap()?;
                debug!(len = self.len, "unmapped region");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Some(m) = self.state.get_mut().take() {
            if let Err(e) = m.unmap() {
                warn!(error = %e, "munmap failed while dropping region");
            }
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("len", &self.len)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Borrowed view of a region's bytes; keeps the mapping alive.
pub struct RegionBytes<'a> {
    guard: RwLockReadGuard<'a, Option<Mapping>>,
    len: usize,
}

impl Deref for RegionBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(m) => unsafe { std::slice::from_raw_parts(m.data_ptr(), self.len) },
            None => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded reader / writer views
// ---------------------------------------------------------------------------

/// Reads from a shared region with bounds checking.
///
/// Holds an `Arc`, so the region cannot be dropped while the reader exists;
/// each call pins the mapping against a concurrent `close()`.
#[derive(Debug, Clone)]
pub struct RegionReader {
    region: Arc<MemoryRegion>,
    pos: u64,
}

impl RegionReader {
    pub fn new(region: Arc<MemoryRegion>) -> Self {
        Self { region, pos: 0 }
    }

    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Copy bytes starting at `offset` into `buf`; returns the count copied,
    /// which is 0 at the end of the region.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let len = self.region.len();
        if offset > len as u64 {
            return Err(IpcError::OutOfRange { offset, len });
        }
        let start = offset as usize;
        let n = buf.len().min(len - start);
        self.region.with_ptr(|p| unsafe {
            std::ptr::copy_nonoverlapping(p.add(start), buf.as_mut_ptr(), n);
        })?;
        Ok(n)
    }
}

impl Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.region.len() as u64 {
            return Ok(0);
        }
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RegionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = seek_position(self.pos, self.region.len(), pos)?;
        Ok(self.pos)
    }
}

/// Writes into a shared region with bounds checking.
///
/// Writes that do not fit are truncated at the end of the region and the
/// short count is returned; nothing past the end is touched.
#[derive(Debug, Clone)]
pub struct RegionWriter {
    region: Arc<MemoryRegion>,
    pos: u64,
}

impl RegionWriter {
    pub fn new(region: Arc<MemoryRegion>) -> Result<Self> {
        if !region.mode().is_writable() {
            return Err(IpcError::ReadOnly);
        }
        Ok(Self { region, pos: 0 })
    }

    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Copy `buf` to `offset`; returns how many bytes fit.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let len = self.region.len();
        if offset >= len as u64 && !buf.is_empty() {
            return Err(IpcError::OutOfRange { offset, len });
        }
        let start = offset as usize;
        let n = buf.len().min(len.saturating_sub(start));
        if n == 0 {
            return Ok(0);
        }
        self.region.with_ptr(|p| unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), p.add(start), n);
        })?;
        Ok(n)
    }
}

impl Write for RegionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.region.len() as u64 {
            return Ok(0);
        }
        let n = self.write_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.region.flush(false).map_err(io::Error::from)
    }
}

impl Seek for RegionWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = seek_position(self.pos, self.region.len(), pos)?;
        Ok(self.pos)
    }
}

fn seek_position(current: u64, len: usize, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(p) => Some(p),
        SeekFrom::End(d) => (len as u64).checked_add_signed(d),
        SeekFrom::Current(d) => current.checked_add_signed(d),
    };
    target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))
}
