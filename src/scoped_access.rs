// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guard that holds a named mutex for the lifetime of an access to a
// shared memory region.

use crate::error::{IpcError, Result};
use crate::layout::{self, Describe};
use crate::mutex::{IpcMutex, IpcMutexGuard};
use crate::region::MemoryRegion;

/// Locks `mutex` on construction and unlocks on drop, giving consistent
/// read/write access to `region` in between.
pub struct ScopedAccess<'a> {
    region: &'a MemoryRegion,
    _guard: IpcMutexGuard<'a>,
}

impl<'a> ScopedAccess<'a> {
    pub fn new(region: &'a MemoryRegion, mutex: &'a IpcMutex) -> Result<Self> {
        let guard = mutex.guard()?;
        Ok(Self {
            region,
            _guard: guard,
        })
    }

    /// Copy of the whole region.
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(self.region.data()?.to_vec())
    }

    /// Copy `buf` to the start of the region.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        if !self.region.mode().is_writable() {
            return Err(IpcError::ReadOnly);
        }
        let cap = self.region.len();
        if buf.len() > cap {
            return Err(IpcError::BufferTooSmall {
                needed: buf.len(),
                actual: cap,
            });
        }
        self.region.with_ptr(|p| unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), p, buf.len());
        })
    }

    /// Transcode `value` into the start of the region.
    pub fn write_value<T: Describe>(&self, value: &T) -> Result<usize> {
        let mut scratch = vec![0u8; layout::footprint::<T>()?];
        let n = layout::write_into(&mut scratch, value)?;
        self.write(&scratch)?;
        Ok(n)
    }

    /// Transcode a `T` out of the start of the region.
    pub fn read_value<T: Describe>(&self) -> Result<T> {
        layout::read_from(&self.region.data()?)
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}
