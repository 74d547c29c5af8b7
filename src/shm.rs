// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory objects and the `Mappable` abstraction that
// `MemoryRegion` maps from.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tracing::debug;

use crate::config::Config;
use crate::error::{IpcError, Result};
use crate::open_mode::{open_or_create, AccessSemantics, OpenMode, OpenRequest};
use crate::platform::posix;
use crate::shm_name;

/// Something that can be mapped into memory by [`MemoryRegion`](crate::MemoryRegion).
pub trait Mappable: AsFd {
    /// Object name; empty for anonymous objects.
    fn name(&self) -> &str {
        ""
    }

    /// Current size in bytes, if the object can report one.
    fn size(&self) -> Result<Option<u64>>;
}

impl Mappable for File {
    fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.metadata()?.len()))
    }
}

/// A named POSIX shared memory object (`shm_open`).
///
/// The object outlives any region mapped from it and is only removed by
/// [`MemoryObject::destroy`]. Dropping the handle closes the descriptor.
#[derive(Debug)]
pub struct MemoryObject {
    fd: OwnedFd,
    name: String,
    access: AccessSemantics,
    created: bool,
}

impl MemoryObject {
    /// Create and/or open `name` according to `mode`.
    pub fn open(name: &str, mode: OpenMode) -> Result<Self> {
        Self::open_with(name, mode, &Config::default())
    }

    pub fn open_with(name: &str, mode: OpenMode, cfg: &Config) -> Result<Self> {
        let resolved = mode.resolve()?;
        let (obj, created) = open_or_create(name, resolved, cfg.race_attempts, |req| {
            Self::open_request(name, req, cfg)
        })?;
        debug!(name, ?mode, created, "opened memory object");
        Ok(obj)
    }

    /// Open `name` and, if this call created it, size it to `size` bytes.
    pub fn create(name: &str, mode: OpenMode, size: u64) -> Result<Self> {
        Self::create_with(name, mode, size, &Config::default())
    }

    pub fn create_with(name: &str, mode: OpenMode, size: u64, cfg: &Config) -> Result<Self> {
        let obj = Self::open_with(name, mode, cfg)?;
        if obj.created && size > 0 {
            if let Err(e) = obj.truncate(size) {
                let _ = Self::destroy(name);
                return Err(e);
            }
        }
        Ok(obj)
    }

    /// One OS-level attempt, used by the negotiator loop.
    pub(crate) fn open_request(name: &str, req: OpenRequest, cfg: &Config) -> Result<Self> {
        let cname = shm_name::posix_cname(name)?;
        let fd = posix::shm_open(&cname, req.oflag(), cfg.mode_t())
            .map_err(|e| IpcError::from_os(e, name))?;
        Ok(Self {
            fd,
            name: name.to_string(),
            access: req.access,
            created: req.create,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn access(&self) -> AccessSemantics {
        self.access
    }

    /// Resize the object.
    pub fn truncate(&self, size: u64) -> Result<()> {
        posix::ftruncate(self.fd.as_fd(), size).map_err(|e| IpcError::from_os(e, &self.name))
    }

    /// Current size in bytes.
    pub fn len(&self) -> Result<u64> {
        let (size, _, _) = posix::fstat(self.fd.as_fd())?;
        Ok(size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// `(device, inode)` pair identifying the underlying object.
    pub(crate) fn identity(&self) -> Result<(u64, u64)> {
        let (_, dev, ino) = posix::fstat(self.fd.as_fd())?;
        Ok((dev, ino))
    }

    /// Close the descriptor. Mappings created from it stay valid.
    pub fn close(self) {}

    /// Permanently remove `name`. Removing a missing object is not an error.
    pub fn destroy(name: &str) -> Result<()> {
        let cname = shm_name::posix_cname(name)?;
        match posix::shm_unlink(&cname) {
            Ok(()) => {
                debug!(name, "destroyed memory object");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(IpcError::from_os(e, name)),
        }
    }
}

impl AsFd for MemoryObject {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Mappable for MemoryObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.len()?))
    }
}
