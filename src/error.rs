// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type shared by every named object in the crate.

use std::io;

use thiserror::Error;

/// Errors returned by shared memory, lock and queue operations.
///
/// `WouldBlock` and `Timeout` are ordinary outcomes of the blocking contract;
/// callers are expected to branch on them (see [`IpcError::is_would_block`]).
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("invalid open flags: {0}")]
    InvalidFlags(&'static str),

    #[error("object not found: {name}")]
    NotFound { name: String },

    #[error("object already exists: {name}")]
    AlreadyExists { name: String },

    #[error("create-or-open of {name} raced with destroy {attempts} times")]
    TransientRace { name: String, attempts: u32 },

    #[error("layout of `{path}` is not flat: {kind}")]
    UnsupportedLayout { path: String, kind: &'static str },

    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("message of {size} bytes exceeds the queue limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("offset {offset} is out of range for {len} bytes")]
    OutOfRange { offset: u64, len: usize },

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("unlock of a lock that is not held")]
    NotLocked,

    #[error("a notification is already registered on this queue")]
    AlreadySubscribed,

    #[error("invalid mapping size: {0}")]
    InvalidSize(&'static str),

    #[error("invalid permissions {0:#o}")]
    InvalidPermissions(u32),

    #[error("invalid object name {0:?}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("region is closed")]
    Closed,

    #[error("region is mapped read-only")]
    ReadOnly,

    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("mmap failed: {0}")]
    MapFailed(#[source] io::Error),

    #[error(transparent)]
    Os(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Lift an OS error raised while operating on `name`.
    ///
    /// `ENOENT` and `EEXIST` become [`IpcError::NotFound`] and
    /// [`IpcError::AlreadyExists`]; everything else is wrapped unchanged.
    pub fn from_os(err: io::Error, name: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => IpcError::NotFound {
                name: name.to_string(),
            },
            io::ErrorKind::AlreadyExists => IpcError::AlreadyExists {
                name: name.to_string(),
            },
            _ => IpcError::Os(err),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, IpcError::WouldBlock)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IpcError::NotFound { .. })
    }
}

impl From<IpcError> for io::Error {
    fn from(err: IpcError) -> Self {
        let kind = match &err {
            IpcError::Os(e) | IpcError::MapFailed(e) => e.kind(),
            IpcError::NotFound { .. } => io::ErrorKind::NotFound,
            IpcError::AlreadyExists { .. } => io::ErrorKind::AlreadyExists,
            IpcError::WouldBlock => io::ErrorKind::WouldBlock,
            IpcError::Timeout => io::ErrorKind::TimedOut,
            IpcError::Unsupported(_) => io::ErrorKind::Unsupported,
            IpcError::OutOfRange { .. } => io::ErrorKind::UnexpectedEof,
            IpcError::ReadOnly => io::ErrorKind::PermissionDenied,
            _ => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}
