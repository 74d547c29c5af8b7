// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Portable open-mode flags shared by every named object, and the
// create-or-open negotiation built on top of them.

use bitflags::bitflags;

use crate::error::{IpcError, Result};

/// Number of create/open rounds attempted for [`OpenMode::CREATE_OR_OPEN`]
/// before giving up with [`IpcError::TransientRace`].
pub const CREATE_OR_OPEN_ATTEMPTS: u32 = 16;

bitflags! {
    /// Create mode × access mode.
    ///
    /// The numeric values are part of the cross-process contract and must not
    /// change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const CREATE_ONLY = 0x01;
        const OPEN_ONLY = 0x02;
        const CREATE_OR_OPEN = 0x04;
        const READ_ONLY = 0x08;
        const WRITE_ONLY = 0x10;
        const READ_WRITE = 0x20;
    }
}

const CREATE_MASK: OpenMode = OpenMode::CREATE_ONLY
    .union(OpenMode::OPEN_ONLY)
    .union(OpenMode::CREATE_OR_OPEN);
const ACCESS_MASK: OpenMode = OpenMode::READ_ONLY
    .union(OpenMode::WRITE_ONLY)
    .union(OpenMode::READ_WRITE);

/// How the named object comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateSemantics {
    /// Create exclusively, fail if it exists.
    CreateExclusive,
    /// Open an existing object, fail if it is missing.
    OpenExisting,
    /// Create if missing, open otherwise.
    CreateOrOpen,
}

/// What the caller intends to do with the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSemantics {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessSemantics {
    /// `O_RDONLY` / `O_WRONLY` / `O_RDWR`.
    pub fn oflag(self) -> libc::c_int {
        match self {
            AccessSemantics::ReadOnly => libc::O_RDONLY,
            AccessSemantics::WriteOnly => libc::O_WRONLY,
            AccessSemantics::ReadWrite => libc::O_RDWR,
        }
    }

    pub fn can_read(self) -> bool {
        self != AccessSemantics::WriteOnly
    }

    pub fn can_write(self) -> bool {
        self != AccessSemantics::ReadOnly
    }
}

/// The validated form of an [`OpenMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub create: CreateSemantics,
    pub access: AccessSemantics,
}

/// A single OS-level open attempt handed to the opener closure of
/// [`open_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    /// `true` for an exclusive create (`O_CREAT | O_EXCL`).
    pub create: bool,
    pub access: AccessSemantics,
}

impl OpenRequest {
    /// Flags suitable for `shm_open` / `mq_open` / `sem_open`.
    pub fn oflag(&self) -> libc::c_int {
        let mut flags = self.access.oflag();
        if self.create {
            flags |= libc::O_CREAT | libc::O_EXCL;
        }
        flags
    }
}

impl OpenMode {
    /// Parse raw bits coming from another process, rejecting unknown bits.
    pub fn from_raw(bits: u32) -> Result<Self> {
        OpenMode::from_bits(bits).ok_or(IpcError::InvalidFlags("unknown bits set"))
    }

    /// Validate the flag combination.
    ///
    /// Exactly one create bit and exactly one access bit must be set.
    pub fn resolve(self) -> Result<Resolved> {
        let create = match self & CREATE_MASK {
            m if m == OpenMode::CREATE_ONLY => CreateSemantics::CreateExclusive,
            m if m == OpenMode::OPEN_ONLY => CreateSemantics::OpenExisting,
            m if m == OpenMode::CREATE_OR_OPEN => CreateSemantics::CreateOrOpen,
            m if m.is_empty() => return Err(IpcError::InvalidFlags("no create mode")),
            _ => return Err(IpcError::InvalidFlags("conflicting create modes")),
        };
        let access = match self & ACCESS_MASK {
            m if m == OpenMode::READ_ONLY => AccessSemantics::ReadOnly,
            m if m == OpenMode::WRITE_ONLY => AccessSemantics::WriteOnly,
            m if m == OpenMode::READ_WRITE => AccessSemantics::ReadWrite,
            m if m.is_empty() => return Err(IpcError::InvalidFlags("no access mode")),
            _ => return Err(IpcError::InvalidFlags("conflicting access modes")),
        };
        Ok(Resolved { create, access })
    }

    /// Resolve a mode for a synchronization object.
    ///
    /// The usual rule applies, and locks additionally need `READ_WRITE`:
    /// every holder writes the shared state.
    pub fn resolve_sync(self) -> Result<Resolved> {
        let resolved = self.resolve()?;
        if resolved.access != AccessSemantics::ReadWrite {
            return Err(IpcError::InvalidFlags("locks must be opened READ_WRITE"));
        }
        Ok(resolved)
    }
}

/// Run the create/open protocol for `mode`, calling `opener` once per OS
/// attempt. Returns the opened object and whether this call created it.
///
/// For [`CreateSemantics::CreateOrOpen`] an exclusive create is tried first;
/// `AlreadyExists` falls back to an open, and a `NotFound` on that open (the
/// object was destroyed in between) starts another round. After `attempts`
/// rounds the race is reported as [`IpcError::TransientRace`].
pub fn open_or_create<T, F>(
    name: &str,
    resolved: Resolved,
    attempts: u32,
    mut opener: F,
) -> Result<(T, bool)>
where
    F: FnMut(OpenRequest) -> Result<T>,
{
    let create = OpenRequest {
        create: true,
        access: resolved.access,
    };
    let open = OpenRequest {
        create: false,
        access: resolved.access,
    };
    match resolved.create {
        CreateSemantics::CreateExclusive => opener(create).map(|obj| (obj, true)),
        CreateSemantics::OpenExisting => opener(open).map(|obj| (obj, false)),
        CreateSemantics::CreateOrOpen => {
            for _ in 0..attempts {
                match opener(create) {
                    Ok(obj) => return Ok((obj, true)),
                    Err(IpcError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e),
                }
                match opener(open) {
                    Ok(obj) => return Ok((obj, false)),
                    Err(IpcError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Err(IpcError::TransientRace {
                name: name.to_string(),
                attempts,
            })
        }
    }
}
