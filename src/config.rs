// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Explicit implementation selection for named objects.
// Callers pick a backend per object instead of relying on a build-target
// default baked into the library.

use std::time::Duration;

use crate::error::{IpcError, Result};
use crate::open_mode::CREATE_OR_OPEN_ATTEMPTS;

/// Storage behind a named [`IpcMutex`](crate::IpcMutex).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexBackend {
    /// Process-shared pthread mutex + condition variable in a shm segment.
    SharedMemory,
    /// Named POSIX semaphore with an initial count of one.
    Semaphore,
}

/// Storage behind a named [`MessageQueue`](crate::MessageQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Ring of fixed-size slots in a shm segment, portable across POSIX systems.
    SharedMemory,
    /// Kernel POSIX message queue (`mq_open`), Linux only.
    Posix,
}

/// Options applied when creating or opening named objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mutex_backend: MutexBackend,
    pub queue_backend: QueueBackend,
    /// Permission bits for newly created objects.
    pub permissions: u32,
    /// Create-or-open rounds before reporting a race.
    pub race_attempts: u32,
    /// How long an opener waits for the creator to finish initialising
    /// shared state.
    pub init_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mutex_backend: MutexBackend::SharedMemory,
            queue_backend: QueueBackend::SharedMemory,
            permissions: 0o666,
            race_attempts: CREATE_OR_OPEN_ATTEMPTS,
            init_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Defaults overridden by `IPC_MUTEX_BACKEND` (`shm`|`sem`),
    /// `IPC_QUEUE_BACKEND` (`shm`|`posix`) and `IPC_PERMISSIONS` (octal).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup("IPC_MUTEX_BACKEND") {
            cfg.mutex_backend = match v.trim() {
                "shm" => MutexBackend::SharedMemory,
                "sem" => MutexBackend::Semaphore,
                other => {
                    return Err(IpcError::InvalidConfig(format!(
                        "IPC_MUTEX_BACKEND={other}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("IPC_QUEUE_BACKEND") {
            cfg.queue_backend = match v.trim() {
                "shm" => QueueBackend::SharedMemory,
                "posix" => QueueBackend::Posix,
                other => {
                    return Err(IpcError::InvalidConfig(format!(
                        "IPC_QUEUE_BACKEND={other}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("IPC_PERMISSIONS") {
            let perm = u32::from_str_radix(v.trim().trim_start_matches("0o"), 8)
                .map_err(|_| IpcError::InvalidConfig(format!("IPC_PERMISSIONS={v}")))?;
            cfg = cfg.with_permissions(perm)?;
        }
        Ok(cfg)
    }

    pub fn with_mutex_backend(mut self, backend: MutexBackend) -> Self {
        self.mutex_backend = backend;
        self
    }

    pub fn with_queue_backend(mut self, backend: QueueBackend) -> Self {
        self.queue_backend = backend;
        self
    }

    /// Set the permission bits; anything outside `0o777` is rejected.
    pub fn with_permissions(mut self, perm: u32) -> Result<Self> {
        if perm & !0o777 != 0 {
            return Err(IpcError::InvalidPermissions(perm));
        }
        self.permissions = perm;
        Ok(self)
    }

    pub(crate) fn mode_t(&self) -> libc::mode_t {
        self.permissions as libc::mode_t
    }
}
