// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process IPC primitives for POSIX systems: named shared memory
// regions, process-shared mutex and reader/writer mutex, and a priority
// message queue. Every named object follows the same open-mode negotiation
// and is removed only by an explicit `destroy`.

#[cfg(not(unix))]
compile_error!("ipc-objects supports POSIX systems only");

pub mod config;
pub mod error;
pub mod layout;
pub mod open_mode;
pub mod shm_name;

mod backoff;
mod monitor;
mod platform;
mod segment;

mod shm;
pub use shm::{Mappable, MemoryObject};

mod region;
pub use region::{offset_fixup, MemoryRegion, RegionBytes, RegionMode, RegionReader, RegionWriter};

mod mutex;
pub use mutex::{IpcMutex, IpcMutexGuard};

mod rw_mutex;
pub use rw_mutex::{ReadGuard, RwMutex, WriteGuard};

mod scoped_access;
pub use scoped_access::ScopedAccess;

pub mod mq;
pub use mq::{
    Attributes, MessageQueue, Messenger, QueueLimits, Subscription, TimedMessenger,
    DEFAULT_MAX_MESSAGES, DEFAULT_MAX_MESSAGE_SIZE,
};

pub use config::{Config, MutexBackend, QueueBackend};
pub use error::{IpcError, Result};
pub use layout::{Complex, Describe, Footprint};
pub use open_mode::{open_or_create, AccessSemantics, CreateSemantics, OpenMode, Resolved};
