// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub(crate) mod posix;

#[cfg(unix)]
pub(crate) use posix::{Deadline, NamedSemaphore};

#[cfg(target_os = "linux")]
pub(crate) use posix::KernelQueue;
