// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Turns caller-supplied object names into POSIX object names.
// Callers treat names as opaque strings; this is the only place that knows
// about leading slashes and per-platform length limits.

use std::ffi::CString;

use crate::error::{IpcError, Result};

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length of a POSIX object name including the leading '/'.
/// 0 disables shortening.
///
/// macOS limits shm and semaphore names to 31 bytes (`PSHMNAMLEN`).
#[cfg(target_os = "macos")]
pub const NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const NAME_MAX: usize = 255;

/// Produce a POSIX object name (leading '/', no other slash).
///
/// Names longer than [`NAME_MAX`] are shortened to
/// `/<prefix>_<16 hex digits of FNV-1a>`, keeping as much of the original as
/// fits for debuggability.
pub fn posix_name(name: &str) -> Result<String> {
    let body = name.strip_prefix('/').unwrap_or(name);
    if body.is_empty() || body.contains('/') || body.contains('\0') {
        return Err(IpcError::InvalidName(name.to_string()));
    }

    let full = format!("/{body}");
    if NAME_MAX == 0 || full.len() <= NAME_MAX {
        return Ok(full);
    }

    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);
    let mut cut = prefix_len.min(body.len());
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }

    Ok(format!(
        "/{}_{:016x}",
        &body[..cut],
        fnv1a_64(full.as_bytes())
    ))
}

/// [`posix_name`] as a C string ready for `shm_open` and friends.
pub(crate) fn posix_cname(name: &str) -> Result<CString> {
    let n = posix_name(name)?;
    CString::new(n).map_err(|_| IpcError::InvalidName(name.to_string()))
}

/// Name of the shm segment holding the shared state of a lock or queue.
pub(crate) fn state_name(kind: &str, name: &str) -> String {
    format!("{}.{kind}", name.trim_start_matches('/'))
}
