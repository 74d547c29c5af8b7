// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-shared monitor: a robust pthread mutex plus condition variables
// living inside a shm segment. Lock and queue state is only touched while
// a `MonitorGuard` is held.

use std::cell::UnsafeCell;

use tracing::warn;

use crate::error::Result;
use crate::platform::{posix, Deadline};

#[repr(C)]
pub(crate) struct RawMonitor {
    mtx: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: the pthread mutex is process-shared and does its own locking.
unsafe impl Sync for RawMonitor {}

impl RawMonitor {
    /// # Safety
    /// `this` must point into freshly created shared memory that no other
    /// thread or process uses yet.
    pub(crate) unsafe fn init(this: *mut Self) -> Result<()> {
        posix::mutex_init(UnsafeCell::raw_get(std::ptr::addr_of_mut!((*this).mtx)))?;
        Ok(())
    }

    pub(crate) fn enter(&self) -> Result<MonitorGuard<'_>> {
        unsafe { posix::mutex_lock(self.mtx.get()) }?;
        Ok(MonitorGuard { monitor: self })
    }
}

#[repr(C)]
pub(crate) struct RawCond {
    cv: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Sync for RawCond {}

impl RawCond {
    /// # Safety
    /// Same contract as [`RawMonitor::init`].
    pub(crate) unsafe fn init(this: *mut Self) -> Result<()> {
        posix::cond_init(UnsafeCell::raw_get(std::ptr::addr_of_mut!((*this).cv)))?;
        Ok(())
    }

    pub(crate) fn signal(&self) -> Result<()> {
        unsafe { posix::cond_signal(self.cv.get()) }?;
        Ok(())
    }

    pub(crate) fn broadcast(&self) -> Result<()> {
        unsafe { posix::cond_broadcast(self.cv.get()) }?;
        Ok(())
    }
}

/// Proof that the monitor is held; unlocks on drop.
pub(crate) struct MonitorGuard<'a> {
    monitor: &'a RawMonitor,
}

impl MonitorGuard<'_> {
    /// Release the monitor, wait on `cond`, and re-acquire.
    /// Returns `Ok(false)` when `deadline` passed first.
    pub(crate) fn wait(&mut self, cond: &RawCond, deadline: Option<&Deadline>) -> Result<bool> {
        let woke = unsafe { posix::cond_wait(cond.cv.get(), self.monitor.mtx.get(), deadline) }?;
        Ok(woke)
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { posix::mutex_unlock(self.monitor.mtx.get()) } {
            warn!(error = %e, "failed to release shared monitor");
        }
    }
}
