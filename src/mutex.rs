// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex.
//
// Shared-memory backend: a `locked` flag guarded by a robust process-shared
// pthread mutex, with a condition variable for blocked lockers. Keeping the
// ownership flag separate from the pthread mutex lets any handle detect an
// unlock of an unlocked mutex and lets `lock_timeout` use the same wait path
// as `lock`.
//
// Semaphore backend: a named POSIX semaphore with an initial count of one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Config, MutexBackend};
use crate::error::{IpcError, Result};
use crate::monitor::{RawCond, RawMonitor};
use crate::open_mode::{open_or_create, OpenMode};
use crate::platform::{Deadline, NamedSemaphore};
use crate::segment::{Segment, SegmentHeader};
use crate::shm_name;

#[repr(C)]
struct MutexState {
    header: SegmentHeader,
    monitor: RawMonitor,
    released: RawCond,
    locked: AtomicU32,
    waiters: AtomicU32,
}

enum Backend {
    Shared(Arc<Segment>),
    Semaphore(NamedSemaphore),
}

/// A named, inter-process mutex.
///
/// The open mode takes one create bit and `READ_WRITE`; other access bits
/// are rejected. Ownership is not tracked per thread: any handle may unlock a
/// locked mutex.
pub struct IpcMutex {
    name: String,
    inner: Backend,
}

impl IpcMutex {
    /// Open (or create) a named mutex with the default backend.
    pub fn open(name: &str, mode: OpenMode) -> Result<Self> {
        Self::open_with(name, mode, &Config::default())
    }

    pub fn open_with(name: &str, mode: OpenMode, cfg: &Config) -> Result<Self> {
        let resolved = mode.resolve_sync()?;
        let (inner, created) = match cfg.mutex_backend {
            MutexBackend::SharedMemory => {
                let size = std::mem::size_of::<MutexState>();
                let (seg, created) = Segment::acquire(
                    &shm_name::state_name("mtx", name),
                    resolved.create,
                    size,
                    size,
                    cfg,
                    |base| unsafe {
                        let st = base as *mut MutexState;
                        RawMonitor::init(std::ptr::addr_of_mut!((*st).monitor))?;
                        RawCond::init(std::ptr::addr_of_mut!((*st).released))
                    },
                )?;
                (Backend::Shared(seg), created)
            }
            MutexBackend::Semaphore => {
                let cname = shm_name::posix_cname(&shm_name::state_name("sem", name))?;
                let (sem, created) = open_or_create(name, resolved, cfg.race_attempts, |req| {
                    NamedSemaphore::open(&cname, req.create, cfg.mode_t(), 1)
                        .map_err(|e| IpcError::from_os(e, name))
                })?;
                (Backend::Semaphore(sem), created)
            }
        };
        debug!(name, backend = ?cfg.mutex_backend, created, "opened mutex");
        Ok(Self {
            name: name.to_string(),
            inner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(seg: &Segment) -> &MutexState {
        unsafe { seg.state::<MutexState>() }
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> Result<()> {
        self.acquire(None)
    }

    /// Acquire within `timeout` or fail with [`IpcError::Timeout`].
    pub fn lock_timeout(&self, timeout: Duration) -> Result<()> {
        self.acquire(Some(&Deadline::after(timeout)))
    }

    fn acquire(&self, deadline: Option<&Deadline>) -> Result<()> {
        match &self.inner {
            Backend::Shared(seg) => {
                let st = Self::state(seg);
                let mut g = st.monitor.enter()?;
                while st.locked.load(Ordering::Relaxed) != 0 {
                    st.waiters.fetch_add(1, Ordering::Relaxed);
                    let woke = g.wait(&st.released, deadline);
                    st.waiters.fetch_sub(1, Ordering::Relaxed);
                    if !woke? && st.locked.load(Ordering::Relaxed) != 0 {
                        return Err(IpcError::Timeout);
                    }
                }
                st.locked.store(1, Ordering::Relaxed);
                Ok(())
            }
            Backend::Semaphore(sem) => match deadline {
                None => Ok(sem.wait()?),
                Some(d) => {
                    if sem.wait_until(d)? {
                        Ok(())
                    } else {
                        Err(IpcError::Timeout)
                    }
                }
            },
        }
    }

    /// Acquire without blocking. Returns `false` if the mutex is held.
    pub fn try_lock(&self) -> Result<bool> {
        match &self.inner {
            Backend::Shared(seg) => {
                let st = Self::state(seg);
                let _g = st.monitor.enter()?;
                if st.locked.load(Ordering::Relaxed) != 0 {
                    return Ok(false);
                }
                st.locked.store(1, Ordering::Relaxed);
                Ok(true)
            }
            Backend::Semaphore(sem) => Ok(sem.try_wait()?),
        }
    }

    /// Release the mutex. Fails with [`IpcError::NotLocked`] if it is not held.
    pub fn unlock(&self) -> Result<()> {
        match &self.inner {
            Backend::Shared(seg) => {
                let st = Self::state(seg);
                let _g = st.monitor.enter()?;
                if st.locked.load(Ordering::Relaxed) == 0 {
                    return Err(IpcError::NotLocked);
                }
                st.locked.store(0, Ordering::Relaxed);
                if st.waiters.load(Ordering::Relaxed) > 0 {
                    st.released.signal()?;
                }
                Ok(())
            }
            Backend::Semaphore(sem) => {
                // Best effort where sem_getvalue exists; the check and the
                // post are not atomic.
                if let Some(v) = sem.value()? {
                    if v > 0 {
                        return Err(IpcError::NotLocked);
                    }
                }
                Ok(sem.post()?)
            }
        }
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self) -> Result<IpcMutexGuard<'_>> {
        self.lock()?;
        Ok(IpcMutexGuard { mutex: self })
    }

    /// [`IpcMutex::guard`] bounded by `timeout`.
    pub fn guard_timeout(&self, timeout: Duration) -> Result<IpcMutexGuard<'_>> {
        self.lock_timeout(timeout)?;
        Ok(IpcMutexGuard { mutex: self })
    }

    /// Non-blocking [`IpcMutex::guard`]; `None` if the mutex is held.
    pub fn try_guard(&self) -> Result<Option<IpcMutexGuard<'_>>> {
        Ok(self.try_lock()?.then(|| IpcMutexGuard { mutex: self }))
    }

    /// Remove the named mutex for every backend. Open handles keep working;
    /// a missing name is not an error.
    pub fn destroy(name: &str) -> Result<()> {
        Segment::destroy(&shm_name::state_name("mtx", name))?;
        let cname = shm_name::posix_cname(&shm_name::state_name("sem", name))?;
        match NamedSemaphore::unlink(&cname) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) => return Err(IpcError::from_os(e, name)),
        }
        debug!(name, "destroyed mutex");
        Ok(())
    }
}

impl std::fmt::Debug for IpcMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.inner {
            Backend::Shared(_) => MutexBackend::SharedMemory,
            Backend::Semaphore(_) => MutexBackend::Semaphore,
        };
        f.debug_struct("IpcMutex")
            .field("name", &self.name)
            .field("backend", &backend)
            .finish()
    }
}

/// Holds an [`IpcMutex`] until dropped.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct IpcMutexGuard<'a> {
    mutex: &'a IpcMutex,
}

impl IpcMutexGuard<'_> {
    pub fn mutex(&self) -> &IpcMutex {
        self.mutex
    }
}

impl Drop for IpcMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            warn!(name = self.mutex.name(), error = %e, "failed to release mutex guard");
        }
    }
}
