// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process reader/writer mutex with writer preference.
//
// State: a writer flag, the number of active readers and the number of
// writers and readers blocked, all guarded by one process-shared monitor.
// A waiting writer blocks new readers, so a steady stream of readers cannot
// starve writers. There is no upgrade from read to write.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{IpcError, Result};
use crate::monitor::{RawCond, RawMonitor};
use crate::open_mode::OpenMode;
use crate::platform::Deadline;
use crate::segment::{Segment, SegmentHeader};
use crate::shm_name;

#[repr(C)]
struct RwState {
    header: SegmentHeader,
    monitor: RawMonitor,
    readers_cv: RawCond,
    writers_cv: RawCond,
    readers: AtomicU32,
    writer: AtomicU32,
    writers_waiting: AtomicU32,
    readers_waiting: AtomicU32,
}

impl RwState {
    fn read_blocked(&self) -> bool {
        self.writer.load(Ordering::Relaxed) != 0 || self.writers_waiting.load(Ordering::Relaxed) > 0
    }

    fn write_blocked(&self) -> bool {
        self.writer.load(Ordering::Relaxed) != 0 || self.readers.load(Ordering::Relaxed) > 0
    }

    /// Wake whoever may proceed now: a writer first, otherwise all readers.
    fn wake(&self) -> Result<()> {
        if self.writers_waiting.load(Ordering::Relaxed) > 0 {
            self.writers_cv.signal()
        } else if self.readers_waiting.load(Ordering::Relaxed) > 0 {
            self.readers_cv.broadcast()
        } else {
            Ok(())
        }
    }
}

/// A named, inter-process reader/writer mutex.
///
/// Always backed by shared memory. Like [`IpcMutex`](crate::IpcMutex), it
/// must be opened with `READ_WRITE`.
pub struct RwMutex {
    name: String,
    seg: Arc<Segment>,
}

impl RwMutex {
    pub fn open(name: &str, mode: OpenMode) -> Result<Self> {
        Self::open_with(name, mode, &Config::default())
    }

    pub fn open_with(name: &str, mode: OpenMode, cfg: &Config) -> Result<Self> {
        let resolved = mode.resolve_sync()?;
        let size = std::mem::size_of::<RwState>();
        let (seg, created) = Segment::acquire(
            &shm_name::state_name("rwm", name),
            resolved.create,
            size,
            size,
            cfg,
            |base| unsafe {
                let st = base as *mut RwState;
                RawMonitor::init(std::ptr::addr_of_mut!((*st).monitor))?;
                RawCond::init(std::ptr::addr_of_mut!((*st).readers_cv))?;
                RawCond::init(std::ptr::addr_of_mut!((*st).writers_cv))
            },
        )?;
        debug!(name, created, "opened rw mutex");
        Ok(Self {
            name: name.to_string(),
            seg,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &RwState {
        unsafe { self.seg.state::<RwState>() }
    }

    // -- readers ------------------------------------------------------------

    /// Acquire shared access, blocking while a writer holds or waits.
    pub fn rlock(&self) -> Result<()> {
        self.acquire_read(None)
    }

    pub fn rlock_timeout(&self, timeout: Duration) -> Result<()> {
        self.acquire_read(Some(&Deadline::after(timeout)))
    }

    pub fn try_rlock(&self) -> Result<bool> {
        let st = self.state();
        let _g = st.monitor.enter()?;
        if st.read_blocked() {
            return Ok(false);
        }
        st.readers.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn acquire_read(&self, deadline: Option<&Deadline>) -> Result<()> {
        let st = self.state();
        let mut g = st.monitor.enter()?;
        while st.read_blocked() {
            st.readers_waiting.fetch_add(1, Ordering::Relaxed);
            let woke = g.wait(&st.readers_cv, deadline);
            st.readers_waiting.fetch_sub(1, Ordering::Relaxed);
            if !woke? && st.read_blocked() {
                return Err(IpcError::Timeout);
            }
        }
        st.readers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release shared access. [`IpcError::NotLocked`] if no reader holds it.
    pub fn runlock(&self) -> Result<()> {
        let st = self.state();
        let _g = st.monitor.enter()?;
        let readers = st.readers.load(Ordering::Relaxed);
        if readers == 0 {
            return Err(IpcError::NotLocked);
        }
        st.readers.store(readers - 1, Ordering::Relaxed);
        if readers == 1 {
            st.wake()?;
        }
        Ok(())
    }

    // -- writers ------------------------------------------------------------

    /// Acquire exclusive access, waiting for active readers to drain.
    pub fn lock(&self) -> Result<()> {
        self.acquire_write(None)
    }

    pub fn lock_timeout(&self, timeout: Duration) -> Result<()> {
        self.acquire_write(Some(&Deadline::after(timeout)))
    }

    pub fn try_lock(&self) -> Result<bool> {
        let st = self.state();
        let _g = st.monitor.enter()?;
        if st.write_blocked() {
            return Ok(false);
        }
        st.writer.store(1, Ordering::Relaxed);
        Ok(true)
    }

    fn acquire_write(&self, deadline: Option<&Deadline>) -> Result<()> {
        let st = self.state();
        let mut g = st.monitor.enter()?;
        while st.write_blocked() {
            st.writers_waiting.fetch_add(1, Ordering::Relaxed);
            let woke = g.wait(&st.writers_cv, deadline);
            let left = st.writers_waiting.fetch_sub(1, Ordering::Relaxed) - 1;
            if !woke? && st.write_blocked() {
                // Readers held back only by this writer may go now.
                if left == 0 && st.writer.load(Ordering::Relaxed) == 0 {
                    st.readers_cv.broadcast()?;
                }
                return Err(IpcError::Timeout);
            }
        }
        st.writer.store(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release exclusive access. [`IpcError::NotLocked`] if no writer holds it.
    pub fn unlock(&self) -> Result<()> {
        let st = self.state();
        let _g = st.monitor.enter()?;
        if st.writer.load(Ordering::Relaxed) == 0 {
            return Err(IpcError::NotLocked);
        }
        st.writer.store(0, Ordering::Relaxed);
        st.wake()
    }

    // -- guards -------------------------------------------------------------

    pub fn read(&self) -> Result<ReadGuard<'_>> {
        self.rlock()?;
        Ok(ReadGuard { lock: self })
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<ReadGuard<'_>> {
        self.rlock_timeout(timeout)?;
        Ok(ReadGuard { lock: self })
    }

    pub fn write(&self) -> Result<WriteGuard<'_>> {
        self.lock()?;
        Ok(WriteGuard { lock: self })
    }

    pub fn write_timeout(&self, timeout: Duration) -> Result<WriteGuard<'_>> {
        self.lock_timeout(timeout)?;
        Ok(WriteGuard { lock: self })
    }

    /// Remove the named lock. A missing name is not an error.
    pub fn destroy(name: &str) -> Result<()> {
        Segment::destroy(&shm_name::state_name("rwm", name))?;
        debug!(name, "destroyed rw mutex");
        Ok(())
    }
}

impl std::fmt::Debug for RwMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwMutex").field("name", &self.name).finish()
    }
}

/// Shared access held until dropped.
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a RwMutex,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.runlock() {
            warn!(name = self.lock.name(), error = %e, "failed to release read guard");
        }
    }
}

/// Exclusive access held until dropped.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a RwMutex,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!(name = self.lock.name(), error = %e, "failed to release write guard");
        }
    }
}
