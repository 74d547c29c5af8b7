// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named, bounded priority message queue.
//
// Messages are delivered highest priority first and FIFO among equal
// priorities. `send` and `receive` block by default; a handle switched to
// non-blocking mode returns `WouldBlock` instead. A handle can register one
// `Subscription` that is woken once when the queue goes from empty to
// non-empty while no receiver is waiting.

mod shm;
#[cfg(target_os = "linux")]
mod posix;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::{Config, QueueBackend};
use crate::error::{IpcError, Result};
use crate::layout::{self, Describe};
use crate::open_mode::{CreateSemantics, OpenMode};
use crate::platform::Deadline;

pub const DEFAULT_MAX_MESSAGES: usize = 10;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8192;

/// Capacity fixed when a queue is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_messages: usize,
    pub max_message_size: usize,
}

impl QueueLimits {
    pub const fn new(max_messages: usize, max_message_size: usize) -> Self {
        Self {
            max_messages,
            max_message_size,
        }
    }

    fn check(&self) -> Result<()> {
        if self.max_messages == 0 || self.max_message_size == 0 {
            return Err(IpcError::InvalidSize("queue limits must be non-zero"));
        }
        Ok(())
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Snapshot of a queue's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub max_messages: usize,
    pub max_message_size: usize,
    pub current_messages: usize,
}

/// Blocking send/receive of raw messages.
pub trait Messenger {
    /// Enqueue `data` with `priority`.
    fn send(&self, data: &[u8], priority: u32) -> Result<()>;
    /// Dequeue into `buf`, returning `(length, priority)`.
    fn receive(&self, buf: &mut [u8]) -> Result<(usize, u32)>;
}

/// [`Messenger`] with bounded waits.
pub trait TimedMessenger: Messenger {
    fn send_timeout(&self, data: &[u8], priority: u32, timeout: Duration) -> Result<()>;
    fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, u32)>;
}

/// Receiving end of a queue notification.
///
/// Each delivery is counted, so a wake-up that arrives before `wait` is
/// called is not lost. Clones share the same counter.
#[derive(Clone, Default)]
pub struct Subscription {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a notification arrives and consume it.
    pub fn wait(&self) {
        let (lock, cv) = &*self.inner;
        let mut pending = lock.lock();
        while *pending == 0 {
            cv.wait(&mut pending);
        }
        *pending -= 1;
    }

    /// [`Subscription::wait`] bounded by `timeout`; `false` if nothing came.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cv) = &*self.inner;
        let mut pending = lock.lock();
        if *pending == 0 {
            let _ = cv.wait_while_for(&mut pending, |p| *p == 0, timeout);
        }
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }

    /// Consume a pending notification without waiting.
    pub fn try_take(&self) -> bool {
        let mut pending = self.inner.0.lock();
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }

    pub(crate) fn signal(&self) {
        let (lock, cv) = &*self.inner;
        *lock.lock() += 1;
        cv.notify_all();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &*self.inner.0.lock())
            .finish()
    }
}

enum Inner {
    Shared(shm::ShmQueue),
    #[cfg(target_os = "linux")]
    Posix(posix::PosixQueue),
}

/// A named message queue handle.
pub struct MessageQueue {
    name: String,
    inner: Inner,
}

macro_rules! dispatch {
    ($self:ident, $q:ident => $e:expr) => {
        match &$self.inner {
            Inner::Shared($q) => $e,
            #[cfg(target_os = "linux")]
            Inner::Posix($q) => $e,
        }
    };
}

fn check_permissions(perm: u32) -> Result<()> {
    if perm & 0o111 != 0 {
        return Err(IpcError::InvalidPermissions(perm));
    }
    Ok(())
}

impl MessageQueue {
    /// Create (or, with `CREATE_OR_OPEN`, join) a queue with `limits`.
    pub fn create(name: &str, mode: OpenMode, limits: QueueLimits) -> Result<Self> {
        Self::create_with(name, mode, limits, &Config::default())
    }

    pub fn create_with(
        name: &str,
        mode: OpenMode,
        limits: QueueLimits,
        cfg: &Config,
    ) -> Result<Self> {
        let resolved = mode.resolve()?;
        limits.check()?;
        check_permissions(cfg.permissions)?;
        let inner = match cfg.queue_backend {
            QueueBackend::SharedMemory => Inner::Shared(shm::ShmQueue::open(name, resolved, Some(limits), cfg)?),
            #[cfg(target_os = "linux")]
            QueueBackend::Posix => Inner::Posix(posix::PosixQueue::open(name, resolved, Some(limits), cfg)?),
            #[cfg(not(target_os = "linux"))]
            QueueBackend::Posix => {
                return Err(IpcError::Unsupported("POSIX message queues require Linux"))
            }
        };
        debug!(name, backend = ?cfg.queue_backend, ?limits, "opened message queue");
        Ok(Self {
            name: name.to_string(),
            inner,
        })
    }

    /// Open an existing queue; its limits are read from the queue itself.
    /// Only `OPEN_ONLY` is accepted as the create bit.
    pub fn open(name: &str, mode: OpenMode) -> Result<Self> {
        Self::open_with(name, mode, &Config::default())
    }

    pub fn open_with(name: &str, mode: OpenMode, cfg: &Config) -> Result<Self> {
        let resolved = mode.resolve()?;
        if resolved.create != CreateSemantics::OpenExisting {
            return Err(IpcError::InvalidFlags(
                "opening a queue without limits requires OPEN_ONLY",
            ));
        }
        let inner = match cfg.queue_backend {
            QueueBackend::SharedMemory => Inner::Shared(shm::ShmQueue::open(name, resolved, None, cfg)?),
            #[cfg(target_os = "linux")]
            QueueBackend::Posix => Inner::Posix(posix::PosixQueue::open(name, resolved, None, cfg)?),
            #[cfg(not(target_os = "linux"))]
            QueueBackend::Posix => {
                return Err(IpcError::Unsupported("POSIX message queues require Linux"))
            }
        };
        debug!(name, backend = ?cfg.queue_backend, "opened message queue");
        Ok(Self {
            name: name.to_string(),
            inner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of queued messages.
    pub fn cap(&self) -> Result<usize> {
        Ok(self.attrs()?.max_messages)
    }

    pub fn send(&self, data: &[u8], priority: u32) -> Result<()> {
        dispatch!(self, q => q.send(data, priority, None))
    }

    pub fn send_timeout(&self, data: &[u8], priority: u32, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        dispatch!(self, q => q.send(data, priority, Some(&deadline)))
    }

    /// `buf` must hold at least `max_message_size` bytes.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, u32)> {
        dispatch!(self, q => q.receive(buf, None))
    }

    pub fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, u32)> {
        let deadline = Deadline::after(timeout);
        dispatch!(self, q => q.receive(buf, Some(&deadline)))
    }

    pub fn attrs(&self) -> Result<Attributes> {
        dispatch!(self, q => q.attrs())
    }

    /// Switch this handle between blocking and non-blocking mode.
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        dispatch!(self, q => q.set_blocking(blocking))
    }

    pub fn is_blocking(&self) -> Result<bool> {
        dispatch!(self, q => q.is_blocking())
    }

    /// Register `sub` for a one-shot empty → non-empty notification.
    pub fn notify(&self, sub: &Subscription) -> Result<()> {
        dispatch!(self, q => q.notify(sub))
    }

    /// Drop the active subscription, if any.
    pub fn notify_cancel(&self) -> Result<()> {
        dispatch!(self, q => q.notify_cancel())
    }

    /// Transcode and send a flat value.
    pub fn send_value<T: Describe>(&self, value: &T, priority: u32) -> Result<()> {
        let mut buf = vec![0u8; layout::footprint::<T>()?];
        layout::write_into(&mut buf, value)?;
        self.send(&buf, priority)
    }

    /// Receive a message and transcode it back into a `T`.
    pub fn receive_value<T: Describe>(&self) -> Result<(T, u32)> {
        let needed = layout::footprint::<T>()?;
        let mut buf = vec![0u8; self.attrs()?.max_message_size.max(needed)];
        let (len, priority) = self.receive(&mut buf)?;
        if len < needed {
            return Err(IpcError::BufferTooSmall {
                needed,
                actual: len,
            });
        }
        Ok((layout::read_from(&buf[..len])?, priority))
    }

    /// Remove the named queue for every backend. Open handles keep working;
    /// a missing name is not an error.
    pub fn destroy(name: &str) -> Result<()> {
        shm::ShmQueue::destroy(name)?;
        #[cfg(target_os = "linux")]
        posix::PosixQueue::destroy(name)?;
        debug!(name, "destroyed message queue");
        Ok(())
    }
}

impl Messenger for MessageQueue {
    fn send(&self, data: &[u8], priority: u32) -> Result<()> {
        MessageQueue::send(self, data, priority)
    }

    fn receive(&self, buf: &mut [u8]) -> Result<(usize, u32)> {
        MessageQueue::receive(self, buf)
    }
}

impl TimedMessenger for MessageQueue {
    fn send_timeout(&self, data: &[u8], priority: u32, timeout: Duration) -> Result<()> {
        MessageQueue::send_timeout(self, data, priority, timeout)
    }

    fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, u32)> {
        MessageQueue::receive_timeout(self, buf, timeout)
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.inner {
            Inner::Shared(_) => QueueBackend::SharedMemory,
            #[cfg(target_os = "linux")]
            Inner::Posix(_) => QueueBackend::Posix,
        };
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("backend", &backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_must_be_positive() {
        assert!(QueueLimits::new(0, 8).check().is_err());
        assert!(QueueLimits::new(1, 0).check().is_err());
        assert!(QueueLimits::default().check().is_ok());
    }

    #[test]
    fn exec_bits_are_rejected() {
        assert!(check_permissions(0o666).is_ok());
        assert!(matches!(
            check_permissions(0o766),
            Err(IpcError::InvalidPermissions(0o766))
        ));
    }

    #[test]
    fn subscription_counts_deliveries() {
        let sub = Subscription::new();
        assert!(!sub.try_take());
        sub.signal();
        sub.signal();
        assert!(sub.wait_timeout(Duration::from_millis(1)));
        assert!(sub.try_take());
        assert!(!sub.wait_timeout(Duration::from_millis(1)));
    }
}
