// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Kernel POSIX message queue backend (Linux `mq_*`).
//
// Notifications use `mq_notify` with `SIGEV_THREAD`. The kernel passes back
// an integer token rather than a pointer; the token is looked up in a
// process-wide registry, so a callback that fires after its handle was
// cancelled or dropped finds nothing and does nothing.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Attributes, QueueLimits, Subscription};
use crate::config::Config;
use crate::error::{IpcError, Result};
use crate::open_mode::{open_or_create, Resolved};
use crate::platform::{Deadline, KernelQueue};
use crate::shm_name;

pub(super) struct PosixQueue {
    name: String,
    mq: KernelQueue,
    max_message_size: usize,
    /// Token of the last registration made through this handle.
    armed: Mutex<Option<usize>>,
}

type Registry = Mutex<HashMap<usize, Subscription>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

extern "C" fn on_notify(value: libc::sigval) {
    let token = value.sival_ptr as usize;
    let sub = registry().lock().remove(&token);
    if let Some(sub) = sub {
        trace!(token, "kernel queue became non-empty");
        sub.signal();
    }
}

/// Map the blocking outcomes of `mq_*` onto the crate's error kinds.
fn lift(err: io::Error, name: &str) -> IpcError {
    match err.raw_os_error() {
        Some(libc::EAGAIN) => IpcError::WouldBlock,
        Some(libc::ETIMEDOUT) => IpcError::Timeout,
        _ => IpcError::from_os(err, name),
    }
}

impl PosixQueue {
    pub(super) fn open(
        name: &str,
        resolved: Resolved,
        limits: Option<QueueLimits>,
        cfg: &Config,
    ) -> Result<Self> {
        let cname = shm_name::posix_cname(name)?;
        let create_limits = limits.unwrap_or_default();
        let (mq, created) = open_or_create(name, resolved, cfg.race_attempts, |req| {
            KernelQueue::open(
                &cname,
                req.oflag(),
                cfg.mode_t(),
                (create_limits.max_messages, create_limits.max_message_size),
            )
            .map_err(|e| IpcError::from_os(e, name))
        })?;
        let attr = mq.attr()?;
        let existing = QueueLimits::new(attr.max_messages, attr.max_message_size);
        if let Some(requested) = limits {
            if !created && requested != existing {
                return Err(IpcError::InvalidConfig(format!(
                    "queue {name} exists with {existing:?}, requested {requested:?}"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            mq,
            max_message_size: attr.max_message_size,
            armed: Mutex::new(None),
        })
    }

    pub(super) fn send(&self, data: &[u8], priority: u32, deadline: Option<&Deadline>) -> Result<()> {
        if data.len() > self.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        self.mq
            .send(data, priority, deadline)
            .map_err(|e| lift(e, &self.name))
    }

    pub(super) fn receive(&self, buf: &mut [u8], deadline: Option<&Deadline>) -> Result<(usize, u32)> {
        if buf.len() < self.max_message_size {
            return Err(IpcError::BufferTooSmall {
                needed: self.max_message_size,
                actual: buf.len(),
            });
        }
        self.mq.receive(buf, deadline).map_err(|e| lift(e, &self.name))
    }

    pub(super) fn attrs(&self) -> Result<Attributes> {
        let attr = self.mq.attr()?;
        Ok(Attributes {
            max_messages: attr.max_messages,
            max_message_size: attr.max_message_size,
            current_messages: attr.current_messages,
        })
    }

    pub(super) fn set_blocking(&self, blocking: bool) -> Result<()> {
        Ok(self.mq.set_nonblocking(!blocking)?)
    }

    pub(super) fn is_blocking(&self) -> Result<bool> {
        Ok(!self.mq.attr()?.nonblocking)
    }

    pub(super) fn notify(&self, sub: &Subscription) -> Result<()> {
        let mut armed = self.armed.lock();
        if let Some(token) = *armed {
            if registry().lock().contains_key(&token) {
                return Err(IpcError::AlreadySubscribed);
            }
        }

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        registry().lock().insert(token, sub.clone());
        if let Err(e) = self.mq.notify(on_notify, token) {
            registry().lock().remove(&token);
            return Err(match e.raw_os_error() {
                // Another handle or process holds the queue's registration.
                Some(libc::EBUSY) => IpcError::AlreadySubscribed,
                _ => IpcError::from_os(e, &self.name),
            });
        }
        *armed = Some(token);
        debug!(name = %self.name, "notification armed");
        Ok(())
    }

    pub(super) fn notify_cancel(&self) -> Result<()> {
        let Some(token) = self.armed.lock().take() else {
            return Ok(());
        };
        // Already delivered: the kernel dropped the registration itself.
        if registry().lock().remove(&token).is_none() {
            return Ok(());
        }
        self.mq
            .notify_cancel()
            .map_err(|e| IpcError::from_os(e, &self.name))?;
        debug!(name = %self.name, "notification cancelled");
        Ok(())
    }

    pub(super) fn destroy(name: &str) -> Result<()> {
        let cname = shm_name::posix_cname(name)?;
        match KernelQueue::unlink(&cname) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOSYS)) => Ok(()),
            Err(e) => Err(IpcError::from_os(e, name)),
        }
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        if let Err(e) = self.notify_cancel() {
            warn!(name = %self.name, error = %e, "failed to cancel notification on drop");
        }
    }
}
