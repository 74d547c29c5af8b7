// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory queue backend.
//
// Segment layout:
//   QueueHeader | slot 0 | slot 1 | ... | slot max_messages-1
// Every slot is a SlotHeader followed by max_message_size data bytes. All
// fields are read and written with the header monitor held. Each message
// gets a sequence number so equal priorities dequeue in send order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Attributes, QueueLimits, Subscription};
use crate::config::Config;
use crate::error::{IpcError, Result};
use crate::monitor::{RawCond, RawMonitor};
use crate::open_mode::{AccessSemantics, Resolved};
use crate::platform::Deadline;
use crate::segment::{Segment, SegmentHeader};
use crate::shm_name;

#[repr(C)]
struct QueueHeader {
    header: SegmentHeader,
    monitor: RawMonitor,
    not_empty: RawCond,
    not_full: RawCond,
    notify_cv: RawCond,
    // Fixed before the segment is published.
    max_messages: u64,
    max_message_size: u64,
    slot_size: u64,
    current: AtomicU64,
    next_seq: AtomicU64,
    notify_epoch: AtomicU64,
    receivers_waiting: AtomicU32,
    senders_waiting: AtomicU32,
    notify_armed: AtomicU32,
    _reserved: u32,
}

#[repr(C)]
struct SlotHeader {
    used: u32,
    priority: u32,
    len: u64,
    seq: u64,
}

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

const fn slots_offset() -> usize {
    align8(std::mem::size_of::<QueueHeader>())
}

fn slot_size(max_message_size: usize) -> Result<usize> {
    std::mem::size_of::<SlotHeader>()
        .checked_add(max_message_size)
        .map(align8)
        .ok_or(IpcError::InvalidSize("message size overflows"))
}

fn segment_size(limits: &QueueLimits) -> Result<usize> {
    slot_size(limits.max_message_size)?
        .checked_mul(limits.max_messages)
        .and_then(|n| n.checked_add(slots_offset()))
        .ok_or(IpcError::InvalidSize("queue size overflows"))
}

/// Background wait for a notification.
struct Watcher {
    cancel: Arc<AtomicBool>,
    /// Set once the watcher no longer counts as an active subscription.
    done: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub(super) struct ShmQueue {
    name: String,
    seg: Arc<Segment>,
    access: AccessSemantics,
    nonblocking: AtomicBool,
    watcher: Mutex<Option<Watcher>>,
}

impl ShmQueue {
    /// `limits` is `Some` when the caller may create the queue.
    pub(super) fn open(
        name: &str,
        resolved: Resolved,
        limits: Option<QueueLimits>,
        cfg: &Config,
    ) -> Result<Self> {
        let create_limits = limits.unwrap_or_default();
        let size = segment_size(&create_limits)?;
        let slot = slot_size(create_limits.max_message_size)?;
        let (seg, created) = Segment::acquire(
            &shm_name::state_name("mq", name),
            resolved.create,
            size,
            std::mem::size_of::<QueueHeader>(),
            cfg,
            |base| unsafe {
                let h = base as *mut QueueHeader;
                RawMonitor::init(std::ptr::addr_of_mut!((*h).monitor))?;
                RawCond::init(std::ptr::addr_of_mut!((*h).not_empty))?;
                RawCond::init(std::ptr::addr_of_mut!((*h).not_full))?;
                RawCond::init(std::ptr::addr_of_mut!((*h).notify_cv))?;
                (*h).max_messages = create_limits.max_messages as u64;
                (*h).max_message_size = create_limits.max_message_size as u64;
                (*h).slot_size = slot as u64;
                Ok(())
            },
        )?;

        let q = Self {
            name: name.to_string(),
            seg,
            access: resolved.access,
            nonblocking: AtomicBool::new(false),
            watcher: Mutex::new(None),
        };
        if !created {
            let existing = q.limits();
            if q.seg.len() < segment_size(&existing)? {
                return Err(IpcError::InvalidSize("queue segment is truncated"));
            }
            if let Some(requested) = limits {
                if requested != existing {
                    return Err(IpcError::InvalidConfig(format!(
                        "queue {name} exists with {existing:?}, requested {requested:?}"
                    )));
                }
            }
        }
        Ok(q)
    }

    fn header(&self) -> &QueueHeader {
        unsafe { self.seg.state::<QueueHeader>() }
    }

    fn limits(&self) -> QueueLimits {
        let h = self.header();
        QueueLimits::new(h.max_messages as usize, h.max_message_size as usize)
    }

    /// Caller must hold the monitor.
    fn slot(&self, index: usize) -> (*mut SlotHeader, *mut u8) {
        let h = self.header();
        unsafe {
            let p = self
                .seg
                .base()
                .add(slots_offset() + index * h.slot_size as usize);
            (p as *mut SlotHeader, p.add(std::mem::size_of::<SlotHeader>()))
        }
    }

    pub(super) fn send(&self, data: &[u8], priority: u32, deadline: Option<&Deadline>) -> Result<()> {
        if !self.access.can_write() {
            return Err(IpcError::Os(std::io::Error::from_raw_os_error(libc::EBADF)));
        }
        let h = self.header();
        let max = h.max_message_size as usize;
        if data.len() > max {
            return Err(IpcError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }
        let cap = h.max_messages;

        let mut g = h.monitor.enter()?;
        while h.current.load(Ordering::Relaxed) >= cap {
            if self.nonblocking.load(Ordering::Relaxed) {
                return Err(IpcError::WouldBlock);
            }
            h.senders_waiting.fetch_add(1, Ordering::Relaxed);
            let woke = g.wait(&h.not_full, deadline);
            h.senders_waiting.fetch_sub(1, Ordering::Relaxed);
            if !woke? && h.current.load(Ordering::Relaxed) >= cap {
                return Err(IpcError::Timeout);
            }
        }

        let free = (0..cap as usize)
            .find(|&i| unsafe { (*self.slot(i).0).used == 0 })
            .ok_or(IpcError::InvalidSize("queue count and slots disagree"))?;
        let (slot, payload) = self.slot(free);
        let seq = h.next_seq.fetch_add(1, Ordering::Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
            *slot = SlotHeader {
                used: 1,
                priority,
                len: data.len() as u64,
                seq,
            };
        }
        let was_empty = h.current.fetch_add(1, Ordering::Relaxed) == 0;

        if h.receivers_waiting.load(Ordering::Relaxed) > 0 {
            h.not_empty.signal()?;
        } else if was_empty && h.notify_armed.load(Ordering::Relaxed) > 0 {
            h.notify_epoch.fetch_add(1, Ordering::Relaxed);
            h.notify_cv.broadcast()?;
        }
        trace!(name = %self.name, len = data.len(), priority, "enqueued");
        Ok(())
    }

    pub(super) fn receive(&self, buf: &mut [u8], deadline: Option<&Deadline>) -> Result<(usize, u32)> {
        if !self.access.can_read() {
            return Err(IpcError::Os(std::io::Error::from_raw_os_error(libc::EBADF)));
        }
        let h = self.header();
        let max = h.max_message_size as usize;
        if buf.len() < max {
            return Err(IpcError::BufferTooSmall {
                needed: max,
                actual: buf.len(),
            });
        }

        let mut g = h.monitor.enter()?;
        while h.current.load(Ordering::Relaxed) == 0 {
            if self.nonblocking.load(Ordering::Relaxed) {
                return Err(IpcError::WouldBlock);
            }
            h.receivers_waiting.fetch_add(1, Ordering::Relaxed);
            let woke = g.wait(&h.not_empty, deadline);
            h.receivers_waiting.fetch_sub(1, Ordering::Relaxed);
            if !woke? && h.current.load(Ordering::Relaxed) == 0 {
                return Err(IpcError::Timeout);
            }
        }

        // Highest priority, then lowest sequence number.
        let mut best: Option<(usize, u32, u64)> = None;
        for i in 0..h.max_messages as usize {
            let s = unsafe { &*self.slot(i).0 };
            if s.used == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, p, seq)) => s.priority > p || (s.priority == p && s.seq < seq),
            };
            if better {
                best = Some((i, s.priority, s.seq));
            }
        }
        let (index, priority, _) = best.ok_or(IpcError::InvalidSize("queue count and slots disagree"))?;

        let (slot, payload) = self.slot(index);
        let len = unsafe {
            let len = ((*slot).len as usize).min(max);
            std::ptr::copy_nonoverlapping(payload, buf.as_mut_ptr(), len);
            (*slot).used = 0;
            len
        };
        h.current.fetch_sub(1, Ordering::Relaxed);
        if h.senders_waiting.load(Ordering::Relaxed) > 0 {
            h.not_full.signal()?;
        }
        trace!(name = %self.name, len, priority, "dequeued");
        Ok((len, priority))
    }

    pub(super) fn attrs(&self) -> Result<Attributes> {
        let h = self.header();
        let _g = h.monitor.enter()?;
        Ok(Attributes {
            max_messages: h.max_messages as usize,
            max_message_size: h.max_message_size as usize,
            current_messages: h.current.load(Ordering::Relaxed) as usize,
        })
    }

    pub(super) fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.nonblocking.store(!blocking, Ordering::Relaxed);
        Ok(())
    }

    pub(super) fn is_blocking(&self) -> Result<bool> {
        Ok(!self.nonblocking.load(Ordering::Relaxed))
    }

    pub(super) fn notify(&self, sub: &Subscription) -> Result<()> {
        let mut slot = self.watcher.lock();
        if let Some(w) = slot.as_ref() {
            if !w.done.load(Ordering::Acquire) {
                return Err(IpcError::AlreadySubscribed);
            }
        }
        if let Some(done) = slot.take() {
            let _ = done.thread.join();
        }

        let h = self.header();
        let epoch = {
            let _g = h.monitor.enter()?;
            h.notify_armed.fetch_add(1, Ordering::Relaxed);
            h.notify_epoch.load(Ordering::Relaxed)
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let seg = Arc::clone(&self.seg);
        let (flag, finished) = (Arc::clone(&cancel), Arc::clone(&done));
        let sub = sub.clone();
        let name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name("ipc-mq-notify".into())
            .spawn(move || watch(&seg, &flag, &finished, epoch, &sub, &name));
        let thread = match spawned {
            Ok(t) => t,
            Err(e) => {
                let _g = h.monitor.enter()?;
                h.notify_armed.fetch_sub(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        *slot = Some(Watcher {
            cancel,
            done,
            thread,
        });
        debug!(name = %self.name, "notification armed");
        Ok(())
    }

    pub(super) fn notify_cancel(&self) -> Result<()> {
        let Some(w) = self.watcher.lock().take() else {
            return Ok(());
        };
        {
            let h = self.header();
            let _g = h.monitor.enter()?;
            w.cancel.store(true, Ordering::Relaxed);
            h.notify_cv.broadcast()?;
        }
        if w.thread.join().is_err() {
            warn!(name = %self.name, "notification watcher panicked");
        }
        debug!(name = %self.name, "notification cancelled");
        Ok(())
    }

    pub(super) fn destroy(name: &str) -> Result<()> {
        Segment::destroy(&shm_name::state_name("mq", name))
    }
}

/// Wait until a sender bumps the epoch or the watcher is cancelled.
fn watch(
    seg: &Segment,
    cancel: &AtomicBool,
    done: &AtomicBool,
    epoch: u64,
    sub: &Subscription,
    name: &str,
) {
    let h = unsafe { seg.state::<QueueHeader>() };
    let fired = (|| -> Result<bool> {
        let mut g = h.monitor.enter()?;
        let outcome = loop {
            if cancel.load(Ordering::Relaxed) {
                break Ok(false);
            }
            if h.notify_epoch.load(Ordering::Relaxed) != epoch {
                break Ok(true);
            }
            if let Err(e) = g.wait(&h.notify_cv, None) {
                break Err(e);
            }
        };
        h.notify_armed.fetch_sub(1, Ordering::Relaxed);
        outcome
    })();
    done.store(true, Ordering::Release);
    match fired {
        Ok(true) => {
            trace!(name, "queue became non-empty");
            sub.signal();
        }
        Ok(false) => {}
        Err(e) => warn!(name, error = %e, "notification watcher failed"),
    }
}

impl Drop for ShmQueue {
    fn drop(&mut self) {
        if let Err(e) = self.notify_cancel() {
            warn!(name = %self.name, error = %e, "failed to cancel notification on drop");
        }
    }
}
