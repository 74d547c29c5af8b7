// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared state segments for locks and queues.
//
// The creator of a segment sizes it, initialises the pthread objects inside
// and finally publishes READY in the header. Openers wait for READY before
// touching anything else, bounded by `Config::init_timeout`.
//
// All handles in one process that refer to the same segment share a single
// mapping. Some pthread implementations (macOS) keep address-relative state
// inside a mutex, so a second mapping of the same pages at another address
// would break it. The cache is keyed by (device, inode) and looked up after
// the OS-level open, so destroy-and-recreate is never confused with reuse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backoff::poll_until;
use crate::config::Config;
use crate::error::{IpcError, Result};
use crate::open_mode::{open_or_create, AccessSemantics, CreateSemantics, Resolved};
use crate::region::{MemoryRegion, RegionMode};
use crate::shm::MemoryObject;

const READY: u32 = 0x5245_4459;

/// First field of every shared state struct.
#[repr(C)]
pub(crate) struct SegmentHeader {
    state: AtomicU32,
    _reserved: u32,
}

pub(crate) struct Segment {
    name: String,
    region: MemoryRegion,
    base: *mut u8,
}

// Safety: `base` points into `region`, which lives as long as the segment;
// everything stored there is synchronised by the process-shared monitor.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

type Cache = Mutex<HashMap<(u64, u64), Weak<Segment>>>;

fn cache() -> &'static Cache {
    static CACHE: OnceLock<Cache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Segment {
    /// Create and/or open the segment `name`.
    ///
    /// `create_size` is used when this call creates it; an opened segment
    /// must be at least `min_size` bytes. `init` receives the zeroed segment
    /// base and runs before any other process can observe the state.
    /// Returns the segment and whether this call created it.
    pub(crate) fn acquire<F>(
        name: &str,
        create: CreateSemantics,
        create_size: usize,
        min_size: usize,
        cfg: &Config,
        init: F,
    ) -> Result<(Arc<Segment>, bool)>
    where
        F: FnOnce(*mut u8) -> Result<()>,
    {
        let resolved = Resolved {
            create,
            access: AccessSemantics::ReadWrite,
        };
        // Held across create and init so no other thread here sees a
        // half-built segment.
        let mut map = cache().lock();
        let (obj, created) = open_or_create(name, resolved, cfg.race_attempts, |req| {
            MemoryObject::open_request(name, req, cfg)
        })?;

        if created {
            let seg = match Self::initialise(name, &obj, create_size, init) {
                Ok(seg) => Arc::new(seg),
                Err(e) => {
                    let _ = MemoryObject::destroy(name);
                    return Err(e);
                }
            };
            map.retain(|_, w| w.strong_count() > 0);
            map.insert(obj.identity()?, Arc::downgrade(&seg));
            debug!(name, size = create_size, "created shared segment");
            return Ok((seg, true));
        }

        let key = obj.identity()?;
        if let Some(seg) = map.get(&key).and_then(Weak::upgrade) {
            trace!(name, "reusing mapped segment");
            return Ok((seg, false));
        }

        // Waiting for another process's creator must not stall opens of
        // unrelated names here.
        drop(map);
        let attached = Self::attach(name, &obj, min_size, cfg)?;

        let mut map = cache().lock();
        if let Some(seg) = map.get(&key).and_then(Weak::upgrade) {
            // Another thread attached meanwhile; keep a single mapping.
            trace!(name, "reusing mapped segment");
            return Ok((seg, false));
        }
        let seg = Arc::new(attached);
        map.retain(|_, w| w.strong_count() > 0);
        map.insert(key, Arc::downgrade(&seg));
        debug!(name, len = seg.len(), "attached shared segment");
        Ok((seg, false))
    }

    fn initialise<F>(name: &str, obj: &MemoryObject, size: usize, init: F) -> Result<Self>
    where
        F: FnOnce(*mut u8) -> Result<()>,
    {
        obj.truncate(size as u64)?;
        let region = MemoryRegion::map(obj, RegionMode::ReadWrite, 0, size)?;
        let base = region.with_ptr(|p| p)?;
        init(base)?;
        let seg = Self {
            name: name.to_string(),
            region,
            base,
        };
        seg.header().state.store(READY, Ordering::Release);
        Ok(seg)
    }

    fn attach(name: &str, obj: &MemoryObject, min_size: usize, cfg: &Config) -> Result<Self> {
        // The creator may not have sized the object yet.
        let len = poll_until(cfg.init_timeout, || match obj.len() {
            Ok(0) => None,
            other => Some(other),
        })
        .ok_or_else(|| IpcError::TransientRace {
            name: name.to_string(),
            attempts: 0,
        })??;
        let len = usize::try_from(len).map_err(|_| IpcError::InvalidSize("segment too large"))?;
        if len < min_size {
            return Err(IpcError::InvalidSize("segment smaller than its header"));
        }

        let region = MemoryRegion::map(obj, RegionMode::ReadWrite, 0, len)?;
        let base = region.with_ptr(|p| p)?;
        let seg = Self {
            name: name.to_string(),
            region,
            base,
        };
        poll_until(cfg.init_timeout, || {
            (seg.header().state.load(Ordering::Acquire) == READY).then_some(())
        })
        .ok_or_else(|| IpcError::TransientRace {
            name: name.to_string(),
            attempts: 0,
        })?;
        Ok(seg)
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.region.len()
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    /// View the start of the segment as `T`.
    ///
    /// # Safety
    /// `T` must be the `#[repr(C)]` state type the segment was initialised
    /// with, starting with a [`SegmentHeader`].
    pub(crate) unsafe fn state<T>(&self) -> &T {
        debug_assert!(std::mem::size_of::<T>() <= self.len());
        &*(self.base as *const T)
    }

    /// Unlink the segment's name. Mappings stay valid.
    pub(crate) fn destroy(name: &str) -> Result<()> {
        MemoryObject::destroy(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_mode::OpenMode;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    #[repr(C)]
    struct Counter {
        header: SegmentHeader,
        value: AtomicU64,
    }

    fn unique(tag: &str) -> String {
        format!("seg_unit_{tag}_{}", std::process::id())
    }

    #[test]
    fn second_acquire_reuses_the_mapping() {
        let name = unique("reuse");
        let _ = Segment::destroy(&name);
        let size = std::mem::size_of::<Counter>();
        let cfg = Config::default();

        let (a, created) = Segment::acquire(&name, CreateSemantics::CreateOrOpen, size, size, &cfg, |base| {
            unsafe { (*(base as *mut Counter)).value.store(7, Ordering::Relaxed) };
            Ok(())
        })
        .unwrap();
        assert!(created);

        let (b, created) =
            Segment::acquire(&name, CreateSemantics::OpenExisting, size, size, &cfg, |_| Ok(())).unwrap();
        assert!(!created);
        assert_eq!(a.base(), b.base());
        assert_eq!(unsafe { b.state::<Counter>() }.value.load(Ordering::Relaxed), 7);

        Segment::destroy(&name).unwrap();
    }

    #[test]
    fn failed_init_unlinks() {
        let name = unique("fail");
        let _ = Segment::destroy(&name);
        let cfg = Config::default();
        let err = Segment::acquire(&name, CreateSemantics::CreateExclusive, 64, 8, &cfg, |_| {
            Err(IpcError::InvalidSize("boom"))
        })
        .unwrap_err();
        assert!(matches!(err, IpcError::InvalidSize("boom")));
        let err = Segment::acquire(&name, CreateSemantics::OpenExisting, 64, 8, &cfg, |_| Ok(()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn waiting_for_a_creator_does_not_block_other_opens() {
        let stalled = unique("stalled");
        let other = unique("other");
        let _ = Segment::destroy(&stalled);
        let _ = Segment::destroy(&other);
        // Sized but never published, like a creator that died mid-init.
        let obj = MemoryObject::create(&stalled, OpenMode::CREATE_ONLY | OpenMode::READ_WRITE, 64).unwrap();
        let cfg = Config {
            init_timeout: Duration::from_millis(600),
            ..Config::default()
        };

        let waiter = {
            let (name, cfg) = (stalled.clone(), cfg.clone());
            std::thread::spawn(move || {
                Segment::acquire(&name, CreateSemantics::OpenExisting, 64, 8, &cfg, |_| Ok(())).map(drop)
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let size = std::mem::size_of::<Counter>();
        let start = Instant::now();
        let (_seg, created) =
            Segment::acquire(&other, CreateSemantics::CreateExclusive, size, size, &cfg, |_| Ok(())).unwrap();
        assert!(created);
        assert!(start.elapsed() < Duration::from_millis(300), "{:?}", start.elapsed());

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, IpcError::TransientRace { .. }));
        drop(obj);
        Segment::destroy(&stalled).unwrap();
        Segment::destroy(&other).unwrap();
    }
}
