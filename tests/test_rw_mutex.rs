// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process reader/writer mutex.

mod common;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{init_tracing, unique_name};
use ipc_objects::{IpcError, OpenMode, RwMutex};

fn open_fresh(prefix: &str) -> (String, RwMutex) {
    init_tracing();
    let name = unique_name(prefix);
    RwMutex::destroy(&name).expect("destroy");
    let lock = RwMutex::open(&name, OpenMode::CREATE_OR_OPEN | OpenMode::READ_WRITE).expect("open");
    (name, lock)
}

#[test]
fn readers_share() {
    let (name, lock) = open_fresh("rw_share");
    lock.rlock().unwrap();
    assert!(lock.try_rlock().unwrap());
    assert!(!lock.try_lock().unwrap());
    lock.runlock().unwrap();
    lock.runlock().unwrap();
    assert!(lock.try_lock().unwrap());
    lock.unlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn readers_on_many_threads_hold_at_once() {
    const READERS: usize = 4;
    let (name, lock) = open_fresh("rw_many_readers");
    let lock = Arc::new(lock);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let (lock, inside, peak) = (Arc::clone(&lock), Arc::clone(&inside), Arc::clone(&peak));
            thread::spawn(move || {
                let lock = RwMutex::open(lock.name(), OpenMode::OPEN_ONLY | OpenMode::READ_WRITE).unwrap();
                let _g = lock.read().unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Stay inside until every reader has arrived, or give up.
                let start = Instant::now();
                while inside.load(Ordering::SeqCst) < READERS && start.elapsed() < Duration::from_secs(5) {
                    thread::sleep(Duration::from_millis(1));
                }
                inside.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), READERS);
    assert!(lock.try_lock().unwrap());
    lock.unlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn writer_excludes_everyone() {
    let (name, lock) = open_fresh("rw_excl");
    lock.lock().unwrap();
    assert!(!lock.try_rlock().unwrap());
    assert!(!lock.try_lock().unwrap());
    assert!(lock.rlock_timeout(Duration::from_millis(20)).unwrap_err().is_timeout());
    assert!(lock.lock_timeout(Duration::from_millis(20)).unwrap_err().is_timeout());
    lock.unlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn misuse_is_not_locked() {
    let (name, lock) = open_fresh("rw_misuse");
    assert!(matches!(lock.runlock(), Err(IpcError::NotLocked)));
    assert!(matches!(lock.unlock(), Err(IpcError::NotLocked)));
    lock.rlock().unwrap();
    // A read hold is not a write hold.
    assert!(matches!(lock.unlock(), Err(IpcError::NotLocked)));
    lock.runlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn open_mode_needs_one_create_bit_and_read_write() {
    init_tracing();
    let name = unique_name("rw_flags");
    RwMutex::destroy(&name).unwrap();
    for mode in [
        OpenMode::CREATE_OR_OPEN,
        OpenMode::CREATE_OR_OPEN | OpenMode::READ_ONLY,
        OpenMode::OPEN_ONLY | OpenMode::READ_ONLY | OpenMode::READ_WRITE,
    ] {
        let err = RwMutex::open(&name, mode).unwrap_err();
        assert!(matches!(err, IpcError::InvalidFlags(_)), "{mode:?}: {err}");
    }
    let lock = RwMutex::open(&name, OpenMode::CREATE_OR_OPEN | OpenMode::READ_WRITE).unwrap();
    lock.rlock().unwrap();
    lock.runlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn destroy_then_open_is_not_found() {
    let (name, _lock) = open_fresh("rw_destroy");
    RwMutex::destroy(&name).unwrap();
    assert!(RwMutex::open(&name, OpenMode::OPEN_ONLY | OpenMode::READ_WRITE).unwrap_err().is_not_found());
}

#[test]
fn waiting_writer_blocks_new_readers() {
    let (name, lock) = open_fresh("rw_pref");
    let lock = Arc::new(lock);
    lock.rlock().unwrap();

    let writer_in = Arc::new(AtomicBool::new(false));
    let l2 = Arc::clone(&lock);
    let w2 = Arc::clone(&writer_in);
    let writer = thread::spawn(move || {
        l2.lock().unwrap();
        w2.store(true, Ordering::SeqCst);
        l2.unlock().unwrap();
    });

    // Give the writer time to queue up behind the reader.
    thread::sleep(Duration::from_millis(50));
    assert!(!lock.try_rlock().unwrap(), "new reader must wait for the queued writer");
    assert!(!writer_in.load(Ordering::SeqCst));

    lock.runlock().unwrap();
    writer.join().unwrap();
    assert!(writer_in.load(Ordering::SeqCst));
    assert!(lock.try_rlock().unwrap());
    lock.runlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn timed_out_writer_releases_readers() {
    let (name, lock) = open_fresh("rw_timeout_release");
    let lock = Arc::new(lock);
    lock.rlock().unwrap();

    let l2 = Arc::clone(&lock);
    let writer = thread::spawn(move || l2.lock_timeout(Duration::from_millis(50)));
    thread::sleep(Duration::from_millis(10));

    let l3 = Arc::clone(&lock);
    let reader = thread::spawn(move || {
        l3.rlock().unwrap();
        l3.runlock().unwrap();
    });

    assert!(writer.join().unwrap().unwrap_err().is_timeout());
    reader.join().unwrap();
    lock.runlock().unwrap();
    RwMutex::destroy(&name).unwrap();
}

#[test]
fn readers_and_writers_never_overlap() {
    let (name, _creator) = open_fresh("rw_stress");
    let active_readers = Arc::new(AtomicI32::new(0));
    let active_writers = Arc::new(AtomicI32::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for id in 0..8 {
        let name = name.clone();
        let readers = Arc::clone(&active_readers);
        let writers = Arc::clone(&active_writers);
        let writes = Arc::clone(&writes);
        handles.push(thread::spawn(move || {
            let lock = RwMutex::open(&name, OpenMode::OPEN_ONLY | OpenMode::READ_WRITE).unwrap();
            for _ in 0..200 {
                if id % 4 == 0 {
                    let _g = lock.write().unwrap();
                    assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(readers.load(Ordering::SeqCst), 0);
                    writes.fetch_add(1, Ordering::Relaxed);
                    writers.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let _g = lock.read().unwrap();
                    readers.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(writers.load(Ordering::SeqCst), 0);
                    readers.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(writes.load(Ordering::Relaxed), 2 * 200);
    RwMutex::destroy(&name).unwrap();
}
