// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Message queue throughput demo.
//
// Usage:
//   demo_msg_que s    (sender: random-sized messages, random priorities)
//   demo_msg_que r    (receiver)
//
// Both sides print throughput once per second. Ctrl-C stops either side;
// the receiver destroys the queue on exit. The backend follows
// IPC_QUEUE_BACKEND (`shm` or `posix`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use ipc_objects::{Config, IpcError, MessageQueue, OpenMode, QueueLimits};

const QUEUE_NAME: &str = "ipc-msg-que";
const MIN_SZ: usize = 128;
const MAX_SZ: usize = 1024 * 8;
const LIMITS: QueueLimits = QueueLimits::new(10, MAX_SZ);
const POLL: Duration = Duration::from_millis(200);

fn str_of_size(sz: usize) -> String {
    if sz > 1024 * 1024 {
        format!("{} MB", sz / (1024 * 1024))
    } else if sz > 1024 {
        format!("{} KB", sz / 1024)
    } else {
        format!("{sz} bytes")
    }
}

fn counting_thread(quit: Arc<AtomicBool>, counter: Arc<AtomicUsize>) {
    let mut i = 1usize;
    while !quit.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
        i += 1;
        if i % 10 != 0 {
            continue;
        }
        i = 0;
        let bytes = counter.swap(0, Ordering::Relaxed);
        println!("{}/s", str_of_size(bytes));
    }
}

fn open_queue(cfg: &Config) -> ipc_objects::Result<MessageQueue> {
    MessageQueue::create_with(
        QUEUE_NAME,
        OpenMode::CREATE_OR_OPEN | OpenMode::READ_WRITE,
        LIMITS,
        cfg,
    )
}

fn do_send(quit: Arc<AtomicBool>, cfg: &Config) -> ipc_objects::Result<()> {
    println!(
        "do_send: start [{} - {}]...",
        str_of_size(MIN_SZ),
        str_of_size(MAX_SZ)
    );
    let que = open_queue(cfg)?;
    let counter = Arc::new(AtomicUsize::new(0));
    let counting = {
        let (q, c) = (Arc::clone(&quit), Arc::clone(&counter));
        thread::spawn(move || counting_thread(q, c))
    };

    // LCG for pseudo-random sizes and priorities.
    let mut rng_state: u64 = 0xdeadbeef_cafebabe;
    let buf = vec![0u8; MAX_SZ];

    while !quit.load(Ordering::Acquire) {
        rng_state = rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let sz = MIN_SZ + (rng_state >> 32) as usize % (MAX_SZ - MIN_SZ + 1);
        let prio = (rng_state >> 16) as u32 % 4;

        match que.send_timeout(&buf[..sz], prio, POLL) {
            Ok(()) => {
                counter.fetch_add(sz, Ordering::Relaxed);
            }
            Err(IpcError::Timeout) => continue,
            Err(e) => {
                quit.store(true, Ordering::Release);
                let _ = counting.join();
                return Err(e);
            }
        }
    }

    let _ = counting.join();
    println!("do_send: quit...");
    Ok(())
}

fn do_recv(quit: Arc<AtomicBool>, cfg: &Config) -> ipc_objects::Result<()> {
    println!(
        "do_recv: start [{} - {}]...",
        str_of_size(MIN_SZ),
        str_of_size(MAX_SZ)
    );
    let que = open_queue(cfg)?;
    let counter = Arc::new(AtomicUsize::new(0));
    let counting = {
        let (q, c) = (Arc::clone(&quit), Arc::clone(&counter));
        thread::spawn(move || counting_thread(q, c))
    };

    let mut buf = vec![0u8; que.attrs()?.max_message_size];
    let result = loop {
        if quit.load(Ordering::Acquire) {
            break Ok(());
        }
        match que.receive_timeout(&mut buf, POLL) {
            Ok((len, _prio)) => {
                counter.fetch_add(len, Ordering::Relaxed);
            }
            Err(IpcError::Timeout) => {}
            Err(e) => break Err(e),
        }
    };

    quit.store(true, Ordering::Release);
    let _ = counting.join();
    MessageQueue::destroy(QUEUE_NAME)?;
    println!("do_recv: quit...");
    result
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_msg_que s|r");
        std::process::exit(1);
    }

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("bad configuration: {e}");
            std::process::exit(1);
        }
    };

    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = Arc::clone(&quit);
        on_shutdown_signal(move || q.store(true, Ordering::Release));
    }

    let result = match args[1].as_str() {
        "s" => do_send(quit, &cfg),
        "r" => do_recv(quit, &cfg),
        other => {
            eprintln!("unknown mode: {other}  (use 's' or 'r')");
            std::process::exit(1);
        }
    };
    if let Err(e) = result {
        eprintln!("demo_msg_que: {e}");
        std::process::exit(1);
    }
}

fn on_shutdown_signal(f: impl Fn() + Send + Sync + 'static) {
    static CB: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = CB.set(Box::new(f));
    extern "C" fn handler(_: libc::c_int) {
        if let Some(cb) = CB.get() {
            cb();
        }
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handler as *const () as libc::sighandler_t);
    }
}
