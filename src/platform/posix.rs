// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX system-call layer: shm objects, mappings, process-shared pthread
// objects, named semaphores and (on Linux) kernel message queues.
// Everything above this module works with safe handles and io::Result.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

// ---------------------------------------------------------------------------
// errno helpers
// ---------------------------------------------------------------------------

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Retry `f` while it fails with `EINTR`.
fn cvt_r<F>(mut f: F) -> io::Result<libc::c_int>
where
    F: FnMut() -> libc::c_int,
{
    loop {
        match cvt(f()) {
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            other => return other,
        }
    }
}

fn check_eno(eno: libc::c_int) -> io::Result<()> {
    if eno == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(eno))
    }
}

// ---------------------------------------------------------------------------
// Absolute deadlines
// ---------------------------------------------------------------------------

/// An absolute `CLOCK_REALTIME` deadline, computed once per blocking call so
/// retries after spurious wake-ups do not stretch the total wait.
#[derive(Clone, Copy)]
pub(crate) struct Deadline {
    ts: libc::timespec,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
        let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let secs = (now.tv_sec as u64)
            .saturating_add(timeout.as_secs())
            .saturating_add(nanos / 1_000_000_000)
            .min(libc::time_t::MAX as u64);
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = secs as libc::time_t;
        ts.tv_nsec = (nanos % 1_000_000_000) as _;
        Self { ts }
    }

    pub(crate) fn as_timespec(&self) -> &libc::timespec {
        &self.ts
    }
}

// ---------------------------------------------------------------------------
// Shared memory objects and mappings
// ---------------------------------------------------------------------------

pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

pub(crate) fn shm_open(name: &CStr, oflag: libc::c_int, perm: libc::mode_t) -> io::Result<OwnedFd> {
    let fd = cvt_r(|| unsafe { libc::shm_open(name.as_ptr(), oflag, perm as libc::c_uint) })?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if oflag & libc::O_CREAT != 0 {
        // shm_open applies the umask; mirror the requested bits exactly.
        if let Err(e) = cvt(unsafe { libc::fchmod(fd.as_raw_fd(), perm) }) {
            let _ = shm_unlink(name);
            return Err(e);
        }
    }
    Ok(fd)
}

pub(crate) fn shm_unlink(name: &CStr) -> io::Result<()> {
    cvt(unsafe { libc::shm_unlink(name.as_ptr()) }).map(drop)
}

pub(crate) fn ftruncate(fd: BorrowedFd<'_>, size: u64) -> io::Result<()> {
    let size = libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size overflows off_t"))?;
    cvt_r(|| unsafe { libc::ftruncate(fd.as_raw_fd(), size) }).map(drop)
}

/// `(size, device, inode)` of an open descriptor.
pub(crate) fn fstat(fd: BorrowedFd<'_>) -> io::Result<(u64, u64, u64)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) })?;
    Ok((st.st_size as u64, st.st_dev as u64, st.st_ino as u64))
}

pub(crate) fn mmap(
    fd: BorrowedFd<'_>,
    len: usize,
    offset: u64,
    prot: libc::c_int,
    flags: libc::c_int,
) -> io::Result<*mut u8> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows off_t"))?;
    let mem = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd.as_raw_fd(), offset) };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// # Safety
/// `addr`/`len` must describe a live mapping created by [`mmap`].
pub(crate) unsafe fn munmap(addr: *mut u8, len: usize) -> io::Result<()> {
    cvt(libc::munmap(addr as *mut libc::c_void, len)).map(drop)
}

/// # Safety
/// `addr`/`len` must describe a live mapping created by [`mmap`].
pub(crate) unsafe fn msync(addr: *mut u8, len: usize, asynchronous: bool) -> io::Result<()> {
    let flags = if asynchronous { libc::MS_ASYNC } else { libc::MS_SYNC };
    cvt(libc::msync(addr as *mut libc::c_void, len, flags)).map(drop)
}

// ---------------------------------------------------------------------------
// Process-shared pthread objects
// ---------------------------------------------------------------------------

// Robust mutex symbols are not exposed by `libc` on every platform.
// macOS has no robust mutexes.

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// Initialise a zeroed `pthread_mutex_t` as process-shared (and robust where
/// supported).
///
/// # Safety
/// `mtx` must point to writable memory that no other thread is using.
pub(crate) unsafe fn mutex_init(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    check_eno(libc::pthread_mutexattr_init(&mut attr))?;

    let mut eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    #[cfg(not(target_os = "macos"))]
    if eno == 0 {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
    }
    if eno == 0 {
        eno = libc::pthread_mutex_init(mtx, &attr);
    }
    libc::pthread_mutexattr_destroy(&mut attr);
    check_eno(eno)
}

/// Lock a process-shared mutex, recovering it if the previous owner died.
///
/// # Safety
/// `mtx` must point to a mutex initialised by [`mutex_init`].
pub(crate) unsafe fn mutex_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_lock(mtx);
    match eno {
        0 => Ok(()),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            warn!("previous owner of a shared mutex died; marking it consistent");
            check_eno(pthread_mutex_consistent(mtx))
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `mtx` must point to a mutex initialised by [`mutex_init`] and held by the
/// calling thread.
pub(crate) unsafe fn mutex_unlock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    check_eno(libc::pthread_mutex_unlock(mtx))
}

/// Initialise a zeroed `pthread_cond_t` as process-shared.
///
/// # Safety
/// `cond` must point to writable memory that no other thread is using.
pub(crate) unsafe fn cond_init(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    ptr::write_bytes(cond, 0, 1);

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    check_eno(libc::pthread_condattr_init(&mut attr))?;
    let mut eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno == 0 {
        eno = libc::pthread_cond_init(cond, &attr);
    }
    libc::pthread_condattr_destroy(&mut attr);
    check_eno(eno)
}

/// Wait on `cond` with `mtx` held. Returns `Ok(false)` when the deadline passed.
///
/// # Safety
/// Both objects must be initialised and `mtx` held by the calling thread.
pub(crate) unsafe fn cond_wait(
    cond: *mut libc::pthread_cond_t,
    mtx: *mut libc::pthread_mutex_t,
    deadline: Option<&Deadline>,
) -> io::Result<bool> {
    let eno = match deadline {
        None => libc::pthread_cond_wait(cond, mtx),
        Some(d) => libc::pthread_cond_timedwait(cond, mtx, d.as_timespec()),
    };
    match eno {
        0 => Ok(true),
        libc::ETIMEDOUT => Ok(false),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            warn!("previous owner of a shared mutex died during a wait");
            check_eno(pthread_mutex_consistent(mtx))?;
            Ok(true)
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `cond` must be initialised.
pub(crate) unsafe fn cond_signal(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    check_eno(libc::pthread_cond_signal(cond))
}

/// # Safety
/// `cond` must be initialised.
pub(crate) unsafe fn cond_broadcast(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    check_eno(libc::pthread_cond_broadcast(cond))
}

// ---------------------------------------------------------------------------
// Named semaphores
// ---------------------------------------------------------------------------

pub(crate) struct NamedSemaphore {
    sem: *mut libc::sem_t,
}

// Safety: sem_t operations are thread-safe; the handle is only closed on drop.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// `create` selects `O_CREAT | O_EXCL` with `initial` as the starting count.
    pub(crate) fn open(
        name: &CStr,
        create: bool,
        perm: libc::mode_t,
        initial: u32,
    ) -> io::Result<Self> {
        let oflag = if create { libc::O_CREAT | libc::O_EXCL } else { 0 };
        loop {
            let sem = unsafe {
                libc::sem_open(
                    name.as_ptr(),
                    oflag,
                    perm as libc::c_uint,
                    initial as libc::c_uint,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok(Self { sem });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    pub(crate) fn wait(&self) -> io::Result<()> {
        cvt_r(|| unsafe { libc::sem_wait(self.sem) }).map(drop)
    }

    /// `Ok(false)` if the count was zero.
    pub(crate) fn try_wait(&self) -> io::Result<bool> {
        match cvt_r(|| unsafe { libc::sem_trywait(self.sem) }) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `Ok(false)` once the deadline passes.
    #[cfg(not(target_os = "macos"))]
    pub(crate) fn wait_until(&self, deadline: &Deadline) -> io::Result<bool> {
        match cvt_r(|| unsafe { libc::sem_timedwait(self.sem, deadline.as_timespec()) }) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ETIMEDOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn wait_until(&self, _deadline: &Deadline) -> io::Result<bool> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub(crate) fn post(&self) -> io::Result<()> {
        cvt(unsafe { libc::sem_post(self.sem) }).map(drop)
    }

    /// Current count, `None` where `sem_getvalue` is unavailable.
    #[cfg(not(target_os = "macos"))]
    pub(crate) fn value(&self) -> io::Result<Option<i32>> {
        let mut v: libc::c_int = 0;
        cvt(unsafe { libc::sem_getvalue(self.sem, &mut v) })?;
        Ok(Some(v))
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn value(&self) -> io::Result<Option<i32>> {
        Ok(None)
    }

    pub(crate) fn unlink(name: &CStr) -> io::Result<()> {
        cvt(unsafe { libc::sem_unlink(name.as_ptr()) }).map(drop)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

// ---------------------------------------------------------------------------
// Kernel message queues (Linux)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub(crate) struct KernelQueue {
    mqd: libc::mqd_t,
}

/// Snapshot of `struct mq_attr`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelQueueAttr {
    pub(crate) nonblocking: bool,
    pub(crate) max_messages: usize,
    pub(crate) max_message_size: usize,
    pub(crate) current_messages: usize,
}

/// `struct sigevent` as laid out for `SIGEV_THREAD` by glibc and musl;
/// `libc::sigevent` keeps the callback fields private.
#[cfg(target_os = "linux")]
#[repr(C)]
struct ThreadSigEvent {
    value: libc::sigval,
    signo: libc::c_int,
    notify: libc::c_int,
    function: Option<extern "C" fn(libc::sigval)>,
    attribute: *mut libc::pthread_attr_t,
    _pad: [u8; THREAD_SIGEV_PAD],
}

#[cfg(target_os = "linux")]
const THREAD_SIGEV_PAD: usize = std::mem::size_of::<libc::sigevent>()
    - std::mem::size_of::<libc::sigval>()
    - 2 * std::mem::size_of::<libc::c_int>()
    - 2 * std::mem::size_of::<usize>();

#[cfg(target_os = "linux")]
const _: () = assert!(std::mem::size_of::<ThreadSigEvent>() == std::mem::size_of::<libc::sigevent>());

#[cfg(target_os = "linux")]
impl KernelQueue {
    /// `limits` is only used when creating: `(max_messages, max_message_size)`.
    pub(crate) fn open(
        name: &CStr,
        oflag: libc::c_int,
        perm: libc::mode_t,
        limits: (usize, usize),
    ) -> io::Result<Self> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = limits.0 as _;
        attr.mq_msgsize = limits.1 as _;
        let attr_ptr = if oflag & libc::O_CREAT != 0 {
            &mut attr as *mut libc::mq_attr
        } else {
            ptr::null_mut()
        };
        let mqd = cvt_r(|| unsafe { libc::mq_open(name.as_ptr(), oflag, perm, attr_ptr) })?;
        Ok(Self { mqd })
    }

    pub(crate) fn send(&self, data: &[u8], prio: u32, deadline: Option<&Deadline>) -> io::Result<()> {
        cvt_r(|| unsafe {
            let msg = data.as_ptr() as *const libc::c_char;
            match deadline {
                None => libc::mq_send(self.mqd, msg, data.len(), prio as libc::c_uint),
                Some(d) => libc::mq_timedsend(
                    self.mqd,
                    msg,
                    data.len(),
                    prio as libc::c_uint,
                    d.as_timespec(),
                ),
            }
        })
        .map(drop)
    }

    pub(crate) fn receive(&self, buf: &mut [u8], deadline: Option<&Deadline>) -> io::Result<(usize, u32)> {
        let mut prio: libc::c_uint = 0;
        let mut received = 0isize;
        cvt_r(|| unsafe {
            let msg = buf.as_mut_ptr() as *mut libc::c_char;
            received = match deadline {
                None => libc::mq_receive(self.mqd, msg, buf.len(), &mut prio),
                Some(d) => libc::mq_timedreceive(self.mqd, msg, buf.len(), &mut prio, d.as_timespec()),
            };
            if received < 0 {
                -1
            } else {
                0
            }
        })?;
        Ok((received as usize, prio as u32))
    }

    pub(crate) fn attr(&self) -> io::Result<KernelQueueAttr> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        cvt(unsafe { libc::mq_getattr(self.mqd, &mut attr) })?;
        Ok(KernelQueueAttr {
            nonblocking: attr.mq_flags as libc::c_int & libc::O_NONBLOCK != 0,
            max_messages: attr.mq_maxmsg as usize,
            max_message_size: attr.mq_msgsize as usize,
            current_messages: attr.mq_curmsgs as usize,
        })
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_flags = if nonblocking { libc::O_NONBLOCK as _ } else { 0 };
        cvt(unsafe { libc::mq_setattr(self.mqd, &attr, ptr::null_mut()) }).map(drop)
    }

    /// Have the kernel run `callback(token)` on a new thread the next time
    /// the queue goes from empty to non-empty. One registration per queue;
    /// `EBUSY` while another is active.
    pub(crate) fn notify(&self, callback: extern "C" fn(libc::sigval), token: usize) -> io::Result<()> {
        let mut ev: ThreadSigEvent = unsafe { std::mem::zeroed() };
        ev.value = libc::sigval {
            sival_ptr: token as *mut libc::c_void,
        };
        ev.notify = libc::SIGEV_THREAD;
        ev.function = Some(callback);
        let ev_ptr = &ev as *const ThreadSigEvent as *const libc::sigevent;
        cvt(unsafe { libc::mq_notify(self.mqd, ev_ptr) }).map(drop)
    }

    /// Drop this process's registration, if it still holds one.
    pub(crate) fn notify_cancel(&self) -> io::Result<()> {
        cvt(unsafe { libc::mq_notify(self.mqd, ptr::null()) }).map(drop)
    }

    pub(crate) fn unlink(name: &CStr) -> io::Result<()> {
        cvt(unsafe { libc::mq_unlink(name.as_ptr()) }).map(drop)
    }
}

#[cfg(target_os = "linux")]
impl Drop for KernelQueue {
    fn drop(&mut self) {
        unsafe { libc::mq_close(self.mqd) };
    }
}
