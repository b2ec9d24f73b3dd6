//! Syscall interception
//!
//! Blocking-style wrappers over the POSIX I/O and sleep primitives. Each
//! wrapper looks like the call it replaces, but on a reactor worker it
//! issues the underlying call non-blockingly, parks the calling fiber on
//! readiness (or a timer), and resumes where it left off — the worker
//! thread meanwhile runs other fibers.
//!
//! Every wrapper delegates straight to libc when hooking is disabled for
//! the thread, when the fd is not a managed socket, when the application
//! itself asked for non-blocking behavior, or when there is no reactor on
//! this thread. Failure semantics are the underlying primitive's: results
//! and errno pass through untouched, with two additions — a lapsed
//! per-direction timeout yields `-1`/`ETIMEDOUT`, and a failed event
//! registration yields `-1`/`EBADF`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strand_core::is_hook_enable;
use strand_core::os::{errno, set_errno};
use strand_runtime::{config, Fiber, Scheduler, Task};

use crate::fd_table::{fd_table, TimeoutKind};
use crate::reactor::{Event, IoManager};

// ── Sleeps ──────────────────────────────────────────────────────────

/// Hooked `sleep(3)`: parks the fiber on a timer instead of the thread
pub fn sleep(seconds: u32) -> u32 {
    if !is_hook_enable() {
        return unsafe { libc::sleep(seconds) };
    }
    match IoManager::current() {
        Some(iom) => {
            sleep_ms(&iom, seconds as u64 * 1000);
            0
        }
        None => unsafe { libc::sleep(seconds) },
    }
}

/// Hooked `usleep(3)`
pub fn usleep(usec: u64) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::usleep(usec as libc::useconds_t) };
    }
    match IoManager::current() {
        Some(iom) => {
            sleep_ms(&iom, usec / 1000);
            0
        }
        None => unsafe { libc::usleep(usec as libc::useconds_t) },
    }
}

/// Hooked `nanosleep(2)`. The remainder argument is never filled in: a
/// fiber sleep is not interruptible by signals.
pub fn nanosleep(req: &libc::timespec) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::nanosleep(req, std::ptr::null_mut()) };
    }
    match IoManager::current() {
        Some(iom) => {
            let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
            sleep_ms(&iom, ms);
            0
        }
        None => unsafe { libc::nanosleep(req, std::ptr::null_mut()) },
    }
}

/// Park the current fiber for `ms`; a one-shot timer re-enqueues it
fn sleep_ms(iom: &Arc<IoManager>, ms: u64) {
    let fiber = Fiber::current();
    let sched = Scheduler::current().expect("sleep hook outside a scheduler thread");
    iom.add_timer(
        ms,
        move || {
            sched.schedule(Task::from_fiber(fiber.clone()));
        },
        false,
    );
    Fiber::yield_to_hold();
}

// ── Generic I/O wait loop ───────────────────────────────────────────

/// Run one hooked I/O primitive to completion.
///
/// Loops over: optional condition timer → underlying non-blocking call →
/// on would-block, arm the direction and park. A timer fire cancels the
/// armed event, which wakes the fiber; the shared flag tells it why.
fn do_io<F>(fd: i32, name: &'static str, event: Event, timeout_kind: TimeoutKind, mut io_call: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enable() {
        return io_call();
    }
    let Some(info) = fd_table().get(fd, false) else {
        return io_call();
    };
    if info.is_closed() || !info.is_socket() || info.user_nonblock() {
        return io_call();
    }
    let Some(iom) = IoManager::current() else {
        return io_call();
    };

    let timeout = info.timeout(timeout_kind);
    // Weak: the timer must not keep the fiber alive, and must not fire
    // into a fiber that already went away.
    let waiter = Arc::downgrade(&Fiber::current());

    loop {
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = if timeout != u64::MAX {
            let flag = timed_out.clone();
            let target = Arc::downgrade(&iom);
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    flag.store(true, Ordering::Release);
                    if let Some(iom) = target.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                waiter.clone(),
                false,
            ))
        } else {
            None
        };

        let rt = io_call();
        if rt != -1 || (errno() != libc::EAGAIN && errno() != libc::EINTR) {
            // Done, or a definitive error the caller must see
            if let Some(t) = &timer {
                t.cancel();
            }
            return rt;
        }

        // Would-block: wait for this direction to become ready
        if let Err(e) = iom.add_event(fd, event, None) {
            tracing::error!(fd, call = name, error = %e, "event registration failed");
            if let Some(t) = &timer {
                t.cancel();
            }
            set_errno(libc::EBADF);
            return -1;
        }

        Fiber::yield_to_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        if timed_out.load(Ordering::Acquire) {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
        // Woken by readiness (or an explicit cancel): try again
    }
}

// ── Read side ───────────────────────────────────────────────────────

pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::read(fd, ptr, len) as isize
    })
}

pub fn readv(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::readv(fd, iov, iovcnt) as isize
    })
}

pub fn recv(fd: i32, buf: &mut [u8], flags: i32) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::recv(fd, ptr, len, flags) as isize
    })
}

pub fn recvfrom(
    fd: i32,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::recvfrom(fd, ptr, len, flags, src_addr, addrlen) as isize
    })
}

pub fn recvmsg(fd: i32, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::recvmsg(fd, msg, flags) as isize
    })
}

// ── Write side ──────────────────────────────────────────────────────

pub fn write(fd: i32, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::write(fd, ptr, len) as isize
    })
}

pub fn writev(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::writev(fd, iov, iovcnt) as isize
    })
}

pub fn send(fd: i32, buf: &[u8], flags: i32) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::send(fd, ptr, len, flags) as isize
    })
}

pub fn sendto(
    fd: i32,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::sendto(fd, ptr, len, flags, dest_addr, addrlen) as isize
    })
}

pub fn sendmsg(fd: i32, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::sendmsg(fd, msg, flags) as isize
    })
}

// ── Connections ─────────────────────────────────────────────────────

/// Hooked `connect(2)` with the configured default timeout
pub fn connect(fd: i32, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, config::tcp_connect_timeout_ms())
}

/// Hooked `connect(2)` with an explicit timeout in milliseconds
pub fn connect_with_timeout(
    fd: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(info) = fd_table().get(fd, true) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if !info.is_init() || info.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !info.is_socket() || info.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { libc::connect(fd, addr, addrlen) };
    };

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: wait for writability, bounded by the timeout
    let timed_out = Arc::new(AtomicBool::new(false));
    let waiter = Arc::downgrade(&Fiber::current());
    let timer = if timeout_ms != u64::MAX {
        let flag = timed_out.clone();
        let target = Arc::downgrade(&iom);
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                flag.store(true, Ordering::Release);
                if let Some(iom) = target.upgrade() {
                    iom.cancel_event(fd, Event::WRITE);
                }
            },
            waiter,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(t) = &timer {
                t.cancel();
            }
            if timed_out.load(Ordering::Acquire) {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            tracing::error!(fd, error = %e, "connect: event registration failed");
            set_errno(libc::EBADF);
            return -1;
        }
    }

    // The socket is writable; the verdict is in SO_ERROR
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    } == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// Hooked `accept(2)`; the accepted fd is registered in the fd table
pub fn accept(fd: i32, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> i32 {
    let rt = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if rt >= 0 {
        fd_table().get(rt as i32, true);
    }
    rt as i32
}

// ── Lifecycle and metadata ──────────────────────────────────────────

/// Hooked `socket(2)`; the new fd is registered in the fd table
pub fn socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if is_hook_enable() && fd >= 0 {
        fd_table().get(fd, true);
    }
    fd
}

/// Hooked `close(2)`: cancels pending waits and clears the fd entry
pub fn close(fd: i32) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::close(fd) };
    }
    if let Some(info) = fd_table().get(fd, false) {
        info.mark_closed();
        if info.is_socket() {
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
        }
        fd_table().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl(2)` for the int-argument commands.
///
/// `F_SETFL` records the application's O_NONBLOCK wish but always keeps
/// the OS-level flag set for managed sockets; `F_GETFL` reports the
/// application's view.
pub fn fcntl(fd: i32, cmd: i32, arg: libc::c_long) -> i32 {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as i32;
            if let Some(info) = fd_table().get(fd, false) {
                if !info.is_closed() && info.is_socket() {
                    info.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if info.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                }
            }
            unsafe { libc::fcntl(fd, cmd, flags) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            let Some(info) = fd_table().get(fd, false) else {
                return flags;
            };
            if info.is_closed() || !info.is_socket() {
                return flags;
            }
            if info.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl(2)`: FIONBIO updates the application's non-blocking wish
pub fn ioctl(fd: i32, request: libc::c_ulong, arg: *mut libc::c_void) -> i32 {
    if is_hook_enable() && request == libc::FIONBIO {
        if let Some(info) = fd_table().get(fd, false) {
            if !info.is_closed() && info.is_socket() {
                let user_nonblock = unsafe { *(arg as *const libc::c_int) } != 0;
                info.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/// Hooked `setsockopt(2)`.
///
/// `SO_RCVTIMEO`/`SO_SNDTIMEO` are stored in the fd table — the kernel
/// timeout has no effect on a socket the runtime forced non-blocking, so
/// the stored value drives the hook's wait loop instead. Reported as
/// success without touching the OS.
pub fn setsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::setsockopt(fd, level, optname, optval, optlen) };
    }
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        if let Some(info) = fd_table().get(fd, true) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // A zero timeval means "no timeout" in SO_*TIMEO semantics
            info.set_timeout(kind, if ms == 0 { u64::MAX } else { ms });
        }
        return 0;
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

/// Hooked `getsockopt(2)`: pure passthrough, present for symmetry
pub fn getsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}
