//! Per-fd application-facing metadata
//!
//! The hook layer consults this table to decide whether a descriptor takes
//! the fiber path at all, and with which per-direction timeouts. A socket
//! is forced non-blocking at the OS level the first time the table sees
//! it; the application's own opinion about O_NONBLOCK is tracked
//! separately so `fcntl(F_GETFL)` can keep lying consistently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Which direction a timeout applies to
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Metadata for one file descriptor
pub struct FdInfo {
    fd: i32,
    /// fstat succeeded at creation
    is_init: bool,
    is_socket: bool,
    /// O_NONBLOCK is set at the OS level (always true for sockets here)
    sys_nonblock: AtomicBool,
    /// The application asked for O_NONBLOCK itself
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// u64::MAX = no timeout
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdInfo {
    fn new(fd: i32) -> FdInfo {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_init = unsafe { libc::fstat(fd, &mut st) } == 0;
        let is_socket = is_init && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let sys_nonblock = if is_socket {
            // The wait loop depends on the kernel never blocking this fd
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            true
        } else {
            false
        };

        FdInfo {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(u64::MAX),
            send_timeout_ms: AtomicU64::new(u64::MAX),
        }
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Dense fd-indexed table of [`FdInfo`] entries
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdInfo>>>>,
}

/// The process-wide table.
///
/// First access creates it; nothing depends on initialization order.
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(|| FdTable {
        slots: RwLock::new(vec![None; 64]),
    })
}

impl FdTable {
    /// Look up `fd`, creating the entry when `auto_create` is set.
    ///
    /// Double-checked: the read lock serves the hot path, creation
    /// re-checks under the write lock so concurrent creators agree on one
    /// entry.
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read();
            if idx >= slots.len() {
                if !auto_create {
                    return None;
                }
            } else if slots[idx].is_some() || !auto_create {
                return slots[idx].clone();
            }
        }

        let mut slots = self.slots.write();
        if idx < slots.len() {
            if let Some(existing) = &slots[idx] {
                return Some(existing.clone());
            }
        }

        let info = Arc::new(FdInfo::new(fd));
        if idx >= slots.len() {
            let new_len = (idx * 3 / 2).max(idx + 1);
            slots.resize(new_len, None);
        }
        slots[idx] = Some(info.clone());
        Some(info)
    }

    /// Clear the entry for `fd`
    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_fd() -> i32 {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_get_without_create() {
        let fd = socket_fd();
        assert!(fd_table().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = socket_fd();
        let info = fd_table().get(fd, true).unwrap();
        assert!(info.is_init());
        assert!(info.is_socket());
        assert!(info.sys_nonblock());
        assert!(!info.user_nonblock());

        // The kernel really has the flag now
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_get_returns_same_entry() {
        let fd = socket_fd();
        let a = fd_table().get(fd, true).unwrap();
        let b = fd_table().get(fd, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_del_clears_slot() {
        let fd = socket_fd();
        fd_table().get(fd, true).unwrap();
        fd_table().del(fd);
        assert!(fd_table().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_invalid_fd_not_initialized() {
        // An fd nobody opened: fstat fails, entry records that
        let info = fd_table().get(9_999, true).unwrap();
        assert!(!info.is_init());
        assert!(!info.is_socket());
        fd_table().del(9_999);
    }

    #[test]
    fn test_timeouts_per_direction() {
        let fd = socket_fd();
        let info = fd_table().get(fd, true).unwrap();
        assert_eq!(info.timeout(TimeoutKind::Recv), u64::MAX);
        assert_eq!(info.timeout(TimeoutKind::Send), u64::MAX);

        info.set_timeout(TimeoutKind::Recv, 1500);
        assert_eq!(info.timeout(TimeoutKind::Recv), 1500);
        assert_eq!(info.timeout(TimeoutKind::Send), u64::MAX);

        fd_table().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_not_hooked() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let info = fd_table().get(fds[0], true).unwrap();
        assert!(info.is_init());
        assert!(!info.is_socket());
        assert!(!info.sys_nonblock());
        fd_table().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
