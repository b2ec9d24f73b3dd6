//! End-to-end scenarios driving fibers, reactor, timers and hooks together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use strand_io::{fd_table, hook, Event, IoManager};
use strand_runtime::Fiber;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_target(false).try_init();
    });
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A hooked sleep must park the fiber, not the worker: with a single
/// worker, other fibers run inside the sleep window and total wall time
/// stays around one second.
#[test]
fn sleep_hook_keeps_worker_busy() {
    init_tracing();
    let iom = IoManager::new(1, false, "sleep-concurrency").unwrap();
    let t0 = Instant::now();

    let a_done = Arc::new(Mutex::new(None::<Duration>));
    let b_done = Arc::new(Mutex::new(None::<Duration>));
    let markers = Arc::new(AtomicUsize::new(0));

    let a = a_done.clone();
    iom.spawn(move || {
        hook::sleep(1);
        *a.lock() = Some(t0.elapsed());
    });

    let b = b_done.clone();
    let m = markers.clone();
    iom.spawn(move || {
        for _ in 0..50 {
            m.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
        }
        *b.lock() = Some(t0.elapsed());
    });

    assert!(wait_until(Duration::from_secs(5), || {
        a_done.lock().is_some() && b_done.lock().is_some()
    }));
    iom.stop();

    assert_eq!(markers.load(Ordering::SeqCst), 50);
    let a = a_done.lock().take().unwrap();
    let b = b_done.lock().take().unwrap();
    assert!(b < a, "markers must finish inside the sleep window");
    assert!(a >= Duration::from_millis(950), "sleep returned early: {:?}", a);
    assert!(a < Duration::from_millis(1900), "sleeps serialized: {:?}", a);
}

/// Arm READ on a pipe, park, write one byte from another fiber after a
/// delay: the reader wakes promptly after the write.
#[test]
fn pipe_readiness_wakes_parked_reader() {
    init_tracing();
    let iom = IoManager::new(2, false, "pipe-wake").unwrap();

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (r, w) = (fds[0], fds[1]);

    let woke_at = Arc::new(Mutex::new(None::<Instant>));
    let wrote_at = Arc::new(Mutex::new(None::<Instant>));

    let woke = woke_at.clone();
    let iom_reader = iom.clone();
    iom.spawn(move || {
        iom_reader.add_event(r, Event::READ, None).unwrap();
        Fiber::yield_to_hold();
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 1);
        *woke.lock() = Some(Instant::now());
    });

    let wrote = wrote_at.clone();
    iom.spawn(move || {
        hook::usleep(200_000);
        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        *wrote.lock() = Some(Instant::now());
    });

    assert!(wait_until(Duration::from_secs(5), || woke_at.lock().is_some()));
    iom.stop();

    let woke = woke_at.lock().take().unwrap();
    let wrote = wrote_at.lock().take().unwrap();
    let latency = woke.saturating_duration_since(wrote);
    assert!(
        latency < Duration::from_millis(150),
        "reader woke {:?} after the write",
        latency
    );

    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

/// SO_RCVTIMEO stored by the hooked setsockopt turns an empty-socket read
/// into -1/ETIMEDOUT after about the configured delay, leaving no armed
/// events behind.
#[test]
fn recv_timeout_returns_etimedout() {
    init_tracing();
    let iom = IoManager::new(1, false, "recv-timeout").unwrap();

    let mut fds = [0i32; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    let fd = fds[0];

    let pending_before = iom.pending_event_count();
    let result = Arc::new(Mutex::new(None::<(isize, i32, Duration)>));

    let res = result.clone();
    iom.spawn(move || {
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 300_000,
        };
        let rt = hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        assert_eq!(rt, 0);

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let n = hook::recv(fd, &mut buf, 0);
        let err = strand_core::os::errno();
        *res.lock() = Some((n, err, started.elapsed()));
    });

    assert!(wait_until(Duration::from_secs(5), || result.lock().is_some()));
    iom.stop();

    let (n, err, elapsed) = result.lock().take().unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(
        elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(1500),
        "timed out after {:?}",
        elapsed
    );
    assert_eq!(iom.pending_event_count(), pending_before);

    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

/// Full connect/accept/send/recv round trip through the hook layer.
#[test]
fn tcp_echo_through_hooks() {
    init_tracing();
    let iom = IoManager::new(2, false, "tcp-echo").unwrap();

    // Listener set up raw on the test thread; the server fiber adopts it.
    let lfd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(lfd >= 0);
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_LOOPBACK.to_be();
    addr.sin_port = 0;
    let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    assert_eq!(
        unsafe { libc::bind(lfd, &addr as *const _ as *const libc::sockaddr, len) },
        0
    );
    assert_eq!(unsafe { libc::listen(lfd, 16) }, 0);
    let mut bound_len = len;
    assert_eq!(
        unsafe {
            libc::getsockname(
                lfd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut bound_len,
            )
        },
        0
    );

    let done = Arc::new(AtomicUsize::new(0));

    let d = done.clone();
    iom.spawn(move || {
        // Adopting the fd forces it non-blocking and enables the hooks
        fd_table().get(lfd, true).unwrap();
        let cfd = hook::accept(lfd, std::ptr::null_mut(), std::ptr::null_mut());
        assert!(cfd >= 0, "accept failed: {}", strand_core::os::errno());

        let mut buf = [0u8; 8];
        let n = hook::recv(cfd, &mut buf, 0);
        assert_eq!(n, 4);
        assert_eq!(hook::send(cfd, &buf[..4], 0), 4);
        assert_eq!(hook::close(cfd), 0);
        d.fetch_add(1, Ordering::SeqCst);
    });

    let d = done.clone();
    iom.spawn(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let rt = hook::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rt, 0, "connect failed: {}", strand_core::os::errno());

        assert_eq!(hook::send(fd, b"ping", 0), 4);
        let mut buf = [0u8; 8];
        let n = hook::recv(fd, &mut buf, 0);
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(hook::close(fd), 0);
        d.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 2
    }));
    iom.stop();
    assert_eq!(iom.pending_event_count(), 0);

    fd_table().del(lfd);
    unsafe { libc::close(lfd) };
}

/// A recurring timer reset(from_now) mid-flight stretches the following
/// period; the set stays ordered and the cancelled timer stops firing.
#[test]
fn recurring_timer_reset_stretches_period() {
    init_tracing();
    let iom = IoManager::new(1, false, "timer-reset").unwrap();

    let fires = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let handle = Arc::new(Mutex::new(None::<Arc<strand_io::Timer>>));

    let f = fires.clone();
    let h = handle.clone();
    let timer = iom.add_timer(
        50,
        move || {
            let n = {
                let mut v = f.lock();
                v.push(Instant::now());
                v.len()
            };
            let guard = h.lock();
            let timer = guard.as_ref().expect("handle published before first fire");
            if n == 3 {
                assert!(timer.reset(150, true));
            } else if n >= 5 {
                assert!(timer.cancel());
            }
        },
        true,
    );
    *handle.lock() = Some(timer);

    assert!(wait_until(Duration::from_secs(5), || fires.lock().len() >= 5));
    iom.stop();

    let fires = fires.lock();
    assert_eq!(fires.len(), 5, "cancelled on the fifth fire");
    let short = fires[1].duration_since(fires[0]);
    let stretched = fires[3].duration_since(fires[2]);
    assert!(
        stretched >= Duration::from_millis(100),
        "reset did not stretch the period: {:?}",
        stretched
    );
    assert!(stretched > short, "{:?} vs {:?}", stretched, short);
}

/// use_caller mode: the constructing thread drains its own queue when it
/// drives stop(), hooks included.
#[test]
fn use_caller_reactor_drains_on_stop() {
    init_tracing();
    let count = Arc::new(AtomicUsize::new(0));
    let iom = IoManager::new(1, true, "caller-iom").unwrap();

    let c = count.clone();
    iom.spawn(move || {
        hook::usleep(50_000);
        c.fetch_add(1, Ordering::SeqCst);
    });
    let c = count.clone();
    iom.spawn(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    iom.stop();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}
