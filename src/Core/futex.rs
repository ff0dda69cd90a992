// Doorbell waits for hosted cores.
// The words live in memory other processes map too, so these are shared futexes:
// FUTEX_PRIVATE_FLAG would only ever wake waiters of the calling process.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
fn futex(word: &AtomicU32, op: libc::c_int, val: u32, ts: *const libc::timespec) -> libc::c_long {
    unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), op, val, ts, 0usize, 0u32) }
}

/// Sleep while `*atomic == expected`, at most `timeout` when given.
/// Spurious returns are allowed; callers re-check their condition.
#[cfg(target_os = "linux")]
pub fn futex_wait(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;

    // Already rung
    if atomic.load(Ordering::Acquire) != expected {
        return;
    }
    match timeout {
        Some(t) => {
            let ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            };
            futex(atomic, libc::FUTEX_WAIT, expected, &ts);
        }
        None => {
            futex(atomic, libc::FUTEX_WAIT, expected, std::ptr::null());
        }
    }
}

/// Wake every core sleeping on `atomic`.
#[cfg(target_os = "linux")]
pub fn futex_wake(atomic: &AtomicU32) {
    futex(atomic, libc::FUTEX_WAKE, i32::MAX as u32, std::ptr::null());
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    let start = Instant::now();
    while atomic.load(Ordering::Acquire) == expected {
        if timeout.is_some_and(|t| start.elapsed() >= t) {
            return;
        }
        std::thread::yield_now();
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_atomic: &AtomicU32) {
    // Pollers notice the changed word on their own
}
