//! Cooperative stop flag, settable from SIGINT.
//!
//! The handler only stores into a static atomic; the outer loop polls the
//! flag between blocks. Installing remembers the previous handler so it can
//! be put back once a stop is underway — a second Ctrl-C then behaves as if
//! we were never here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);
static PREV_HANDLER: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

/// The flag the outer loop polls.
pub fn flag() -> &'static AtomicBool {
    &STOP
}

pub fn requested() -> bool {
    STOP.load(Ordering::Acquire)
}

/// Route SIGINT to the stop flag, remembering the previous disposition.
pub fn install() {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    let prev = unsafe { libc::signal(libc::SIGINT, handler as usize as libc::sighandler_t) };
    PREV_HANDLER.store(prev as usize, Ordering::Release);
    INSTALLED.store(true, Ordering::Release);
}

/// Restore whatever handler was active before [`install`]. Safe to call
/// more than once, or without a prior install.
pub fn restore() {
    if INSTALLED.swap(false, Ordering::AcqRel) {
        let prev = PREV_HANDLER.load(Ordering::Acquire);
        unsafe {
            libc::signal(libc::SIGINT, prev as libc::sighandler_t);
        }
    }
}
