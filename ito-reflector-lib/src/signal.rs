//! SIGINT/SIGTERM handling for the synchronous main loop.
//!
//! The handler only sets a flag; the main loop polls
//! [`stop_requested`] between stats intervals.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

/// Install the shutdown handler for SIGINT and SIGTERM.
pub fn install_stop_handler() -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_stop as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::Relaxed)
}

/// Clear the flag; exposed for tests.
pub fn reset() {
    STOP.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigint_sets_the_stop_flag() {
        install_stop_handler().expect("install handlers");
        reset();
        assert!(!stop_requested());
        unsafe { libc::raise(libc::SIGINT) };
        assert!(stop_requested());
        reset();
    }
}
