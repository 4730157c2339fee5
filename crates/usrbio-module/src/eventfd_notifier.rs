//! `EventFdNotifier`: default `Notifier` implementation.
//!
//! Writes to an eventfd to wake a caller blocked in `wait_for_completions`.
//! Coalescing: multiple calls to `notify()` before the waiter reads the
//! eventfd result in a single wakeup (eventfd counter semantics).

use usrbio_core::error::{Result, UsrbioError};
use usrbio_core::notifier::Notifier;

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking eventfd and wrap it.
    ///
    /// The notifier OWNS the fd and closes it on Drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(UsrbioError::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Raw eventfd, for an external event loop to poll.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Consume any pending signal without blocking.
    ///
    /// Returns `true` if the counter was non-zero.
    pub fn drain(&self) -> bool {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN: counter is zero.
        ret == std::mem::size_of::<u64>() as isize && val > 0
    }

    /// poll(2) for readability. Retries EINTR against the original deadline.
    fn poll_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ms: libc::c_int = match deadline {
                None => -1,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    // Round up so a sub-millisecond remainder still sleeps.
                    let ms = left.as_micros().div_ceil(1000);
                    ms.min(libc::c_int::MAX as u128) as libc::c_int
                }
            };
            let mut pfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
            return Ok(ret > 0 && (pfd.revents & libc::POLLIN) != 0);
        }
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            // EAGAIN is OK: means the counter would overflow,
            // which implies a signal is already pending. That's fine.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(UsrbioError::Os(errno));
        }
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if timeout == Some(Duration::ZERO) {
            return Ok(self.drain());
        }
        if self.poll_readable(timeout)? {
            Ok(self.drain())
        } else {
            Ok(false)
        }
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_notify_then_wait() {
        let n = EventFdNotifier::create().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        // Coalesced into one wakeup.
        assert!(n.wait(Some(Duration::from_millis(100))).unwrap());
        assert!(!n.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let n = EventFdNotifier::create().unwrap();
        let start = Instant::now();
        assert!(!n.wait(Some(Duration::from_millis(20))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_cross_thread_wake() {
        let n = Arc::new(EventFdNotifier::create().unwrap());
        let n2 = Arc::clone(&n);
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            n2.notify().unwrap();
        });
        assert!(n.wait(None).unwrap());
        h.join().unwrap();
    }
}
