//! Readiness wait on the driver's event descriptor

use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::trace;

use crate::error::{Error, Result};

/// Waits for a session's event descriptor to become readable
#[derive(Debug, Clone, Copy)]
pub struct PollGate<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> PollGate<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd }
    }

    /// Wait up to `timeout` for pending events.
    ///
    /// Returns `Ok(false)` on timeout and `Ok(true)` once the descriptor is
    /// readable. An interrupted wait is restarted with the full `timeout`.
    /// Timeouts beyond what poll(2) accepts wait the longest supported interval.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        self.wait_with(timeout, |fds, timeout| nix::poll::poll(fds, timeout))
    }

    fn wait_with<F>(&self, timeout: Duration, mut poll: F) -> Result<bool>
    where
        F: FnMut(&mut [PollFd<'_>], PollTimeout) -> nix::Result<i32>,
    {
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);

        loop {
            let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.contains(PollFlags::POLLIN) {
                        return Ok(true);
                    }
                    if revents.contains(PollFlags::POLLNVAL) {
                        return Err(Error::Poll(Errno::EBADF));
                    }
                    return Err(Error::Poll(Errno::EIO));
                }
                Err(Errno::EINTR) => {
                    trace!("Event wait interrupted, retrying");
                }
                Err(errno) => return Err(Error::Poll(errno)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_zero_timeout_without_data_is_not_ready() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let gate = PollGate::new(rx.as_fd());

        assert!(!gate.wait(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_pending_data_is_ready() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();
        let gate = PollGate::new(rx.as_fd());

        assert!(gate.wait(Duration::from_millis(500)).unwrap());
    }

    #[test]
    fn test_interrupt_retries_with_original_timeout() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let gate = PollGate::new(rx.as_fd());
        let mut seen = Vec::new();

        let ready = gate
            .wait_with(Duration::from_millis(250), |_, timeout| {
                seen.push(timeout);
                if seen.len() < 3 {
                    Err(Errno::EINTR)
                } else {
                    Ok(0)
                }
            })
            .unwrap();

        assert!(!ready);
        assert_eq!(seen.len(), 3);
        let expected = PollTimeout::try_from(Duration::from_millis(250)).unwrap();
        assert!(seen.iter().all(|t| *t == expected));
    }

    #[test]
    fn test_other_errors_surface() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let gate = PollGate::new(rx.as_fd());

        let result = gate.wait_with(Duration::ZERO, |_, _| Err(Errno::ENOMEM));
        assert!(matches!(result, Err(Error::Poll(Errno::ENOMEM))));
    }

    #[test]
    fn test_huge_timeout_is_clamped() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();
        let gate = PollGate::new(rx.as_fd());

        let mut seen = None;
        gate.wait_with(Duration::from_secs(u64::MAX), |fds, timeout| {
            seen = Some(timeout);
            nix::poll::poll(fds, PollTimeout::ZERO)
        })
        .unwrap();

        assert_eq!(seen, Some(PollTimeout::MAX));
    }
}
