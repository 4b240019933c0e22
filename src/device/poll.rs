//! Readiness wait on a raw descriptor.

use std::io;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::Readiness;

/// Whole milliseconds for `poll`, rounded up so the wait never ends early.
fn poll_millis(timeout: Duration) -> c_int {
    timeout
        .as_nanos()
        .div_ceil(1_000_000)
        .min(c_int::MAX as u128) as c_int
}

/// Block until `fd` is readable or `timeout` elapses.
///
/// EINTR comes back as `io::ErrorKind::Interrupted`.
pub(crate) fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, poll_millis(timeout)) };
    match rc {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Readiness::TimedOut),
        _ => Ok(Readiness::Ready),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Pipe {
        read: RawFd,
        write: RawFd,
    }

    impl Pipe {
        fn new() -> Pipe {
            let mut fds = [0 as c_int; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe");
            Pipe {
                read: fds[0],
                write: fds[1],
            }
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read);
                libc::close(self.write);
            }
        }
    }

    #[test]
    fn fractional_milliseconds_round_up() {
        assert_eq!(poll_millis(Duration::ZERO), 0);
        assert_eq!(poll_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_millis(Duration::from_micros(1_900)), 2);
        assert_eq!(poll_millis(Duration::from_millis(2_000)), 2_000);
        assert_eq!(poll_millis(Duration::from_secs(u64::MAX)), c_int::MAX);
    }

    #[test]
    fn empty_pipe_waits_out_the_full_timeout() -> io::Result<()> {
        let pipe = Pipe::new();
        let timeout = Duration::from_micros(1_900);
        let started = Instant::now();
        let readiness = poll_readable(pipe.read, timeout)?;
        let elapsed = started.elapsed();
        assert_eq!(readiness, Readiness::TimedOut);
        assert!(elapsed >= timeout, "timed out after {:?}", elapsed);
        Ok(())
    }

    #[test]
    fn pending_bytes_are_ready() -> io::Result<()> {
        let pipe = Pipe::new();
        let written = unsafe { libc::write(pipe.write, b"x".as_ptr().cast(), 1) };
        assert_eq!(written, 1);
        assert_eq!(
            poll_readable(pipe.read, Duration::from_secs(1))?,
            Readiness::Ready
        );
        Ok(())
    }
}
