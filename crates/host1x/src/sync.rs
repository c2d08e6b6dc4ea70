//! Blocking waits on syncpoint thresholds and sync-file fences.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use host1x_uapi::tegra_drm::{DrmTegraSyncptRead, DrmTegraSyncptWait, DRM_TEGRA_NO_TIMEOUT};

use crate::device::{request, Device};
use crate::error::{Error, Result};

/// How long a wait may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Block until the fence signals or the device fails.
    Never,
    /// Millisecond granularity; partial milliseconds round up.
    After(Duration),
}

impl Timeout {
    pub const fn from_millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    fn millis(d: Duration) -> u128 {
        d.as_nanos().div_ceil(1_000_000)
    }

    /// `SYNCPT_WAIT` encoding. Finite values never collide with [`DRM_TEGRA_NO_TIMEOUT`].
    pub fn as_drm_millis(self) -> u32 {
        match self {
            Timeout::Never => DRM_TEGRA_NO_TIMEOUT,
            Timeout::After(d) => Self::millis(d).min(u128::from(DRM_TEGRA_NO_TIMEOUT - 1)) as u32,
        }
    }

    /// `poll(2)` encoding.
    pub fn as_poll_millis(self) -> libc::c_int {
        match self {
            Timeout::Never => -1,
            Timeout::After(d) => Self::millis(d).min(libc::c_int::MAX as u128) as libc::c_int,
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Never => f.write_str("no timeout"),
            Timeout::After(d) => write!(f, "{}ms", Self::millis(*d)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Blocks until syncpoint `id` reaches `threshold`; returns the value observed.
pub fn wait_syncpoint<D: Device + ?Sized>(
    device: &D,
    id: u32,
    threshold: u32,
    timeout: Timeout,
) -> Result<u32> {
    let mut args = DrmTegraSyncptWait {
        id,
        thresh: threshold,
        timeout: timeout.as_drm_millis(),
        value: 0,
    };
    // SAFETY: SYNCPT_WAIT carries no user pointers.
    match unsafe { request(device, &mut args) } {
        Ok(()) => Ok(args.value),
        Err(err) if matches!(err.raw_os_error(), Some(libc::EAGAIN | libc::ETIMEDOUT)) => {
            Err(Error::WaitTimeout {
                id,
                threshold,
                timeout,
            })
        }
        Err(err) => Err(Error::Wait(err)),
    }
}

/// Current value of syncpoint `id`.
pub fn read_syncpoint<D: Device + ?Sized>(device: &D, id: u32) -> Result<u32> {
    let mut args = DrmTegraSyncptRead { id, value: 0 };
    // SAFETY: SYNCPT_READ carries no user pointers.
    unsafe { request(device, &mut args) }.map_err(|source| Error::SyncpointRead { id, source })?;
    Ok(args.value)
}

/// Blocks until the sync file `fd` becomes readable (signalled).
pub fn wait_fence_fd(fd: BorrowedFd<'_>, timeout: Timeout) -> Result<()> {
    let deadline = match timeout {
        Timeout::Never => None,
        Timeout::After(d) => Some(Instant::now() + d),
    };

    loop {
        let budget = match deadline {
            None => Timeout::Never,
            Some(deadline) => Timeout::After(deadline.saturating_duration_since(Instant::now())),
        };
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, budget.as_poll_millis()) };
        match ret {
            -1 => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::Wait(err));
            }
            0 => return Err(Error::FenceTimeout { timeout }),
            _ if pfd.revents & libc::POLLNVAL != 0 => {
                return Err(Error::Wait(io::Error::from_raw_os_error(libc::EBADF)));
            }
            _ if pfd.revents & libc::POLLERR != 0 => {
                return Err(Error::Wait(io::Error::from_raw_os_error(libc::EIO)));
            }
            _ if pfd.revents & libc::POLLHUP != 0 => return signalled_before_hangup(fd),
            _ => return Ok(()),
        }
    }
}

/// A hung-up fence only counts as signalled if the signal is still queued.
fn signalled_before_hangup(fd: BorrowedFd<'_>) -> Result<()> {
    let mut byte = 0u8;
    // SAFETY: peeks at most one byte into a live local.
    let ret = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            std::ptr::addr_of_mut!(byte).cast(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if ret > 0 {
        Ok(())
    } else {
        Err(Error::Wait(io::Error::from_raw_os_error(libc::EPIPE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn never_is_distinct_from_any_finite_timeout() {
        assert_eq!(Timeout::Never.as_drm_millis(), DRM_TEGRA_NO_TIMEOUT);
        assert_eq!(Timeout::After(Duration::MAX).as_drm_millis(), DRM_TEGRA_NO_TIMEOUT - 1);
        assert_eq!(Timeout::from_millis(100).as_drm_millis(), 100);
        assert_eq!(Timeout::After(Duration::from_micros(1500)).as_drm_millis(), 2);
        assert_eq!(Timeout::Never.as_poll_millis(), -1);
    }

    #[test]
    fn display() {
        assert_eq!(Timeout::Never.to_string(), "no timeout");
        assert_eq!(Timeout::from_millis(1000).to_string(), "1000ms");
    }

    #[test]
    fn fence_fd_wait_times_out_until_written() {
        let (mut signal, fence) = UnixStream::pair().unwrap();

        let err = wait_fence_fd(fence.as_fd(), Timeout::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::FenceTimeout { .. }));

        signal.write_all(&[1]).unwrap();
        wait_fence_fd(fence.as_fd(), Timeout::from_millis(10)).unwrap();
        wait_fence_fd(fence.as_fd(), Timeout::Never).unwrap();
    }

    #[test]
    fn signal_followed_by_hangup_still_counts() {
        let (mut signal, fence) = UnixStream::pair().unwrap();
        signal.write_all(&[1]).unwrap();
        drop(signal);
        wait_fence_fd(fence.as_fd(), Timeout::from_millis(10)).unwrap();
    }

    #[test]
    fn hangup_without_signal_is_an_error() {
        let (signal, fence) = UnixStream::pair().unwrap();
        drop(signal);
        let err = wait_fence_fd(fence.as_fd(), Timeout::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Wait(_)), "unexpected error: {err}");
        assert!(!err.is_timeout());
        assert_eq!(err.os_error(), Some(libc::EPIPE));
    }
}
