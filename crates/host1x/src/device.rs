//! Driver transport.
//!
//! [`Device`] is the only seam between the submission layer and the kernel:
//! one `ioctl` entry point taking the request struct as bytes, plus `mmap` /
//! `munmap` for buffer objects. [`DrmDevice`] talks to a real DRM node;
//! [`crate::emu::EmulatedHost1x`] models one in-process.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use host1x_uapi::tegra_drm::DrmRequest;
use tracing::debug;

use crate::error::{Error, Result};

/// DRM node opened when the caller does not pick one.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/dri/card0";

pub trait Device {
    /// Issues one driver request.
    ///
    /// `arg` holds the request struct identified by `code` and receives the
    /// driver's reply in place. Failures carry the OS error code.
    ///
    /// # Safety
    ///
    /// Any user-space addresses embedded in the request (the array pointers
    /// of `SUBMIT`) must point at live, correctly typed arrays of the length
    /// the request declares, for the duration of the call.
    unsafe fn ioctl(&self, code: u32, arg: &mut [u8]) -> io::Result<()>;

    /// Maps `len` bytes of the buffer object published at the fake `offset`
    /// returned by `GEM_MMAP`.
    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>>;

    /// Releases a mapping returned by [`Device::mmap`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must come from a prior `mmap` on this device that has
    /// not been released yet, and no references into the mapping may outlive
    /// the call.
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// Issues a typed request.
///
/// # Safety
///
/// Same contract as [`Device::ioctl`] for any addresses embedded in `arg`.
pub unsafe fn request<D, R>(device: &D, arg: &mut R) -> io::Result<()>
where
    D: Device + ?Sized,
    R: DrmRequest,
{
    device.ioctl(R::CODE, bytemuck::bytes_of_mut(arg))
}

/// Size field of an `_IOC` command code.
pub(crate) const fn ioc_size(code: u32) -> usize {
    ((code >> 16) & 0x3fff) as usize
}

/// A Tegra DRM device node.
#[derive(Debug)]
pub struct DrmDevice {
    file: File,
    path: PathBuf,
}

impl DrmDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::DeviceOpen {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "opened DRM device");
        Ok(Self { file, path })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(DEFAULT_DEVICE_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for DrmDevice {
    unsafe fn ioctl(&self, code: u32, arg: &mut [u8]) -> io::Result<()> {
        // The kernel copies `_IOC_SIZE(code)` bytes in and out of `arg`.
        if ioc_size(code) != arg.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "ioctl {code:#010x} expects {} argument bytes, got {}",
                    ioc_size(code),
                    arg.len()
                ),
            ));
        }

        loop {
            let ret = libc::ioctl(self.file.as_raw_fd(), code as _, arg.as_mut_ptr());
            if ret != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
        // SAFETY: a fresh shared mapping of the DRM node; no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if libc::munmap(ptr.as_ptr().cast(), len) == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
