//! Job submission.
//!
//! A [`Submit`] collects command words, syncpoint increment declarations and
//! relocations, then [`Submit::submit`] turns them into one `SUBMIT` request:
//!
//! 1. allocate a command buffer object of exactly `words * 4` bytes;
//! 2. point every relocation at that buffer (its handle is unknown before);
//! 3. map it and copy the words in push order;
//! 4. describe it with a single cmdbuf descriptor and issue the request.
//!
//! The increment declarations are bookkeeping for the driver. Nothing checks
//! that they agree with the `INCR_SYNCPT` writes actually present in the
//! stream; a mismatch shows up as a job that never reaches its fence.

use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};

use bitflags::bitflags;
use host1x_uapi::tegra_drm::{
    DrmTegraCmdbuf, DrmTegraReloc, DrmTegraRelocBuffer, DrmTegraSubmit, DrmTegraSyncpt,
    DRM_TEGRA_FENCE_EMIT, DRM_TEGRA_FENCE_FD,
};
use tracing::debug;

use crate::channel::Channel;
use crate::device::{request, Device};
use crate::error::{Error, Result};
use crate::gem::GemBuffer;
use crate::sync::{wait_fence_fd, wait_syncpoint, Timeout};

const WORD_SIZE: usize = std::mem::size_of::<u32>();

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct SubmitFlags: u32 {
        const FENCE_EMIT = DRM_TEGRA_FENCE_EMIT;
        const FENCE_FD = DRM_TEGRA_FENCE_FD;
        /// Return a pollable sync-file descriptor instead of a raw threshold.
        const SYNC_FILE = Self::FENCE_EMIT.bits() | Self::FENCE_FD.bits();
    }
}

/// Deliberate corruption of the cmdbuf descriptor, for fault-injection tests.
///
/// Only reachable through [`Submit::with_quirks`], which requires the
/// `quirks` feature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitQuirks {
    /// Word count reported to the driver instead of the number of pushed words.
    pub force_cmdbuf_words: Option<u32>,
    /// Byte offset reported to the driver instead of 0.
    pub force_cmdbuf_offset: Option<u32>,
}

/// Single-use job builder. [`Submit::submit`] consumes it.
#[derive(Clone, Debug)]
pub struct Submit {
    words: Vec<u32>,
    incrs: Vec<DrmTegraSyncpt>,
    relocs: Vec<DrmTegraReloc>,
    flags: SubmitFlags,
    quirks: SubmitQuirks,
}

impl Default for Submit {
    fn default() -> Self {
        Self::new()
    }
}

impl Submit {
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            incrs: Vec::new(),
            relocs: Vec::new(),
            flags: SubmitFlags::empty(),
            quirks: SubmitQuirks::default(),
        }
    }

    /// A builder whose cmdbuf descriptor is corrupted as `quirks` describes.
    #[cfg(any(test, feature = "quirks"))]
    pub fn with_quirks(quirks: SubmitQuirks) -> Self {
        Self {
            quirks,
            ..Self::new()
        }
    }

    pub fn set_flags(&mut self, flags: SubmitFlags) {
        self.flags = flags;
    }

    pub fn push(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn extend(&mut self, words: impl IntoIterator<Item = u32>) {
        self.words.extend(words);
    }

    /// Declares `count` increments of syncpoint `syncpt` for this job.
    ///
    /// Repeated declarations for the same syncpoint are passed through as-is.
    /// A `count` of zero makes [`Submit::submit`] fail with `EINVAL`.
    pub fn add_incr(&mut self, syncpt: u32, count: u32) {
        self.incrs.push(DrmTegraSyncpt {
            id: syncpt,
            incrs: count,
        });
    }

    /// Asks the driver to write the address of `target` (plus `target_offset`,
    /// shifted right by `shift`) into the command word at byte `cmdbuf_offset`.
    pub fn add_reloc(&mut self, cmdbuf_offset: u32, target: u32, target_offset: u32, shift: u32) {
        self.relocs.push(DrmTegraReloc {
            // The command buffer does not exist yet; `submit` fills in its handle.
            cmdbuf: DrmTegraRelocBuffer {
                handle: 0,
                offset: cmdbuf_offset,
            },
            target: DrmTegraRelocBuffer {
                handle: target,
                offset: target_offset,
            },
            shift,
            pad: 0,
        });
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn flags(&self) -> SubmitFlags {
        self.flags
    }

    pub fn submit<D: Device + ?Sized>(mut self, channel: &Channel<'_, D>) -> Result<SubmitResult> {
        let device = channel.device();
        if self.incrs.iter().any(|incr| incr.incrs == 0) {
            return Err(Error::Submit(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        let too_long = || Error::Submit(io::Error::from_raw_os_error(libc::E2BIG));
        let word_count = u32::try_from(self.words.len()).map_err(|_| too_long())?;
        let num_relocs = u32::try_from(self.relocs.len()).map_err(|_| too_long())?;
        let num_syncpts = u32::try_from(self.incrs.len()).map_err(|_| too_long())?;

        let byte_len = (self.words.len() * WORD_SIZE) as u64;
        let mut cmdbuf = GemBuffer::allocate(device, byte_len)?;

        for reloc in &mut self.relocs {
            reloc.cmdbuf.handle = cmdbuf.handle();
        }

        let mapped = cmdbuf.map()?;
        mapped.copy_from_slice(bytemuck::cast_slice(&self.words));

        let cmdbuf_desc = DrmTegraCmdbuf {
            handle: cmdbuf.handle(),
            offset: self.quirks.force_cmdbuf_offset.unwrap_or(0),
            words: self.quirks.force_cmdbuf_words.unwrap_or(word_count),
            pad: 0,
        };

        let mut args = DrmTegraSubmit {
            context: channel.context(),
            num_syncpts,
            num_cmdbufs: 1,
            num_relocs,
            syncpts: user_ptr(&self.incrs),
            cmdbufs: user_ptr(std::slice::from_ref(&cmdbuf_desc)),
            relocs: user_ptr(&self.relocs),
            flags: self.flags.bits(),
            ..Default::default()
        };
        // SAFETY: the syncpt, cmdbuf and reloc arrays are owned by `self` / this frame and
        // outlive the call; each count matches its array.
        unsafe { request(device, &mut args) }.map_err(Error::Submit)?;

        let fence = if self.flags.contains(SubmitFlags::SYNC_FILE) {
            let fd = RawFd::try_from(args.fence)
                .map_err(|_| Error::Submit(io::Error::from_raw_os_error(libc::EBADF)))?;
            // SAFETY: with FENCE_FD the driver installs a fresh sync-file descriptor in
            // `fence` and hands its ownership to the caller.
            Fence::SyncFile(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Fence::Threshold(args.fence)
        };

        debug!(
            context = channel.context(),
            words = word_count,
            syncpts = num_syncpts,
            relocs = num_relocs,
            ?fence,
            "submitted job"
        );

        Ok(SubmitResult {
            syncpt: self.incrs.first().map(|incr| incr.id),
            fence,
        })
    }
}

fn user_ptr<T>(items: &[T]) -> u64 {
    if items.is_empty() {
        0
    } else {
        items.as_ptr() as u64
    }
}

/// Completion handle of a submitted job.
#[derive(Debug)]
pub enum Fence {
    /// Value the job's syncpoint reaches once all declared increments land.
    Threshold(u32),
    /// Sync file that becomes readable when the job completes.
    SyncFile(OwnedFd),
}

#[derive(Debug)]
pub struct SubmitResult {
    /// Syncpoint of the first increment declaration; a threshold fence refers to it.
    pub syncpt: Option<u32>,
    pub fence: Fence,
}

impl SubmitResult {
    pub fn threshold(&self) -> Option<u32> {
        match self.fence {
            Fence::Threshold(threshold) => Some(threshold),
            Fence::SyncFile(_) => None,
        }
    }

    /// Waits in whichever style the fence supports.
    ///
    /// A threshold fence without any declared syncpoint has nothing to wait
    /// for and returns immediately.
    pub fn wait<D: Device + ?Sized>(&self, device: &D, timeout: Timeout) -> Result<()> {
        match (&self.fence, self.syncpt) {
            (Fence::SyncFile(fd), _) => wait_fence_fd(fd.as_fd(), timeout),
            (Fence::Threshold(threshold), Some(id)) => {
                wait_syncpoint(device, id, *threshold, timeout).map(|_| ())
            }
            (Fence::Threshold(_), None) => Ok(()),
        }
    }
}
