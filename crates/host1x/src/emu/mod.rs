//! In-process host1x model behind the [`Device`] transport.
//!
//! [`EmulatedHost1x`] accepts the same requests as a Tegra DRM node and
//! rejects malformed ones with the errno the kernel driver would return.
//! Accepted jobs run in submission order on a worker thread that interprets
//! the command stream (see [`exec`]); a job whose stream performs fewer
//! syncpoint increments than it declared is completed by CPU increments after
//! [`EmulatorConfig::job_timeout`], the way the kernel's job timeout handler
//! recovers a hung channel.

pub mod exec;

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use host1x_uapi::opcode::Host1xClass;
use host1x_uapi::tegra_drm::{
    DrmGemClose, DrmRequest, DrmTegraCloseChannel, DrmTegraCmdbuf, DrmTegraGemCreate,
    DrmTegraGemMmap, DrmTegraGetSyncpt, DrmTegraOpenChannel, DrmTegraReloc, DrmTegraSubmit,
    DrmTegraSyncpt, DrmTegraSyncptRead, DrmTegraSyncptWait, DRM_IOCTL_GEM_CLOSE,
    DRM_IOCTL_TEGRA_CLOSE_CHANNEL, DRM_IOCTL_TEGRA_GEM_CREATE, DRM_IOCTL_TEGRA_GEM_MMAP,
    DRM_IOCTL_TEGRA_GET_SYNCPT, DRM_IOCTL_TEGRA_OPEN_CHANNEL, DRM_IOCTL_TEGRA_SUBMIT,
    DRM_IOCTL_TEGRA_SYNCPT_READ, DRM_IOCTL_TEGRA_SYNCPT_WAIT, DRM_TEGRA_FENCE_EMIT,
    DRM_TEGRA_FENCE_FD, DRM_TEGRA_FENCE_FLAGS, DRM_TEGRA_FENCE_WAIT, DRM_TEGRA_NO_TIMEOUT,
};
use tracing::{debug, trace, warn};

use crate::device::Device;
use crate::platform::{PlatformProfile, Soc};

use self::exec::execute;

/// Fake mmap offsets start here; one page per handle.
const MMAP_OFFSET_BASE: u64 = 1 << 32;
const PAGE_SHIFT: u32 = 12;

const IOVA_BASE: u64 = 0x4000_0000;
const IOVA_STRIDE_SHIFT: u32 = 24;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Wrap-aware "has `value` reached `threshold`" for 32-bit syncpoints.
pub fn syncpt_reached(value: u32, threshold: u32) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}

#[derive(Clone, Debug)]
pub struct EmulatorConfig {
    pub soc: Soc,
    /// How long a job may sit short of its fence before CPU increments complete it.
    pub job_timeout: Duration,
    /// Total bytes of buffer objects that may be alive at once.
    pub memory_limit: u64,
    pub keep_last_submissions: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            soc: Soc::FALLBACK,
            job_timeout: Duration::from_millis(500),
            memory_limit: 256 << 20,
            keep_last_submissions: 64,
        }
    }
}

impl EmulatorConfig {
    pub fn for_soc(soc: Soc) -> Self {
        Self {
            soc,
            ..Self::default()
        }
    }
}

/// Live resource counts, for leak checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    pub channels: usize,
    pub buffers: usize,
    pub mappings: usize,
    pub syncpoints: usize,
    pub bytes_allocated: u64,
    pub jobs_pending: usize,
    pub jobs_completed: u64,
    pub jobs_timed_out: u64,
}

/// What the model saw for one accepted `SUBMIT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub context: u64,
    pub syncpts: Vec<DrmTegraSyncpt>,
    pub cmdbuf: DrmTegraCmdbuf,
    pub relocs: Vec<DrmTegraReloc>,
    /// Command words as read from the command buffer.
    pub words: Vec<u32>,
    /// Command words after relocation patching, as executed.
    pub executed: Vec<u32>,
    /// Threshold of the first declared syncpoint.
    pub fence: u32,
}

struct BufferObject {
    ptr: NonNull<u8>,
    size: usize,
    maps: usize,
}

// SAFETY: the allocation is owned by this value; the model only touches it under the state
// lock and CPU mappings are handed out through `Device::mmap` like any shared mapping.
unsafe impl Send for BufferObject {}

impl BufferObject {
    fn new(size: usize) -> Self {
        let storage: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(storage)).cast::<u8>();
        Self { ptr, size, maps: 0 }
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        // SAFETY: `ptr` is valid for `size` bytes for as long as `self` lives.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), self.size) };
        out
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` came from `Box::leak` of a boxed slice of exactly this length.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.size)) });
    }
}

struct ChannelState {
    class: Host1xClass,
    syncpt: Option<u32>,
}

struct Job {
    context: u64,
    executed: Vec<u32>,
    /// (syncpoint, threshold) pairs that complete the job.
    thresholds: Vec<(u32, u32)>,
    sync_file: Option<UnixStream>,
}

struct State {
    buffers: BTreeMap<u32, BufferObject>,
    /// Closed while still mapped; freed on the last munmap.
    orphans: Vec<BufferObject>,
    bytes_allocated: u64,
    channels: BTreeMap<u64, ChannelState>,
    next_context: u64,
    values: Vec<u32>,
    max: Vec<u32>,
    owner: Vec<Option<u64>>,
    queue: VecDeque<Job>,
    running: bool,
    submissions: VecDeque<SubmissionRecord>,
    jobs_completed: u64,
    jobs_timed_out: u64,
    shutdown: bool,
}

impl State {
    fn job_done(&self, job: &Job) -> bool {
        job.thresholds
            .iter()
            .all(|&(id, threshold)| syncpt_reached(self.values[id as usize], threshold))
    }

    fn buffer(&self, handle: u32) -> io::Result<&BufferObject> {
        self.buffers.get(&handle).ok_or_else(|| errno(libc::ENOENT))
    }
}

struct Shared {
    config: EmulatorConfig,
    profile: PlatformProfile,
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Software host1x + Tegra DRM driver.
pub struct EmulatedHost1x {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EmulatedHost1x {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedHost1x")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EmulatedHost1x {
    pub fn new(config: EmulatorConfig) -> Self {
        let profile = PlatformProfile::new(config.soc);
        let count = profile.syncpoint_count() as usize;
        let state = State {
            buffers: BTreeMap::new(),
            orphans: Vec::new(),
            bytes_allocated: 0,
            channels: BTreeMap::new(),
            next_context: 1,
            values: vec![0; count],
            max: vec![0; count],
            owner: vec![None; count],
            queue: VecDeque::new(),
            running: false,
            submissions: VecDeque::new(),
            jobs_completed: 0,
            jobs_timed_out: 0,
            shutdown: false,
        };
        let shared = Arc::new(Shared {
            config,
            profile,
            state: Mutex::new(state),
            cond: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_jobs(&shared))
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn profile(&self) -> PlatformProfile {
        self.shared.profile
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> EmulatorStats {
        let state = self.shared.lock();
        EmulatorStats {
            channels: state.channels.len(),
            buffers: state.buffers.len(),
            mappings: state
                .buffers
                .values()
                .chain(state.orphans.iter())
                .map(|bo| bo.maps)
                .sum(),
            syncpoints: state.owner.iter().filter(|owner| owner.is_some()).count(),
            bytes_allocated: state.bytes_allocated,
            jobs_pending: state.queue.len() + usize::from(state.running),
            jobs_completed: state.jobs_completed,
            jobs_timed_out: state.jobs_timed_out,
        }
    }

    /// Most recent accepted submissions, oldest first.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.shared.lock().submissions.iter().cloned().collect()
    }

    pub fn syncpoint_value(&self, id: u32) -> Option<u32> {
        self.shared.lock().values.get(id as usize).copied()
    }

    /// Copy of a live buffer object's contents.
    pub fn read_buffer(&self, handle: u32) -> Option<Vec<u8>> {
        self.shared.lock().buffers.get(&handle).map(BufferObject::snapshot)
    }

    /// Address relocations against `handle` resolve to.
    pub const fn iova_of(handle: u32) -> u64 {
        IOVA_BASE + ((handle as u64) << IOVA_STRIDE_SHIFT)
    }

    fn gem_create(&self, req: &mut DrmTegraGemCreate) -> io::Result<()> {
        let mut state = self.shared.lock();
        if req.size == 0 {
            return Err(errno(libc::EINVAL));
        }
        let fits = state
            .bytes_allocated
            .checked_add(req.size)
            .is_some_and(|total| total <= self.shared.config.memory_limit);
        let size = usize::try_from(req.size).ok().filter(|_| fits).ok_or_else(|| errno(libc::ENOMEM))?;

        // Lowest free handle, like the DRM object idr.
        let handle = (1..=u32::MAX)
            .find(|h| !state.buffers.contains_key(h))
            .ok_or_else(|| errno(libc::ENOSPC))?;
        state.buffers.insert(handle, BufferObject::new(size));
        state.bytes_allocated += req.size;
        req.handle = handle;
        trace!(handle, size = req.size, "gem create");
        Ok(())
    }

    fn gem_mmap(&self, req: &mut DrmTegraGemMmap) -> io::Result<()> {
        let state = self.shared.lock();
        state.buffer(req.handle)?;
        req.offset = MMAP_OFFSET_BASE + (u64::from(req.handle) << PAGE_SHIFT);
        Ok(())
    }

    fn gem_close(&self, req: &mut DrmGemClose) -> io::Result<()> {
        let mut state = self.shared.lock();
        let bo = state.buffers.remove(&req.handle).ok_or_else(|| errno(libc::EINVAL))?;
        state.bytes_allocated -= bo.size as u64;
        if bo.maps > 0 {
            state.orphans.push(bo);
        }
        trace!(handle = req.handle, "gem close");
        Ok(())
    }

    fn open_channel(&self, req: &mut DrmTegraOpenChannel) -> io::Result<()> {
        let class = Host1xClass::from_u32(req.client)
            .filter(|class| self.shared.profile.channel_classes().contains(class))
            .ok_or_else(|| errno(libc::ENODEV))?;

        let mut state = self.shared.lock();
        let context = state.next_context;
        state.next_context += 1;
        state.channels.insert(context, ChannelState { class, syncpt: None });
        req.context = context;
        debug!(context, class = class.name(), "channel opened");
        Ok(())
    }

    fn close_channel(&self, req: &mut DrmTegraCloseChannel) -> io::Result<()> {
        let mut state = self.shared.lock();
        let channel = state.channels.remove(&req.context).ok_or_else(|| errno(libc::EINVAL))?;
        if let Some(id) = channel.syncpt {
            state.owner[id as usize] = None;
        }
        debug!(context = req.context, class = channel.class.name(), "channel closed");
        Ok(())
    }

    fn get_syncpt(&self, req: &mut DrmTegraGetSyncpt) -> io::Result<()> {
        let mut state = self.shared.lock();
        let existing = state
            .channels
            .get(&req.context)
            .ok_or_else(|| errno(libc::ENODEV))?
            .syncpt;
        if req.index != 0 {
            return Err(errno(libc::EINVAL));
        }

        let id = match existing {
            Some(id) => id,
            None => {
                // Syncpoint 0 stays reserved, as on hardware.
                let id = (1..state.owner.len())
                    .find(|&id| state.owner[id].is_none())
                    .ok_or_else(|| errno(libc::EBUSY))? as u32;
                state.owner[id as usize] = Some(req.context);
                if let Some(channel) = state.channels.get_mut(&req.context) {
                    channel.syncpt = Some(id);
                }
                id
            }
        };
        req.id = id;
        Ok(())
    }

    fn syncpt_read(&self, req: &mut DrmTegraSyncptRead) -> io::Result<()> {
        let state = self.shared.lock();
        req.value = *state.values.get(req.id as usize).ok_or_else(|| errno(libc::EINVAL))?;
        Ok(())
    }

    fn syncpt_wait(&self, req: &mut DrmTegraSyncptWait) -> io::Result<()> {
        let id = req.id as usize;
        let threshold = req.thresh;
        let state = self.shared.lock();
        if id >= state.values.len() {
            return Err(errno(libc::EINVAL));
        }

        let pending = |s: &mut State| !syncpt_reached(s.values[id], threshold);
        let state = if req.timeout == DRM_TEGRA_NO_TIMEOUT {
            self.shared
                .cond
                .wait_while(state, pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        } else {
            let timeout = Duration::from_millis(u64::from(req.timeout));
            self.shared
                .cond
                .wait_timeout_while(state, timeout, pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0
        };

        req.value = state.values[id];
        if syncpt_reached(req.value, threshold) {
            Ok(())
        } else {
            Err(errno(libc::EAGAIN))
        }
    }

    /// # Safety
    ///
    /// The array addresses in `req` must satisfy the [`Device::ioctl`] contract.
    unsafe fn submit(&self, req: &mut DrmTegraSubmit) -> io::Result<()> {
        let flags = req.flags;
        if flags & !DRM_TEGRA_FENCE_FLAGS != 0 || flags & DRM_TEGRA_FENCE_WAIT != 0 {
            return Err(errno(libc::EINVAL));
        }
        let sync_file = flags & DRM_TEGRA_FENCE_FD != 0;
        if sync_file && flags & DRM_TEGRA_FENCE_EMIT == 0 {
            return Err(errno(libc::EINVAL));
        }
        if req.num_waitchks != 0 || req.num_syncpts == 0 {
            return Err(errno(libc::EINVAL));
        }

        let syncpts: Vec<DrmTegraSyncpt> = copy_from_user(req.syncpts, req.num_syncpts)?;
        let cmdbufs: Vec<DrmTegraCmdbuf> = copy_from_user(req.cmdbufs, req.num_cmdbufs)?;
        let relocs: Vec<DrmTegraReloc> = copy_from_user(req.relocs, req.num_relocs)?;

        let mut state = self.shared.lock();
        if !state.channels.contains_key(&req.context) {
            return Err(errno(libc::ENODEV));
        }
        for syncpt in &syncpts {
            if state.owner.get(syncpt.id as usize).copied().flatten() != Some(req.context) {
                return Err(errno(libc::EINVAL));
            }
        }

        let mut words = Vec::new();
        let mut executed = Vec::new();
        for cmdbuf in &cmdbufs {
            let bo = state.buffer(cmdbuf.handle)?;
            let end = u64::from(cmdbuf.offset) + u64::from(cmdbuf.words) * size_of::<u32>() as u64;
            if cmdbuf.offset % 4 != 0 || end > bo.size as u64 {
                return Err(errno(libc::EINVAL));
            }

            let mut image: Vec<u32> = bo
                .snapshot()
                .chunks_exact(4)
                .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
                .collect();
            let range = cmdbuf.offset as usize / 4..end as usize / 4;
            words.extend_from_slice(&image[range.clone()]);

            for reloc in relocs.iter().filter(|r| r.cmdbuf.handle == cmdbuf.handle) {
                if reloc.cmdbuf.offset % 4 != 0 || reloc.cmdbuf.offset as usize >= bo.size {
                    return Err(errno(libc::EINVAL));
                }
                let target = state.buffer(reloc.target.handle)?;
                if reloc.target.offset as usize >= target.size {
                    return Err(errno(libc::EINVAL));
                }
                let address = Self::iova_of(reloc.target.handle) + u64::from(reloc.target.offset);
                image[reloc.cmdbuf.offset as usize / 4] = (address >> reloc.shift.min(63)) as u32;
            }
            executed.extend_from_slice(&image[range]);
        }

        // Relocations must patch one of the submitted command buffers.
        for reloc in &relocs {
            if !cmdbufs.iter().any(|c| c.handle == reloc.cmdbuf.handle) {
                state.buffer(reloc.cmdbuf.handle)?;
                return Err(errno(libc::EINVAL));
            }
        }

        let mut thresholds: Vec<(u32, u32)> = Vec::new();
        for syncpt in &syncpts {
            let max = &mut state.max[syncpt.id as usize];
            *max = max.wrapping_add(syncpt.incrs);
            match thresholds.iter_mut().find(|(id, _)| *id == syncpt.id) {
                Some(entry) => entry.1 = *max,
                None => thresholds.push((syncpt.id, *max)),
            }
        }
        let fence = thresholds.first().map_or(0, |&(_, threshold)| threshold);

        let (signal, fence_value) = if sync_file {
            let (signal, wait) = UnixStream::pair()?;
            let fd = wait.into_raw_fd();
            (Some(signal), fd as u32)
        } else {
            (None, fence)
        };
        req.fence = fence_value;

        let keep = self.shared.config.keep_last_submissions;
        if keep > 0 {
            if state.submissions.len() == keep {
                state.submissions.pop_front();
            }
            state.submissions.push_back(SubmissionRecord {
                context: req.context,
                syncpts,
                cmdbuf: cmdbufs.first().copied().unwrap_or_default(),
                relocs,
                words,
                executed: executed.clone(),
                fence,
            });
        }

        state.queue.push_back(Job {
            context: req.context,
            executed,
            thresholds,
            sync_file: signal,
        });
        debug!(context = req.context, fence, sync_file, "job queued");
        self.shared.cond.notify_all();
        Ok(())
    }

    fn release_mapping(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let mut state = self.shared.lock();
        if let Some(bo) = state.buffers.values_mut().find(|bo| bo.ptr == ptr) {
            if bo.maps == 0 || len > bo.size {
                return Err(errno(libc::EINVAL));
            }
            bo.maps -= 1;
            return Ok(());
        }
        let index = state
            .orphans
            .iter()
            .position(|bo| bo.ptr == ptr)
            .ok_or_else(|| errno(libc::EINVAL))?;
        let bo = &mut state.orphans[index];
        bo.maps -= 1;
        if bo.maps == 0 {
            state.orphans.swap_remove(index);
        }
        Ok(())
    }
}

/// Copies `count` elements from a user-space array address.
///
/// # Safety
///
/// A non-zero `addr` must point at `count` live, aligned elements of `T`.
unsafe fn copy_from_user<T: bytemuck::Pod>(addr: u64, count: u32) -> io::Result<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if addr == 0 || addr as usize % std::mem::align_of::<T>() != 0 {
        return Err(errno(libc::EFAULT));
    }
    // SAFETY: upheld by the caller.
    Ok(unsafe { std::slice::from_raw_parts(addr as usize as *const T, count as usize) }.to_vec())
}

/// Decodes `arg` as `R`, runs `f`, and copies the request back like `drm_ioctl` does.
fn dispatch<R: DrmRequest>(arg: &mut [u8], f: impl FnOnce(&mut R) -> io::Result<()>) -> io::Result<()> {
    if arg.len() != size_of::<R>() {
        return Err(errno(libc::EINVAL));
    }
    let mut req: R = bytemuck::pod_read_unaligned(arg);
    let result = f(&mut req);
    arg.copy_from_slice(bytemuck::bytes_of(&req));
    trace!(request = R::NAME, ok = result.is_ok(), "ioctl");
    result
}

impl Device for EmulatedHost1x {
    unsafe fn ioctl(&self, code: u32, arg: &mut [u8]) -> io::Result<()> {
        match code {
            DRM_IOCTL_TEGRA_GEM_CREATE => dispatch(arg, |r| self.gem_create(r)),
            DRM_IOCTL_TEGRA_GEM_MMAP => dispatch(arg, |r| self.gem_mmap(r)),
            DRM_IOCTL_GEM_CLOSE => dispatch(arg, |r| self.gem_close(r)),
            DRM_IOCTL_TEGRA_OPEN_CHANNEL => dispatch(arg, |r| self.open_channel(r)),
            DRM_IOCTL_TEGRA_CLOSE_CHANNEL => dispatch(arg, |r| self.close_channel(r)),
            DRM_IOCTL_TEGRA_GET_SYNCPT => dispatch(arg, |r| self.get_syncpt(r)),
            DRM_IOCTL_TEGRA_SYNCPT_READ => dispatch(arg, |r| self.syncpt_read(r)),
            DRM_IOCTL_TEGRA_SYNCPT_WAIT => dispatch(arg, |r| self.syncpt_wait(r)),
            // SAFETY: forwarded from this function's own contract.
            DRM_IOCTL_TEGRA_SUBMIT => dispatch(arg, |r| unsafe { self.submit(r) }),
            _ => Err(errno(libc::ENOTTY)),
        }
    }

    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let handle = offset
            .checked_sub(MMAP_OFFSET_BASE)
            .filter(|rel| rel & ((1 << PAGE_SHIFT) - 1) == 0)
            .and_then(|rel| u32::try_from(rel >> PAGE_SHIFT).ok())
            .ok_or_else(|| errno(libc::EINVAL))?;

        let mut state = self.shared.lock();
        let bo = state.buffers.get_mut(&handle).ok_or_else(|| errno(libc::EINVAL))?;
        if len == 0 || len > bo.size {
            return Err(errno(libc::EINVAL));
        }
        bo.maps += 1;
        Ok(bo.ptr)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.release_mapping(ptr, len)
    }
}

impl Drop for EmulatedHost1x {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("host1x emulator worker panicked");
            }
        }
    }
}

fn run_jobs(shared: &Shared) {
    loop {
        let job = {
            let state = shared.lock();
            let mut state = shared
                .cond
                .wait_while(state, |s| s.queue.is_empty() && !s.shutdown)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.shutdown {
                return;
            }
            let Some(job) = state.queue.pop_front() else {
                continue;
            };
            state.running = true;
            job
        };

        let execution = execute(&job.executed, &shared.profile);
        if let Some(fault) = execution.fault {
            debug!(context = job.context, ?fault, "job stopped early");
        }

        let mut state = shared.lock();
        let count = state.values.len();
        for id in execution.increments {
            if let Some(value) = state.values.get_mut(id as usize) {
                *value = value.wrapping_add(1);
            } else {
                trace!(id, count, "increment of nonexistent syncpoint ignored");
            }
        }
        shared.cond.notify_all();

        if !state.job_done(&job) {
            let (guard, _) = shared
                .cond
                .wait_timeout_while(state, shared.config.job_timeout, |s| {
                    !s.shutdown && !s.job_done(&job)
                })
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
            if state.shutdown {
                return;
            }
            if !state.job_done(&job) {
                warn!(context = job.context, "job timed out, completing with CPU increments");
                for &(id, threshold) in &job.thresholds {
                    let value = &mut state.values[id as usize];
                    if !syncpt_reached(*value, threshold) {
                        *value = threshold;
                    }
                }
                state.jobs_timed_out += 1;
                shared.cond.notify_all();
            }
        }

        state.jobs_completed += 1;
        state.running = false;
        drop(state);

        if let Some(signal) = job.sync_file {
            signal_sync_file(&signal);
        }
    }
}

/// Makes the waiter's end readable. The waiter may already have closed it.
fn signal_sync_file(signal: &UnixStream) {
    let byte = 1u8;
    // SAFETY: one byte from a live local; MSG_NOSIGNAL turns a closed peer into EPIPE.
    let ret = unsafe {
        libc::send(
            signal.as_raw_fd(),
            std::ptr::addr_of!(byte).cast(),
            1,
            libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        trace!(err = %io::Error::last_os_error(), "sync file waiter gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_aware_threshold_comparison() {
        assert!(syncpt_reached(5, 5));
        assert!(syncpt_reached(6, 5));
        assert!(!syncpt_reached(4, 5));
        assert!(syncpt_reached(2, u32::MAX - 1));
        assert!(!syncpt_reached(u32::MAX - 1, 2));
    }

    #[test]
    fn unknown_request_is_enotty() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let mut arg = [0u8; 8];
        // SAFETY: no user pointers involved.
        let err = unsafe { emu.ioctl(0xdead_0000, &mut arg) }.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTTY));
    }

    #[test]
    fn short_argument_is_rejected() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let mut arg = [0u8; 4];
        // SAFETY: no user pointers involved.
        let err = unsafe { emu.ioctl(DRM_IOCTL_TEGRA_GEM_CREATE, &mut arg) }.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn handles_are_reused_lowest_first() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let create = |size| {
            let mut req = DrmTegraGemCreate {
                size,
                ..Default::default()
            };
            emu.gem_create(&mut req).unwrap();
            req.handle
        };
        let a = create(16);
        let b = create(16);
        emu.gem_close(&mut DrmGemClose { handle: a, pad: 0 }).unwrap();
        assert_eq!(create(32), a);
        assert_ne!(a, b);
    }

    #[test]
    fn memory_limit_is_enforced() {
        let emu = EmulatedHost1x::new(EmulatorConfig {
            memory_limit: 4096,
            ..EmulatorConfig::default()
        });
        let mut req = DrmTegraGemCreate {
            size: 4097,
            ..Default::default()
        };
        let err = emu.gem_create(&mut req).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn closing_a_mapped_buffer_defers_the_free() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let mut create = DrmTegraGemCreate {
            size: 64,
            ..Default::default()
        };
        emu.gem_create(&mut create).unwrap();
        let mut mmap = DrmTegraGemMmap {
            handle: create.handle,
            ..Default::default()
        };
        emu.gem_mmap(&mut mmap).unwrap();
        let ptr = emu.mmap(mmap.offset, 64).unwrap();

        emu.gem_close(&mut DrmGemClose {
            handle: create.handle,
            pad: 0,
        })
        .unwrap();
        assert_eq!(emu.stats().buffers, 0);
        assert_eq!(emu.stats().mappings, 1);

        // SAFETY: mapping obtained above and not yet released.
        unsafe { emu.munmap(ptr, 64) }.unwrap();
        assert_eq!(emu.stats().mappings, 0);
    }

    #[test]
    fn short_job_stays_pending_until_the_job_timeout() {
        let emu = EmulatedHost1x::new(EmulatorConfig {
            job_timeout: Duration::from_millis(200),
            ..EmulatorConfig::for_soc(Soc::Tegra30)
        });
        assert_eq!(emu.config().job_timeout, Duration::from_millis(200));
        assert_eq!(emu.profile().soc(), Soc::Tegra30);

        let mut open = DrmTegraOpenChannel {
            client: Host1xClass::Gr2d.as_u32(),
            ..Default::default()
        };
        emu.open_channel(&mut open).unwrap();
        let mut get = DrmTegraGetSyncpt {
            context: open.context,
            ..Default::default()
        };
        emu.get_syncpt(&mut get).unwrap();

        let mut create = DrmTegraGemCreate {
            size: 8,
            ..Default::default()
        };
        emu.gem_create(&mut create).unwrap();
        let syncpts = [DrmTegraSyncpt { id: get.id, incrs: 1 }];
        let cmdbufs = [DrmTegraCmdbuf {
            handle: create.handle,
            offset: 0,
            words: 2,
            pad: 0,
        }];
        let mut submit = DrmTegraSubmit {
            context: open.context,
            num_syncpts: 1,
            num_cmdbufs: 1,
            syncpts: syncpts.as_ptr() as u64,
            cmdbufs: cmdbufs.as_ptr() as u64,
            ..Default::default()
        };
        // SAFETY: both arrays outlive the call and match their counts.
        unsafe { emu.submit(&mut submit) }.unwrap();
        assert_eq!(emu.stats().jobs_pending, 1);

        let mut wait = DrmTegraSyncptWait {
            id: get.id,
            thresh: submit.fence,
            timeout: DRM_TEGRA_NO_TIMEOUT,
            value: 0,
        };
        emu.syncpt_wait(&mut wait).unwrap();
        let stats = emu.stats();
        assert_eq!(stats.jobs_pending, 0);
        assert_eq!(stats.jobs_timed_out, 1);
    }

    #[test]
    fn mmap_rejects_foreign_offsets() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        assert_eq!(emu.mmap(0, 16).unwrap_err().raw_os_error(), Some(libc::EINVAL));
        assert_eq!(
            emu.mmap(MMAP_OFFSET_BASE + (7 << PAGE_SHIFT), 16)
                .unwrap_err()
                .raw_os_error(),
            Some(libc::EINVAL)
        );
    }
}
