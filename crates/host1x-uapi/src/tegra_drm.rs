//! Tegra DRM request layouts.
//!
//! Source of truth: `include/uapi/drm/tegra_drm.h` (pre-5.17 "staging" ABI)
//! plus `DRM_IOCTL_GEM_CLOSE` from `drm.h`.

use bytemuck::{Pod, Zeroable};

/// Magic type byte shared by every DRM ioctl (`'d'`).
pub const DRM_IOCTL_BASE: u32 = b'd' as u32;
/// First driver-private DRM request number.
pub const DRM_COMMAND_BASE: u32 = 0x40;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    assert!(size < (1 << 14), "ioctl argument too large for _IOC size field");
    (dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

/// `DRM_IOWR(nr, T)`.
pub const fn drm_iowr(nr: u32, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, size)
}

/// `DRM_IOW(nr, T)`.
pub const fn drm_iow(nr: u32, size: usize) -> u32 {
    ioc(IOC_WRITE, nr, size)
}

pub const DRM_TEGRA_GEM_CREATE: u32 = 0x00;
pub const DRM_TEGRA_GEM_MMAP: u32 = 0x01;
pub const DRM_TEGRA_SYNCPT_READ: u32 = 0x02;
pub const DRM_TEGRA_SYNCPT_INCR: u32 = 0x03;
pub const DRM_TEGRA_SYNCPT_WAIT: u32 = 0x04;
pub const DRM_TEGRA_OPEN_CHANNEL: u32 = 0x05;
pub const DRM_TEGRA_CLOSE_CHANNEL: u32 = 0x06;
pub const DRM_TEGRA_GET_SYNCPT: u32 = 0x07;
pub const DRM_TEGRA_SUBMIT: u32 = 0x08;

const DRM_GEM_CLOSE: u32 = 0x09;

/// Timeout value meaning "block until the threshold is reached".
pub const DRM_TEGRA_NO_TIMEOUT: u32 = 0xffff_ffff;

/// Wait on the pre-fence passed in `fence` before running the job.
pub const DRM_TEGRA_FENCE_WAIT: u32 = 1 << 0;
/// Emit a post-fence for the job.
pub const DRM_TEGRA_FENCE_EMIT: u32 = 1 << 1;
/// Fences are sync-file descriptors rather than raw syncpoint thresholds.
pub const DRM_TEGRA_FENCE_FD: u32 = 1 << 2;
pub const DRM_TEGRA_FENCE_FLAGS: u32 = DRM_TEGRA_FENCE_WAIT | DRM_TEGRA_FENCE_EMIT | DRM_TEGRA_FENCE_FD;

/// A request struct together with the command code the driver expects it under.
pub trait DrmRequest: Pod {
    const CODE: u32;
    const NAME: &'static str;
}

macro_rules! drm_request {
    ($ty:ty, $name:literal, iowr($nr:expr)) => {
        impl DrmRequest for $ty {
            const CODE: u32 = drm_iowr(DRM_COMMAND_BASE + $nr, core::mem::size_of::<$ty>());
            const NAME: &'static str = $name;
        }
    };
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraGemCreate {
    pub size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraGemMmap {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

impl DrmRequest for DrmGemClose {
    const CODE: u32 = drm_iow(DRM_GEM_CLOSE, core::mem::size_of::<DrmGemClose>());
    const NAME: &'static str = "GEM_CLOSE";
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraSyncptRead {
    pub id: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraSyncptWait {
    pub id: u32,
    pub thresh: u32,
    /// Milliseconds, or [`DRM_TEGRA_NO_TIMEOUT`].
    pub timeout: u32,
    /// Counter value observed when the wait returned.
    pub value: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraOpenChannel {
    /// Host1x class of the engine to open.
    pub client: u32,
    pub pad: u32,
    pub context: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraCloseChannel {
    pub context: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraGetSyncpt {
    pub context: u64,
    pub index: u32,
    pub id: u32,
}

/// Syncpoint increment declaration.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraSyncpt {
    pub id: u32,
    pub incrs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraCmdbuf {
    pub handle: u32,
    /// Byte offset of the first word inside the buffer object.
    pub offset: u32,
    pub words: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraRelocBuffer {
    pub handle: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraReloc {
    /// Location patched with the target address.
    pub cmdbuf: DrmTegraRelocBuffer,
    pub target: DrmTegraRelocBuffer,
    pub shift: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraWaitchk {
    pub handle: u32,
    pub offset: u32,
    pub syncpt: u32,
    pub thresh: u32,
}

/// The `SUBMIT` request.
///
/// `syncpts`, `cmdbufs`, `relocs` and `waitchks` are user-space addresses of
/// arrays of the matching element type, `num_*` entries long.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrmTegraSubmit {
    pub context: u64,
    pub num_syncpts: u32,
    pub num_cmdbufs: u32,
    pub num_relocs: u32,
    pub num_waitchks: u32,
    pub waitchk_mask: u32,
    pub timeout: u32,
    pub syncpts: u64,
    pub cmdbufs: u64,
    pub relocs: u64,
    pub waitchks: u64,
    /// Return value: syncpoint threshold, or a sync-file fd with [`DRM_TEGRA_FENCE_FD`].
    pub fence: u32,
    pub flags: u32,
    pub reserved: [u32; 4],
}

drm_request!(DrmTegraGemCreate, "TEGRA_GEM_CREATE", iowr(DRM_TEGRA_GEM_CREATE));
drm_request!(DrmTegraGemMmap, "TEGRA_GEM_MMAP", iowr(DRM_TEGRA_GEM_MMAP));
drm_request!(DrmTegraSyncptRead, "TEGRA_SYNCPT_READ", iowr(DRM_TEGRA_SYNCPT_READ));
drm_request!(DrmTegraSyncptWait, "TEGRA_SYNCPT_WAIT", iowr(DRM_TEGRA_SYNCPT_WAIT));
drm_request!(DrmTegraOpenChannel, "TEGRA_OPEN_CHANNEL", iowr(DRM_TEGRA_OPEN_CHANNEL));
drm_request!(DrmTegraCloseChannel, "TEGRA_CLOSE_CHANNEL", iowr(DRM_TEGRA_CLOSE_CHANNEL));
drm_request!(DrmTegraGetSyncpt, "TEGRA_GET_SYNCPT", iowr(DRM_TEGRA_GET_SYNCPT));
drm_request!(DrmTegraSubmit, "TEGRA_SUBMIT", iowr(DRM_TEGRA_SUBMIT));

pub const DRM_IOCTL_TEGRA_GEM_CREATE: u32 = <DrmTegraGemCreate as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_GEM_MMAP: u32 = <DrmTegraGemMmap as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_SYNCPT_READ: u32 = <DrmTegraSyncptRead as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_SYNCPT_WAIT: u32 = <DrmTegraSyncptWait as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_OPEN_CHANNEL: u32 = <DrmTegraOpenChannel as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_CLOSE_CHANNEL: u32 = <DrmTegraCloseChannel as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_GET_SYNCPT: u32 = <DrmTegraGetSyncpt as DrmRequest>::CODE;
pub const DRM_IOCTL_TEGRA_SUBMIT: u32 = <DrmTegraSubmit as DrmRequest>::CODE;
pub const DRM_IOCTL_GEM_CLOSE: u32 = <DrmGemClose as DrmRequest>::CODE;
