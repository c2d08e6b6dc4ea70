//! Command submission and syncpoint synchronization for host1x engines on
//! NVIDIA Tegra SoCs, over the Tegra DRM (staging) interface.
//!
//! The layer is built bottom-up:
//!
//! - [`Device`]: the driver transport ([`DrmDevice`] for `/dev/dri/cardN`,
//!   [`emu::EmulatedHost1x`] for an in-process model)
//! - [`GemBuffer`]: one GEM buffer object with an optional CPU mapping
//! - [`Channel`]: an execution context for one host1x class, owning its syncpoint
//! - [`Submit`]: single-use job builder producing a [`SubmitResult`] fence
//! - [`wait_syncpoint`] / [`wait_fence_fd`]: blocking waits with [`Timeout`]
//! - [`PlatformProfile`]: per-[`Soc`] opcode layout and default class
//!
//! Command words are built with the encoders in [`host1x_uapi::opcode`].

mod channel;
mod device;
pub mod emu;
mod error;
mod gem;
mod platform;
mod submit;
mod sync;

pub use channel::Channel;
pub use device::{request, Device, DrmDevice, DEFAULT_DEVICE_PATH};
pub use error::{Error, Result};
pub use gem::GemBuffer;
pub use platform::{PlatformProfile, Soc, UnknownSoc, DEFAULT_COMPATIBLE_PATH};
pub use submit::{Fence, Submit, SubmitFlags, SubmitQuirks, SubmitResult};
pub use sync::{read_syncpoint, wait_fence_fd, wait_syncpoint, Timeout};

pub use host1x_uapi::Host1xClass;
