//! Kernel ABI for the Tegra DRM host1x submission path.
//!
//! - [`tegra_drm`]: request structs and ioctl command codes (`tegra_drm.h`).
//! - [`opcode`]: host1x command word encoders and class ids (`host1x.h`).
//!
//! Everything here is plain data; the request structs are `Pod` so they can be
//! handed to a transport as raw bytes.

pub mod opcode;
pub mod tegra_drm;

pub use opcode::Host1xClass;
