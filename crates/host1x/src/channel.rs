use host1x_uapi::opcode::Host1xClass;
use host1x_uapi::tegra_drm::{DrmTegraCloseChannel, DrmTegraGetSyncpt, DrmTegraOpenChannel};
use tracing::{debug, warn};

use crate::device::{request, Device};
use crate::error::{Error, Result};
use crate::platform::PlatformProfile;

/// An execution context on one host1x engine.
///
/// Syncpoint ids obtained through [`Channel::syncpoint`] are only meaningful
/// for submissions on this channel.
#[derive(Debug)]
pub struct Channel<'d, D: Device + ?Sized> {
    device: &'d D,
    context: u64,
    class: Host1xClass,
}

impl<'d, D: Device + ?Sized> Channel<'d, D> {
    pub fn open(device: &'d D, class: Host1xClass) -> Result<Self> {
        let mut args = DrmTegraOpenChannel {
            client: class.as_u32(),
            ..Default::default()
        };
        // SAFETY: OPEN_CHANNEL carries no user pointers.
        unsafe { request(device, &mut args) }.map_err(Error::ChannelOpen)?;

        debug!(context = args.context, class = class.name(), "opened channel");
        Ok(Self {
            device,
            context: args.context,
            class,
        })
    }

    /// Opens the engine `profile` names as the default for its SoC.
    pub fn open_default(device: &'d D, profile: &PlatformProfile) -> Result<Self> {
        Self::open(device, profile.default_class())
    }

    /// Allocates the syncpoint at slot `index` of this context and returns its id.
    pub fn syncpoint(&self, index: u32) -> Result<u32> {
        let mut args = DrmTegraGetSyncpt {
            context: self.context,
            index,
            ..Default::default()
        };
        // SAFETY: GET_SYNCPT carries no user pointers.
        unsafe { request(self.device, &mut args) }
            .map_err(|source| Error::SyncpointAllocation { index, source })?;
        Ok(args.id)
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn class(&self) -> Host1xClass {
        self.class
    }

    pub fn device(&self) -> &'d D {
        self.device
    }
}

impl<D: Device + ?Sized> Drop for Channel<'_, D> {
    fn drop(&mut self) {
        let mut args = DrmTegraCloseChannel {
            context: self.context,
        };
        // SAFETY: CLOSE_CHANNEL carries no user pointers.
        if let Err(err) = unsafe { request(self.device, &mut args) } {
            warn!(context = self.context, %err, "failed to close channel");
        }
    }
}
