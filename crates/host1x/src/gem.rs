use std::io;
use std::ptr::NonNull;

use host1x_uapi::tegra_drm::{DrmGemClose, DrmTegraGemCreate, DrmTegraGemMmap};
use tracing::{debug, warn};

use crate::device::{request, Device};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

/// One GEM buffer object.
///
/// The handle is owned exclusively by this value: dropping it unmaps the CPU
/// view (if any) and closes the handle, exactly once.
#[derive(Debug)]
pub struct GemBuffer<'d, D: Device + ?Sized> {
    device: &'d D,
    handle: u32,
    size: u64,
    mapping: Option<Mapping>,
}

impl<'d, D: Device + ?Sized> GemBuffer<'d, D> {
    pub fn allocate(device: &'d D, size: u64) -> Result<Self> {
        let mut args = DrmTegraGemCreate {
            size,
            ..Default::default()
        };
        // SAFETY: GEM_CREATE carries no user pointers.
        unsafe { request(device, &mut args) }.map_err(|source| Error::Allocation { size, source })?;

        debug!(handle = args.handle, size, "allocated buffer object");
        Ok(Self {
            device,
            handle: args.handle,
            size,
            mapping: None,
        })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// CPU view of the whole buffer.
    ///
    /// The mapping is established on the first call and reused afterwards.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        let mapping = match self.mapping {
            Some(mapping) => mapping,
            None => {
                let mapping = self.establish_mapping()?;
                self.mapping = Some(mapping);
                mapping
            }
        };
        // SAFETY: the mapping covers `len` bytes and lives until `self` is dropped; the
        // returned slice borrows `self` mutably so no other view can coexist.
        Ok(unsafe { std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), mapping.len) })
    }

    fn establish_mapping(&self) -> Result<Mapping> {
        let len = usize::try_from(self.size)
            .map_err(|_| Error::Mapping(io::Error::from_raw_os_error(libc::EOVERFLOW)))?;

        let mut args = DrmTegraGemMmap {
            handle: self.handle,
            ..Default::default()
        };
        // SAFETY: GEM_MMAP carries no user pointers.
        unsafe { request(self.device, &mut args) }.map_err(Error::Mapping)?;

        let ptr = self.device.mmap(args.offset, len).map_err(Error::Mapping)?;
        Ok(Mapping { ptr, len })
    }
}

impl<D: Device + ?Sized> Drop for GemBuffer<'_, D> {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // SAFETY: the mapping came from `mmap` on this device and every slice handed out
            // borrowed `self`, so none outlives this point.
            if let Err(err) = unsafe { self.device.munmap(mapping.ptr, mapping.len) } {
                warn!(handle = self.handle, %err, "failed to unmap buffer object");
            }
        }

        let mut args = DrmGemClose {
            handle: self.handle,
            pad: 0,
        };
        // SAFETY: GEM_CLOSE carries no user pointers.
        if let Err(err) = unsafe { request(self.device, &mut args) } {
            warn!(handle = self.handle, %err, "failed to close buffer object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::{EmulatedHost1x, EmulatorConfig};

    #[test]
    fn zero_sized_allocation_is_rejected() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let err = GemBuffer::allocate(&emu, 0).unwrap_err();
        assert!(matches!(err, Error::Allocation { size: 0, .. }));
        assert_eq!(err.os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn mapping_is_established_once() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let mut bo = GemBuffer::allocate(&emu, 64).unwrap();
        assert!(!bo.is_mapped());

        let first = bo.map().unwrap().as_mut_ptr();
        let second = bo.map().unwrap().as_mut_ptr();
        assert_eq!(first, second);
        assert_eq!(bo.map().unwrap().len(), 64);
        assert_eq!(emu.stats().mappings, 1);
    }

    #[test]
    fn cpu_writes_land_in_the_buffer_object() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        let mut bo = GemBuffer::allocate(&emu, 16).unwrap();
        bo.map().unwrap()[4..8].copy_from_slice(&0xdead_beefu32.to_ne_bytes());
        assert_eq!(emu.read_buffer(bo.handle()).unwrap()[4..8], 0xdead_beefu32.to_ne_bytes());
    }

    #[test]
    fn drop_releases_mapping_and_handle() {
        let emu = EmulatedHost1x::new(EmulatorConfig::default());
        {
            let mut bo = GemBuffer::allocate(&emu, 4096).unwrap();
            bo.map().unwrap();
            assert_eq!(emu.stats().buffers, 1);
        }
        let stats = emu.stats();
        assert_eq!(stats.buffers, 0);
        assert_eq!(stats.mappings, 0);
    }
}
