//! Module for tiled buffers created using [libgbm](gbm).
//!
//! The [`GbmAllocator`] owns a [`GbmDevice`] opened on a duplicate of the drm file descriptor.
//! Buffers are requested with the modifier of the configured [`Tiling`] and mapped through
//! gbm, which presents tiled memory to the cpu in linear order.

use std::{
    ffi::c_void,
    fmt, io,
    os::unix::io::{AsFd, OwnedFd},
    ptr::{self, NonNull},
};

use drm::buffer::Buffer as DrmBuffer;
pub use gbm::{BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};
use gbm::{AsRaw, BufferObject};
use tracing::{debug, instrument, trace, warn};

use super::{Allocator, Buffer, BufferRole, Mapping, Storage, Tiling, FORMAT};
use crate::backend::drm::{error::AccessError, DisplayDevice, Error};

/// Allocator creating buffers of a fixed tiling layout through gbm
pub struct GbmAllocator<D> {
    device: D,
    gbm: GbmDevice<OwnedFd>,
    tiling: Tiling,
}

impl<D: fmt::Debug> fmt::Debug for GbmAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmAllocator")
            .field("device", &self.device)
            .field("tiling", &self.tiling)
            .finish_non_exhaustive()
    }
}

impl<D: DisplayDevice + AsFd> GbmAllocator<D> {
    /// Create a new [`GbmAllocator`] on the given device, handing out buffers of the given tiling.
    ///
    /// The gbm device is destroyed together with the allocator.
    pub fn new(device: D, tiling: Tiling) -> Result<Self, Error> {
        let access_err = |errmsg, source| {
            Error::Access(AccessError {
                errmsg,
                dev: device.dev_path(),
                source,
            })
        };

        let fd = device
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| access_err("Failed to duplicate device fd", source))?;
        let gbm = GbmDevice::new(fd).map_err(|source| access_err("Failed to create gbm device", source))?;
        debug!(backend = ?gbm.backend_name(), ?tiling, "created gbm device");

        Ok(GbmAllocator { device, gbm, tiling })
    }
}

/// Buffer object handed out by a [`GbmAllocator`], together with its cpu mapping
pub(crate) struct GbmBuffer {
    bo: BufferObject<()>,
    map_data: Option<*mut c_void>,
}

impl fmt::Debug for GbmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmBuffer")
            .field("bo", &self.bo)
            .field("mapped", &self.map_data.is_some())
            .finish()
    }
}

impl GbmBuffer {
    fn raw(&self) -> *mut gbm_sys::gbm_bo {
        self.bo.as_raw() as *mut _
    }

    /// Map the whole buffer for reading and writing
    fn map(&mut self, width: u32, height: u32) -> io::Result<Mapping> {
        let mut stride = 0u32;
        let mut map_data: *mut c_void = ptr::null_mut();
        // SAFETY: the bo outlives the mapping, which is released in `unmap` before the bo is dropped
        let ptr = unsafe {
            gbm_sys::gbm_bo_map(
                self.raw(),
                0,
                0,
                width,
                height,
                gbm_sys::gbm_bo_transfer_flags::GBM_BO_TRANSFER_READ_WRITE,
                &mut stride,
                &mut map_data,
            )
        };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)?;
        self.map_data = Some(map_data);

        Ok(Mapping {
            ptr,
            len: stride as usize * height as usize,
            stride,
        })
    }

    /// Release the mapping, writing back what was drawn into it
    pub(crate) fn unmap(&mut self) {
        if let Some(map_data) = self.map_data.take() {
            // SAFETY: `map_data` was handed out by `gbm_bo_map` for this bo and is released only once
            unsafe { gbm_sys::gbm_bo_unmap(self.raw(), map_data) };
        }
    }
}

impl Drop for GbmBuffer {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl<D: DisplayDevice> Allocator for GbmAllocator<D> {
    fn tiling(&self) -> Tiling {
        self.tiling
    }

    #[instrument(level = "trace", skip(self), fields(tiling = ?self.tiling), err)]
    #[profiling::function]
    fn allocate(&mut self, width: u32, height: u32, role: BufferRole) -> Result<Buffer, Error> {
        let (requested, result) = match (role, self.tiling) {
            (BufferRole::Cursor, _) => (
                Tiling::Linear,
                self.gbm.create_buffer_object::<()>(
                    width,
                    height,
                    FORMAT,
                    GbmBufferFlags::CURSOR | GbmBufferFlags::LINEAR | GbmBufferFlags::WRITE,
                ),
            ),
            (BufferRole::Scanout, Tiling::Linear) => (
                Tiling::Linear,
                self.gbm.create_buffer_object::<()>(
                    width,
                    height,
                    FORMAT,
                    GbmBufferFlags::SCANOUT | GbmBufferFlags::LINEAR,
                ),
            ),
            (BufferRole::Scanout, tiling) => (
                tiling,
                self.gbm.create_buffer_object_with_modifiers::<()>(
                    width,
                    height,
                    FORMAT,
                    std::iter::once(tiling.modifier()),
                ),
            ),
        };

        let alloc_err = |errmsg, source| Error::AllocationFailed {
            width,
            height,
            source: AccessError {
                errmsg,
                dev: self.device.dev_path(),
                source,
            },
        };
        let bo = result.map_err(|source| alloc_err("Failed to create gbm buffer object", source))?;
        let stride = bo.stride().map_err(|err| {
            alloc_err(
                "Failed to query gbm buffer stride",
                io::Error::new(io::ErrorKind::NotConnected, err),
            )
        })?;

        // gbm may report an invalid modifier for buffers created without one
        let tiling = bo.modifier().ok().and_then(Tiling::from_modifier).unwrap_or(requested);
        if tiling != requested {
            warn!(?requested, ?tiling, "gbm picked a different layout");
        }
        let handle = DrmBuffer::handle(&bo);
        trace!(?handle, stride, ?tiling, "allocated gbm buffer");

        Ok(Buffer {
            width,
            height,
            stride,
            size: tiling.allocation_size(stride, height),
            format: FORMAT,
            handle,
            map: None,
            fb: None,
            tiling,
            role,
            storage: Storage::Gbm(GbmBuffer { bo, map_data: None }),
        })
    }

    #[profiling::function]
    fn map(&mut self, buffer: &mut Buffer) -> Result<NonNull<u8>, Error> {
        if let Some(mapping) = buffer.map {
            return Ok(mapping.ptr);
        }

        let (width, height) = (buffer.width, buffer.height);
        let mapping = match &mut buffer.storage {
            Storage::Gbm(bo) => bo.map(width, height).map_err(|source| {
                Error::MappingFailed(AccessError {
                    errmsg: "Failed to map gbm buffer object",
                    dev: self.device.dev_path(),
                    source,
                })
            })?,
            Storage::Dumb => return buffer.map_with(&self.device),
        };
        trace!(handle = ?buffer.handle, stride = mapping.stride, "mapped gbm buffer");
        Ok(buffer.set_mapping(mapping))
    }

    fn destroy(&mut self, buffer: Buffer) {
        buffer.release_with(&self.device)
    }
}
