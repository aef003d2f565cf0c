//! Module for [DumbBuffer](https://01.org/linuxgraphics/gfx-docs/drm/gpu/drm-kms.html#dumb-buffer-objects) buffers

use std::ptr::NonNull;

use tracing::{instrument, trace};

use super::{Allocator, Buffer, BufferRole, Storage, Tiling, FORMAT};
use crate::backend::drm::{error::AccessError, framebuffer::LEGACY_BPP, DisplayDevice, Error};

/// Allocator creating linear kernel dumb buffers.
#[derive(Debug, Clone)]
pub struct DumbAllocator<D> {
    device: D,
}

impl<D: DisplayDevice> DumbAllocator<D> {
    /// Create a new [`DumbAllocator`] for the given device
    pub fn new(device: D) -> Self {
        DumbAllocator { device }
    }
}

impl<D: DisplayDevice> Allocator for DumbAllocator<D> {
    fn tiling(&self) -> Tiling {
        // dumb buffers are always linear
        Tiling::Linear
    }

    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn allocate(&mut self, width: u32, height: u32, role: BufferRole) -> Result<Buffer, Error> {
        let created = self
            .device
            .create_dumb_buffer(width, height, LEGACY_BPP)
            .map_err(|source| Error::AllocationFailed {
                width,
                height,
                source: AccessError {
                    errmsg: "Failed to create dumb buffer",
                    dev: self.device.dev_path(),
                    source,
                },
            })?;
        trace!(handle = ?created.handle, pitch = created.pitch, "allocated dumb buffer");

        Ok(Buffer {
            width,
            height,
            stride: created.pitch,
            size: created.size,
            format: FORMAT,
            handle: created.handle,
            map: None,
            fb: None,
            tiling: Tiling::Linear,
            role,
            storage: Storage::Dumb,
        })
    }

    #[profiling::function]
    fn map(&mut self, buffer: &mut Buffer) -> Result<NonNull<u8>, Error> {
        buffer.map_with(&self.device)
    }

    fn destroy(&mut self, buffer: Buffer) {
        buffer.release_with(&self.device)
    }
}
