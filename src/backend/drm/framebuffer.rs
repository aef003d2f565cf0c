//! Utilities to attach [`framebuffer::Handle`]s to allocated buffers
//!
//! Linear buffers are attached through the legacy interface using a fixed depth and bpp.
//! Tiled buffers carry a layout the display engine has to be told about, so they are
//! attached plane by plane including their modifier.

use drm::{
    buffer::{self, PlanarBuffer},
    control::framebuffer,
};
use tracing::{trace, warn};

use super::{
    error::{AccessError, Error},
    DisplayDevice,
};
use crate::backend::allocator::{Buffer, BufferRole, Fourcc, Modifier, Tiling};

/// Color depth used for legacy framebuffers
pub const LEGACY_DEPTH: u32 = 24;
/// Bits per pixel used for legacy framebuffers
pub const LEGACY_BPP: u32 = 32;

/// Single plane framebuffer description with an implicit layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyFramebuffer {
    /// Size in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub format: Fourcc,
    /// Row stride in bytes
    pub pitch: u32,
    /// Gem handle of the backing buffer
    pub handle: buffer::Handle,
    /// Color depth
    pub depth: u32,
    /// Bits per pixel
    pub bpp: u32,
}

impl buffer::Buffer for LegacyFramebuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

/// Framebuffer description with up to four planes and an explicit modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanarFramebuffer {
    /// Size in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub format: Fourcc,
    /// Layout of the planes, `None` for an implicit layout
    pub modifier: Option<Modifier>,
    /// Gem handles per plane
    pub handles: [Option<buffer::Handle>; 4],
    /// Row stride per plane
    pub pitches: [u32; 4],
    /// Offset into the buffer per plane
    pub offsets: [u32; 4],
}

impl PlanarBuffer for PlanarFramebuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<Modifier> {
        self.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

/// Attach a [`framebuffer::Handle`] to a scanout [`Buffer`]
///
/// On success the framebuffer is recorded on the buffer. On failure the buffer is left untouched,
/// rolling it back is up to the caller.
#[profiling::function]
pub fn bind<D: DisplayDevice>(device: &D, buffer: &mut Buffer) -> Result<framebuffer::Handle, Error> {
    if buffer.role != BufferRole::Scanout {
        return Err(Error::InvalidBufferRole(buffer.role));
    }

    let ret = match buffer.tiling {
        Tiling::Linear => device.add_framebuffer(&LegacyFramebuffer {
            size: (buffer.width, buffer.height),
            format: buffer.format,
            pitch: buffer.stride,
            handle: buffer.handle,
            depth: LEGACY_DEPTH,
            bpp: LEGACY_BPP,
        }),
        tiling => device.add_planar_framebuffer(&PlanarFramebuffer {
            size: (buffer.width, buffer.height),
            format: buffer.format,
            modifier: Some(tiling.modifier()),
            handles: [Some(buffer.handle), None, None, None],
            pitches: [buffer.stride, 0, 0, 0],
            offsets: [0; 4],
        }),
    };

    let fb = ret.map_err(|source| {
        Error::BindFailed(AccessError {
            errmsg: "Failed to add framebuffer",
            dev: device.dev_path(),
            source,
        })
    })?;
    trace!(?fb, handle = ?buffer.handle, tiling = ?buffer.tiling, "bound framebuffer");
    buffer.fb = Some(fb);
    Ok(fb)
}

/// Remove a framebuffer previously created by [`bind`]
///
/// Failures are logged, there is nothing a caller could do about them.
pub fn unbind<D: DisplayDevice>(device: &D, fb: framebuffer::Handle) {
    trace!(?fb, "destroying framebuffer");
    if let Err(err) = device.destroy_framebuffer(fb) {
        warn!(?fb, ?err, "failed to destroy framebuffer");
    }
}
