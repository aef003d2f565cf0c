use std::{io, path::PathBuf, ptr::NonNull};

use drm::{
    buffer,
    control::{connector, crtc, encoder, framebuffer, Mode},
};

use super::framebuffer::{LegacyFramebuffer, PlanarFramebuffer};
use crate::backend::allocator::Buffer;

mod fd;
pub use fd::DrmDeviceFd;

/// Modesetting resources of a device, in the order reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// Connectors of the device
    pub connectors: Vec<connector::Handle>,
    /// Crtcs of the device
    pub crtcs: Vec<crtc::Handle>,
}

impl Resources {
    /// Resolve an encoder's `possible_crtcs` bitmask into crtc handles.
    ///
    /// Bit `j` of the mask refers to the `j`-th crtc of the device.
    pub fn filter_crtcs(&self, possible_crtcs: u32) -> impl Iterator<Item = crtc::Handle> + '_ {
        self.crtcs
            .iter()
            .enumerate()
            .filter(move |(idx, _)| *idx < 32 && possible_crtcs & (1 << idx) != 0)
            .map(|(_, crtc)| *crtc)
    }

    /// Bitmask position of the given crtc
    pub fn crtc_index(&self, crtc: crtc::Handle) -> Option<usize> {
        self.crtcs.iter().position(|c| *c == crtc)
    }
}

/// Information about a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Handle of the connector
    pub handle: connector::Handle,
    /// Kind of physical port
    pub interface: connector::Interface,
    /// Whether a sink is attached
    pub state: connector::State,
    /// Modes advertised by the attached sink, preferred mode first
    pub modes: Vec<Mode>,
    /// Encoder currently driving the connector
    pub current_encoder: Option<encoder::Handle>,
    /// Encoders able to drive the connector, in hardware order
    pub encoders: Vec<encoder::Handle>,
}

/// Information about an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Handle of the encoder
    pub handle: encoder::Handle,
    /// Crtc currently bound to the encoder
    pub crtc: Option<crtc::Handle>,
    /// Bitmask of crtcs the encoder can be driven by, see [`Resources::filter_crtcs`]
    pub possible_crtcs: u32,
}

/// Configuration of a crtc as read back from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcState {
    /// Handle of the crtc
    pub handle: crtc::Handle,
    /// Framebuffer currently scanned out
    pub framebuffer: Option<framebuffer::Handle>,
    /// Scanout offset into the framebuffer
    pub position: (u32, u32),
    /// Active mode, `None` if the crtc is disabled
    pub mode: Option<Mode>,
}

/// A freshly created dumb buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    /// Gem handle of the buffer
    pub handle: buffer::Handle,
    /// Row stride in bytes, as chosen by the kernel
    pub pitch: u32,
    /// Total size in bytes
    pub size: u64,
}

/// Kernel modesetting operations needed to provision displays.
///
/// [`DrmDeviceFd`] implements this on top of an open drm node.
/// Every method maps to a single blocking kernel call.
pub trait DisplayDevice {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;

    /// Whether the device is able to create dumb buffers
    fn supports_dumb_buffers(&self) -> io::Result<bool>;

    /// Enumerate connectors and crtcs
    fn resources(&self) -> io::Result<Resources>;

    /// Query a connector
    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo>;

    /// Query an encoder
    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo>;

    /// Read back the configuration of a crtc
    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcState>;

    /// Program a crtc. Passing no framebuffer and no mode disables it.
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()>;

    /// Create a dumb buffer
    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation>;

    /// Retrieve the fake offset to pass to [`DisplayDevice::map_memory`] for a gem handle
    fn map_offset(&self, handle: buffer::Handle) -> io::Result<u64>;

    /// Map `len` bytes at the given offset of the device into our address space
    fn map_memory(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>>;

    /// Unmap memory previously returned by [`DisplayDevice::map_memory`]
    ///
    /// # Safety
    ///
    /// `ptr` and `len` have to describe exactly one live mapping and no references
    /// into that memory may exist anymore.
    unsafe fn unmap_memory(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Destroy a dumb buffer
    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()>;

    /// Attach a framebuffer using a fixed depth and bits per pixel
    fn add_framebuffer(&self, buffer: &LegacyFramebuffer) -> io::Result<framebuffer::Handle>;

    /// Attach a framebuffer described plane by plane, optionally carrying a modifier
    fn add_planar_framebuffer(&self, buffer: &PlanarFramebuffer) -> io::Result<framebuffer::Handle>;

    /// Remove a framebuffer
    fn destroy_framebuffer(&self, handle: framebuffer::Handle) -> io::Result<()>;

    /// Scan out `buffer` on the cursor plane of a crtc, `None` hides the cursor
    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<&Buffer>) -> io::Result<()>;

    /// Move the cursor of a crtc, relative to the top left corner of the crtc
    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()>;

    /// Flush rendering into a framebuffer that is currently scanned out.
    ///
    /// Drivers scanning out directly from memory report `ENOSYS`.
    fn dirty_framebuffer(&self, handle: framebuffer::Handle) -> io::Result<()>;
}
