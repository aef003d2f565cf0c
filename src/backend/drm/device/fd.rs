use drm::{
    buffer,
    control::{connector, crtc, encoder, framebuffer, Device as ControlDevice, FbCmd2Flags, Mode},
    Device as BasicDevice, DriverCapability,
};
use std::{
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd},
    path::PathBuf,
    ptr::NonNull,
    sync::Arc,
};
use tracing::{error, info, trace, warn};

use super::{ConnectorInfo, CrtcState, DisplayDevice, DumbAllocation, EncoderInfo, Resources};
use crate::{
    backend::{
        allocator::Buffer,
        drm::framebuffer::{LegacyFramebuffer, PlanarFramebuffer},
    },
    utils::{DevPath, DeviceFd},
};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: DeviceFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// `DeviceFd`, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: DeviceFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
        };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // This is only needed on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Returns if the master lock was acquired for this device
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

fn invalid_handle(raw: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("kernel returned invalid buffer handle {}", raw),
    )
}

impl DisplayDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        DevPath::dev_path(self)
    }

    fn supports_dumb_buffers(&self) -> io::Result<bool> {
        Ok(self.get_driver_capability(DriverCapability::DumbBuffer)? != 0)
    }

    fn resources(&self) -> io::Result<Resources> {
        let handles = self.resource_handles()?;
        Ok(Resources {
            connectors: handles.connectors().to_vec(),
            crtcs: handles.crtcs().to_vec(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        let info = self.get_connector(handle, false)?;
        Ok(ConnectorInfo {
            handle: info.handle(),
            interface: info.interface(),
            state: info.state(),
            modes: info.modes().to_vec(),
            current_encoder: info.current_encoder(),
            encoders: info.encoders().to_vec(),
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        let info = self.get_encoder(handle)?;
        // drm-rs keeps the raw mask private, rebuild it from the crtcs it resolves to.
        let res_handles = self.resource_handles()?;
        let allowed = res_handles.filter_crtcs(info.possible_crtcs());
        let possible_crtcs = res_handles
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| allowed.contains(crtc))
            .fold(0u32, |mask, (idx, _)| mask | (1 << idx));

        Ok(EncoderInfo {
            handle: info.handle(),
            crtc: info.crtc(),
            possible_crtcs,
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcState> {
        let info = self.get_crtc(handle)?;
        Ok(CrtcState {
            handle: info.handle(),
            framebuffer: info.framebuffer(),
            position: info.position(),
            mode: info.mode(),
        })
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        ControlDevice::set_crtc(self, crtc, framebuffer, position, connectors, mode)
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let created = drm_ffi::mode::dumbbuffer::create(self.as_fd(), width, height, bpp, 0)?;
        let handle: buffer::Handle =
            drm::control::from_u32(created.handle).ok_or_else(|| invalid_handle(created.handle))?;
        trace!(?handle, pitch = created.pitch, size = created.size, "created dumb buffer");
        Ok(DumbAllocation {
            handle,
            pitch: created.pitch,
            size: created.size,
        })
    }

    fn map_offset(&self, handle: buffer::Handle) -> io::Result<u64> {
        let map = drm_ffi::mode::dumbbuffer::map(self.as_fd(), handle.into(), 0, 0)?;
        Ok(map.offset)
    }

    fn map_memory(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        use rustix::mm::{mmap, MapFlags, ProtFlags};

        // SAFETY: we let the kernel pick the address, so no existing mapping is replaced.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.as_fd(),
                offset,
            )
        }
        .map_err(io::Error::from)?;

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))
    }

    unsafe fn unmap_memory(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: upheld by the caller
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }.map_err(io::Error::from)
    }

    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.as_fd(), handle.into())?;
        Ok(())
    }

    fn add_framebuffer(&self, buffer: &LegacyFramebuffer) -> io::Result<framebuffer::Handle> {
        ControlDevice::add_framebuffer(self, buffer, buffer.depth, buffer.bpp)
    }

    fn add_planar_framebuffer(&self, buffer: &PlanarFramebuffer) -> io::Result<framebuffer::Handle> {
        let flags = if buffer.modifier.is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        ControlDevice::add_planar_framebuffer(self, buffer, flags)
    }

    fn destroy_framebuffer(&self, handle: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, handle)
    }

    // cursor planes are only reachable through atomic modesetting
    #[allow(deprecated)]
    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<&Buffer>) -> io::Result<()> {
        ControlDevice::set_cursor(self, crtc, buffer)
    }

    #[allow(deprecated)]
    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()> {
        ControlDevice::move_cursor(self, crtc, position)
    }

    fn dirty_framebuffer(&self, handle: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::dirty_framebuffer(self, handle, &[])
    }
}
