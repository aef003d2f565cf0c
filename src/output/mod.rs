//! Output provisioning
//!
//! This module lights up every usable connector of a device. A [`ResourceManager`]
//! walks all connectors, lets a [`DisplayProvisioner`] pick a mode and a free crtc
//! and allocate the buffers of each, and programs the crtcs to show the first buffer.
//! Dropping the manager (or calling [`ResourceManager::teardown`]) restores the
//! previous crtc configuration and frees every buffer again.
//!
//! ```no_run
//! use modeset::backend::{allocator::Backend, drm::DrmDeviceFd};
//! use modeset::output::{config::ProvisionConfig, ResourceManager};
//! use modeset::utils::DeviceFd;
//!
//! let device = DrmDeviceFd::new(DeviceFd::open("/dev/dri/card0").unwrap());
//! let backend = Backend::dumb(device.clone());
//! let mut manager = ResourceManager::new(device, backend, ProvisionConfig::default());
//!
//! for display in manager.provision_all().unwrap() {
//!     println!("{:?} on {:?}: {:?}", display.connector(), display.crtc(), display.mode().size());
//! }
//! // everything is released once `manager` goes out of scope
//! ```

use drm::control::{connector, crtc, Mode};
use smallvec::SmallVec;
use tracing::trace;

use crate::backend::{
    allocator::Buffer,
    drm::{AccessError, CrtcState, DisplayDevice, Error},
};

const ENOSYS: i32 = 38;

pub mod config;
pub mod crtc_mapper;
mod manager;
mod provision;

pub use self::manager::ResourceManager;
pub use self::provision::DisplayProvisioner;

/// A connector driven by a crtc, together with the buffers it scans out.
#[derive(Debug)]
pub struct Display {
    pub(crate) connector: connector::Handle,
    pub(crate) interface: connector::Interface,
    pub(crate) crtc: crtc::Handle,
    pub(crate) mode: Mode,
    pub(crate) buffers: SmallVec<[Buffer; 3]>,
    pub(crate) cursor: Buffer,
    pub(crate) saved_crtc: Option<CrtcState>,
    pub(crate) enabled: bool,
    pub(crate) cursor_visible: bool,
    pub(crate) front: usize,
}

impl Display {
    /// Connector of this display
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Kind of port the connector is
    pub fn interface(&self) -> connector::Interface {
        self.interface
    }

    /// Crtc driving the connector
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Mode the crtc is programmed with
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Scanout buffers, each bound to a framebuffer
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Scanout buffers, for drawing into them
    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    /// Cursor buffer
    pub fn cursor(&self) -> &Buffer {
        &self.cursor
    }

    /// Cursor buffer, for drawing into it
    pub fn cursor_mut(&mut self) -> &mut Buffer {
        &mut self.cursor
    }

    /// Whether the crtc was successfully programmed to show this display
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Crtc configuration found before this display was applied
    pub fn saved_crtc(&self) -> Option<&CrtcState> {
        self.saved_crtc.as_ref()
    }

    /// Index of the buffer currently on screen
    pub fn front_index(&self) -> usize {
        self.front
    }

    /// Buffer currently on screen
    pub fn front_buffer(&self) -> &Buffer {
        &self.buffers[self.front]
    }

    /// Mark the buffer at `index` as being on screen
    pub fn set_front(&mut self, index: usize) -> Result<(), Error> {
        if index >= self.buffers.len() {
            return Err(Error::InvalidBufferIndex {
                index,
                count: self.buffers.len(),
            });
        }
        self.front = index;
        Ok(())
    }

    /// Index of the buffer to show after the current front buffer
    pub fn next_index(&self) -> usize {
        (self.front + 1) % self.buffers.len()
    }

    /// Whether the cursor buffer is on the cursor plane of the crtc
    pub fn is_cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    /// Show the cursor buffer at `position`, relative to the top left corner of the display
    pub fn show_cursor<D: DisplayDevice>(&mut self, device: &D, position: (i32, i32)) -> Result<(), Error> {
        device
            .set_cursor(self.crtc, Some(&self.cursor))
            .map_err(|source| self.cursor_err(device, "Failed to set cursor", source))?;
        self.cursor_visible = true;
        trace!(crtc = ?self.crtc, handle = ?self.cursor.handle(), "cursor shown");
        self.move_cursor(device, position)
    }

    /// Move the cursor to `position`
    pub fn move_cursor<D: DisplayDevice>(&self, device: &D, position: (i32, i32)) -> Result<(), Error> {
        device
            .move_cursor(self.crtc, position)
            .map_err(|source| self.cursor_err(device, "Failed to move cursor", source))
    }

    /// Take the cursor buffer off the cursor plane
    pub fn hide_cursor<D: DisplayDevice>(&mut self, device: &D) -> Result<(), Error> {
        device
            .set_cursor(self.crtc, None)
            .map_err(|source| self.cursor_err(device, "Failed to hide cursor", source))?;
        self.cursor_visible = false;
        Ok(())
    }

    /// Tell the display engine that the front buffer was drawn to.
    ///
    /// Devices scanning out directly from memory have nothing to flush, that is not an error.
    pub fn flush_front<D: DisplayDevice>(&self, device: &D) -> Result<(), Error> {
        let Some(fb) = self.front_buffer().framebuffer() else {
            return Ok(());
        };
        match device.dirty_framebuffer(fb) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(ENOSYS) => {
                trace!(?fb, "device does not track dirty framebuffers");
                Ok(())
            }
            Err(source) => Err(Error::FlushFailed {
                fb,
                source: AccessError {
                    errmsg: "Failed to flush framebuffer",
                    dev: device.dev_path(),
                    source,
                },
            }),
        }
    }

    fn cursor_err<D: DisplayDevice>(&self, device: &D, errmsg: &'static str, source: std::io::Error) -> Error {
        Error::CursorFailed {
            crtc: self.crtc,
            source: AccessError {
                errmsg,
                dev: device.dev_path(),
                source,
            },
        }
    }
}
