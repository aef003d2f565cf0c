//! Drm/Kms device access and framebuffer management
//!
//! This module provides the [`DisplayDevice`] abstraction over the modesetting
//! calls needed to light up outputs, and [`DrmDeviceFd`] implementing it on top
//! of an open drm node.
//!
//! ## How to use it
//!
//! ```rust,no_run
//! use modeset::backend::drm::{DisplayDevice, DrmDeviceFd};
//! use modeset::utils::DeviceFd;
//!
//! let fd = DeviceFd::open("/dev/dri/card0").expect("failed to open drm node");
//! let device = DrmDeviceFd::new(fd);
//!
//! // Get a set of all modesetting resource handles
//! let resources = device.resources().unwrap();
//! for connector in resources.connectors {
//!     let info = device.connector(connector).unwrap();
//!     println!("{:?}: {:?} with {} modes", connector, info.state, info.modes.len());
//! }
//! ```
//!
//! Buffers to scan out are created by the allocators of [`crate::backend::allocator`]
//! and attached to framebuffers through [`framebuffer::bind`].

pub(crate) mod device;
pub mod error;
pub mod framebuffer;
#[cfg(any(test, feature = "device_test"))]
pub mod test;

pub use device::{
    ConnectorInfo, CrtcState, DisplayDevice, DrmDeviceFd, DumbAllocation, EncoderInfo, Resources,
};
pub use error::{AccessError, Error, UnusableReason};
