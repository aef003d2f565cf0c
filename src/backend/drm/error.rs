//! Errors of the drm backend
//!
//! [`Error`] distinguishes failures aborting a whole device from those only
//! affecting a single connector, see [`Error::is_fatal`] and [`Error::is_skip`].

use std::{fmt, io, path::PathBuf};

use drm::control::{connector, crtc, framebuffer};

use crate::backend::allocator::BufferRole;

/// Errors thrown while provisioning or releasing display resources of a [`DisplayDevice`](super::DisplayDevice).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device lacks a capability required to drive any output
    #[error("Device `{dev:?}` does not support {capability}")]
    DeviceUnsupported {
        /// Name of the missing capability
        capability: &'static str,
        /// Device on which the capability was queried
        dev: Option<PathBuf>,
        /// Underlying device error, if the query itself failed
        #[source]
        source: Option<io::Error>,
    },
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The connector cannot be driven and was skipped
    #[error("Connector `{connector:?}` is unusable: {reason}")]
    ConnectorUnusable {
        /// Connector
        connector: connector::Handle,
        /// Why the connector was rejected
        reason: UnusableReason,
    },
    /// Every crtc the connector could use is already claimed
    #[error("No free crtc available for connector `{0:?}`")]
    ControllerUnavailable(connector::Handle),
    /// Creating a buffer object failed
    #[error("Failed to allocate {width}x{height} buffer")]
    AllocationFailed {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Underlying device error
        #[source]
        source: AccessError,
    },
    /// Mapping a buffer object into our address space failed
    #[error("Failed to map buffer")]
    MappingFailed(#[source] AccessError),
    /// Attaching a framebuffer to a buffer object failed
    #[error("Failed to bind framebuffer")]
    BindFailed(#[source] AccessError),
    /// Programming the initial mode on a crtc failed
    #[error("Failed to apply mode on crtc `{crtc:?}`")]
    ControllerApplyFailed {
        /// CRTC
        crtc: crtc::Handle,
        /// Underlying device error
        #[source]
        source: AccessError,
    },
    /// Restoring the previous configuration of a crtc failed
    #[error("Failed to restore crtc `{crtc:?}`")]
    ControllerRestoreFailed {
        /// CRTC
        crtc: crtc::Handle,
        /// Underlying device error
        #[source]
        source: AccessError,
    },
    /// Updating the cursor plane of a crtc failed
    #[error("Failed to update cursor on crtc `{crtc:?}`")]
    CursorFailed {
        /// CRTC
        crtc: crtc::Handle,
        /// Underlying device error
        #[source]
        source: AccessError,
    },
    /// Flushing front buffer rendering to the display engine failed
    #[error("Failed to flush framebuffer `{fb:?}`")]
    FlushFailed {
        /// Framebuffer that was drawn to
        fb: framebuffer::Handle,
        /// Underlying device error
        #[source]
        source: AccessError,
    },
    /// The operation is not valid for a buffer of this role
    #[error("Operation not supported for {0:?} buffers")]
    InvalidBufferRole(BufferRole),
    /// A buffer index outside of the scanout buffers of a display was given
    #[error("Buffer index {index} out of range, display has {count} buffers")]
    InvalidBufferIndex {
        /// Requested index
        index: usize,
        /// Number of scanout buffers
        count: usize,
    },
}

impl Error {
    /// Whether this error aborts provisioning of the whole device,
    /// instead of only affecting a single connector.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceUnsupported { .. } | Error::Access(_))
    }

    /// Whether this error denotes a connector, that was skipped without touching any buffers.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Error::ConnectorUnusable { .. } | Error::ControllerUnavailable(_)
        )
    }

    /// The operating system error code carried by this error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::DeviceUnsupported { source, .. } => source.as_ref().and_then(io::Error::raw_os_error),
            Error::Access(err)
            | Error::AllocationFailed { source: err, .. }
            | Error::MappingFailed(err)
            | Error::BindFailed(err)
            | Error::ControllerApplyFailed { source: err, .. }
            | Error::ControllerRestoreFailed { source: err, .. }
            | Error::CursorFailed { source: err, .. }
            | Error::FlushFailed { source: err, .. } => err.source.raw_os_error(),
            _ => None,
        }
    }
}

/// Why a connector was not provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusableReason {
    /// Nothing is plugged into the connector
    Disconnected,
    /// The connector does not advertise any mode
    NoModes,
}

impl fmt::Display for UnusableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnusableReason::Disconnected => f.write_str("not connected"),
            UnusableReason::NoModes => f.write_str("no modes advertised"),
        }
    }
}

/// Error returned by a failed device call
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}
