use drm::control::{connector, crtc};
use smallvec::SmallVec;
use tracing::{debug, info_span, instrument, trace};

use super::{
    config::{ProvisionConfig, CURSOR_SIZE},
    crtc_mapper::{CrtcMapper, SimpleCrtcMapper},
    Display,
};
use crate::backend::{
    allocator::{Allocator, Buffer, BufferRole},
    drm::{framebuffer, ConnectorInfo, DisplayDevice, Error, Resources, UnusableReason},
};

/// Creates a [`Display`] for a single connector.
///
/// Either every buffer of the display is created, or none is left behind.
#[derive(Debug, Clone)]
pub struct DisplayProvisioner<M = SimpleCrtcMapper> {
    config: ProvisionConfig,
    mapper: M,
}

impl DisplayProvisioner<SimpleCrtcMapper> {
    /// Create a new provisioner using the greedy [`SimpleCrtcMapper`]
    pub fn new(config: ProvisionConfig) -> Self {
        Self::with_mapper(config, SimpleCrtcMapper::new())
    }
}

impl<M: CrtcMapper> DisplayProvisioner<M> {
    /// Create a new provisioner using a custom crtc mapper
    pub fn with_mapper(config: ProvisionConfig, mapper: M) -> Self {
        DisplayProvisioner { config, mapper }
    }

    /// Configuration in use
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Provision a display for `connector`.
    ///
    /// Crtcs listed in `claimed` are not considered. Scanout buffers come from `scanout`,
    /// the cursor buffer from `cursor`. The returned display is not applied yet.
    ///
    /// Disconnected connectors, connectors without modes and connectors without a free crtc
    /// are rejected before any buffer is created, see [`Error::is_skip`].
    pub fn provision<D, A, C>(
        &self,
        device: &D,
        resources: &Resources,
        connector: &ConnectorInfo,
        claimed: &[crtc::Handle],
        scanout: &mut A,
        cursor: &mut C,
    ) -> Result<Display, Error>
    where
        D: DisplayDevice,
        A: Allocator,
        C: Allocator,
    {
        let span = info_span!("provision", connector = ?connector.handle);
        let _guard = span.enter();

        if connector.state != connector::State::Connected {
            return Err(Error::ConnectorUnusable {
                connector: connector.handle,
                reason: UnusableReason::Disconnected,
            });
        }
        let no_modes = Error::ConnectorUnusable {
            connector: connector.handle,
            reason: UnusableReason::NoModes,
        };
        if connector.modes.is_empty() {
            return Err(no_modes);
        }
        let mode = self.config.select_mode(&connector.modes).ok_or(no_modes)?;

        let crtc = self
            .mapper
            .pick_crtc(device, resources, connector, claimed)
            .ok_or(Error::ControllerUnavailable(connector.handle))?;

        let (width, height) = mode.size();
        let (width, height) = (u32::from(width), u32::from(height));
        debug!(?crtc, width, height, refresh = mode.vrefresh(), "selected mode");

        let count = self.config.buffers.get();
        let mut buffers = SmallVec::<[Buffer; 3]>::new();
        for idx in 0..count {
            match create_scanout(device, scanout, width, height) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    debug!(idx, count, ?err, "scanout buffer failed, rolling back");
                    rollback(device, scanout, buffers);
                    return Err(err);
                }
            }
        }

        let cursor = match create_cursor(cursor) {
            Ok(buffer) => buffer,
            Err(err) => {
                debug!(?err, "cursor buffer failed, rolling back");
                rollback(device, scanout, buffers);
                return Err(err);
            }
        };

        Ok(Display {
            connector: connector.handle,
            interface: connector.interface,
            crtc,
            mode,
            buffers,
            cursor,
            saved_crtc: None,
            enabled: false,
            cursor_visible: false,
            front: 0,
        })
    }
}

/// Allocate, map and bind one scanout buffer, destroying it again on failure
#[instrument(level = "trace", skip(device, allocator))]
#[profiling::function]
fn create_scanout<D, A>(device: &D, allocator: &mut A, width: u32, height: u32) -> Result<Buffer, Error>
where
    D: DisplayDevice,
    A: Allocator,
{
    let mut buffer = allocator.allocate(width, height, BufferRole::Scanout)?;
    if let Err(err) = allocator.map(&mut buffer) {
        allocator.destroy(buffer);
        return Err(err);
    }
    if let Err(err) = framebuffer::bind(device, &mut buffer) {
        allocator.destroy(buffer);
        return Err(err);
    }
    Ok(buffer)
}

fn create_cursor<C: Allocator>(allocator: &mut C) -> Result<Buffer, Error> {
    let mut buffer = allocator.allocate(CURSOR_SIZE, CURSOR_SIZE, BufferRole::Cursor)?;
    if let Err(err) = allocator.map(&mut buffer) {
        allocator.destroy(buffer);
        return Err(err);
    }
    Ok(buffer)
}

/// Unbind and destroy scanout buffers, newest first
fn rollback<D, A>(device: &D, allocator: &mut A, buffers: SmallVec<[Buffer; 3]>)
where
    D: DisplayDevice,
    A: Allocator,
{
    for buffer in buffers.into_iter().rev() {
        if let Some(fb) = buffer.framebuffer() {
            framebuffer::unbind(device, fb);
        }
        trace!(handle = ?buffer.handle(), "rolling back buffer");
        allocator.destroy(buffer);
    }
}
