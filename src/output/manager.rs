use drm::control::connector;
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::{config::ProvisionConfig, provision::DisplayProvisioner, Display};
use crate::backend::{
    allocator::{Allocator, Backend, DumbAllocator},
    drm::{framebuffer, AccessError, DisplayDevice, Error},
};

/// Owner of every display provisioned on a device.
///
/// Displays are kept in connector discovery order. Dropping the manager tears
/// all of them down, restoring the crtc configuration found before.
///
/// Scanout buffers come from `A`, usually a [`Backend`] picked at runtime.
#[derive(Debug)]
pub struct ResourceManager<D: DisplayDevice, A: Allocator = Backend<D>> {
    device: D,
    displays: Vec<Display>,
    skipped: Vec<(connector::Handle, Error)>,
    provisioner: DisplayProvisioner,
    cursor_allocator: DumbAllocator<D>,
    backend: A,
    span: tracing::Span,
}

impl<D: DisplayDevice + Clone, A: Allocator> ResourceManager<D, A> {
    /// Create a new manager for `device`, allocating scanout buffers from `backend`.
    ///
    /// Cursor buffers are always linear dumb buffers, independent of the backend.
    pub fn new(device: D, backend: A, config: ProvisionConfig) -> Self {
        let span = info_span!("modeset", device = ?device.dev_path(), tiling = ?backend.tiling());
        ResourceManager {
            cursor_allocator: DumbAllocator::new(device.clone()),
            device,
            displays: Vec::new(),
            skipped: Vec::new(),
            provisioner: DisplayProvisioner::new(config),
            backend,
            span,
        }
    }
}

impl<D: DisplayDevice, A: Allocator> ResourceManager<D, A> {
    /// Provision a display for every usable connector and show its first buffer.
    ///
    /// Fails only if the device cannot be used at all. Connectors that could not be
    /// provisioned are logged and listed in [`ResourceManager::skipped`], a display whose
    /// crtc could not be programmed is kept disabled.
    #[instrument(parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn provision_all(&mut self) -> Result<&[Display], Error> {
        self.skipped.clear();
        match self.device.supports_dumb_buffers() {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::DeviceUnsupported {
                    capability: "dumb buffers",
                    dev: self.device.dev_path(),
                    source: None,
                })
            }
            Err(source) => {
                return Err(Error::DeviceUnsupported {
                    capability: "dumb buffers",
                    dev: self.device.dev_path(),
                    source: Some(source),
                })
            }
        }

        let resources = self.device.resources().map_err(|source| AccessError {
            errmsg: "Error loading drm resources",
            dev: self.device.dev_path(),
            source,
        })?;
        debug!(
            connectors = resources.connectors.len(),
            crtcs = resources.crtcs.len(),
            "enumerated resources"
        );

        let first_new = self.displays.len();
        for handle in resources.connectors.iter().copied() {
            if self.displays.iter().any(|output| output.connector == handle) {
                continue;
            }

            let info = match self.device.connector(handle) {
                Ok(info) => info,
                Err(source) => {
                    let err = Error::Access(AccessError {
                        errmsg: "Failed to query connector",
                        dev: self.device.dev_path(),
                        source,
                    });
                    warn!(connector = ?handle, "skipping connector: {}", err);
                    self.skipped.push((handle, err));
                    continue;
                }
            };

            let claimed = self.displays.iter().map(|output| output.crtc).collect::<Vec<_>>();
            match self.provisioner.provision(
                &self.device,
                &resources,
                &info,
                &claimed,
                &mut self.backend,
                &mut self.cursor_allocator,
            ) {
                Ok(output) => {
                    info!(
                        connector = ?handle,
                        interface = ?info.interface,
                        crtc = ?output.crtc,
                        mode = ?output.mode.size(),
                        buffers = output.buffers.len(),
                        "provisioned display"
                    );
                    self.displays.push(output);
                }
                Err(err) if err.is_skip() => {
                    info!(connector = ?handle, "skipping connector: {}", err);
                    self.skipped.push((handle, err));
                }
                Err(err) => {
                    warn!(connector = ?handle, "failed to provision connector: {}", err);
                    self.skipped.push((handle, err));
                }
            }
        }

        for output in &mut self.displays[first_new..] {
            apply(&self.device, output);
        }

        Ok(&self.displays)
    }

    /// Restore every crtc and free all buffers.
    ///
    /// Restore failures are logged, buffers are released regardless.
    /// Calling this again without provisioning in between does nothing.
    #[instrument(parent = &self.span, skip(self))]
    pub fn teardown(&mut self) {
        for output in std::mem::take(&mut self.displays) {
            self.release(output);
        }
    }

    fn release(&mut self, mut output: Display) {
        let span = info_span!("teardown", connector = ?output.connector, crtc = ?output.crtc);
        let _guard = span.enter();

        restore(&self.device, &output);

        for buffer in output.buffers.drain(..) {
            if let Some(fb) = buffer.framebuffer() {
                framebuffer::unbind(&self.device, fb);
            }
            self.backend.destroy(buffer);
        }
        if output.cursor_visible {
            if let Err(err) = output.hide_cursor(&self.device) {
                warn!("{}", err);
            }
        }
        self.cursor_allocator.destroy(output.cursor);
        trace!("released display");
    }

    /// Provisioned displays, in connector discovery order
    pub fn displays(&self) -> &[Display] {
        &self.displays
    }

    /// Provisioned displays, for drawing into their buffers
    pub fn displays_mut(&mut self) -> &mut [Display] {
        &mut self.displays
    }

    /// Connectors the last [`ResourceManager::provision_all`] did not provision, and why
    pub fn skipped(&self) -> &[(connector::Handle, Error)] {
        &self.skipped
    }

    /// Underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Allocator scanout buffers are allocated from
    pub fn backend(&self) -> &A {
        &self.backend
    }

    /// Configuration used for provisioning
    pub fn config(&self) -> &ProvisionConfig {
        self.provisioner.config()
    }
}

/// Save the crtc configuration and show the first buffer of the display
fn apply<D: DisplayDevice>(device: &D, output: &mut Display) {
    let (crtc, connector) = (output.crtc, output.connector);
    output.saved_crtc = match device.crtc(crtc) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!(?crtc, ?err, "failed to read crtc state, it will be disabled on teardown");
            None
        }
    };
    output.front = 0;

    let fb = output.buffers[0].framebuffer();
    match device.set_crtc(crtc, fb, (0, 0), &[connector], Some(output.mode)) {
        Ok(()) => {
            output.enabled = true;
            debug!(?connector, ?crtc, ?fb, "applied display");
        }
        Err(source) => {
            let err = Error::ControllerApplyFailed {
                crtc,
                source: AccessError {
                    errmsg: "Failed to set crtc",
                    dev: device.dev_path(),
                    source,
                },
            };
            error!(?connector, "{}, keeping display disabled", err);
            output.enabled = false;
        }
    }
}

/// Put back the crtc configuration found before the display was applied
fn restore<D: DisplayDevice>(device: &D, output: &Display) {
    let result = match output.saved_crtc {
        Some(saved) if saved.mode.is_some() => device.set_crtc(
            saved.handle,
            saved.framebuffer,
            saved.position,
            &[output.connector],
            saved.mode,
        ),
        // nothing to restore for a crtc we never managed to program
        None if !output.enabled => return,
        _ => device.set_crtc(output.crtc, None, (0, 0), &[], None),
    };

    if let Err(source) = result {
        let err = Error::ControllerRestoreFailed {
            crtc: output.crtc,
            source: AccessError {
                errmsg: "Failed to restore crtc",
                dev: device.dev_path(),
                source,
            },
        };
        error!("{}", err);
    }
}

impl<D: DisplayDevice, A: Allocator> Drop for ResourceManager<D, A> {
    fn drop(&mut self) {
        if !self.displays.is_empty() {
            self.teardown();
        }
    }
}
