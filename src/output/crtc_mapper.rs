//! Assignment of crtcs to connectors
//!
//! A [`CrtcMapper`] decides which crtc drives a connector. The default
//! [`SimpleCrtcMapper`] assigns them greedily in connector discovery order.

use drm::control::crtc;
use tracing::{trace, warn};

use crate::backend::drm::{ConnectorInfo, DisplayDevice, Resources};

/// CRTC Mapper trait
///
/// It is responsible for picking a crtc for a connector,
/// that is not yet driving any other connector.
pub trait CrtcMapper {
    /// Pick a crtc able to drive `connector`, ignoring all crtcs in `claimed`
    fn pick_crtc(
        &self,
        device: &impl DisplayDevice,
        resources: &Resources,
        connector: &ConnectorInfo,
        claimed: &[crtc::Handle],
    ) -> Option<crtc::Handle>;
}

/// Simple CRTC Mapper
///
/// This is a greedy mapper, connectors discovered first get the first usable crtc.
///
/// It is capable of recovering the mapping that was used by the tty
/// or display manager before, if that crtc is still free.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleCrtcMapper;

impl SimpleCrtcMapper {
    /// Create new [`SimpleCrtcMapper`]
    pub fn new() -> Self {
        Self
    }

    fn restored_for_connector(
        &self,
        device: &impl DisplayDevice,
        connector: &ConnectorInfo,
        claimed: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        let encoder = connector.current_encoder?;
        let encoder = device
            .encoder(encoder)
            .map_err(|err| warn!(?encoder, ?err, "failed to query current encoder"))
            .ok()?;
        let crtc = encoder.crtc?;

        (!claimed.contains(&crtc)).then_some(crtc)
    }

    fn pick_next_available_for_connector(
        &self,
        device: &impl DisplayDevice,
        resources: &Resources,
        connector: &ConnectorInfo,
        claimed: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        connector
            .encoders
            .iter()
            .filter_map(|encoder| match device.encoder(*encoder) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(?encoder, ?err, "failed to query encoder, skipping");
                    None
                }
            })
            .find_map(|encoder| {
                resources
                    .filter_crtcs(encoder.possible_crtcs)
                    .find(|crtc| !claimed.contains(crtc))
            })
    }
}

impl CrtcMapper for SimpleCrtcMapper {
    fn pick_crtc(
        &self,
        device: &impl DisplayDevice,
        resources: &Resources,
        connector: &ConnectorInfo,
        claimed: &[crtc::Handle],
    ) -> Option<crtc::Handle> {
        if let Some(crtc) = self.restored_for_connector(device, connector, claimed) {
            trace!(connector = ?connector.handle, ?crtc, "reusing current crtc");
            return Some(crtc);
        }

        let crtc = self.pick_next_available_for_connector(device, resources, connector, claimed);
        trace!(connector = ?connector.handle, ?crtc, "picked next available crtc");
        crtc
    }
}
