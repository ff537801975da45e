//! Book-keeping of connectors and their modes.
//!
//! The kernel hands out fresh mode lists on every rescan, while applications hold on to mode handles.
//! Modes are therefore never removed from a [`Connector`]: a rescan only marks the modes the
//! monitor does not offer anymore as invalid, and known timings keep their index.

use tracing::{debug, trace};

use super::{
    kms::{ConnectorId, ConnectorInfo, ConnectorState, CrtcId, KmsDevice, ModeInfo, PropertyId, Resources},
    DisplayError,
};
use crate::utils::Extent;

/// Resolution assumed for monitors without valid modes
pub const FALLBACK_RESOLUTION: Extent = Extent {
    width: 1024,
    height: 768,
};

/// Density assumed to derive the physical size of a monitor
const ASSUMED_DPI: f64 = 96.0;

#[derive(Debug, Clone)]
pub(crate) struct DisplayMode {
    pub info: ModeInfo,
    pub valid: bool,
    pub preferred: bool,
}

#[derive(Debug)]
pub(crate) struct Connector {
    pub id: ConnectorId,
    pub name: String,
    pub connected: bool,
    /// The crtc shows one of our framebuffers with the current mode
    pub active: bool,
    pub dpms_property: Option<PropertyId>,
    pub crtc: Option<CrtcId>,
    pub modes: Vec<DisplayMode>,
    pub current_mode: Option<usize>,
    pub current_drm_mode: Option<ModeInfo>,
}

impl Connector {
    fn new(id: ConnectorId, name: String) -> Connector {
        Connector {
            id,
            name,
            connected: false,
            active: false,
            dpms_property: None,
            crtc: None,
            modes: Vec::new(),
            current_mode: None,
            current_drm_mode: None,
        }
    }

    fn register_mode(&mut self, info: ModeInfo) {
        let preferred = info.is_preferred();
        match self.modes.iter_mut().find(|mode| mode.info.same_timings(&info)) {
            Some(known) => {
                known.valid = true;
                known.preferred = preferred;
            }
            None => {
                trace!(connector = %self.name, mode = %info.name, "New display mode");
                self.modes.push(DisplayMode {
                    info,
                    valid: true,
                    preferred,
                });
            }
        }
    }

    /// Indices and modes the monitor currently offers
    pub fn valid_modes(&self) -> impl Iterator<Item = (usize, &DisplayMode)> + '_ {
        self.modes.iter().enumerate().filter(|(_, mode)| mode.valid)
    }

    /// The mode at `index`, if the monitor still offers it
    pub fn valid_mode(&self, index: usize) -> Option<&DisplayMode> {
        self.modes.get(index).filter(|mode| mode.valid)
    }

    /// Native resolution of the monitor: the preferred mode, else the largest one
    pub fn physical_resolution(&self) -> Extent {
        if let Some((_, mode)) = self.valid_modes().find(|(_, mode)| mode.preferred) {
            return mode.info.extent();
        }
        self.valid_modes()
            .map(|(_, mode)| mode.info.extent())
            .max_by_key(|extent| extent.width as u64 * extent.height as u64)
            .unwrap_or(FALLBACK_RESOLUTION)
    }
}

/// Size in millimeters of `resolution` at the assumed density
pub(crate) fn physical_dimensions(resolution: Extent) -> Extent {
    let mm = |px: u32| (px as f64 * 25.4 / ASSUMED_DPI + 0.5) as u32;
    Extent::new(mm(resolution.width), mm(resolution.height))
}

/// Every connector seen so far
#[derive(Debug, Default)]
pub(crate) struct Registry {
    connectors: Vec<Connector>,
}

impl Registry {
    pub fn get(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors.iter().find(|connector| connector.id == id)
    }

    pub fn get_mut(&mut self, id: ConnectorId) -> Option<&mut Connector> {
        self.connectors.iter_mut().find(|connector| connector.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connector> + '_ {
        self.connectors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connector> + '_ {
        self.connectors.iter_mut()
    }

    /// Re-reads a connector from the kernel
    pub fn update(&mut self, kms: &dyn KmsDevice, id: ConnectorId) -> Result<&mut Connector, DisplayError> {
        let info = kms.connector(id, true)?;
        let pos = match self.connectors.iter().position(|connector| connector.id == id) {
            Some(pos) => pos,
            None => {
                debug!(name = %info.name, "New connector");
                self.connectors.push(Connector::new(id, info.name.clone()));
                self.connectors.len() - 1
            }
        };
        let connector = &mut self.connectors[pos];
        connector.connected = info.state != ConnectorState::Disconnected;
        if connector.dpms_property.is_none() {
            connector.dpms_property = info.dpms_property;
        }
        for mode in &mut connector.modes {
            mode.valid = false;
        }
        for mode in info.modes {
            connector.register_mode(mode);
        }
        Ok(connector)
    }
}

/// Returns true if no other connector is driven by `crtc`
fn crtc_solo(
    kms: &dyn KmsDevice,
    resources: &Resources,
    connector: &ConnectorInfo,
    crtc: CrtcId,
) -> Result<bool, DisplayError> {
    for other in resources.connectors.iter().filter(|id| **id != connector.id) {
        let other = kms.connector(*other, false)?;
        let Some(encoder) = other.encoder else {
            continue;
        };
        if kms.encoder(encoder)?.crtc == Some(crtc) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Picks the crtc to drive `connector`.
///
/// The crtc already driving the connector is kept if it drives nothing else, otherwise the first
/// idle crtc is taken.
fn select_crtc(
    kms: &dyn KmsDevice,
    resources: &Resources,
    connector: &ConnectorInfo,
) -> Result<Option<CrtcId>, DisplayError> {
    if let Some(encoder) = connector.encoder {
        if let Some(crtc) = kms.encoder(encoder)?.crtc {
            if crtc_solo(kms, resources, connector, crtc)? {
                return Ok(Some(crtc));
            }
        }
    }

    for crtc in &resources.crtcs {
        if kms.crtc(*crtc)?.framebuffer.is_none() {
            return Ok(Some(*crtc));
        }
    }
    Ok(None)
}

/// Prepares `connector` to show mode `mode_index`: picks a crtc and records the kernel mode.
pub(crate) fn setup_connector(
    kms: &dyn KmsDevice,
    connector: &mut Connector,
    mode_index: usize,
) -> Result<(), DisplayError> {
    if connector.current_mode == Some(mode_index) && connector.crtc.is_some() {
        return Ok(());
    }

    let wanted = connector
        .modes
        .get(mode_index)
        .map(|mode| mode.info.clone())
        .ok_or(DisplayError::ModeNotFound(connector.id))?;

    let resources = kms.resources()?;
    let info = kms.connector(connector.id, true)?;
    let drm_mode = info
        .modes
        .iter()
        .find(|mode| mode.same_timings(&wanted))
        .cloned()
        .ok_or(DisplayError::ModeNotFound(connector.id))?;
    let crtc = select_crtc(kms, &resources, &info)?.ok_or(DisplayError::NoCrtc(connector.id))?;

    debug!(connector = %connector.name, ?crtc, mode = %drm_mode.name, "Connector set up");
    connector.crtc = Some(crtc);
    connector.current_mode = Some(mode_index);
    connector.current_drm_mode = Some(drm_mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{physical_dimensions, Registry, FALLBACK_RESOLUTION};
    use crate::{
        backend::display::{
            kms::{ConnectorId, ConnectorState, ModeInfo},
            tests::{mode, MockKms},
        },
        utils::Extent,
    };

    #[test]
    fn rescan_invalidates_but_keeps_modes() {
        let kms = MockKms::new();
        let id = ConnectorId(1);
        let mut registry = Registry::default();
        let connector = registry.update(&kms, id).unwrap();
        assert!(connector.connected);
        assert_eq!(connector.valid_modes().count(), 2);

        kms.set_modes(id, vec![mode(1280, 720, false)]);
        let connector = registry.update(&kms, id).unwrap();
        assert_eq!(connector.modes.len(), 2);
        let valid: Vec<usize> = connector.valid_modes().map(|(idx, _)| idx).collect();
        assert_eq!(valid, vec![1]);
    }

    #[test]
    fn resolution_prefers_preferred_mode() {
        let kms = MockKms::new();
        let id = ConnectorId(1);
        let mut registry = Registry::default();
        kms.set_modes(id, vec![mode(2560, 1440, false), mode(1920, 1080, true)]);
        assert_eq!(
            registry.update(&kms, id).unwrap().physical_resolution(),
            Extent::new(1920, 1080)
        );

        kms.set_modes(id, vec![mode(1280, 720, false), mode(2560, 1440, false)]);
        assert_eq!(
            registry.update(&kms, id).unwrap().physical_resolution(),
            Extent::new(2560, 1440)
        );

        kms.set_modes(id, Vec::<ModeInfo>::new());
        kms.set_state(id, ConnectorState::Disconnected);
        let connector = registry.update(&kms, id).unwrap();
        assert!(!connector.connected);
        assert_eq!(connector.physical_resolution(), FALLBACK_RESOLUTION);
    }

    #[test]
    fn dimensions_at_96_dpi() {
        assert_eq!(physical_dimensions(Extent::new(1920, 1080)), Extent::new(508, 286));
    }
}
