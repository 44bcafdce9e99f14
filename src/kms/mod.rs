//! The display swap-engine state machine (§4.5-§4.9).
//!
//! This module owns everything downstream of buffer allocation: mode
//! discovery and synthesis ([`mode`]), the post/flip/copy state machine
//! ([`swap`]), vblank pacing ([`vblank`]), overlay plane bookkeeping
//! ([`plane`]), and connector hotplug notification ([`hotplug`]).

pub mod hotplug;
pub mod mode;
pub mod plane;
pub mod swap;
pub mod vblank;

pub use mode::{Mode, ModeSet};
pub use plane::PlaneState;
pub use swap::{PostOps, Poster, SecondaryOutput, SwapMode, SwapState};

/// Context handed to [`crate::backend::Backend::init_kms_features`] once the
/// primary connector and its preferred mode have been discovered (§4.7).
#[derive(Debug, Clone)]
pub struct KmsInit {
    /// Name of the kernel driver backing the opened DRM node (`i915`,
    /// `radeon`, `nouveau`, ...).
    pub driver_name: String,
    /// The mode KMS intends to drive the primary CRTC with.
    pub mode: ModeSet,
    /// `true` if more than one active CRTC/connector pair was discovered
    /// (§4.7 "dual output" — disables the single-buffer fast paths).
    pub dual_output: bool,
}

use std::collections::HashSet;
use std::sync::Arc;

use drm::control::{connector, crtc, encoder, Device as ControlDevice};
use drm_fourcc::DrmFourcc;

use crate::backend::{Backend, PlaneLayout};
use crate::bo::BufferObject;
use crate::error::{Error, Result};

/// One discovered connector/CRTC/mode triple, either the primary output or
/// the secondary cloned HDMI-A output (§4.8).
#[derive(Debug, Clone)]
pub struct OutputTarget {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub mode: ModeSet,
}

/// The outcome of KMS connector/CRTC/mode discovery (§4.8 "Initialization").
#[derive(Debug, Clone)]
pub struct KmsDiscovery {
    pub init: KmsInit,
    pub primary: OutputTarget,
    /// A second, distinct HDMI-A connector, if one is connected (§4.8
    /// "cloned secondary output").
    pub secondary: Option<OutputTarget>,
}

/// Enumerates connectors, encoders and CRTCs on `device` and picks the
/// primary output and, if present, a secondary cloned HDMI-A output (§4.8).
///
/// The primary connector is the first connected LVDS panel, else the first
/// connected connector of any type — matching the original's "prefer the
/// built-in panel" policy. The secondary output is the first connected
/// HDMI-A connector distinct from the primary, since a laptop's HDMI-A port
/// being the primary connector is handled by simply not finding a distinct
/// second one.
pub fn discover(device: &impl ControlDevice, driver_name: &str) -> Result<KmsDiscovery> {
    let res = device.resource_handles()?;

    let connected: Vec<connector::Info> = res
        .connectors()
        .iter()
        .filter_map(|handle| device.get_connector(*handle, true).ok())
        .filter(|info| info.state() == connector::State::Connected)
        .collect();

    let primary_info = connected
        .iter()
        .find(|c| c.interface() == connector::Interface::LVDS)
        .or_else(|| connected.first())
        .ok_or(Error::Inval)?;

    let mut used_crtcs = HashSet::new();
    let primary = pick_output(device, &res, primary_info, &mut used_crtcs)?;

    let secondary = connected
        .iter()
        .find(|c| {
            c.interface() == connector::Interface::HDMIA && c.handle() != primary_info.handle()
        })
        .and_then(|hdmi| pick_output(device, &res, hdmi, &mut used_crtcs).ok());

    let init = KmsInit {
        driver_name: driver_name.to_string(),
        mode: primary.mode.clone(),
        dual_output: secondary.is_some(),
    };

    Ok(KmsDiscovery { init, primary, secondary })
}

/// Picks a mode for `connector` and the first CRTC its encoders can drive
/// that isn't already claimed in `used_crtcs` (§4.8).
fn pick_output(
    device: &impl ControlDevice,
    res: &drm::control::ResourceHandles,
    connector: &connector::Info,
    used_crtcs: &mut HashSet<crtc::Handle>,
) -> Result<OutputTarget> {
    let mode = mode::select(connector.modes()).ok_or(Error::Inval)?;

    let crtc = connector
        .encoders()
        .iter()
        .filter_map(|handle| device.get_encoder(*handle).ok())
        .flat_map(|enc: encoder::Info| res.filter_crtcs(enc.possible_crtcs()))
        .find(|crtc| !used_crtcs.contains(crtc))
        .ok_or(Error::Inval)?;
    used_crtcs.insert(crtc);

    Ok(OutputTarget { connector: connector.handle(), crtc, mode })
}

/// Spawns a thread driving `listener` to completion, invoking `on_event` for
/// every hotplug event it reports (§4.8 "spawn the hotplug listener").
/// Used to re-run secondary-output discovery on HDMI-A connect/disconnect
/// without touching the primary output or the BO-manager lock (§5).
pub fn spawn_hotplug_listener<L, F>(mut listener: L, mut on_event: F) -> std::thread::JoinHandle<()>
where
    L: hotplug::HotplugListener + 'static,
    F: FnMut(hotplug::HotplugEvent) + Send + 'static,
{
    std::thread::spawn(move || {
        while let Some(event) = listener.next_event() {
            on_event(event);
        }
    })
}

/// Attaches a framebuffer object to `bo`, resolving its per-plane layout
/// through `backend.resolve_format` for multi-planar formats (§4.8).
///
/// `add_fb` performs the actual kernel fb-add ioctl given the resolved
/// layout (or a single-plane fallback for packed RGB), and returns the new
/// fb id.
pub fn attach_framebuffer<F>(
    backend: &dyn Backend,
    bo: &Arc<BufferObject>,
    format: DrmFourcc,
    add_fb: F,
) -> Result<u32>
where
    F: FnOnce(Option<PlaneLayout>) -> Result<u32>,
{
    let payload = bo_payload_for_resolve(bo);
    let layout = backend.resolve_format(format, &payload);
    let fb_id = add_fb(layout)?;
    bo.set_fb_id(fb_id);
    Ok(fb_id)
}

fn bo_payload_for_resolve(bo: &Arc<BufferObject>) -> crate::backend::BoPayload {
    bo.payload()
}
