//! Connector hotplug notification (§4.8 "spawn a hotplug listener").
//!
//! The production implementation watches udev for `drm` subsystem uevents
//! on a dedicated thread and re-runs secondary-output discovery on
//! connect/disconnect; that thread touches only the secondary output's
//! state, behind a mutex distinct from the BO-manager lock (§5).

/// What happened to a connector since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A connector gained a display.
    Connected(u32),
    /// A connector lost its display.
    Disconnected(u32),
}

/// A source of hotplug events, abstracted so the KMS core can be driven by
/// either the real udev watcher or a test double.
pub trait HotplugListener: Send {
    /// Blocks until the next hotplug event, or returns `None` if the
    /// listener has been shut down.
    fn next_event(&mut self) -> Option<HotplugEvent>;
}

#[cfg(feature = "hotplug-udev")]
mod udev_listener {
    use super::{HotplugEvent, HotplugListener};
    use std::io;
    use tracing::warn;
    use udev::{EventType, MonitorBuilder};

    /// Watches the `drm` udev subsystem for connector change events.
    pub struct UdevHotplugListener {
        socket: udev::MonitorSocket,
    }

    impl UdevHotplugListener {
        /// Opens a udev monitor filtered to the `drm` subsystem.
        pub fn new() -> io::Result<UdevHotplugListener> {
            let socket = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
            Ok(UdevHotplugListener { socket })
        }
    }

    impl HotplugListener for UdevHotplugListener {
        fn next_event(&mut self) -> Option<HotplugEvent> {
            loop {
                let event = self.socket.iter().next()?;
                let connector_id = event
                    .sysname()
                    .to_str()
                    .and_then(|name| name.rsplit('-').next())
                    .and_then(|id| id.parse().ok())
                    .unwrap_or(0);
                match event.event_type() {
                    EventType::Change | EventType::Add => {
                        return Some(HotplugEvent::Connected(connector_id))
                    }
                    EventType::Remove => return Some(HotplugEvent::Disconnected(connector_id)),
                    other => {
                        warn!(?other, "ignoring unrecognized udev drm event");
                        continue;
                    }
                }
            }
        }
    }
}

#[cfg(feature = "hotplug-udev")]
pub use udev_listener::UdevHotplugListener;
