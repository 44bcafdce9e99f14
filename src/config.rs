//! Reads the two Android-style system properties the KMS mode-selection
//! policy consults (§4.8, §6), plus the `enable-*` build switches exposed as
//! Cargo features.
//!
//! The original reads `debug.drm.mode`/`debug.drm.mode.force` through
//! Android's property service. There is no equivalent service on a generic
//! Linux host, so this reimplementation reads the same two names from the
//! process environment instead; the semantics (format string, precedence)
//! are unchanged.

use tracing::warn;

/// A parsed `WxH[@bpp]` or `WxH[@refresh]` property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSpec {
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
    /// Either a bit depth (for `debug.drm.mode`) or a refresh rate in Hz
    /// (for `debug.drm.mode.force`), depending on which property produced
    /// this value.
    pub extra: Option<u32>,
}

fn parse_mode_spec(value: &str) -> Option<ModeSpec> {
    let (dims, extra) = match value.split_once('@') {
        Some((dims, extra)) => (dims, Some(extra)),
        None => (value, None),
    };
    let (w, h) = dims.split_once('x')?;
    let width: u32 = w.parse().ok()?;
    let height: u32 = h.parse().ok()?;
    let extra = match extra {
        Some(e) => Some(e.parse().ok()?),
        None => None,
    };
    Some(ModeSpec { width, height, extra })
}

/// Reads `debug.drm.mode`, used to select an existing mode by nearest
/// geometric match (§4.8).
pub fn debug_drm_mode() -> Option<ModeSpec> {
    read_property("debug.drm.mode")
}

/// Reads `debug.drm.mode.force`, used to synthesize a CVT timing (§4.8).
pub fn debug_drm_mode_force() -> Option<ModeSpec> {
    read_property("debug.drm.mode.force")
}

fn read_property(name: &str) -> Option<ModeSpec> {
    let value = std::env::var(name).ok()?;
    match parse_mode_spec(&value) {
        Some(spec) => Some(spec),
        None => {
            warn!(property = name, value = %value, "malformed mode property, ignoring");
            None
        }
    }
}

/// Whether the `vmwgfx` quirk (no vblank wait, dirty-fb based copy-mode
/// post, §4.7) should be active for the named kernel driver.
pub fn is_vmwgfx(driver_name: &str) -> bool {
    driver_name == "vmwgfx"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dims_only() {
        assert_eq!(
            parse_mode_spec("1920x1080"),
            Some(ModeSpec { width: 1920, height: 1080, extra: None })
        );
    }

    #[test]
    fn parses_dims_and_extra() {
        assert_eq!(
            parse_mode_spec("1024x768@32"),
            Some(ModeSpec { width: 1024, height: 768, extra: Some(32) })
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_mode_spec("not-a-mode"), None);
        assert_eq!(parse_mode_spec("1024xbb"), None);
    }
}
