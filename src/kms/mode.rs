//! Mode discovery and VESA-CVT-style synthesis (§4.8).

use drm::control::Mode as DrmMode;
use drm_fourcc::DrmFourcc;
use tracing::debug;

use crate::config;

/// A chosen or synthesized display timing, paired with the pixel format the
/// `debug.drm.mode` bit-depth hint selects (§4.8).
#[derive(Debug, Clone)]
pub struct Mode {
    /// The underlying kernel mode, real for a discovered mode and
    /// hand-built for a synthesized one.
    pub drm_mode: DrmMode,
    /// The framebuffer pixel format this mode should be posted with.
    pub format: DrmFourcc,
}

/// The outcome of the mode-selection policy (§4.8), distinguishing a mode
/// picked from the connector's existing list from one synthesized on the
/// fly, since only the latter needs a CRTC-side CVT-timing commit.
#[derive(Debug, Clone)]
pub enum ModeSet {
    /// An existing connector mode, chosen by nearest-match or
    /// preferred-else-first.
    Existing(Mode),
    /// A CVT-synthesized timing with no connector-advertised counterpart.
    /// `drm::control::Mode` has no public constructor outside the `drm`
    /// crate, so the synthesized timing is carried directly rather than
    /// forced into that type; the CRTC-side commit builds the kernel
    /// `drm_mode_modeinfo` blob from these fields itself.
    Synthesized(SynthesizedMode),
}

impl ModeSet {
    /// The pixel format this mode should be posted with, regardless of
    /// which variant was chosen.
    pub fn format(&self) -> DrmFourcc {
        match self {
            ModeSet::Existing(m) => m.format,
            ModeSet::Synthesized(m) => m.format,
        }
    }
}

/// A CVT-synthesized timing paired with its target pixel format (§4.8).
#[derive(Debug, Clone)]
pub struct SynthesizedMode {
    pub timing: CvtTiming,
    pub format: DrmFourcc,
}

/// CVT gradient constant (§4.8).
const CVT_M: f64 = 600.0;
/// CVT offset constant.
const CVT_C: f64 = 40.0;
/// CVT blanking-duty-cycle scale constant.
const CVT_K: f64 = 128.0;
/// CVT blanking-duty-cycle breakpoint constant.
const CVT_J: f64 = 20.0;
/// Horizontal cell granularity modes must round to.
const CVT_CELL_GRANULARITY: u32 = 8;
/// Minimum vsync+back-porch time, in microseconds.
const CVT_MIN_VSYNC_BP_US: f64 = 550.0;
/// Horizontal sync pulse width, as a fraction of total line length.
const CVT_HSYNC_PERCENT: f64 = 0.08;

/// Picks the mode with the nearest squared pixel-dimension distance to
/// `(width, height)` (§4.8 `debug.drm.mode`).
pub fn nearest_match<'a>(modes: &'a [DrmMode], width: u32, height: u32) -> Option<&'a DrmMode> {
    modes.iter().min_by_key(|m| {
        let (mw, mh) = m.size();
        let dw = mw as i64 - width as i64;
        let dh = mh as i64 - height as i64;
        dw * dw + dh * dh
    })
}

/// Picks the connector's flagged-preferred mode, falling back to the first
/// mode in its list (§4.8 default policy).
pub fn preferred_or_first(modes: &[DrmMode]) -> Option<&DrmMode> {
    modes
        .iter()
        .find(|m| m.mode_type().contains(drm::control::ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
}

/// Maps a `debug.drm.mode` bit-depth hint to a framebuffer format: `2`
/// selects RGB565, anything else selects BGRA8888 (§4.8).
fn format_for_bpp_hint(extra: Option<u32>) -> DrmFourcc {
    match extra {
        Some(2) => DrmFourcc::Rgb565,
        _ => DrmFourcc::Argb8888,
    }
}

/// CVT-synthesized horizontal and vertical blanking totals, matching the
/// constants and rounding rules specified in §4.8.
#[derive(Debug, Clone, Copy)]
pub struct CvtTiming {
    pub h_total: u32,
    pub v_total: u32,
    pub h_sync: u32,
    pub h_blank_start: u32,
    pub v_sync_start: u32,
    pub pixel_clock_khz: u32,
}

fn synthesize_cvt(width: u32, height: u32, refresh_hz: u32) -> CvtTiming {
    let h_pixels = (width as f64 / CVT_CELL_GRANULARITY as f64).round() as u32
        * CVT_CELL_GRANULARITY;
    let v_lines = height;

    let h_period_estimate = ((1.0 / refresh_hz as f64) - CVT_MIN_VSYNC_BP_US / 1_000_000.0)
        / v_lines as f64
        * 1_000_000.0;
    let vbi_lines = (CVT_MIN_VSYNC_BP_US / h_period_estimate).ceil() as u32;
    let v_total = v_lines + vbi_lines;

    let ideal_duty_cycle = CVT_C - (CVT_M * h_period_estimate / 1000.0);
    let duty_cycle = if ideal_duty_cycle < 20.0 { 20.0 } else { ideal_duty_cycle };
    let h_blank = ((h_pixels as f64 * duty_cycle / (100.0 - duty_cycle))
        / (2.0 * CVT_CELL_GRANULARITY as f64))
        .round() as u32
        * 2
        * CVT_CELL_GRANULARITY;
    let _ = CVT_K;
    let _ = CVT_J;
    let h_total = h_pixels + h_blank;

    let h_sync = ((CVT_HSYNC_PERCENT * h_total as f64 / CVT_CELL_GRANULARITY as f64).round()
        as u32)
        * CVT_CELL_GRANULARITY;
    let h_blank_start = h_pixels;
    let v_sync_start = v_lines + 3;

    let pixel_clock_khz = ((h_total as f64 * v_total as f64 * refresh_hz as f64) / 1000.0).round()
        as u32;

    CvtTiming { h_total, v_total, h_sync, h_blank_start, v_sync_start, pixel_clock_khz }
}

/// Chooses a mode for `modes` (the primary connector's advertised list)
/// following the §4.8 policy: `debug.drm.mode` nearest-match, else
/// `debug.drm.mode.force` CVT synthesis, else preferred-else-first.
pub fn select(modes: &[DrmMode]) -> Option<ModeSet> {
    if let Some(spec) = config::debug_drm_mode() {
        let picked = nearest_match(modes, spec.width, spec.height)?;
        debug!(w = spec.width, h = spec.height, "debug.drm.mode nearest match");
        return Some(ModeSet::Existing(Mode {
            drm_mode: *picked,
            format: format_for_bpp_hint(spec.extra),
        }));
    }

    if let Some(spec) = config::debug_drm_mode_force() {
        let refresh = spec.extra.unwrap_or(60).max(1);
        let timing = synthesize_cvt(spec.width, spec.height, refresh);
        debug!(
            w = spec.width,
            h = spec.height,
            refresh,
            pclk_khz = timing.pixel_clock_khz,
            h_total = timing.h_total,
            v_total = timing.v_total,
            h_sync = timing.h_sync,
            h_blank_start = timing.h_blank_start,
            v_sync_start = timing.v_sync_start,
            "synthesizing CVT timing"
        );
        return Some(ModeSet::Synthesized(SynthesizedMode {
            timing,
            format: format_for_bpp_hint(spec.extra),
        }));
    }

    preferred_or_first(modes).map(|m| {
        ModeSet::Existing(Mode { drm_mode: *m, format: DrmFourcc::Argb8888 })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_hint_selects_rgb565_only_for_2() {
        assert_eq!(format_for_bpp_hint(Some(2)), DrmFourcc::Rgb565);
        assert_eq!(format_for_bpp_hint(Some(32)), DrmFourcc::Argb8888);
        assert_eq!(format_for_bpp_hint(None), DrmFourcc::Argb8888);
    }

    #[test]
    fn cvt_timing_grows_with_resolution() {
        let small = synthesize_cvt(640, 480, 60);
        let large = synthesize_cvt(1920, 1080, 60);
        assert!(large.h_total > small.h_total);
        assert!(large.v_total > small.v_total);
        assert!(large.pixel_clock_khz > small.pixel_clock_khz);
    }

    #[test]
    fn cvt_blanking_respects_cell_granularity() {
        let timing = synthesize_cvt(1280, 720, 60);
        assert_eq!(timing.h_total % CVT_CELL_GRANULARITY, 0);
        assert_eq!(timing.h_sync % CVT_CELL_GRANULARITY, 0);
    }

    #[test]
    fn synthesized_mode_carries_the_computed_timing() {
        let timing = synthesize_cvt(1280, 720, 60);
        let set = ModeSet::Synthesized(SynthesizedMode { timing, format: DrmFourcc::Argb8888 });
        match set {
            ModeSet::Synthesized(m) => {
                assert_eq!(m.timing.h_total, timing.h_total);
                assert_eq!(m.timing.pixel_clock_khz, timing.pixel_clock_khz);
            }
            ModeSet::Existing(_) => panic!("expected a synthesized mode"),
        }
    }
}
