//! The cross-process opaque buffer handle and its wire-format codec (§3, §4.1).
//!
//! A [`Handle`] is the only entity that crosses process boundaries. It is a
//! flat, `#[repr(C)]` record with a fixed integer count and no file
//! descriptors, deliberately shaped like the original `gralloc_drm_handle_t`
//! (see `DESIGN.md` for the field-by-field grounding).

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use drm_fourcc::DrmFourcc;

use crate::error::{Error, Result};

/// Compile-time wire-format constants, validated on every handle that
/// enters the process from the outside (§4.1).
pub const MAGIC: u32 = 0x1234_5678;
/// Wire-format version. Bumped from the original's `0` because [`LocalToken`]
/// widens the local-side field from a 32-bit pointer to a 64-bit registry
/// key (§9 open question, recorded in `DESIGN.md`).
pub const VERSION: u32 = 2;
/// Number of logical integer fields carried in the wire record.
pub const NUM_INTS: u32 = 11;
/// Handles never carry file descriptors.
pub const NUM_FDS: u32 = 0;

bitflags! {
    /// Usage bitmask, analogous to the original `GRALLOC_USAGE_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        /// Buffer is read by software.
        const SW_READ = 1 << 0;
        /// Buffer is read frequently by software (forces linear layout).
        const SW_READ_OFTEN = 1 << 1;
        /// Buffer is written by software.
        const SW_WRITE = 1 << 2;
        /// Buffer is written frequently by software (forces linear layout).
        const SW_WRITE_OFTEN = 1 << 3;
        /// Buffer may be used as a hardware framebuffer (scanout).
        const HW_FB = 1 << 4;
        /// Buffer may be sampled as a hardware texture.
        const HW_TEXTURE = 1 << 5;
        /// Buffer is a render target for the GPU.
        const HW_RENDER = 1 << 6;
        /// Buffer may be composed through a hardware overlay plane.
        const HW_COMPOSER = 1 << 7;
    }
}

impl Usage {
    /// Software read or write, in either frequency, triggers `Backend::map`
    /// in `bo::Manager::lock` (§4.2).
    pub fn wants_cpu_access(self) -> bool {
        self.intersects(
            Usage::SW_READ | Usage::SW_READ_OFTEN | Usage::SW_WRITE | Usage::SW_WRITE_OFTEN,
        )
    }

    /// Frequent software access forces a linear (untiled) layout in the
    /// Intel and Radeon backends (§4.5, §4.6).
    pub fn wants_linear(self) -> bool {
        self.intersects(Usage::SW_READ_OFTEN | Usage::SW_WRITE_OFTEN)
    }
}

/// An opaque reference to a locally-owned [`crate::bo::BufferObject`].
///
/// The original stores this as a truncating `int` holding a raw pointer;
/// widened here to a `u64` registry key (see `DESIGN.md`). It is only ever
/// meaningful in the process that set it — see [`Handle::owner_is_self`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LocalToken(pub u64);

impl LocalToken {
    /// The null token, meaning "no local owner".
    pub const NONE: LocalToken = LocalToken(0);
}

/// The fixed-size, `#[repr(C)]` cross-process buffer descriptor (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Handle {
    magic: u32,
    version: u32,
    num_ints: u32,
    num_fds: u32,

    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: DrmFourcc,
    /// Usage bitmask the buffer was allocated (or imported) with.
    pub usage: Usage,
    /// Bitmask of overlay plane ids allowed to display this buffer.
    pub plane_mask: u32,
    /// Kernel GEM global name. `0` means "never exported".
    pub name: u32,
    /// Stride in bytes.
    pub stride: u32,
    /// PID that last owned the local side of this handle.
    pub owner: u32,
    /// Opaque local-side token, meaningful only when `owner == getpid()`.
    pub local: LocalToken,
}

static CACHED_PID: AtomicU32 = AtomicU32::new(0);

/// Returns the current process id, caching it in a process-global atomic
/// after the first call (§4.1). `0` is not a valid pid, so it doubles as
/// the "not yet cached" sentinel.
pub fn current_pid() -> u32 {
    let cached = CACHED_PID.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let pid = rustix::process::getpid().as_raw_nonzero().get() as u32;
    CACHED_PID.store(pid, Ordering::Relaxed);
    pid
}

impl Handle {
    /// Builds a fresh, unexported handle for a local allocation. Called by
    /// `bo::Manager::create` before handing the handle to the backend's
    /// `alloc` (§4.2).
    pub fn new(width: u32, height: u32, format: DrmFourcc, usage: Usage) -> Handle {
        Handle {
            magic: MAGIC,
            version: VERSION,
            num_ints: NUM_INTS,
            num_fds: NUM_FDS,
            width,
            height,
            format,
            usage,
            plane_mask: 0,
            name: 0,
            stride: 0,
            owner: current_pid(),
            local: LocalToken::NONE,
        }
    }

    /// Validates the wire-format fields of a handle that arrived from
    /// outside this call (§4.1, §8 boundary behaviors).
    ///
    /// Does *not* check ownership — callers that need to distinguish a
    /// foreign handle from a local one should follow up with
    /// [`Handle::owner_is_self`].
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC
            || self.version != VERSION
            || self.num_ints != NUM_INTS
            || self.num_fds != NUM_FDS
        {
            return Err(Error::Inval);
        }
        Ok(())
    }

    /// `true` if the local-side token was set by *this* process and can be
    /// trusted (§3 invariant).
    pub fn owner_is_self(&self) -> bool {
        self.owner == current_pid()
    }

    /// Clears the local-owner/local-token pair, leaving `name`/`stride`
    /// (the kernel-level identity) intact. Used by `bo::Manager::destroy`
    /// and `unregister` when releasing an imported handle (§4.2).
    pub fn clear_local(&mut self) {
        self.owner = 0;
        self.local = LocalToken::NONE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Handle {
        Handle::new(64, 32, DrmFourcc::Xrgb8888, Usage::HW_FB)
    }

    #[test]
    fn fresh_handle_validates() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn fresh_handle_is_owned_by_self() {
        assert!(sample().owner_is_self());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut h = sample();
        h.magic = 0xdead_beef;
        assert!(matches!(h.validate(), Err(Error::Inval)));
    }

    #[test]
    fn bad_version_rejected() {
        let mut h = sample();
        h.version = VERSION + 1;
        assert!(matches!(h.validate(), Err(Error::Inval)));
    }

    #[test]
    fn bad_int_count_rejected() {
        let mut h = sample();
        h.num_ints = 0;
        assert!(matches!(h.validate(), Err(Error::Inval)));
    }

    #[test]
    fn bad_fd_count_rejected() {
        let mut h = sample();
        h.num_fds = 1;
        assert!(matches!(h.validate(), Err(Error::Inval)));
    }

    #[test]
    fn clear_local_drops_ownership_not_identity() {
        let mut h = sample();
        h.name = 42;
        h.local = LocalToken(0xabc);
        h.clear_local();
        assert_eq!(h.owner, 0);
        assert_eq!(h.local, LocalToken::NONE);
        assert_eq!(h.name, 42, "kernel-level identity must survive clear_local");
    }

    #[test]
    fn usage_cpu_access_detection() {
        assert!(Usage::SW_READ.wants_cpu_access());
        assert!(Usage::SW_WRITE_OFTEN.wants_cpu_access());
        assert!(!Usage::HW_FB.wants_cpu_access());
        assert!(Usage::SW_WRITE_OFTEN.wants_linear());
        assert!(!Usage::SW_WRITE.wants_linear());
    }
}
