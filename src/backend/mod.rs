//! The vendor-driver dispatch layer (§4.3).
//!
//! [`Backend`] is the uniform contract every vendor driver implements.
//! [`probe`] selects one by the kernel driver name, falling back to the
//! generic pipe backend when no named vendor matches.

#[cfg(any(test, feature = "backend-nouveau"))]
pub mod nouveau;
#[cfg(any(test, feature = "backend-pipe"))]
pub mod pipe;
#[cfg(any(test, feature = "backend-radeon"))]
pub mod radeon;
#[cfg(any(test, feature = "backend-radeon"))]
mod radeon_uapi;

#[cfg(any(test, feature = "backend-intel"))]
pub mod intel;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

use std::fmt;
use std::os::raw::c_void;
use std::sync::Arc;

use drm_fourcc::DrmFourcc;

use crate::bo::BufferObject;
use crate::error::Result;
use crate::handle::{Handle, Usage};
use crate::kms::KmsInit;
use crate::utils::Rect;

/// Backend-private per-BO state. Cheap to clone: it holds only integers and
/// small fixed arrays, never an owned kernel resource (those live behind
/// the backend's own bookkeeping, keyed by `gem_handle`).
#[derive(Debug, Clone, Default)]
pub struct BoPayload {
    /// The backend-side GEM handle, needed for fb-attach (§3).
    pub gem_handle: u32,
    /// `true` if the buffer is tiled (vendor-specific tiling mode).
    pub tiled: bool,
    /// Per-plane layout, filled in by `Backend::resolve_format` for
    /// multi-planar formats (§4.8 fb-object attach).
    pub planes: Option<PlaneLayout>,
}

/// Per-plane pitch/offset/GEM-handle triples for a multi-planar pixel
/// format (§4.8): YV12 places Y then V then U with half-width chroma
/// pitches, NV12 interleaves chroma into a second plane, packed RGB
/// formats use only plane 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneLayout {
    /// Number of planes actually in use (1-3).
    pub count: u8,
    /// Per-plane byte pitch.
    pub pitches: [u32; 3],
    /// Per-plane byte offset from the start of the allocation.
    pub offsets: [u32; 3],
    /// Per-plane backend GEM handle (often identical across planes for a
    /// single-allocation layout).
    pub gem_handles: [u32; 3],
}

/// Capabilities a backend may report to the KMS core after mode discovery
/// (§4.7 `init_kms_features`).
#[derive(Debug, Clone, Copy, Default)]
pub struct KmsFeatures {
    /// The swap strategy this backend and the discovered mode/driver
    /// support (§4.5 swap-mode selection, §4.6).
    pub swap_mode: crate::kms::SwapMode,
}

/// The uniform vendor-driver contract (§4.3).
///
/// Implementors must be `Send + Sync`: the BO manager only ever holds the
/// backend behind a short-lived registry lock (§5), never across an ioctl,
/// so the backend itself is responsible for any internal synchronization
/// its kernel interface requires.
pub trait Backend: fmt::Debug + Send + Sync {
    /// Tears down backend-global state (batch buffers, cached device
    /// handles). Called when the owning `DrmDevice` is dropped.
    fn destroy(&self) {}

    /// Called once KMS has discovered the primary mode, to let the backend
    /// pick its swap strategy (§4.5 swap-mode selection, §4.6, §4.7).
    fn init_kms_features(&self, init: &KmsInit) -> KmsFeatures;

    /// Allocates (or, if `handle.name != 0`, imports) the backend-side
    /// storage for `handle`, writing the assigned global name and stride
    /// back into it (§4.2 `create`/`register`).
    fn alloc(&self, handle: &mut Handle) -> Result<BoPayload>;

    /// Releases the backend-side storage for `bo` (§4.2 `destroy`).
    fn free(&self, bo: &BufferObject) -> Result<()>;

    /// Maps `bo` for CPU access, waiting out any in-flight GPU writes
    /// before returning the pointer (§4.2 `lock`).
    fn map(&self, bo: &BufferObject, usage: Usage, rect: Rect<i32>) -> Result<*mut c_void>;

    /// Unmaps a buffer previously mapped with [`Backend::map`] (§4.2 `unlock`).
    fn unmap(&self, bo: &BufferObject) -> Result<()>;

    /// Blits `src_rect` of `src` into `dst_rect` of `dst`. Implementations
    /// must reject differing rect sizes — no scaling (§4.5).
    fn blit(
        &self,
        dst: &BufferObject,
        src: &BufferObject,
        dst_rect: Rect<i32>,
        src_rect: Rect<i32>,
    ) -> Result<()>;

    /// Fills in the multi-plane pitch/offset/gem-handle layout for a
    /// YUV/NV pixel format (§4.8). Packed RGB formats may leave this `None`
    /// and let the caller fall back to the single-plane payload.
    fn resolve_format(&self, _format: DrmFourcc, _payload: &BoPayload) -> Option<PlaneLayout> {
        None
    }
}

/// Probes `driver_name` (as returned by `drm::Device::get_driver`) and
/// constructs the matching backend, trying a named vendor dispatch first
/// and falling back to the generic pipe backend (§4.3).
///
/// `fd` is the open DRM device file descriptor, shared (via [`crate::utils::DeviceFd`])
/// with every other subsystem of the owning [`crate::device::DrmDevice`].
pub fn probe(fd: crate::utils::DeviceFd, driver_name: &str) -> Result<Arc<dyn Backend>> {
    match driver_name {
        #[cfg(feature = "backend-intel")]
        "i915" => return Ok(Arc::new(intel::IntelBackend::new(fd)?)),
        #[cfg(feature = "backend-radeon")]
        "radeon" => return Ok(Arc::new(radeon::RadeonBackend::new(fd)?)),
        #[cfg(feature = "backend-nouveau")]
        "nouveau" => return Ok(Arc::new(nouveau::NouveauBackend::new(fd)?)),
        _ => {}
    }

    #[cfg(feature = "backend-pipe")]
    {
        if let Ok(backend) = pipe::PipeBackend::new(fd.clone()) {
            return Ok(Arc::new(backend));
        }
    }

    Err(crate::error::Error::NoEnt)
}
