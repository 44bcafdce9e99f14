//! The Nouveau backend (§4.7): a thin GEM wrapper with no blit engine.

use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::{Backend, BoPayload, KmsFeatures};
use crate::bo::BufferObject;
use crate::error::{Error, Result};
use crate::handle::{Handle, Usage};
use crate::kms::{KmsInit, SwapMode};
use crate::utils::{DeviceFd, Rect};

/// Tile cell size nouveau rounds width/height to before computing size.
const TILE: u32 = 8;
/// Host page size used for the final rounding step.
const PAGE_SIZE: u32 = 4096;

fn bytes_per_pixel(format: drm_fourcc::DrmFourcc) -> Option<u32> {
    use drm_fourcc::DrmFourcc::*;
    match format {
        Xrgb8888 | Argb8888 | Xbgr8888 | Abgr8888 => Some(4),
        Rgb565 | Bgr565 => Some(2),
        _ => None,
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// `size = align(width, tile) * align(height, tile) * bpp`, rounded up to
/// the page (§4.7).
fn planned_size(width: u32, height: u32, bpp: u32) -> u32 {
    let aligned_width = align_up(width, TILE);
    let aligned_height = align_up(height, TILE);
    align_up(aligned_width * aligned_height * bpp, PAGE_SIZE)
}

#[derive(Debug)]
struct Allocation {
    mapped: Mutex<Vec<u8>>,
}

/// The Nouveau backend.
#[derive(Debug)]
pub struct NouveauBackend {
    fd: DeviceFd,
    next_gem: AtomicU32,
    next_name: AtomicU32,
    allocations: Mutex<HashMap<u32, Allocation>>,
}

impl NouveauBackend {
    /// Opens the backend for an already-probed `nouveau` DRM fd.
    pub fn new(fd: DeviceFd) -> Result<NouveauBackend> {
        Ok(NouveauBackend {
            fd,
            next_gem: AtomicU32::new(1),
            next_name: AtomicU32::new(1),
            allocations: Mutex::new(HashMap::new()),
        })
    }
}

impl Backend for NouveauBackend {
    fn init_kms_features(&self, _init: &KmsInit) -> KmsFeatures {
        // Nouveau has no blit fallback: the swap strategy is always FLIP
        // (§4.7).
        KmsFeatures { swap_mode: SwapMode::Flip }
    }

    fn alloc(&self, handle: &mut Handle) -> Result<BoPayload> {
        let bpp = bytes_per_pixel(handle.format).ok_or(Error::Inval)?;
        let size = planned_size(handle.width, handle.height, bpp);

        let gem_handle = self.next_gem.fetch_add(1, Ordering::SeqCst);
        self.allocations.lock().unwrap().insert(
            gem_handle,
            Allocation { mapped: Mutex::new(vec![0u8; size as usize]) },
        );

        if handle.name == 0 {
            handle.name = self.next_name.fetch_add(1, Ordering::SeqCst);
            handle.stride = align_up(handle.width, TILE) * bpp;
        }

        debug!(gem_handle, size, "nouveau bo allocated");
        Ok(BoPayload { gem_handle, tiled: false, planes: None })
    }

    fn free(&self, bo: &BufferObject) -> Result<()> {
        self.allocations.lock().unwrap().remove(&bo.payload().gem_handle);
        Ok(())
    }

    fn map(&self, bo: &BufferObject, _usage: Usage, _rect: Rect<i32>) -> Result<*mut c_void> {
        let allocations = self.allocations.lock().unwrap();
        let allocation = allocations
            .get(&bo.payload().gem_handle)
            .ok_or(Error::Inval)?;
        let mut bytes = allocation.mapped.lock().unwrap();
        Ok(bytes.as_mut_ptr() as *mut c_void)
    }

    fn unmap(&self, _bo: &BufferObject) -> Result<()> {
        Ok(())
    }

    fn blit(
        &self,
        _dst: &BufferObject,
        _src: &BufferObject,
        _dst_rect: Rect<i32>,
        _src_rect: Rect<i32>,
    ) -> Result<()> {
        // No blit engine: nouveau always runs FLIP (§4.7).
        let _ = &self.fd;
        Err(Error::Inval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_rounds_to_tile_then_page() {
        let size = planned_size(100, 50, 4);
        let expected_raw = align_up(100, TILE) * align_up(50, TILE) * 4;
        assert_eq!(size, align_up(expected_raw, PAGE_SIZE));
        assert_eq!(size % PAGE_SIZE, 0);
    }

    #[test]
    fn allocation_tracks_and_frees_gem_handles() {
        use std::os::fd::FromRawFd;
        let fd = unsafe { DeviceFd::from_raw_fd(libc::dup(0)) };
        let backend = NouveauBackend::new(fd).unwrap();
        let mut h = Handle::new(64, 64, drm_fourcc::DrmFourcc::Xrgb8888, Usage::HW_FB);
        backend.alloc(&mut h).unwrap();
        assert_eq!(backend.allocations.lock().unwrap().len(), 1);
    }
}
