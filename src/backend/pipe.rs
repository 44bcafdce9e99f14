//! The backend-agnostic fallback over the kernel's generic "dumb buffer"
//! manager (§4.4).
//!
//! Every DRM driver, regardless of vendor, implements `DUMB_CREATE` /
//! `DUMB_MAP_OFFSET` / `DUMB_DESTROY` for simple linear scanout buffers.
//! This backend never tiles and never blits; when selected it always
//! drives the display through a full modeset (`SwapMode::SetCrtc`).

use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::Mutex;

use drm::control::{dumbbuffer::DumbBuffer, Device as ControlDevice};
use drm_fourcc::DrmFourcc;
use tracing::debug;

use super::{Backend, BoPayload, KmsFeatures};
use crate::bo::BufferObject;
use crate::error::{Error, Result};
use crate::handle::{Handle, Usage};
use crate::kms::{KmsInit, SwapMode};
use crate::utils::{DeviceFd, Rect};

fn bpp_for(format: DrmFourcc) -> Option<u32> {
    match format {
        DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888 | DrmFourcc::Xbgr8888 | DrmFourcc::Abgr8888 => {
            Some(32)
        }
        DrmFourcc::Rgb565 | DrmFourcc::Bgr565 => Some(16),
        _ => None,
    }
}

fn depth_for(format: DrmFourcc) -> Option<u32> {
    match format {
        DrmFourcc::Xrgb8888 | DrmFourcc::Xbgr8888 => Some(24),
        DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 => Some(32),
        DrmFourcc::Rgb565 | DrmFourcc::Bgr565 => Some(16),
        _ => None,
    }
}

#[derive(Debug)]
struct Card(DeviceFd);

impl std::os::fd::AsFd for Card {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl drm::Device for Card {}
impl ControlDevice for Card {}

#[derive(Debug)]
struct Entry {
    buffer: DumbBuffer,
    mapped: Option<*mut c_void>,
}

// SAFETY: the mapped pointer is only ever dereferenced by the process that
// created it, guarded by `bo::Manager`'s per-BO lock bookkeeping.
unsafe impl Send for Entry {}

/// The generic pipe-buffer-manager fallback backend.
#[derive(Debug)]
pub struct PipeBackend {
    card: Card,
    buffers: Mutex<HashMap<u32, Entry>>,
}

impl PipeBackend {
    /// Opens the generic dumb-buffer path on an already-open DRM fd.
    pub fn new(fd: DeviceFd) -> Result<PipeBackend> {
        Ok(PipeBackend {
            card: Card(fd),
            buffers: Mutex::new(HashMap::new()),
        })
    }
}

impl Backend for PipeBackend {
    fn init_kms_features(&self, _init: &KmsInit) -> KmsFeatures {
        KmsFeatures { swap_mode: SwapMode::SetCrtc }
    }

    fn alloc(&self, handle: &mut Handle) -> Result<BoPayload> {
        if handle.name != 0 {
            // The generic path has no global-name import story: dumb
            // buffers are never flink-exported across processes in
            // practice. Refuse rather than silently fabricate a handle.
            return Err(Error::Inval);
        }

        let bpp = bpp_for(handle.format).ok_or(Error::Inval)?;
        let depth = depth_for(handle.format).ok_or(Error::Inval)?;

        let buffer = self
            .card
            .create_dumb_buffer((handle.width, handle.height), depth, bpp)
            .map_err(|_| Error::NoMem)?;

        handle.stride = buffer.pitch();
        handle.name = 0; // the generic path never exports a global name

        let gem_handle = buffer.handle().into();
        self.buffers.lock().unwrap().insert(
            gem_handle,
            Entry { buffer, mapped: None },
        );

        debug!(gem_handle, "pipe backend allocated dumb buffer");
        Ok(BoPayload { gem_handle, tiled: false, planes: None })
    }

    fn free(&self, bo: &BufferObject) -> Result<()> {
        let gem_handle = bo.payload().gem_handle;
        if let Some(entry) = self.buffers.lock().unwrap().remove(&gem_handle) {
            let _ = self.card.destroy_dumb_buffer(entry.buffer);
        }
        Ok(())
    }

    fn map(&self, bo: &BufferObject, _usage: Usage, _rect: Rect<i32>) -> Result<*mut c_void> {
        let gem_handle = bo.payload().gem_handle;
        let mut buffers = self.buffers.lock().unwrap();
        let entry = buffers.get_mut(&gem_handle).ok_or(Error::Inval)?;
        if let Some(ptr) = entry.mapped {
            return Ok(ptr);
        }
        let mapping = self
            .card
            .map_dumb_buffer(&mut entry.buffer)
            .map_err(|_| Error::NoMem)?;
        let ptr = mapping.as_ptr() as *mut c_void;
        entry.mapped = Some(ptr);
        Ok(ptr)
    }

    fn unmap(&self, _bo: &BufferObject) -> Result<()> {
        // The mapping is kept for the buffer's lifetime and torn down in
        // `free`; dumb-buffer mappings are cheap enough that remapping on
        // every lock would be wasteful, and the kernel does not require an
        // explicit unmap ioctl the way vendor GEM backends do.
        Ok(())
    }

    fn blit(
        &self,
        _dst: &BufferObject,
        _src: &BufferObject,
        _dst_rect: Rect<i32>,
        _src_rect: Rect<i32>,
    ) -> Result<()> {
        // No command submission path exists for the generic backend; it
        // only ever drives `SwapMode::SetCrtc`, which never calls `blit`.
        Err(Error::Inval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpp_table_covers_common_formats() {
        assert_eq!(bpp_for(DrmFourcc::Xrgb8888), Some(32));
        assert_eq!(bpp_for(DrmFourcc::Rgb565), Some(16));
        assert_eq!(bpp_for(DrmFourcc::Nv12), None);
    }
}
