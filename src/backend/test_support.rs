//! An in-memory [`Backend`] used by unit and integration tests, standing in
//! for a real `/dev/dri` node (out of reach for `cargo test`).

use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use drm_fourcc::DrmFourcc;

use super::{Backend, BoPayload, KmsFeatures};
use crate::bo::BufferObject;
use crate::error::{Error, Result};
use crate::handle::{Handle, Usage};
use crate::kms::{KmsInit, SwapMode};
use crate::utils::Rect;

#[derive(Debug)]
struct Allocation {
    bytes: Vec<u8>,
}

/// A deterministic, allocation-tracking fake backend.
#[derive(Debug)]
pub struct FakeBackend {
    next_name: AtomicU32,
    next_gem: AtomicU32,
    allocations: Mutex<HashMap<u32, Allocation>>,
    fail_alloc: AtomicBool,
    blit_calls: Mutex<Vec<(u32, u32)>>,
}

impl FakeBackend {
    /// A fresh backend with no buffers and allocation enabled.
    pub fn new() -> FakeBackend {
        FakeBackend {
            next_name: AtomicU32::new(1),
            next_gem: AtomicU32::new(1),
            allocations: Mutex::new(HashMap::new()),
            fail_alloc: AtomicBool::new(false),
            blit_calls: Mutex::new(Vec::new()),
        }
    }

    /// Builder variant that makes every subsequent `alloc` fail, for
    /// exercising the allocation-failure path.
    pub fn failing_alloc(self) -> FakeBackend {
        self.fail_alloc.store(true, Ordering::SeqCst);
        self
    }

    /// The blit calls recorded so far, as `(dst_gem, src_gem)` pairs.
    pub fn blit_calls(&self) -> Vec<(u32, u32)> {
        self.blit_calls.lock().unwrap().clone()
    }
}

impl Default for FakeBackend {
    fn default() -> FakeBackend {
        FakeBackend::new()
    }
}

impl Backend for FakeBackend {
    fn init_kms_features(&self, _init: &KmsInit) -> KmsFeatures {
        KmsFeatures { swap_mode: SwapMode::Flip }
    }

    fn alloc(&self, handle: &mut Handle) -> Result<BoPayload> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(Error::Inval);
        }
        let gem_handle = self.next_gem.fetch_add(1, Ordering::SeqCst);
        let stride = handle.width * 4;
        let size = stride as usize * handle.height as usize;
        self.allocations
            .lock()
            .unwrap()
            .insert(gem_handle, Allocation { bytes: vec![0u8; size.max(1)] });

        handle.stride = stride;
        if handle.name == 0 {
            handle.name = self.next_name.fetch_add(1, Ordering::SeqCst);
        }
        Ok(BoPayload { gem_handle, tiled: false, planes: None })
    }

    fn free(&self, bo: &BufferObject) -> Result<()> {
        self.allocations.lock().unwrap().remove(&bo.payload().gem_handle);
        Ok(())
    }

    fn map(&self, bo: &BufferObject, _usage: Usage, _rect: Rect<i32>) -> Result<*mut c_void> {
        let mut allocations = self.allocations.lock().unwrap();
        let allocation = allocations
            .get_mut(&bo.payload().gem_handle)
            .ok_or(Error::Inval)?;
        Ok(allocation.bytes.as_mut_ptr() as *mut c_void)
    }

    fn unmap(&self, _bo: &BufferObject) -> Result<()> {
        Ok(())
    }

    fn blit(
        &self,
        dst: &BufferObject,
        src: &BufferObject,
        dst_rect: Rect<i32>,
        src_rect: Rect<i32>,
    ) -> Result<()> {
        if !dst_rect.same_size(&src_rect) {
            return Err(Error::Inval);
        }
        self.blit_calls
            .lock()
            .unwrap()
            .push((dst.payload().gem_handle, src.payload().gem_handle));
        Ok(())
    }

    fn resolve_format(&self, format: DrmFourcc, payload: &BoPayload) -> Option<super::PlaneLayout> {
        match format {
            DrmFourcc::Nv12 => Some(super::PlaneLayout {
                count: 2,
                pitches: [payload.gem_handle, payload.gem_handle / 2, 0],
                offsets: [0, payload.gem_handle, 0],
                gem_handles: [payload.gem_handle; 3],
            }),
            _ => None,
        }
    }
}
