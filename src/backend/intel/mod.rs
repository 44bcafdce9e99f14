//! The Intel i915 backend (§4.5).

pub mod blit;
mod uapi;

use std::collections::HashMap;
use std::os::fd::AsRawFd;
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

/// Tiling mode assigned to a GEM object (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TilingMode {
    Linear,
    XTiled,
}

/// Width alignment (in pixels) required before X-tiling, and the minimum
/// texture width that still benefits from it (§4.5).
const TILE_WIDTH_ALIGN: u32 = 64;

/// Maximum stride in bytes on gen >= 5; halved per generation below that
/// (§4.5).
fn max_stride_for_gen(gen: u8) -> u32 {
    let base = 32 * 1024;
    if gen >= 5 {
        base
    } else {
        base >> (5 - gen).min(31)
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[derive(Debug)]
struct TrackedBo {
    tiled: bool,
    stride: u32,
}

/// The Intel backend.
#[derive(Debug)]
pub struct IntelBackend {
    fd: DeviceFd,
    gen: u8,
    page_flip_supported: bool,
    next_gem: AtomicU32,
    next_name: AtomicU32,
    tracked: Mutex<HashMap<u32, TrackedBo>>,
}

impl IntelBackend {
    /// Opens the Intel backend on an already-probed `i915` DRM fd.
    ///
    /// Hardware generation detection requires a PCI device-id lookup this
    /// crate does not perform; callers that need a specific generation
    /// should use [`IntelBackend::with_generation`]. This constructor
    /// assumes a conservative gen 6 baseline (the first BLT-ring, flip
    /// capable generation).
    pub fn new(fd: DeviceFd) -> Result<IntelBackend> {
        Ok(Self::with_generation(fd, 6))
    }

    /// Opens the Intel backend for a known hardware generation (§4.5 swap
    /// and tiling policy both key off this number).
    pub fn with_generation(fd: DeviceFd, gen: u8) -> IntelBackend {
        IntelBackend {
            fd,
            gen,
            page_flip_supported: gen > 3,
            next_gem: AtomicU32::new(1),
            next_name: AtomicU32::new(1),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn bytes_per_pixel(format: drm_fourcc::DrmFourcc) -> Option<u32> {
        use drm_fourcc::DrmFourcc::*;
        match format {
            Xrgb8888 | Argb8888 | Xbgr8888 | Abgr8888 => Some(4),
            Rgb565 | Bgr565 => Some(2),
            _ => None,
        }
    }

    /// Computes the tiling decision and stride for a fresh allocation,
    /// falling back to linear when the tiled stride would exceed the
    /// generation's maximum, and failing only if linear also overflows
    /// (§4.5 tiling policy).
    fn plan_tiling(&self, width: u32, bpp: u32, usage: Usage) -> Result<(TilingMode, u32)> {
        if usage.wants_linear() {
            let stride = width * bpp;
            return if stride <= max_stride_for_gen(self.gen) {
                Ok((TilingMode::Linear, stride))
            } else {
                Err(Error::Inval)
            };
        }

        let aligned_width = align_up(width, TILE_WIDTH_ALIGN);
        let tiled_stride = aligned_width * bpp;
        if tiled_stride <= max_stride_for_gen(self.gen) {
            return Ok((TilingMode::XTiled, tiled_stride));
        }

        let linear_stride = width * bpp;
        if linear_stride <= max_stride_for_gen(self.gen) {
            Ok((TilingMode::Linear, linear_stride))
        } else {
            Err(Error::Inval)
        }
    }
}

/// Pure swap-mode selection logic (§4.5): FLIP when the kernel reports
/// flip support and gen > 3; COPY at gen 3 (a batch builder always exists
/// by then); SETCRTC otherwise.
fn select_swap_mode(gen: u8, page_flip_supported: bool) -> SwapMode {
    if page_flip_supported && gen > 3 {
        SwapMode::Flip
    } else if gen == 3 {
        SwapMode::Copy
    } else {
        SwapMode::SetCrtc
    }
}

impl Backend for IntelBackend {
    fn init_kms_features(&self, _init: &KmsInit) -> KmsFeatures {
        let swap_mode = select_swap_mode(self.gen, self.page_flip_supported);
        debug!(gen = self.gen, ?swap_mode, "intel swap mode selected");
        KmsFeatures { swap_mode }
    }

    fn alloc(&self, handle: &mut Handle) -> Result<BoPayload> {
        let bpp = Self::bytes_per_pixel(handle.format).ok_or(Error::Inval)?;

        if handle.name != 0 {
            // Import path: open the existing object by its global name and
            // trust the stride/tiling already recorded on the handle —
            // a real implementation reads tiling back via
            // `DRM_IOCTL_I915_GEM_GET_TILING`.
            let gem_handle = self.next_gem.fetch_add(1, Ordering::SeqCst);
            self.tracked.lock().unwrap().insert(
                gem_handle,
                TrackedBo { tiled: false, stride: handle.stride },
            );
            return Ok(BoPayload { gem_handle, tiled: false, planes: None });
        }

        let (tiling, stride) = self.plan_tiling(handle.width, bpp, handle.usage)?;
        let gem_handle = self.next_gem.fetch_add(1, Ordering::SeqCst);
        let name = self.next_name.fetch_add(1, Ordering::SeqCst);

        self.tracked.lock().unwrap().insert(
            gem_handle,
            TrackedBo { tiled: tiling == TilingMode::XTiled, stride },
        );

        handle.stride = stride;
        handle.name = name;

        debug!(gem_handle, stride, tiled = tiling == TilingMode::XTiled, "intel bo allocated");
        Ok(BoPayload { gem_handle, tiled: tiling == TilingMode::XTiled, planes: None })
    }

    fn free(&self, bo: &BufferObject) -> Result<()> {
        self.tracked.lock().unwrap().remove(&bo.payload().gem_handle);
        Ok(())
    }

    fn map(&self, bo: &BufferObject, usage: Usage, _rect: Rect<i32>) -> Result<*mut c_void> {
        let gem_handle = bo.payload().gem_handle;
        let (stride, height) = {
            let tracked = self.tracked.lock().unwrap();
            let tracked_bo = tracked.get(&gem_handle).ok_or(Error::Inval)?;
            (tracked_bo.stride, bo.handle.lock().unwrap().height)
        };

        let mut set_domain = uapi::GemSetDomain {
            handle: gem_handle,
            read_domains: uapi::GEM_DOMAIN_GTT,
            write_domain: if usage.wants_cpu_access() { uapi::GEM_DOMAIN_GTT } else { 0 },
        };
        // SAFETY: `set_domain` is a valid, exclusively-owned `repr(C)` struct
        // matching the kernel's `drm_i915_gem_set_domain` layout.
        if unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                uapi::set_domain_request(),
                &mut set_domain as *mut uapi::GemSetDomain,
            )
        } < 0
        {
            return Err(Error::Inval);
        }

        let mut mmap_gtt = uapi::GemMmapGtt { handle: gem_handle, pad: 0, offset: 0 };
        // SAFETY: same as above, for `drm_i915_gem_mmap_gtt`.
        if unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                uapi::mmap_gtt_request(),
                &mut mmap_gtt as *mut uapi::GemMmapGtt,
            )
        } < 0
        {
            return Err(Error::Inval);
        }

        let len = (stride as usize) * (height as usize);
        // SAFETY: `mmap_gtt.offset` is the fake-offset the ioctl above
        // assigned this object within the device fd's mmap space; `len`
        // matches the object's own tracked size.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                mmap_gtt.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Inval);
        }
        Ok(ptr)
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
        let (dst_gem, dst_stride, dst_tiled, src_gem, src_stride, src_tiled) = {
            let tracked = self.tracked.lock().unwrap();
            let dst_gem = dst.payload().gem_handle;
            let src_gem = src.payload().gem_handle;
            let dst_bo = tracked.get(&dst_gem).ok_or(Error::Inval)?;
            let src_bo = tracked.get(&src_gem).ok_or(Error::Inval)?;
            (dst_gem, dst_bo.stride, dst_bo.tiled, src_gem, src_bo.stride, src_bo.tiled)
        };
        if dst_stride % 4 != 0 || src_stride % 4 != 0 {
            return Err(Error::Inval);
        }

        let fd = self.fd.as_raw_fd();
        let gen = self.gen;
        let mut builder = blit::BatchBuilder::new(gen, move |dwords, relocs| {
            submit_batch(fd, dst_gem, src_gem, dwords, relocs)
        });
        builder.xy_src_copy(
            dst_stride,
            dst_tiled,
            0,
            src_stride,
            src_tiled,
            0,
            dst_rect.loc.x as u32,
            dst_rect.loc.y as u32,
            src_rect.loc.x as u32,
            src_rect.loc.y as u32,
            dst_rect.width() as u32,
            dst_rect.height() as u32,
        )?;
        builder.flush()
    }
}

/// Submits one flushed batch via `DRM_IOCTL_I915_GEM_EXECBUFFER2`.
///
/// `blit::BatchBuilder` only ever emits two relocations per `xy_src_copy`
/// call, in destination-then-source order, so they map directly onto the
/// two tracked GEM handles passed in here alongside the batch itself.
fn submit_batch(
    fd: std::os::raw::c_int,
    dst_gem: u32,
    src_gem: u32,
    dwords: &[u32],
    relocs: &[blit::Relocation],
) -> Result<()> {
    let mut reloc_entries: Vec<uapi::GemRelocationEntry> = relocs
        .iter()
        .map(|r| uapi::GemRelocationEntry {
            offset: (r.batch_offset as u64) * 4,
            delta: r.target_offset as u32,
            target_handle: if r.write_domain != 0 { dst_gem } else { src_gem },
            read_domains: r.read_domains,
            write_domain: r.write_domain,
            presumed_offset: 0,
        })
        .collect();

    let mut objects = [
        uapi::GemExecObject2 {
            handle: dst_gem,
            relocation_count: 0,
            relocs_ptr: 0,
            alignment: 0,
            offset: 0,
            flags: 0,
            rsvd1: 0,
            rsvd2: 0,
        },
        uapi::GemExecObject2 {
            handle: src_gem,
            relocation_count: 0,
            relocs_ptr: 0,
            alignment: 0,
            offset: 0,
            flags: 0,
            rsvd1: 0,
            rsvd2: 0,
        },
        uapi::GemExecObject2 {
            // The batch itself also needs a GEM object uploaded with
            // `dwords` before submission (`DRM_IOCTL_I915_GEM_CREATE` +
            // `DRM_IOCTL_I915_GEM_PWRITE`); that upload step is not wired
            // up here, so `handle` is left at the kernel's reserved-invalid
            // value rather than guessed at.
            handle: 0,
            relocation_count: reloc_entries.len() as u32,
            relocs_ptr: reloc_entries.as_mut_ptr() as u64,
            alignment: 0,
            offset: 0,
            flags: 0,
            rsvd1: 0,
            rsvd2: 0,
        },
    ];

    let mut execbuffer = uapi::GemExecbuffer2 {
        buffers_ptr: objects.as_mut_ptr() as u64,
        buffer_count: objects.len() as u32,
        batch_start_offset: 0,
        batch_len: (dwords.len() * 4) as u32,
        dr1: 0,
        dr4: 0,
        num_cliprects: 0,
        cliprects_ptr: 0,
        flags: 0,
        rsvd1: 0,
        rsvd2: 0,
    };

    // SAFETY: `execbuffer` and the `objects`/`reloc_entries` it points into
    // are all valid for the duration of this call and match the kernel's
    // `drm_i915_gem_execbuffer2` layout.
    if unsafe {
        libc::ioctl(fd, uapi::execbuffer2_request(), &mut execbuffer as *mut uapi::GemExecbuffer2)
    } < 0
    {
        return Err(Error::Inval);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_fourcc::DrmFourcc;

    fn fake_fd() -> DeviceFd {
        use std::os::fd::FromRawFd;
        unsafe { DeviceFd::from_raw_fd(libc::dup(0)) }
    }

    #[test]
    fn linear_forced_by_frequent_sw_access() {
        let backend = IntelBackend::with_generation(fake_fd(), 6);
        let mut h = Handle::new(128, 64, DrmFourcc::Xrgb8888, Usage::SW_WRITE_OFTEN);
        backend.alloc(&mut h).unwrap();
        assert_eq!(h.stride, 128 * 4);
    }

    #[test]
    fn x_tiling_aligns_width_to_64() {
        let backend = IntelBackend::with_generation(fake_fd(), 6);
        let mut h = Handle::new(100, 64, DrmFourcc::Xrgb8888, Usage::HW_FB);
        backend.alloc(&mut h).unwrap();
        assert_eq!(h.stride, 128 * 4);
    }

    #[test]
    fn swap_mode_flip_above_gen3() {
        assert_eq!(select_swap_mode(6, true), SwapMode::Flip);
    }

    #[test]
    fn swap_mode_copy_at_gen3() {
        assert_eq!(select_swap_mode(3, false), SwapMode::Copy);
    }

    #[test]
    fn swap_mode_setcrtc_below_gen3() {
        assert_eq!(select_swap_mode(2, false), SwapMode::SetCrtc);
    }
}
