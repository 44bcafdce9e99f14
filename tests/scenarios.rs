//! End-to-end scenarios against `backend::test_support::FakeBackend` and the
//! vendor backends' pure logic, standing in for the six scenarios that in
//! the original required a real `/dev/dri` node.

use std::os::fd::FromRawFd;
use std::sync::Arc;

use drm_fourcc::DrmFourcc;

use gralloc_drm::backend::intel::IntelBackend;
use gralloc_drm::backend::radeon::{RadeonBackend, TilingConfig};
use gralloc_drm::backend::test_support::FakeBackend;
use gralloc_drm::backend::Backend;
use gralloc_drm::bo::Manager;
use gralloc_drm::handle::{Handle, LocalToken, Usage};
use gralloc_drm::kms::swap::{PostOps, SecondaryOutput, SwapMode, SwapState};

fn attach_fb(backend: &dyn Backend, bo: &Arc<gralloc_drm::bo::BufferObject>) {
    gralloc_drm::kms::attach_framebuffer(backend, bo, DrmFourcc::Xrgb8888, |_layout| Ok(1)).unwrap();
}

fn dup_stdin_fd() -> gralloc_drm::utils::DeviceFd {
    unsafe { gralloc_drm::utils::DeviceFd::from_raw_fd(libc::dup(0)) }
}

/// Scenario 1: Intel gen 6, 1024x768 BGRA8888 with HW_FB — stride is a
/// multiple of 64*4, tiling is X, and a global name is assigned.
#[test]
fn scenario_1_intel_gen6_allocation() {
    let backend = IntelBackend::with_generation(dup_stdin_fd(), 6);
    let mut handle = Handle::new(1024, 768, DrmFourcc::Argb8888, Usage::HW_FB);
    let payload = backend.alloc(&mut handle).unwrap();

    assert_eq!(handle.stride % (64 * 4), 0);
    assert!(payload.tiled, "expected X-tiling for an HW_FB allocation at this width");
    assert_ne!(handle.name, 0);
}

/// Scenario 2: an allocation request the backend cannot satisfy returns
/// `INVAL` with no side effects. `DrmFourcc` is a closed enum so an
/// out-of-range wire value like `0xDEAD` cannot be constructed safely;
/// we approximate the "unrecognized format" case with a backend
/// configured to reject every allocation, matching the `unrecognized
/// format fails with INVAL` unit test in `bo.rs`.
#[test]
fn scenario_2_unrecognized_format_has_no_side_effects() {
    let backend = Arc::new(FakeBackend::new().failing_alloc());
    let mgr = Manager::new(backend);
    let err = mgr.create(1, 1, DrmFourcc::Xrgb8888, Usage::HW_FB).unwrap_err();
    assert!(matches!(err, gralloc_drm::Error::Inval));
}

/// Scenario 3: Radeon evergreen macro-tiling pitch alignment for
/// num_banks=8, group_bytes=512, bpe=4 is 128 pixels; height alignment is
/// 8*num_channels.
#[test]
fn scenario_3_radeon_macro_tiling_alignment() {
    let cfg = TilingConfig { num_channels: 4, num_banks: 8, group_bytes: 512 };
    let backend = RadeonBackend::with_tiling_config(dup_stdin_fd(), cfg).unwrap();
    let mut handle = Handle::new(300, 4, DrmFourcc::Xrgb8888, Usage::HW_FB);
    backend.alloc(&mut handle).unwrap();

    // pitch_align(macro) = (group_bytes/8/bpe) * num_banks * 8
    //                     = (512/8/4) * 8 * 8 = 16 * 64 = 1024 pixels.
    // Width is aligned in pixels first (300 -> 1024), then widened to
    // bytes: 1024 * 4 = 4096. A narrower, byte-domain-first formula would
    // instead align 300*4=1200 bytes up to 1024 and land on 2048 here,
    // so this width is wide enough to tell the two formulas apart.
    assert_eq!(handle.stride, 4096);
}

/// Scenario 4: process B registers a handle exported by process A; B's
/// handle is marked owned by B, the resulting BO is `imported`, and
/// unregistering in B does not touch A's BO.
#[test]
fn scenario_4_cross_process_import_isolation() {
    let mgr_a = Manager::new(Arc::new(FakeBackend::new()));
    let bo_a = mgr_a.create(8, 8, DrmFourcc::Xrgb8888, Usage::HW_TEXTURE).unwrap();

    let mut exported = *bo_a.handle.lock().unwrap();
    exported.owner = exported.owner.wrapping_add(1);
    exported.local = LocalToken::NONE;

    let mgr_b = Manager::new(Arc::new(FakeBackend::new()));
    let bo_b = mgr_b.register(&mut exported, true).unwrap().unwrap();

    assert!(bo_b.imported);
    assert_eq!(exported.owner, gralloc_drm::handle::current_pid());

    mgr_b.unregister(&mut exported).unwrap();
    assert!(mgr_b.lookup(exported.local).is_none());

    // process A's own BO is completely untouched
    let a_handle = *bo_a.handle.lock().unwrap();
    assert!(mgr_a.lookup(a_handle.local).is_some());
}

/// Scenario 5: under `FLIP`, the first post is a plain modeset (nothing
/// pending yet); the second schedules a real flip, which stays pending
/// until the flip-complete event retires it.
#[test]
fn scenario_5_flip_mode_two_posts_settle_cleanly() {
    let backend = Arc::new(FakeBackend::new());
    let mgr = Manager::new(backend.clone());
    let b1 = mgr.create(4, 4, DrmFourcc::Xrgb8888, Usage::HW_FB).unwrap();
    let b2 = mgr.create(4, 4, DrmFourcc::Xrgb8888, Usage::HW_FB).unwrap();
    attach_fb(backend.as_ref(), &b1);
    attach_fb(backend.as_ref(), &b2);

    let mut swap = SwapState::new(0, SwapMode::Flip, 1);
    let mut ops = CountingOps::default();

    swap.post(&mut ops, b1.clone()).unwrap();
    assert!(!swap.waiting_flip(), "first post is a modeset, not a flip");

    swap.post(&mut ops, b2.clone()).unwrap();
    assert!(swap.waiting_flip(), "second post schedules a flip that stays pending until retired");

    swap.on_flip_complete();
    assert!(!swap.waiting_flip(), "flip-complete event must retire the pending flip");
}

#[derive(Default)]
struct CountingOps {
    vblank: u32,
}

impl PostOps for CountingOps {
    fn blit(
        &mut self,
        _dst: &Arc<gralloc_drm::bo::BufferObject>,
        _src: &Arc<gralloc_drm::bo::BufferObject>,
    ) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn setcrtc(&mut self, _bo: &Arc<gralloc_drm::bo::BufferObject>) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn page_flip(
        &mut self,
        _bo: &Arc<gralloc_drm::bo::BufferObject>,
        _request_event: bool,
    ) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn drain_flip_event(&mut self) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn dirty_fb(&mut self, _bo: &Arc<gralloc_drm::bo::BufferObject>) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn query_vblank(&mut self, _crtc: u32) -> Option<u32> {
        Some(self.vblank)
    }
    fn wait_vblank(&mut self, _crtc: u32, target: u32, _miss_ok: bool) -> Option<u32> {
        self.vblank = target;
        Some(target)
    }
    fn front_is_software_writable(&self) -> bool {
        false
    }
    fn requires_sync_flip(&self) -> bool {
        false
    }
    fn vmwgfx_quirk(&self) -> bool {
        false
    }
    fn secondary(&mut self) -> Option<&mut dyn SecondaryOutput> {
        None
    }
}

/// Scenario 6: `SETCRTC` with the vmwgfx quirk enabled posts via a plain
/// modeset, never waits on vblank, and issues exactly one dirty-fb call
/// (through the `Copy`-mode path the quirk shares).
#[test]
fn scenario_6_setcrtc_vmwgfx_quirk_skips_vblank() {
    let backend = Arc::new(FakeBackend::new());
    let mgr = Manager::new(backend.clone());
    let b1 = mgr.create(4, 4, DrmFourcc::Xrgb8888, Usage::HW_FB).unwrap();
    attach_fb(backend.as_ref(), &b1);

    let mut swap = SwapState::new(0, SwapMode::SetCrtc, 1);
    let mut ops = VmwgfxOps::default();

    swap.post(&mut ops, b1).unwrap();

    assert_eq!(ops.setcrtc_calls, 1);
    assert_eq!(ops.vblank_wait_calls, 0, "vmwgfx quirk must short-circuit vblank pacing");
}

#[derive(Default)]
struct VmwgfxOps {
    setcrtc_calls: u32,
    vblank_wait_calls: u32,
}

impl PostOps for VmwgfxOps {
    fn blit(
        &mut self,
        _dst: &Arc<gralloc_drm::bo::BufferObject>,
        _src: &Arc<gralloc_drm::bo::BufferObject>,
    ) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn setcrtc(&mut self, _bo: &Arc<gralloc_drm::bo::BufferObject>) -> gralloc_drm::Result<()> {
        self.setcrtc_calls += 1;
        Ok(())
    }
    fn page_flip(
        &mut self,
        _bo: &Arc<gralloc_drm::bo::BufferObject>,
        _request_event: bool,
    ) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn drain_flip_event(&mut self) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn dirty_fb(&mut self, _bo: &Arc<gralloc_drm::bo::BufferObject>) -> gralloc_drm::Result<()> {
        Ok(())
    }
    fn query_vblank(&mut self, _crtc: u32) -> Option<u32> {
        self.vblank_wait_calls += 1;
        Some(0)
    }
    fn wait_vblank(&mut self, _crtc: u32, target: u32, _miss_ok: bool) -> Option<u32> {
        self.vblank_wait_calls += 1;
        Some(target)
    }
    fn front_is_software_writable(&self) -> bool {
        false
    }
    fn requires_sync_flip(&self) -> bool {
        false
    }
    fn vmwgfx_quirk(&self) -> bool {
        true
    }
    fn secondary(&mut self) -> Option<&mut dyn SecondaryOutput> {
        None
    }
}
