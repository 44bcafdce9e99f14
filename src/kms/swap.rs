//! The display post state machine (§4.8).
//!
//! `Poster` is the single entry point for presenting a buffer. It is
//! deliberately `!Send`: the original contract is "only ever called from
//! the thread that owns the DRM fd", and here that is enforced at compile
//! time rather than checked at runtime.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bo::BufferObject;
use crate::error::Result;
use crate::kms::vblank::{self, VblankState, WaitPlan};

/// The swap strategy a backend selects once KMS has picked a mode
/// (§4.5-§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapMode {
    /// No display work at all; used for headless/test configurations.
    #[default]
    Noop,
    /// Page-flip based presentation (Intel, Nouveau).
    Flip,
    /// Blit-into-front-buffer presentation (Intel fallback under linear
    /// pressure, vmwgfx).
    Copy,
    /// Full modeset on every post (the generic pipe backend).
    SetCrtc,
}

/// Which state the post state machine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostState {
    FirstPost,
    Steady,
}

/// Operations the post state machine needs from the underlying KMS/DRM
/// plumbing, abstracted so the transition logic itself can be unit tested
/// without a real device (§8).
pub trait PostOps {
    /// Blits `src` into `dst`, used for `Copy`-mode and cloned-secondary
    /// presentation.
    fn blit(&mut self, dst: &Arc<BufferObject>, src: &Arc<BufferObject>) -> Result<()>;
    /// Issues a full modeset onto `bo`.
    fn setcrtc(&mut self, bo: &Arc<BufferObject>) -> Result<()>;
    /// Schedules a page flip, requesting a completion event unless
    /// `sync` is `false`.
    fn page_flip(&mut self, bo: &Arc<BufferObject>, request_event: bool) -> Result<()>;
    /// Drains one pending flip event synchronously.
    fn drain_flip_event(&mut self) -> Result<()>;
    /// Issues a dirty-fb notification (vmwgfx `Copy` mode).
    fn dirty_fb(&mut self, bo: &Arc<BufferObject>) -> Result<()>;
    /// Reads the current vblank sequence via a relative, count-zero query.
    fn query_vblank(&mut self, crtc: u32) -> Option<u32>;
    /// Performs an absolute-sequence vblank wait, returning the sequence
    /// the wait completed at.
    fn wait_vblank(&mut self, crtc: u32, target: u32, miss_ok: bool) -> Option<u32>;
    /// `true` if the current front buffer is software-writable, forcing a
    /// synchronous flip drain (§4.8 Steady/Flip).
    fn front_is_software_writable(&self) -> bool;
    /// `true` if the driver requires every flip to be drained
    /// synchronously (observed quirk, distinct from the vmwgfx quirk).
    fn requires_sync_flip(&self) -> bool;
    /// `true` if vblank pacing should be skipped entirely (vmwgfx quirk).
    fn vmwgfx_quirk(&self) -> bool;
    /// The cloned secondary output, if one is active (§4.8 dual-output).
    fn secondary(&mut self) -> Option<&mut dyn SecondaryOutput>;
}

/// A cloned secondary output's presentation surface (§4.8).
pub trait SecondaryOutput {
    /// The secondary's private back buffer, blitted into before each post.
    fn back_buffer(&self) -> Arc<BufferObject>;
    fn setcrtc(&mut self, bo: &Arc<BufferObject>) -> Result<()>;
    fn page_flip(&mut self, bo: &Arc<BufferObject>) -> Result<()>;
    fn blit_centered(&mut self, src: &Arc<BufferObject>) -> Result<()>;
}

/// Per-CRTC presentation state: which state the machine is in, the front
/// buffer, a pending flip target, and vblank pacing state.
#[derive(Debug)]
pub struct SwapState {
    state: PostState,
    crtc: u32,
    swap_mode: SwapMode,
    current_front: Option<Arc<BufferObject>>,
    next_front: Option<Arc<BufferObject>>,
    vblank: VblankState,
}

impl SwapState {
    /// Builds fresh swap state for a CRTC about to receive its first post.
    pub fn new(crtc: u32, swap_mode: SwapMode, swap_interval: u32) -> SwapState {
        SwapState {
            state: PostState::FirstPost,
            crtc,
            swap_mode,
            current_front: None,
            next_front: None,
            vblank: VblankState { last_swap: 0, swap_interval: swap_interval.max(1) },
        }
    }

    /// `true` while a page flip is outstanding (§5 ordering invariant).
    pub fn waiting_flip(&self) -> bool {
        self.next_front.is_some()
    }

    fn pace(&mut self, ops: &mut dyn PostOps, flip: bool) {
        if ops.vmwgfx_quirk() {
            return;
        }
        let Some(current) = ops.query_vblank(self.crtc) else {
            vblank::warn_query_failed(self.crtc);
            return;
        };
        let first_post = self.state == PostState::FirstPost;
        match vblank::plan_wait(&self.vblank, current, flip, first_post) {
            WaitPlan::Skip => {
                if first_post {
                    self.vblank.last_swap = current;
                }
            }
            WaitPlan::Absolute { target, miss_ok } => {
                if let Some(seq) = ops.wait_vblank(self.crtc, target, miss_ok) {
                    vblank::record_swap(&mut self.vblank, seq, flip);
                }
            }
        }
    }

    /// Presents `bo`, driving the post state machine's transition for the
    /// current `swap_mode` (§4.8).
    pub fn post(&mut self, ops: &mut dyn PostOps, bo: Arc<BufferObject>) -> Result<()> {
        match self.state {
            PostState::FirstPost => self.first_post(ops, bo),
            PostState::Steady => match self.swap_mode {
                SwapMode::Flip => self.steady_flip(ops, bo),
                SwapMode::Copy => self.steady_copy(ops, bo),
                SwapMode::SetCrtc => self.steady_setcrtc(ops, bo),
                SwapMode::Noop => Ok(()),
            },
        }
    }

    fn first_post(&mut self, ops: &mut dyn PostOps, bo: Arc<BufferObject>) -> Result<()> {
        let target = if self.swap_mode == SwapMode::Copy {
            let front = self.current_front.clone().unwrap_or_else(|| bo.clone());
            ops.blit(&front, &bo)?;
            front
        } else {
            if bo.fb_id() == 0 {
                return Err(crate::error::Error::Inval);
            }
            bo
        };

        self.pace(ops, false);
        ops.setcrtc(&target)?;
        self.current_front = Some(target.clone());
        self.state = PostState::Steady;

        if let Some(secondary) = ops.secondary() {
            let back = secondary.back_buffer();
            secondary.setcrtc(&back)?;
        }
        debug!(crtc = self.crtc, "first post complete");
        Ok(())
    }

    fn steady_flip(&mut self, ops: &mut dyn PostOps, bo: Arc<BufferObject>) -> Result<()> {
        if bo.fb_id() == 0 {
            return Err(crate::error::Error::Inval);
        }
        if self.vblank.swap_interval > 1 {
            self.pace(ops, true);
        }

        if self.waiting_flip() {
            ops.drain_flip_event()?;
            self.current_front = self.next_front.take();
        }

        ops.page_flip(&bo, true)?;
        self.next_front = Some(bo.clone());

        if let Some(secondary) = ops.secondary() {
            secondary.blit_centered(&bo)?;
            let back = secondary.back_buffer();
            secondary.page_flip(&back)?;
        }

        if ops.requires_sync_flip() || ops.front_is_software_writable() {
            ops.drain_flip_event()?;
            self.current_front = self.next_front.take();
        }
        Ok(())
    }

    fn steady_copy(&mut self, ops: &mut dyn PostOps, bo: Arc<BufferObject>) -> Result<()> {
        self.pace(ops, false);
        let front = self.current_front.clone().ok_or(crate::error::Error::Inval)?;
        ops.blit(&front, &bo)?;
        if ops.vmwgfx_quirk() {
            ops.dirty_fb(&front)?;
        }
        Ok(())
    }

    fn steady_setcrtc(&mut self, ops: &mut dyn PostOps, bo: Arc<BufferObject>) -> Result<()> {
        if bo.fb_id() == 0 {
            return Err(crate::error::Error::Inval);
        }
        self.pace(ops, false);
        ops.setcrtc(&bo)?;
        self.current_front = Some(bo.clone());
        if let Some(secondary) = ops.secondary() {
            secondary.setcrtc(&bo)?;
        }
        Ok(())
    }

    /// Called from the page-flip event callback: retires the pending flip
    /// (§4.8 flip completion).
    pub fn on_flip_complete(&mut self) {
        if let Some(next) = self.next_front.take() {
            self.current_front = Some(next);
        } else {
            warn!(crtc = self.crtc, "flip-complete event with no pending flip");
        }
    }
}

/// The single-threaded handle through which a caller presents buffers.
/// `!Send` by construction: it carries a raw-pointer marker so the
/// compiler refuses to let it cross a thread boundary (§5).
#[derive(Debug)]
pub struct Poster<'a> {
    state: &'a mut SwapState,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Poster<'a> {
    /// Borrows `state` for the duration of one posting session.
    pub fn new(state: &'a mut SwapState) -> Poster<'a> {
        Poster { state, _not_send: PhantomData }
    }

    /// Presents `bo` (§4.8).
    pub fn post(&mut self, ops: &mut dyn PostOps, bo: Arc<BufferObject>) -> Result<()> {
        self.state.post(ops, bo)
    }

    /// `true` while a page flip is outstanding.
    pub fn waiting_flip(&self) -> bool {
        self.state.waiting_flip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::FakeBackend;
    use crate::bo::Manager;
    use crate::handle::Usage;
    use drm_fourcc::DrmFourcc;
    use std::sync::Mutex;

    struct FakeOps {
        vblank_seq: u32,
        vmwgfx: bool,
        sync_flip: bool,
        sw_writable: bool,
        blits: Vec<(u64, u64)>,
        flips: Vec<u64>,
        setcrtcs: Vec<u64>,
        dirty_fbs: Vec<u64>,
        drained: u32,
    }

    impl FakeOps {
        fn new() -> FakeOps {
            FakeOps {
                vblank_seq: 0,
                vmwgfx: false,
                sync_flip: false,
                sw_writable: false,
                blits: Vec::new(),
                flips: Vec::new(),
                setcrtcs: Vec::new(),
                dirty_fbs: Vec::new(),
                drained: 0,
            }
        }
    }

    impl PostOps for FakeOps {
        fn blit(&mut self, dst: &Arc<BufferObject>, src: &Arc<BufferObject>) -> Result<()> {
            self.blits.push((dst.id(), src.id()));
            Ok(())
        }
        fn setcrtc(&mut self, bo: &Arc<BufferObject>) -> Result<()> {
            self.setcrtcs.push(bo.id());
            Ok(())
        }
        fn page_flip(&mut self, bo: &Arc<BufferObject>, _request_event: bool) -> Result<()> {
            self.flips.push(bo.id());
            Ok(())
        }
        fn drain_flip_event(&mut self) -> Result<()> {
            self.drained += 1;
            Ok(())
        }
        fn dirty_fb(&mut self, bo: &Arc<BufferObject>) -> Result<()> {
            self.dirty_fbs.push(bo.id());
            Ok(())
        }
        fn query_vblank(&mut self, _crtc: u32) -> Option<u32> {
            Some(self.vblank_seq)
        }
        fn wait_vblank(&mut self, _crtc: u32, target: u32, _miss_ok: bool) -> Option<u32> {
            self.vblank_seq = target;
            Some(target)
        }
        fn front_is_software_writable(&self) -> bool {
            self.sw_writable
        }
        fn requires_sync_flip(&self) -> bool {
            self.sync_flip
        }
        fn vmwgfx_quirk(&self) -> bool {
            self.vmwgfx
        }
        fn secondary(&mut self) -> Option<&mut dyn SecondaryOutput> {
            None
        }
    }

    fn make_bo(mgr: &Manager) -> Arc<BufferObject> {
        let bo = mgr.create(64, 64, DrmFourcc::Xrgb8888, Usage::HW_FB).unwrap();
        bo.set_fb_id(1);
        bo
    }

    #[test]
    fn post_without_fb_id_is_rejected_outside_copy_mode() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = Manager::new(backend);
        let bo = mgr.create(64, 64, DrmFourcc::Xrgb8888, Usage::HW_FB).unwrap();
        assert_eq!(bo.fb_id(), 0);

        let mut swap = SwapState::new(0, SwapMode::Flip, 1);
        let mut ops = FakeOps::new();
        assert!(matches!(swap.post(&mut ops, bo), Err(crate::error::Error::Inval)));
    }

    #[test]
    fn flip_mode_drains_prior_flip_before_scheduling_next() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = Manager::new(backend);
        let bo1 = make_bo(&mgr);
        let bo2 = make_bo(&mgr);

        let mut swap = SwapState::new(0, SwapMode::Flip, 1);
        let mut ops = FakeOps::new();
        let lock = Mutex::new(());
        let _g = lock.lock().unwrap();

        swap.post(&mut ops, bo1.clone()).unwrap();
        assert_eq!(ops.setcrtcs, vec![bo1.id()]);

        swap.post(&mut ops, bo2.clone()).unwrap();
        assert_eq!(ops.flips, vec![bo2.id()]);
        assert_eq!(ops.drained, 0, "no prior flip pending on second post");

        let bo3 = make_bo(&mgr);
        swap.post(&mut ops, bo3.clone()).unwrap();
        assert_eq!(ops.drained, 1, "third post must drain the still-pending second flip");
        assert_eq!(ops.flips, vec![bo2.id(), bo3.id()]);
    }

    #[test]
    fn setcrtc_mode_never_flips_or_blits() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = Manager::new(backend);
        let bo1 = make_bo(&mgr);
        let bo2 = make_bo(&mgr);

        let mut swap = SwapState::new(0, SwapMode::SetCrtc, 1);
        let mut ops = FakeOps::new();
        ops.vmwgfx = true;

        swap.post(&mut ops, bo1.clone()).unwrap();
        swap.post(&mut ops, bo2.clone()).unwrap();

        assert_eq!(ops.setcrtcs, vec![bo1.id(), bo2.id()]);
        assert!(ops.flips.is_empty());
        assert!(ops.blits.is_empty());
    }

    #[test]
    fn vmwgfx_copy_mode_issues_dirty_fb() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = Manager::new(backend);
        let bo1 = make_bo(&mgr);
        let bo2 = make_bo(&mgr);

        let mut swap = SwapState::new(0, SwapMode::Copy, 1);
        let mut ops = FakeOps::new();
        ops.vmwgfx = true;

        swap.post(&mut ops, bo1.clone()).unwrap();
        swap.post(&mut ops, bo2.clone()).unwrap();

        assert_eq!(ops.blits, vec![(bo1.id(), bo2.id())]);
        assert_eq!(ops.dirty_fbs, vec![bo1.id()]);
    }

    #[test]
    fn noop_mode_does_nothing() {
        let backend = Arc::new(FakeBackend::new());
        let mgr = Manager::new(backend);
        let bo1 = make_bo(&mgr);
        let bo2 = make_bo(&mgr);

        let mut swap = SwapState::new(0, SwapMode::Noop, 1);
        let mut ops = FakeOps::new();

        swap.post(&mut ops, bo1).unwrap();
        swap.post(&mut ops, bo2).unwrap();
        assert!(ops.setcrtcs.is_empty());
        assert!(ops.flips.is_empty());
    }
}
