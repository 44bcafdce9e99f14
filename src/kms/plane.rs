//! The overlay plane manager (§4.9).

use std::sync::Arc;

use crate::bo::{BufferObject, Manager};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::utils::Rect;

/// One hardware overlay plane's reservation state.
#[derive(Debug, Default)]
struct Slot {
    id: u32,
    possible_crtcs: u32,
    active: bool,
    fb_id: u32,
    dst: Rect<i32>,
    src: Rect<i32>,
    current: Option<Arc<BufferObject>>,
    /// The buffer this plane was last committed with, retained until the
    /// next commit so the plane manager can deref it only once the new
    /// buffer has taken over scanout (§4.9).
    previous: Option<Arc<BufferObject>>,
}

/// Tracks every overlay plane discovered on the primary pipe and which
/// buffer, if any, each is currently displaying (§4.9).
#[derive(Debug, Default)]
pub struct PlaneState {
    slots: Vec<Slot>,
    primary_crtc_bit: u32,
}

impl PlaneState {
    /// Builds plane state from the kernel's plane-resource enumeration.
    /// `planes` is `(plane_id, possible_crtcs)` per discovered plane.
    pub fn new(planes: impl IntoIterator<Item = (u32, u32)>, primary_crtc_bit: u32) -> PlaneState {
        PlaneState {
            slots: planes
                .into_iter()
                .map(|(id, possible_crtcs)| Slot { id, possible_crtcs, ..Default::default() })
                .collect(),
            primary_crtc_bit,
        }
    }

    /// Reserves an inactive plane whose id bit is set in `handle.plane_mask`
    /// and which can be driven from the primary pipe (§4.9).
    pub fn reserve(&mut self, handle: &Handle, dst: Rect<i32>, src: Rect<i32>) -> Result<u32> {
        if handle.plane_mask == 0 {
            return Err(Error::Inval);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| {
                !s.active
                    && handle.plane_mask & (1 << s.id) != 0
                    && s.possible_crtcs & self.primary_crtc_bit != 0
            })
            .ok_or(Error::Busy)?;
        slot.active = true;
        slot.dst = dst;
        slot.src = src;
        Ok(slot.id)
    }

    /// Marks every plane inactive and clears its fb attachment, used on
    /// teardown and mode changes.
    pub fn disable_all(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
            slot.fb_id = 0;
            slot.current = None;
        }
    }

    /// Replaces the buffer shown on an already-reserved plane.
    pub fn set_handle(&mut self, id: u32, bo: Arc<BufferObject>) -> Result<()> {
        let slot = self.slots.iter_mut().find(|s| s.id == id).ok_or(Error::Inval)?;
        if !slot.active {
            return Err(Error::Inval);
        }
        slot.current = Some(bo);
        Ok(())
    }

    /// Commits every reserved plane's current buffer to the hardware
    /// (§4.9): attaches an fb if missing, issues the plane update in the
    /// wire-format coordinate convention (source 16.16 fixed point,
    /// destination integer), increfs the buffer now on scanout and derefs
    /// the one it replaces, and on failure clears `plane_mask` on the
    /// offending handle so the buffer is never retried.
    pub fn commit<F>(&mut self, manager: &Manager, mut set_plane: F) -> Result<()>
    where
        F: FnMut(u32, &BufferObject, Rect<i32>, Rect<i32>) -> Result<u32>,
    {
        for slot in &mut self.slots {
            if !slot.active {
                continue;
            }
            let Some(bo) = slot.current.clone() else { continue };
            match set_plane(slot.id, &bo, slot.dst, slot.src) {
                Ok(fb_id) => {
                    slot.fb_id = fb_id;
                    manager.incref(&bo);
                    if let Some(previous) = slot.previous.replace(bo) {
                        let mut h = *previous.handle.lock().unwrap();
                        manager.decref(&previous, &mut h)?;
                    }
                }
                Err(e) => {
                    bo.handle.lock().unwrap().plane_mask = 0;
                    slot.active = false;
                    slot.current = None;
                    slot.previous = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
