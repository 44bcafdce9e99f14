//! The termination hook (§4.8): drain a pending flip before exiting on
//! `SIGINT`/`SIGTERM`.
//!
//! Mirrors the original's crude, documented-as-racy approach: a signal
//! handler cannot safely call back into arbitrary device code, so it only
//! flips an atomic and lets a short sleep/retry loop in the handler itself
//! decide whether it's safe to drain. Installed only when the active swap
//! mode is `Flip`.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

/// Set for the duration of the posting thread's call into `drmHandleEvent`
/// (or this crate's equivalent flip-drain call), so the signal path knows
/// not to race it.
static HANDLING_EVENT: AtomicBool = AtomicBool::new(false);

/// The process-singleton hook state, set once `init_kms_features` selects
/// `SwapMode::Flip` (§4.8).
static HOOK: OnceLock<SignalHook> = OnceLock::new();

/// What the termination hook needs from the owning device to drain a
/// pending flip, abstracted so the hook can be installed without pulling
/// in `device::DrmDevice` directly (avoiding a dependency cycle on the
/// signal-handling path).
pub trait FlipDrain: Send + Sync {
    /// `true` if a page flip is currently outstanding.
    fn waiting_flip(&self) -> bool;
    /// Issues a null flip (or event drain) to retire the pending one.
    fn drain(&self);
}

struct SignalHook {
    target: &'static dyn FlipDrain,
}

/// Installs the termination hook against `target`. Idempotent: only the
/// first call takes effect, matching the original's single
/// `drm_singleton` registration.
pub fn install(target: &'static dyn FlipDrain) {
    let _ = HOOK.set(SignalHook { target });
}

/// Marks the posting thread as mid-event-handling; call before and after
/// the blocking event-drain call this crate makes during a flip.
pub fn mark_handling_event(handling: bool) {
    HANDLING_EVENT.store(handling, Ordering::SeqCst);
}

/// The `SIGINT`/`SIGTERM` handler body (§4.8): if a flip is pending, sleep
/// briefly when another thread is mid-drain, otherwise drain directly; then
/// terminate with the original's sentinel exit code.
pub fn on_signal() -> ! {
    if let Some(hook) = HOOK.get() {
        if hook.target.waiting_flip() {
            if HANDLING_EVENT.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            } else {
                hook.target.drain();
            }
        }
    } else {
        warn!("termination signal received with no flip-drain hook installed");
    }
    process::exit(-1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingDrain {
        waiting: AtomicBool,
        drains: AtomicU32,
    }

    impl FlipDrain for CountingDrain {
        fn waiting_flip(&self) -> bool {
            self.waiting.load(Ordering::SeqCst)
        }
        fn drain(&self) {
            self.drains.fetch_add(1, Ordering::SeqCst);
            self.waiting.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn mark_handling_event_round_trips() {
        mark_handling_event(true);
        assert!(HANDLING_EVENT.load(Ordering::SeqCst));
        mark_handling_event(false);
        assert!(!HANDLING_EVENT.load(Ordering::SeqCst));
    }

    #[test]
    fn flip_drain_clears_waiting_flag() {
        let drain = CountingDrain { waiting: AtomicBool::new(true), drains: AtomicU32::new(0) };
        assert!(drain.waiting_flip());
        drain.drain();
        assert!(!drain.waiting_flip());
        assert_eq!(drain.drains.load(Ordering::SeqCst), 1);
    }
}
