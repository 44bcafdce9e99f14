//! The process-singleton device (§3, §4).
//!
//! `DrmDevice` ties together the opened DRM fd, the probed backend, the BO
//! manager, and KMS state. Exactly one instance exists per process,
//! constructed lazily on first entry from [`crate::module`].

use std::fs::OpenOptions;
use std::sync::{Mutex, OnceLock};

use tracing::{info, warn};

use crate::backend::{self, Backend};
use crate::bo;
use crate::error::Result;
use crate::kms;
use crate::utils::DeviceFd;

/// Default DRM node probed when no explicit path is given.
const DEFAULT_CARD: &str = "/dev/dri/card0";

/// The process-wide singleton, wrapped for lazy, fallible construction.
static INSTANCE: OnceLock<Mutex<Option<DrmDevice>>> = OnceLock::new();

/// Ties the opened DRM device together with its buffer manager and KMS
/// state (§3 data model).
pub struct DrmDevice {
    fd: DeviceFd,
    backend: std::sync::Arc<dyn Backend>,
    bo_manager: bo::Manager,
    swap: Mutex<kms::SwapState>,
    driver_name: String,
}

impl DrmDevice {
    fn open(path: &str) -> Result<DrmDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = DeviceFd::from(std::os::fd::OwnedFd::from(file));

        let driver_name = probe_driver_name(&fd);
        let backend = backend::probe(fd.clone(), &driver_name)?;
        let bo_manager = bo::Manager::new(backend.clone());

        let swap = match kms::discover(&fd, &driver_name) {
            Ok(discovery) => {
                let crtc_id: u32 = discovery.primary.crtc.into();
                let features = backend.init_kms_features(&discovery.init);
                info!(crtc_id, dual_output = discovery.init.dual_output, "kms discovery complete");
                kms::SwapState::new(crtc_id, features.swap_mode, 1)
            }
            Err(err) => {
                warn!(%err, "kms discovery failed, falling back to a no-op swap chain");
                kms::SwapState::new(0, kms::SwapMode::Noop, 1)
            }
        };

        info!(path, driver = %driver_name, "drm device opened");
        Ok(DrmDevice {
            fd,
            backend,
            bo_manager,
            swap: Mutex::new(swap),
            driver_name,
        })
    }

    /// Returns the process-singleton device, opening [`DEFAULT_CARD`] on
    /// first call (§3 "created lazily on first entry").
    pub fn instance() -> Result<&'static Mutex<Option<DrmDevice>>> {
        Self::instance_at(DEFAULT_CARD)
    }

    /// Same as [`DrmDevice::instance`] but against an explicit device path,
    /// used by tests and alternate-card configurations.
    pub fn instance_at(path: &str) -> Result<&'static Mutex<Option<DrmDevice>>> {
        let cell = INSTANCE.get_or_init(|| Mutex::new(None));
        {
            let mut guard = cell.lock().unwrap();
            if guard.is_none() {
                *guard = Some(DrmDevice::open(path)?);
            }
        }
        Ok(cell)
    }

    /// The raw DRM device fd, handed out to `GetDrmFd` (§4 process-entry
    /// surface).
    pub fn fd(&self) -> &DeviceFd {
        &self.fd
    }

    /// The kernel driver name this device's backend was probed against.
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// The buffer-object manager (§4.2).
    pub fn bo_manager(&self) -> &bo::Manager {
        &self.bo_manager
    }

    /// The backend in use (§4.3).
    pub fn backend(&self) -> &std::sync::Arc<dyn Backend> {
        &self.backend
    }

    /// Locks the swap state for the duration of one presentation. The
    /// returned guard is handed to [`kms::Poster::new`] by the caller,
    /// which is itself `!Send` (§5).
    pub fn swap_state(&self) -> std::sync::MutexGuard<'_, kms::SwapState> {
        self.swap.lock().unwrap()
    }

    /// Resets swap state to `FirstPost` (§4 `EnterVt`: setmaster +
    /// `first_post = true`).
    pub fn on_enter_vt(&self) {
        let mut swap = self.swap.lock().unwrap();
        *swap = kms::SwapState::new(0, kms::SwapMode::Noop, 1);
        warn!("enter_vt: swap state reset to FirstPost, mode re-probe pending");
    }
}

impl drm::Device for DeviceFd {}
impl drm::control::Device for DeviceFd {}

fn probe_driver_name(fd: &DeviceFd) -> String {
    use drm::Device as _;

    match fd.get_driver() {
        Ok(driver) => driver.name().to_string_lossy().into_owned(),
        Err(err) => {
            warn!(%err, "failed to query drm driver name, falling back to generic backend");
            String::from("unknown")
        }
    }
}

impl std::fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDevice").field("driver_name", &self.driver_name).finish()
    }
}
