//! Crate-wide error taxonomy (§7).
//!
//! Every fallible operation in this crate returns [`Error`]. At the module
//! glue boundary (`crate::module`) these are narrowed to the negative errno
//! values the original `perform()` dispatch contract expects.

use std::path::PathBuf;

/// The crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by this crate, mirroring the taxonomy of §7.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad handle, bad arguments, no compatible mode, no encoder, or an
    /// unsupported pixel format.
    #[error("invalid argument")]
    Inval,
    /// A kernel or host allocation failed.
    #[error("out of memory")]
    NoMem,
    /// No free plane was available, or the driver reports a flip already
    /// pending.
    #[error("device or resource busy")]
    Busy,
    /// The DRM character device could not be opened.
    #[error("no such device")]
    NoEnt,
    /// A lower-level DRM ioctl failed.
    #[error("drm access error: {errmsg} on device `{dev:?}`: {source}")]
    Access {
        /// Human-readable description of the failing call.
        errmsg: &'static str,
        /// Device node path, if known.
        dev: Option<PathBuf>,
        /// Underlying ioctl error.
        #[source]
        source: drm::SystemError,
    },
    /// A plain I/O error (device open, mmap, ...).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps this error onto the negative-errno contract the module glue's
    /// `perform()` dispatch and the Android-style HAL entry points use.
    pub fn to_negative_errno(&self) -> i32 {
        match self {
            Error::Inval => -libc::EINVAL,
            Error::NoMem => -libc::ENOMEM,
            Error::Busy => -libc::EBUSY,
            Error::NoEnt => -libc::ENOENT,
            // `drm::SystemError` does not expose a stable raw-errno accessor;
            // ioctl failures are reported to the caller as a generic I/O error.
            Error::Access { .. } => -libc::EIO,
            Error::Io(err) => -(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

impl From<drm::SystemError> for Error {
    fn from(source: drm::SystemError) -> Error {
        Error::Access {
            errmsg: "drm ioctl failed",
            dev: None,
            source,
        }
    }
}
