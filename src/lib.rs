#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # `gralloc-drm`
//!
//! A userspace graphics buffer allocator sitting on top of DRM/KMS: buffer
//! object lifecycle and cross-process import ([`bo`], [`handle`]), a
//! vendor-driver dispatch layer ([`backend`]), and the display swap-engine
//! state machine ([`kms`]).
//!
//! ## Structure
//!
//! [`device::DrmDevice`] is the process-singleton that ties everything
//! together: it owns the open DRM fd, the probed [`backend::Backend`], the
//! [`bo::Manager`], and the current [`kms::SwapState`]. [`module`] is the
//! thin process-entry glue a caller actually talks to.
//!
//! A [`handle::Handle`] is the only type that crosses process boundaries —
//! a fixed-size, `#[repr(C)]` record with no file descriptors. Everything
//! else lives behind an `Arc` inside one process's [`bo::Manager`].

pub mod backend;
pub mod bo;
pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod kms;
pub mod module;
pub mod signal;
pub mod utils;

pub use error::{Error, Result};
