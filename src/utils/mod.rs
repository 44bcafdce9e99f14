//! Small shared utilities used throughout the crate.

mod geometry;
pub mod fd;

pub use fd::DeviceFd;
pub use geometry::{Point, Rect, Size};
