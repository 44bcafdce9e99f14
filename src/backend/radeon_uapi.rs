//! Raw Radeon GEM ioctl request numbers and argument structs, mirroring
//! the stable `radeon_drm.h` kernel uAPI. Mapping and simple copy
//! submission go through these rather than the safe `drm` crate surface,
//! which only covers generic KMS/dumb-buffer ioctls.

use std::os::raw::c_ulong;

const DRM_IOCTL_BASE: c_ulong = b'd' as c_ulong;
const DRM_COMMAND_BASE: c_ulong = 0x40;

const DRM_RADEON_GEM_MMAP: c_ulong = 0x0e;
const DRM_RADEON_GEM_WAIT_IDLE: c_ulong = 0x14;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn iowr(nr: c_ulong, size: usize) -> c_ulong {
    ((IOC_READ | IOC_WRITE) << 30) | (DRM_IOCTL_BASE << 8) | nr | ((size as c_ulong) << 16)
}

const fn iow(nr: c_ulong, size: usize) -> c_ulong {
    (IOC_WRITE << 30) | (DRM_IOCTL_BASE << 8) | nr | ((size as c_ulong) << 16)
}

#[repr(C)]
pub struct GemMmap {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
}

#[repr(C)]
pub struct GemWaitIdle {
    pub handle: u32,
    pub pad: u32,
}

pub fn gem_mmap_request() -> c_ulong {
    iowr(DRM_COMMAND_BASE + DRM_RADEON_GEM_MMAP, std::mem::size_of::<GemMmap>())
}

pub fn gem_wait_idle_request() -> c_ulong {
    iow(DRM_COMMAND_BASE + DRM_RADEON_GEM_WAIT_IDLE, std::mem::size_of::<GemWaitIdle>())
}
