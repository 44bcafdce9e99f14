//! Raw i915 GEM ioctl request numbers and argument structs.
//!
//! The safe `drm` crate surface only covers the generic KMS/dumb-buffer
//! ioctls (used by `backend::pipe`); command submission and GTT mapping are
//! i915-specific and go straight through `libc::ioctl` against the device
//! fd, mirroring the stable `i915_drm.h` kernel uAPI layout.

use std::os::raw::c_ulong;

const DRM_IOCTL_BASE: c_ulong = b'd' as c_ulong;
const DRM_COMMAND_BASE: c_ulong = 0x40;

const DRM_I915_GEM_EXECBUFFER2: c_ulong = 0x29;
const DRM_I915_GEM_SET_DOMAIN: c_ulong = 0x06;
const DRM_I915_GEM_MMAP_GTT: c_ulong = 0x11;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn iowr(nr: c_ulong, size: usize) -> c_ulong {
    ((IOC_READ | IOC_WRITE) << 30) | (DRM_IOCTL_BASE << 8) | nr | ((size as c_ulong) << 16)
}

/// `I915_GEM_DOMAIN_GTT`, used for both read and write CPU-visible access
/// through the GTT aperture.
pub const GEM_DOMAIN_GTT: u32 = 0x0000_0004;

#[repr(C)]
pub struct GemExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
pub struct GemRelocationEntry {
    pub offset: u64,
    pub delta: u32,
    pub target_handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
    pub presumed_offset: i64,
}

#[repr(C)]
pub struct GemExecbuffer2 {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
pub struct GemSetDomain {
    pub handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

#[repr(C)]
pub struct GemMmapGtt {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

pub fn execbuffer2_request() -> c_ulong {
    iowr(DRM_COMMAND_BASE + DRM_I915_GEM_EXECBUFFER2, std::mem::size_of::<GemExecbuffer2>())
}

pub fn set_domain_request() -> c_ulong {
    iowr(DRM_COMMAND_BASE + DRM_I915_GEM_SET_DOMAIN, std::mem::size_of::<GemSetDomain>())
}

pub fn mmap_gtt_request() -> c_ulong {
    iowr(DRM_COMMAND_BASE + DRM_I915_GEM_MMAP_GTT, std::mem::size_of::<GemMmapGtt>())
}
