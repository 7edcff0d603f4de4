// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The subset of the V4L2 UAPI (`linux/videodev2.h`) used by the capture
//! source: single-planar streaming capture with MMAP buffers and dma-buf
//! export.

#![allow(non_camel_case_types)]

use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};
use std::ffi::{c_int, c_ulong, c_void, CStr};

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;
pub const V4L2_CAP_TIMEPERFRAME: u32 = 0x1000;

pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;

/// A NUL-padded fixed-size string field. A field filled to the last byte
/// carries no terminator and is read whole.
pub fn fixed_str(bytes: &[u8]) -> String {
    match CStr::from_bytes_until_nul(bytes) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl v4l2_capability {
    pub fn driver_name(&self) -> String {
        fixed_str(&self.driver)
    }

    pub fn card_name(&self) -> String {
        fixed_str(&self.card)
    }

    /// Capabilities of the opened node rather than the whole driver.
    pub fn node_caps(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_format_union {
    pub pix: v4l2_pix_format,
    // The kernel union holds pointer-bearing members, hence 8-byte alignment.
    pub raw_data: [u64; 25],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_union,
}

impl v4l2_format {
    pub fn capture(pix: v4l2_pix_format) -> Self {
        let mut fmt = Self {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            fmt: v4l2_format_union { raw_data: [0; 25] },
        };
        fmt.fmt.pix = pix;
        fmt
    }

    pub fn pix(&self) -> v4l2_pix_format {
        // SAFETY: only single-planar capture formats are exchanged.
        unsafe { self.fmt.pix }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_captureparm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: v4l2_fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_streamparm_union {
    pub capture: v4l2_captureparm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_streamparm {
    pub type_: u32,
    pub parm: v4l2_streamparm_union,
}

impl v4l2_streamparm {
    pub fn capture() -> Self {
        Self {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            parm: v4l2_streamparm_union { raw_data: [0; 200] },
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    pub fn mmap_capture(index: u32) -> Self {
        Self {
            index,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            timecode: v4l2_timecode::default(),
            sequence: 0,
            memory: V4L2_MEMORY_MMAP,
            m: v4l2_buffer_m { userptr: 0 },
            length: 0,
            reserved2: 0,
            request_fd: 0,
        }
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: MMAP buffers report their mapping offset in `m.offset`.
        unsafe { self.m.offset }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
ioctl_readwrite!(vidioc_expbuf, b'V', 16, v4l2_exportbuffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
ioctl_readwrite!(vidioc_g_parm, b'V', 21, v4l2_streamparm);
ioctl_readwrite!(vidioc_s_parm, b'V', 22, v4l2_streamparm);
