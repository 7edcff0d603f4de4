// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bindings for the RGA im2d API (`im2d_type.h`, `im2d_single.h`, `rga.h`).

#![allow(non_camel_case_types, non_upper_case_globals)]

use libloading::Library;
use std::{
    ffi::{c_char, c_double, c_int, c_void, OsStr},
    ptr::null_mut,
};

pub type IM_STATUS = c_int;
pub const IM_STATUS_NOERROR: IM_STATUS = 2;
pub const IM_STATUS_SUCCESS: IM_STATUS = 1;
pub const IM_STATUS_NOT_SUPPORTED: IM_STATUS = -1;
pub const IM_STATUS_OUT_OF_MEMORY: IM_STATUS = -2;
pub const IM_STATUS_INVALID_PARAM: IM_STATUS = -3;
pub const IM_STATUS_ILLEGAL_PARAM: IM_STATUS = -4;
pub const IM_STATUS_ERROR_VERSION: IM_STATUS = -5;
pub const IM_STATUS_FAILED: IM_STATUS = 0;

pub const INTER_NEAREST: c_int = 0;
pub const INTER_LINEAR: c_int = 1;
pub const INTER_CUBIC: c_int = 2;

pub const RK_FORMAT_RGBA_8888: c_int = 0x0 << 8;
pub const RK_FORMAT_RGBX_8888: c_int = 0x1 << 8;
pub const RK_FORMAT_RGB_888: c_int = 0x2 << 8;
pub const RK_FORMAT_BGR_888: c_int = 0x7 << 8;
pub const RK_FORMAT_YCbCr_420_SP: c_int = 0xa << 8;
pub const RK_FORMAT_YCrCb_420_SP: c_int = 0xe << 8;
pub const RK_FORMAT_YUYV_422: c_int = 0x18 << 8;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct im_colorkey_range {
    pub max: c_int,
    pub min: c_int,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct im_nn_t {
    pub scale_r: c_int,
    pub scale_g: c_int,
    pub scale_b: c_int,
    pub offset_r: c_int,
    pub offset_g: c_int,
    pub offset_b: c_int,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct rga_buffer_t {
    pub vir_addr: *mut c_void,
    pub phy_addr: *mut c_void,
    pub fd: c_int,
    pub width: c_int,
    pub height: c_int,
    pub wstride: c_int,
    pub hstride: c_int,
    pub format: c_int,
    pub color_space_mode: c_int,
    pub global_alpha: c_int,
    pub rd_mode: c_int,
    pub color: c_int,
    pub colorkey_range: im_colorkey_range,
    pub nn: im_nn_t,
    pub rop_code: c_int,
    pub handle: c_int,
}

impl Default for rga_buffer_t {
    fn default() -> Self {
        Self {
            vir_addr: null_mut(),
            phy_addr: null_mut(),
            fd: -1,
            width: 0,
            height: 0,
            wstride: 0,
            hstride: 0,
            format: 0,
            color_space_mode: 0,
            global_alpha: 0,
            rd_mode: 0,
            color: 0,
            colorkey_range: im_colorkey_range::default(),
            nn: im_nn_t::default(),
            rop_code: 0,
            handle: 0,
        }
    }
}

impl rga_buffer_t {
    /// Equivalent of the `wrapbuffer_fd` macro with tightly packed strides.
    pub fn from_fd(fd: c_int, width: c_int, height: c_int, format: c_int) -> Self {
        Self {
            fd,
            width,
            height,
            wstride: width,
            hstride: height,
            format,
            ..Default::default()
        }
    }

    /// Equivalent of the `wrapbuffer_virtualaddr` macro with tightly packed
    /// strides.
    pub fn from_virtual(vaddr: *mut c_void, width: c_int, height: c_int, format: c_int) -> Self {
        Self {
            vir_addr: vaddr,
            width,
            height,
            wstride: width,
            hstride: height,
            format,
            ..Default::default()
        }
    }
}

pub type imresize_t_fn = unsafe extern "C" fn(
    src: rga_buffer_t,
    dst: rga_buffer_t,
    fx: c_double,
    fy: c_double,
    interpolation: c_int,
    sync: c_int,
) -> IM_STATUS;
pub type imStrError_t_fn = unsafe extern "C" fn(status: IM_STATUS) -> *const c_char;
pub type querystring_fn = unsafe extern "C" fn(name: c_int) -> *const c_char;

pub const RGA_VERSION: c_int = 4;

pub struct Rga {
    __library: Library,
    pub imresize_t: imresize_t_fn,
    pub imStrError_t: imStrError_t_fn,
    pub querystring: querystring_fn,
}

impl Rga {
    /// Opens `librga` and resolves the im2d entry points.
    ///
    /// # Safety
    ///
    /// Loading a shared library runs its initialisers; `path` must name a
    /// genuine librga build.
    pub unsafe fn new<P: AsRef<OsStr>>(path: P) -> Result<Self, libloading::Error> {
        let library = Library::new(path)?;
        Ok(Self {
            imresize_t: crate::symbol(&library, b"imresize_t\0")?,
            imStrError_t: crate::symbol(&library, b"imStrError_t\0")?,
            querystring: crate::symbol(&library, b"querystring\0")?,
            __library: library,
        })
    }
}
