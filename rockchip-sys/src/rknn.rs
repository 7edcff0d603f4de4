// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bindings for the RKNN NPU runtime (`rknn_api.h`).

#![allow(non_camel_case_types, non_upper_case_globals)]

use libloading::Library;
use std::ffi::{c_char, c_int, c_void, OsStr};

#[cfg(target_pointer_width = "64")]
pub type rknn_context = u64;
#[cfg(not(target_pointer_width = "64"))]
pub type rknn_context = u32;

pub const RKNN_SUCC: c_int = 0;

pub const RKNN_MAX_DIMS: usize = 16;
pub const RKNN_MAX_NAME_LEN: usize = 256;

pub type rknn_query_cmd = c_int;
pub const RKNN_QUERY_IN_OUT_NUM: rknn_query_cmd = 0;
pub const RKNN_QUERY_INPUT_ATTR: rknn_query_cmd = 1;
pub const RKNN_QUERY_OUTPUT_ATTR: rknn_query_cmd = 2;
pub const RKNN_QUERY_SDK_VERSION: rknn_query_cmd = 5;

pub type rknn_tensor_type = c_int;
pub const RKNN_TENSOR_FLOAT32: rknn_tensor_type = 0;
pub const RKNN_TENSOR_FLOAT16: rknn_tensor_type = 1;
pub const RKNN_TENSOR_INT8: rknn_tensor_type = 2;
pub const RKNN_TENSOR_UINT8: rknn_tensor_type = 3;

pub type rknn_tensor_format = c_int;
pub const RKNN_TENSOR_NCHW: rknn_tensor_format = 0;
pub const RKNN_TENSOR_NHWC: rknn_tensor_format = 1;

pub type rknn_tensor_qnt_type = c_int;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct rknn_input_output_num {
    pub n_input: u32,
    pub n_output: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct rknn_tensor_attr {
    pub index: u32,
    pub n_dims: u32,
    pub dims: [u32; RKNN_MAX_DIMS],
    pub name: [c_char; RKNN_MAX_NAME_LEN],
    pub n_elems: u32,
    pub size: u32,
    pub fmt: rknn_tensor_format,
    pub type_: rknn_tensor_type,
    pub qnt_type: rknn_tensor_qnt_type,
    pub fl: i8,
    pub zp: i32,
    pub scale: f32,
    pub w_stride: u32,
    pub size_with_stride: u32,
    pub pass_through: u8,
    pub h_stride: u32,
}

impl rknn_tensor_attr {
    pub fn with_index(index: u32) -> Self {
        // SAFETY: plain-old-data, all-zero is a valid value for every field.
        let mut attr: Self = unsafe { std::mem::zeroed() };
        attr.index = index;
        attr
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct rknn_sdk_version {
    pub api_version: [c_char; 256],
    pub drv_version: [c_char; 256],
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct rknn_input {
    pub index: u32,
    pub buf: *mut c_void,
    pub size: u32,
    pub pass_through: u8,
    pub type_: rknn_tensor_type,
    pub fmt: rknn_tensor_format,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct rknn_output {
    pub want_float: u8,
    pub is_prealloc: u8,
    pub index: u32,
    pub buf: *mut c_void,
    pub size: u32,
}

pub struct Rknn {
    __library: Library,
    pub rknn_init: unsafe extern "C" fn(
        context: *mut rknn_context,
        model: *mut c_void,
        size: u32,
        flag: u32,
        extend: *mut c_void,
    ) -> c_int,
    pub rknn_destroy: unsafe extern "C" fn(context: rknn_context) -> c_int,
    pub rknn_query: unsafe extern "C" fn(
        context: rknn_context,
        cmd: rknn_query_cmd,
        info: *mut c_void,
        size: u32,
    ) -> c_int,
    pub rknn_inputs_set: unsafe extern "C" fn(
        context: rknn_context,
        n_inputs: u32,
        inputs: *mut rknn_input,
    ) -> c_int,
    pub rknn_run: unsafe extern "C" fn(context: rknn_context, extend: *mut c_void) -> c_int,
    pub rknn_outputs_get: unsafe extern "C" fn(
        context: rknn_context,
        n_outputs: u32,
        outputs: *mut rknn_output,
        extend: *mut c_void,
    ) -> c_int,
    pub rknn_outputs_release: unsafe extern "C" fn(
        context: rknn_context,
        n_outputs: u32,
        outputs: *mut rknn_output,
    ) -> c_int,
}

impl Rknn {
    /// Opens `librknnrt` and resolves the runtime entry points.
    ///
    /// # Safety
    ///
    /// Loading a shared library runs its initialisers; `path` must name a
    /// genuine RKNN runtime build.
    pub unsafe fn new<P: AsRef<OsStr>>(path: P) -> Result<Self, libloading::Error> {
        use crate::symbol;
        let lib = Library::new(path)?;
        Ok(Self {
            rknn_init: symbol(&lib, b"rknn_init\0")?,
            rknn_destroy: symbol(&lib, b"rknn_destroy\0")?,
            rknn_query: symbol(&lib, b"rknn_query\0")?,
            rknn_inputs_set: symbol(&lib, b"rknn_inputs_set\0")?,
            rknn_run: symbol(&lib, b"rknn_run\0")?,
            rknn_outputs_get: symbol(&lib, b"rknn_outputs_get\0")?,
            rknn_outputs_release: symbol(&lib, b"rknn_outputs_release\0")?,
            __library: lib,
        })
    }
}
