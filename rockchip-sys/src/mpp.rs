// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bindings for the Rockchip Media Process Platform (`rk_mpi.h`,
//! `mpp_buffer.h`, `mpp_frame.h`, `mpp_packet.h`, `rk_venc_cfg.h`).

#![allow(non_camel_case_types, non_upper_case_globals)]

use libloading::Library;
use std::ffi::{c_char, c_int, c_void, OsStr};

pub type MPP_RET = c_int;
pub const MPP_OK: MPP_RET = 0;
pub const MPP_NOK: MPP_RET = -1;
pub const MPP_ERR_TIMEOUT: MPP_RET = -8;

pub type MppCtx = *mut c_void;
pub type MppParam = *mut c_void;
pub type MppFrame = *mut c_void;
pub type MppPacket = *mut c_void;
pub type MppBuffer = *mut c_void;
pub type MppBufferGroup = *mut c_void;
pub type MppEncCfg = *mut c_void;
pub type MppMeta = *mut c_void;
pub type MppTask = *mut c_void;

pub type MppCtxType = c_int;
pub const MPP_CTX_DEC: MppCtxType = 0;
pub const MPP_CTX_ENC: MppCtxType = 1;

pub type MppCodingType = c_int;
pub const MPP_VIDEO_CodingAVC: MppCodingType = 7;
pub const MPP_VIDEO_CodingHEVC: MppCodingType = 0x0100_0004;

pub type MppFrameFormat = c_int;
pub const MPP_FMT_YUV420SP: MppFrameFormat = 0;

pub type MppBufferType = c_int;
pub const MPP_BUFFER_TYPE_NORMAL: MppBufferType = 0;
pub const MPP_BUFFER_TYPE_ION: MppBufferType = 1;
pub const MPP_BUFFER_TYPE_EXT_DMA: MppBufferType = 2;
pub const MPP_BUFFER_TYPE_DRM: MppBufferType = 3;
pub const MPP_BUFFER_TYPE_DMA_HEAP: MppBufferType = 4;

pub type MppEncRcMode = c_int;
pub const MPP_ENC_RC_MODE_VBR: MppEncRcMode = 0;
pub const MPP_ENC_RC_MODE_CBR: MppEncRcMode = 1;

pub type MpiCmd = c_int;
const CMD_MODULE_CODEC: MpiCmd = 0x0030_0000;
const CMD_CTX_ID_ENC: MpiCmd = 0x0002_0000;
const MPP_ENC_CMD_BASE: MpiCmd = CMD_MODULE_CODEC | CMD_CTX_ID_ENC;
pub const MPP_ENC_SET_CFG: MpiCmd = MPP_ENC_CMD_BASE + 1;
pub const MPP_ENC_GET_CFG: MpiCmd = MPP_ENC_CMD_BASE + 2;

pub type MppMetaKey = u32;

const fn fourcc_meta(a: u8, b: u8, c: u8, d: u8) -> MppMetaKey {
    (a as u32) << 24 | (b as u32) << 16 | (c as u32) << 8 | d as u32
}

/// Set on an output packet when it carries an intra (IDR) frame.
pub const KEY_OUTPUT_INTRA: MppMetaKey = fourcc_meta(b'o', b'i', b'n', b't');

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MppBufferInfo {
    pub type_: MppBufferType,
    pub size: usize,
    pub ptr: *mut c_void,
    pub hnd: *mut c_void,
    pub fd: c_int,
    pub index: c_int,
}

#[repr(C)]
pub struct MppApi {
    pub size: u32,
    pub version: u32,
    pub decode: Option<
        unsafe extern "C" fn(ctx: MppCtx, packet: MppPacket, frame: *mut MppFrame) -> MPP_RET,
    >,
    pub decode_put_packet:
        Option<unsafe extern "C" fn(ctx: MppCtx, packet: MppPacket) -> MPP_RET>,
    pub decode_get_frame:
        Option<unsafe extern "C" fn(ctx: MppCtx, frame: *mut MppFrame) -> MPP_RET>,
    pub encode: Option<
        unsafe extern "C" fn(ctx: MppCtx, frame: MppFrame, packet: *mut MppPacket) -> MPP_RET,
    >,
    pub encode_put_frame: Option<unsafe extern "C" fn(ctx: MppCtx, frame: MppFrame) -> MPP_RET>,
    pub encode_get_packet:
        Option<unsafe extern "C" fn(ctx: MppCtx, packet: *mut MppPacket) -> MPP_RET>,
    pub isp: Option<unsafe extern "C" fn(ctx: MppCtx, dst: MppFrame, src: MppFrame) -> MPP_RET>,
    pub isp_put_frame: Option<unsafe extern "C" fn(ctx: MppCtx, frame: MppFrame) -> MPP_RET>,
    pub isp_get_frame: Option<unsafe extern "C" fn(ctx: MppCtx, frame: *mut MppFrame) -> MPP_RET>,
    pub poll: Option<unsafe extern "C" fn(ctx: MppCtx, port: c_int, timeout: c_int) -> MPP_RET>,
    pub dequeue:
        Option<unsafe extern "C" fn(ctx: MppCtx, port: c_int, task: *mut MppTask) -> MPP_RET>,
    pub enqueue: Option<unsafe extern "C" fn(ctx: MppCtx, port: c_int, task: MppTask) -> MPP_RET>,
    pub reset: Option<unsafe extern "C" fn(ctx: MppCtx) -> MPP_RET>,
    pub control: Option<unsafe extern "C" fn(ctx: MppCtx, cmd: MpiCmd, param: MppParam) -> MPP_RET>,
    pub reserv: [u32; 16],
}

pub struct Mpp {
    __library: Library,
    pub mpp_create: unsafe extern "C" fn(ctx: *mut MppCtx, mpi: *mut *mut MppApi) -> MPP_RET,
    pub mpp_init:
        unsafe extern "C" fn(ctx: MppCtx, type_: MppCtxType, coding: MppCodingType) -> MPP_RET,
    pub mpp_destroy: unsafe extern "C" fn(ctx: MppCtx) -> MPP_RET,

    pub mpp_enc_cfg_init: unsafe extern "C" fn(cfg: *mut MppEncCfg) -> MPP_RET,
    pub mpp_enc_cfg_deinit: unsafe extern "C" fn(cfg: MppEncCfg) -> MPP_RET,
    pub mpp_enc_cfg_set_s32:
        unsafe extern "C" fn(cfg: MppEncCfg, name: *const c_char, val: i32) -> MPP_RET,

    pub mpp_buffer_import_with_tag: unsafe extern "C" fn(
        group: MppBufferGroup,
        info: *mut MppBufferInfo,
        buffer: *mut MppBuffer,
        tag: *const c_char,
        caller: *const c_char,
    ) -> MPP_RET,
    pub mpp_buffer_put_with_caller:
        unsafe extern "C" fn(buffer: MppBuffer, caller: *const c_char) -> MPP_RET,

    pub mpp_frame_init: unsafe extern "C" fn(frame: *mut MppFrame) -> MPP_RET,
    pub mpp_frame_deinit: unsafe extern "C" fn(frame: *mut MppFrame) -> MPP_RET,
    pub mpp_frame_set_width: unsafe extern "C" fn(frame: MppFrame, width: u32),
    pub mpp_frame_set_height: unsafe extern "C" fn(frame: MppFrame, height: u32),
    pub mpp_frame_set_hor_stride: unsafe extern "C" fn(frame: MppFrame, stride: u32),
    pub mpp_frame_set_ver_stride: unsafe extern "C" fn(frame: MppFrame, stride: u32),
    pub mpp_frame_set_fmt: unsafe extern "C" fn(frame: MppFrame, fmt: MppFrameFormat),
    pub mpp_frame_set_buffer: unsafe extern "C" fn(frame: MppFrame, buffer: MppBuffer),

    pub mpp_packet_deinit: unsafe extern "C" fn(packet: *mut MppPacket) -> MPP_RET,
    pub mpp_packet_get_pos: unsafe extern "C" fn(packet: MppPacket) -> *mut c_void,
    pub mpp_packet_get_length: unsafe extern "C" fn(packet: MppPacket) -> usize,
    pub mpp_packet_get_meta: unsafe extern "C" fn(packet: MppPacket) -> MppMeta,
    pub mpp_meta_get_s32:
        unsafe extern "C" fn(meta: MppMeta, key: MppMetaKey, val: *mut i32) -> MPP_RET,
}

impl Mpp {
    /// Opens `librockchip_mpp` and resolves the encoder entry points.
    ///
    /// # Safety
    ///
    /// Loading a shared library runs its initialisers; `path` must name a
    /// genuine MPP build.
    pub unsafe fn new<P: AsRef<OsStr>>(path: P) -> Result<Self, libloading::Error> {
        use crate::symbol;
        let lib = Library::new(path)?;
        Ok(Self {
            mpp_create: symbol(&lib, b"mpp_create\0")?,
            mpp_init: symbol(&lib, b"mpp_init\0")?,
            mpp_destroy: symbol(&lib, b"mpp_destroy\0")?,
            mpp_enc_cfg_init: symbol(&lib, b"mpp_enc_cfg_init\0")?,
            mpp_enc_cfg_deinit: symbol(&lib, b"mpp_enc_cfg_deinit\0")?,
            mpp_enc_cfg_set_s32: symbol(&lib, b"mpp_enc_cfg_set_s32\0")?,
            mpp_buffer_import_with_tag: symbol(&lib, b"mpp_buffer_import_with_tag\0")?,
            mpp_buffer_put_with_caller: symbol(&lib, b"mpp_buffer_put_with_caller\0")?,
            mpp_frame_init: symbol(&lib, b"mpp_frame_init\0")?,
            mpp_frame_deinit: symbol(&lib, b"mpp_frame_deinit\0")?,
            mpp_frame_set_width: symbol(&lib, b"mpp_frame_set_width\0")?,
            mpp_frame_set_height: symbol(&lib, b"mpp_frame_set_height\0")?,
            mpp_frame_set_hor_stride: symbol(&lib, b"mpp_frame_set_hor_stride\0")?,
            mpp_frame_set_ver_stride: symbol(&lib, b"mpp_frame_set_ver_stride\0")?,
            mpp_frame_set_fmt: symbol(&lib, b"mpp_frame_set_fmt\0")?,
            mpp_frame_set_buffer: symbol(&lib, b"mpp_frame_set_buffer\0")?,
            mpp_packet_deinit: symbol(&lib, b"mpp_packet_deinit\0")?,
            mpp_packet_get_pos: symbol(&lib, b"mpp_packet_get_pos\0")?,
            mpp_packet_get_length: symbol(&lib, b"mpp_packet_get_length\0")?,
            mpp_packet_get_meta: symbol(&lib, b"mpp_packet_get_meta\0")?,
            mpp_meta_get_s32: symbol(&lib, b"mpp_meta_get_s32\0")?,
            __library: lib,
        })
    }
}
