// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! H.264 encoding of NV12 frames on the Rockchip MPP hardware encoder.

use crate::{
    dma::PhysicalBuffer,
    error::{Error, Result},
    image::{image_size, Geometry, NV12},
};
use rockchip_sys::mpp::*;
use std::{
    ffi::CStr,
    os::fd::{AsRawFd, BorrowedFd},
    ptr::null_mut,
    slice::from_raw_parts,
};
use tracing::{debug, info, instrument, trace, warn};

/// Default encoder output scratch size.
pub const DEFAULT_SCRATCH_CAPACITY: usize = 2 * 1024 * 1024;

/// Default target bitrate in bits per second.
pub const DEFAULT_BITRATE: u32 = 3 * 1024 * 1024;

/// What happens when one frame's output outgrows the scratch region.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ScratchPolicy {
    /// The frame is rejected as a whole.
    #[default]
    Fixed,
    /// The scratch grows to hold the frame.
    Grow,
}

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub geometry: Geometry,
    pub frame_rate: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub scratch_capacity: usize,
    pub scratch_policy: ScratchPolicy,
}

impl EncoderConfig {
    pub fn new(geometry: Geometry, frame_rate: u32) -> Self {
        Self {
            geometry,
            frame_rate,
            bitrate: DEFAULT_BITRATE,
            scratch_capacity: DEFAULT_SCRATCH_CAPACITY,
            scratch_policy: ScratchPolicy::Fixed,
        }
    }

    /// Frames between key frames: one key frame per second.
    pub fn gop(&self) -> u32 {
        self.frame_rate
    }

    pub fn bitrate_max(&self) -> u32 {
        self.bitrate / 2 * 3
    }

    pub fn bitrate_min(&self) -> u32 {
        self.bitrate / 2
    }

    /// Bytes an NV12 input frame of the configured geometry occupies.
    pub fn input_size(&self) -> usize {
        image_size(self.geometry.width, self.geometry.height, NV12).unwrap_or(0)
    }
}

/// Concatenates the output units of one frame into a reusable scratch
/// region, enforcing its capacity.
#[derive(Debug)]
pub struct PacketAssembler {
    data: Vec<u8>,
    capacity: usize,
    policy: ScratchPolicy,
    required: usize,
    key_frame: bool,
}

impl PacketAssembler {
    pub fn new(capacity: usize, policy: ScratchPolicy) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            policy,
            required: 0,
            key_frame: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Starts a new frame.
    pub fn begin(&mut self) {
        self.data.clear();
        self.required = 0;
        self.key_frame = false;
    }

    /// Appends one output unit in arrival order.
    pub fn push(&mut self, unit: &[u8], key_frame: bool) {
        self.required += unit.len();
        self.key_frame |= key_frame;
        if self.required > self.capacity {
            match self.policy {
                ScratchPolicy::Fixed => return,
                ScratchPolicy::Grow => {
                    self.data.reserve(self.required - self.data.len());
                    self.capacity = self.required;
                }
            }
        }
        self.data.extend_from_slice(unit);
    }

    /// Bytes the current frame needed, whether or not they fitted.
    pub fn required(&self) -> usize {
        self.required
    }

    /// Completes the frame. Under [`ScratchPolicy::Fixed`] a frame that did
    /// not fit is rejected whole; no truncated prefix is ever returned.
    pub fn finish(&self) -> Result<(&[u8], bool)> {
        if self.required > self.capacity {
            return Err(Error::InsufficientCapacity {
                required: self.required,
                capacity: self.capacity,
            });
        }
        Ok((&self.data, self.key_frame))
    }
}

/// One encoded frame, borrowed from the session scratch until the next
/// encode call. May be empty while the encoder warms up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame<'a> {
    pub data: &'a [u8],
    pub key_frame: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames: u64,
    pub bytes: u64,
    pub key_frames: u64,
    /// Frames whose output exceeded the scratch capacity, rejected or grown.
    pub overflows: u64,
}

/// The hardware side of an encoder session.
pub trait EncoderBackend {
    /// Submits one NV12 frame of `size` bytes, read by the engine through
    /// `fd`.
    fn put_frame(&mut self, fd: BorrowedFd<'_>, size: usize) -> Result<()>;

    /// Hands every pending output unit to `sink` in arrival order together
    /// with its key-frame flag.
    fn drain(&mut self, sink: &mut dyn FnMut(&[u8], bool)) -> Result<()>;
}

/// Something that turns NV12 physical buffers into compressed frames.
pub trait FrameEncoder {
    fn encode(&mut self, frame: &PhysicalBuffer) -> Result<EncodedFrame<'_>>;

    fn stats(&self) -> EncoderStats;
}

/// MPP H.264 encoder context.
pub struct MppBackend {
    ctx: MppCtx,
    mpi: *mut MppApi,
    geometry: Geometry,
    lib: Mpp,
}

const MPP_LIBRARY: &str = "librockchip_mpp.so";

fn check(ret: MPP_RET, call: &str) -> Result<()> {
    if ret == MPP_OK {
        Ok(())
    } else {
        Err(Error::Encoder(format!("{call} failed: {ret}")))
    }
}

impl MppBackend {
    /// Creates and configures an H.264 encoder context: CBR rate control
    /// around the configured bitrate, one key frame per second.
    pub fn open(config: &EncoderConfig) -> Result<Self> {
        let lib = unsafe { Mpp::new(MPP_LIBRARY) }.map_err(|source| Error::Library {
            library: MPP_LIBRARY,
            source,
        })?;

        let mut ctx: MppCtx = null_mut();
        let mut mpi: *mut MppApi = null_mut();
        check(unsafe { (lib.mpp_create)(&mut ctx, &mut mpi) }, "mpp_create")?;
        let backend = Self {
            ctx,
            mpi,
            geometry: config.geometry,
            lib,
        };

        check(
            unsafe { (backend.lib.mpp_init)(ctx, MPP_CTX_ENC, MPP_VIDEO_CodingAVC) },
            "mpp_init",
        )?;
        backend.configure(config)?;

        info!(
            "H.264 encoder ready {} {} fps {} bps gop {}",
            config.geometry,
            config.frame_rate,
            config.bitrate,
            config.gop()
        );
        Ok(backend)
    }

    fn api(&self) -> &MppApi {
        // SAFETY: mpp_create succeeded, so the vtable lives as long as ctx.
        unsafe { &*self.mpi }
    }

    fn configure(&self, config: &EncoderConfig) -> Result<()> {
        let width = config.geometry.width as i32;
        let height = config.geometry.height as i32;
        let fps = config.frame_rate as i32;
        let settings: [(&CStr, i32); 16] = [
            (c"prep:width", width),
            (c"prep:height", height),
            (c"prep:hor_stride", width),
            (c"prep:ver_stride", height),
            (c"prep:format", MPP_FMT_YUV420SP),
            (c"rc:mode", MPP_ENC_RC_MODE_CBR),
            (c"rc:bps_target", config.bitrate as i32),
            (c"rc:bps_max", config.bitrate_max() as i32),
            (c"rc:bps_min", config.bitrate_min() as i32),
            (c"rc:fps_in_flex", 0),
            (c"rc:fps_in_num", fps),
            (c"rc:fps_in_denorm", 1),
            (c"rc:fps_out_flex", 0),
            (c"rc:fps_out_num", fps),
            (c"rc:fps_out_denorm", 1),
            (c"rc:gop", config.gop() as i32),
        ];

        let mut cfg: MppEncCfg = null_mut();
        check(unsafe { (self.lib.mpp_enc_cfg_init)(&mut cfg) }, "mpp_enc_cfg_init")?;
        let result = settings
            .iter()
            .try_for_each(|(name, value)| {
                let ret = unsafe { (self.lib.mpp_enc_cfg_set_s32)(cfg, name.as_ptr(), *value) };
                check(ret, &format!("mpp_enc_cfg_set_s32 {}", name.to_string_lossy()))
            })
            .and_then(|_| {
                let control = self
                    .api()
                    .control
                    .ok_or_else(|| Error::Encoder("MPI control missing".to_string()))?;
                check(
                    unsafe { control(self.ctx, MPP_ENC_SET_CFG, cfg) },
                    "MPP_ENC_SET_CFG",
                )
            });
        unsafe { (self.lib.mpp_enc_cfg_deinit)(cfg) };
        result
    }
}

impl EncoderBackend for MppBackend {
    fn put_frame(&mut self, fd: BorrowedFd<'_>, size: usize) -> Result<()> {
        let put = self
            .api()
            .encode_put_frame
            .ok_or_else(|| Error::Encoder("MPI encode_put_frame missing".to_string()))?;
        let Geometry { width, height } = self.geometry;

        let mut frame: MppFrame = null_mut();
        check(unsafe { (self.lib.mpp_frame_init)(&mut frame) }, "mpp_frame_init")?;
        unsafe {
            (self.lib.mpp_frame_set_width)(frame, width);
            (self.lib.mpp_frame_set_height)(frame, height);
            (self.lib.mpp_frame_set_hor_stride)(frame, width);
            (self.lib.mpp_frame_set_ver_stride)(frame, height);
            (self.lib.mpp_frame_set_fmt)(frame, MPP_FMT_YUV420SP);
        }

        let mut info = MppBufferInfo {
            type_: MPP_BUFFER_TYPE_EXT_DMA,
            size,
            ptr: null_mut(),
            hnd: null_mut(),
            fd: fd.as_raw_fd(),
            index: 0,
        };
        let mut buffer: MppBuffer = null_mut();
        let ret = unsafe {
            (self.lib.mpp_buffer_import_with_tag)(
                null_mut(),
                &mut info,
                &mut buffer,
                c"rkstream".as_ptr(),
                c"put_frame".as_ptr(),
            )
        };
        if let Err(e) = check(ret, "mpp_buffer_import") {
            unsafe { (self.lib.mpp_frame_deinit)(&mut frame) };
            return Err(e);
        }

        let ret = unsafe {
            (self.lib.mpp_frame_set_buffer)(frame, buffer);
            let ret = put(self.ctx, frame);
            (self.lib.mpp_buffer_put_with_caller)(buffer, c"put_frame".as_ptr());
            (self.lib.mpp_frame_deinit)(&mut frame);
            ret
        };
        check(ret, "encode_put_frame")
    }

    fn drain(&mut self, sink: &mut dyn FnMut(&[u8], bool)) -> Result<()> {
        let get = self
            .api()
            .encode_get_packet
            .ok_or_else(|| Error::Encoder("MPI encode_get_packet missing".to_string()))?;

        loop {
            let mut packet: MppPacket = null_mut();
            let ret = unsafe { get(self.ctx, &mut packet) };
            if ret != MPP_OK || packet.is_null() {
                trace!("encoder drained ({})", ret);
                break;
            }

            unsafe {
                let len = (self.lib.mpp_packet_get_length)(packet);
                let pos = (self.lib.mpp_packet_get_pos)(packet);
                let data: &[u8] = if len == 0 || pos.is_null() {
                    &[]
                } else {
                    from_raw_parts(pos.cast(), len)
                };

                let mut intra = 0;
                let meta = (self.lib.mpp_packet_get_meta)(packet);
                if !meta.is_null() {
                    (self.lib.mpp_meta_get_s32)(meta, KEY_OUTPUT_INTRA, &mut intra);
                }

                sink(data, intra != 0);
                (self.lib.mpp_packet_deinit)(&mut packet);
            }
        }
        Ok(())
    }
}

impl Drop for MppBackend {
    fn drop(&mut self) {
        if self.ctx.is_null() {
            return;
        }
        let ret = unsafe { (self.lib.mpp_destroy)(self.ctx) };
        if ret != MPP_OK {
            warn!("mpp_destroy failed: {}", ret);
        }
        self.ctx = null_mut();
        debug!("H.264 encoder closed");
    }
}

/// An encoder session: one backend context plus the scratch region its
/// output is assembled in.
pub struct VideoManager<B: EncoderBackend = MppBackend> {
    backend: B,
    config: EncoderConfig,
    assembler: PacketAssembler,
    stats: EncoderStats,
}

impl VideoManager<MppBackend> {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let backend = MppBackend::open(&config)?;
        Ok(Self::with_backend(backend, config))
    }
}

impl<B: EncoderBackend> VideoManager<B> {
    pub fn with_backend(backend: B, config: EncoderConfig) -> Self {
        let assembler = PacketAssembler::new(config.scratch_capacity, config.scratch_policy);
        Self {
            backend,
            config,
            assembler,
            stats: EncoderStats::default(),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Destroys the encoder context and frees the scratch region.
    pub fn close(self) -> EncoderStats {
        self.stats
    }
}

impl<B: EncoderBackend> FrameEncoder for VideoManager<B> {
    /// Encodes one NV12 frame and returns its complete output.
    ///
    /// The buffer must hold at least one NV12 frame of the configured
    /// geometry; it is read by the engine through its handle, so a CPU
    /// writer must have flushed it.
    #[instrument(skip_all, fields(frame = %frame))]
    fn encode(&mut self, frame: &PhysicalBuffer) -> Result<EncodedFrame<'_>> {
        let size = self.config.input_size();
        if frame.len() < size {
            return Err(Error::Surface(format!(
                "encoder input holds {} bytes, {} NV12 needs {}",
                frame.len(),
                self.config.geometry,
                size
            )));
        }

        self.backend.put_frame(frame.fd(), size)?;

        let assembler = &mut self.assembler;
        assembler.begin();
        let capacity = assembler.capacity();
        self.backend
            .drain(&mut |unit, key_frame| assembler.push(unit, key_frame))?;

        self.stats.frames += 1;
        if self.assembler.required() > capacity {
            self.stats.overflows += 1;
        }
        let (data, key_frame) = self.assembler.finish()?;
        self.stats.bytes += data.len() as u64;
        if key_frame {
            self.stats.key_frames += 1;
        }
        trace!("encoded {} bytes key:{}", data.len(), key_frame);
        Ok(EncodedFrame { data, key_frame })
    }

    fn stats(&self) -> EncoderStats {
        self.stats
    }
}
