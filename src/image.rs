// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    dma::PhysicalBuffer,
    error::{Error, Result},
};
use rockchip_sys::rga::{
    rga_buffer_t, Rga, IM_STATUS_SUCCESS, INTER_LINEAR, RK_FORMAT_RGB_888, RK_FORMAT_YCbCr_420_SP,
    RK_FORMAT_YUYV_422,
};
use std::{
    ffi::{c_int, c_void, CStr},
    fmt,
    os::fd::{AsRawFd, BorrowedFd},
};
use tracing::{debug, instrument};

/// Four character code identifying a pixel format, laid out as V4L2 does.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl From<FourCC> for u32 {
    fn from(value: FourCC) -> Self {
        u32::from_le_bytes(value.0)
    }
}

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.0 {
            let c = if c.is_ascii_graphic() { c as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

/// RGB 24-bit packed pixel format, the inference input format
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// YUYV 4:2:2 packed format, the camera output format
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// NV12 4:2:0 semi-planar format, the encoder input format
pub const NV12: FourCC = FourCC(*b"NV12");

/// Width and height in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Bytes per row of `format`, or `None` for formats the pipeline does not
/// handle. NV12 is reported as its average row cost (luma plus half a row of
/// interleaved chroma).
pub const fn format_row_stride(format: FourCC, width: u32) -> Option<usize> {
    match format {
        RGB3 => Some(3 * width as usize),
        YUYV => Some(2 * width as usize),
        NV12 => Some(width as usize / 2 + width as usize),
        _ => None,
    }
}

pub const fn image_size(width: u32, height: u32, format: FourCC) -> Option<usize> {
    match format_row_stride(format, width) {
        Some(stride) => Some(stride * height as usize),
        None => None,
    }
}

fn rga_format(format: FourCC) -> Option<c_int> {
    match format {
        RGB3 => Some(RK_FORMAT_RGB_888),
        YUYV => Some(RK_FORMAT_YUYV_422),
        NV12 => Some(RK_FORMAT_YCbCr_420_SP),
        _ => None,
    }
}

/// Where a surface's pixels live.
#[derive(Copy, Clone, Debug)]
pub enum Memory<'a> {
    /// A dma-buf the engine reads or writes by handle.
    Dma { fd: BorrowedFd<'a>, len: usize },
    /// A CPU mapping the engine reaches by virtual address.
    Virtual(&'a [u8]),
}

impl Memory<'_> {
    pub fn len(&self) -> usize {
        match self {
            Memory::Dma { len, .. } => *len,
            Memory::Virtual(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Descriptor handed to the conversion engine: memory plus the geometry and
/// format it is to be interpreted as.
#[derive(Copy, Clone, Debug)]
pub struct Surface<'a> {
    memory: Memory<'a>,
    geometry: Geometry,
    format: FourCC,
}

impl<'a> Surface<'a> {
    pub fn new(memory: Memory<'a>, geometry: Geometry, format: FourCC) -> Self {
        Self {
            memory,
            geometry,
            format,
        }
    }

    /// Describes `buffer` as a conversion source.
    pub fn source(buffer: &'a PhysicalBuffer, geometry: Geometry, format: FourCC) -> Self {
        Self::new(
            Memory::Dma {
                fd: buffer.fd(),
                len: buffer.len(),
            },
            geometry,
            format,
        )
    }

    /// Describes `buffer` as a conversion target. The buffer stays mutably
    /// borrowed, and so unavailable to any other engine, while the surface
    /// lives.
    pub fn target(buffer: &'a mut PhysicalBuffer, geometry: Geometry, format: FourCC) -> Self {
        let len = buffer.len();
        let buffer: &'a PhysicalBuffer = buffer;
        Self::new(
            Memory::Dma {
                fd: buffer.fd(),
                len,
            },
            geometry,
            format,
        )
    }

    pub fn memory(&self) -> &Memory<'a> {
        &self.memory
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn format(&self) -> FourCC {
        self.format
    }

    /// Checks the descriptor is self-consistent: a supported format, a
    /// non-empty geometry that format can represent, and backing memory at
    /// least as large as the geometry requires.
    pub fn validate(&self) -> Result<()> {
        let Geometry { width, height } = self.geometry;
        if width == 0 || height == 0 {
            return Err(Error::Surface(format!("empty geometry {}", self.geometry)));
        }
        let required = image_size(width, height, self.format)
            .ok_or(Error::UnsupportedFormat(self.format))?;
        if matches!(self.format, NV12 | YUYV) && (width % 2 != 0 || height % 2 != 0) {
            return Err(Error::Surface(format!(
                "{} {} requires even dimensions",
                self.geometry, self.format
            )));
        }
        if self.memory.len() < required {
            return Err(Error::Surface(format!(
                "{} {} needs {} bytes but only {} are backed",
                self.geometry,
                self.format,
                required,
                self.memory.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Surface<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.memory {
            Memory::Dma { fd, len } => write!(
                f,
                "{} {} fd:{} len:{}",
                self.geometry,
                self.format,
                fd.as_raw_fd(),
                len
            ),
            Memory::Virtual(data) => write!(
                f,
                "{} {} vaddr:{:p} len:{}",
                self.geometry,
                self.format,
                data.as_ptr(),
                data.len()
            ),
        }
    }
}

/// A format/scale conversion engine.
///
/// [`FrameTransform::convert`] validates both descriptors before the engine
/// is touched, so a rejected call leaves the destination as it was. After a
/// successful call the destination holds freshly device-written data: a CPU
/// reader must invalidate first. After a failed call its contents are
/// unspecified and must not be sent downstream.
pub trait FrameTransform {
    /// Performs the conversion on the engine. Called only with validated
    /// surfaces.
    fn blit(&self, src: &Surface<'_>, dst: &Surface<'_>) -> Result<()>;

    fn convert(&self, src: &Surface<'_>, dst: &Surface<'_>) -> Result<()> {
        src.validate()?;
        dst.validate()?;
        self.blit(src, dst)
    }
}

/// Rockchip RGA conversion engine.
///
/// Wraps the im2d API of `librga`. Each conversion is a single synchronous
/// resize/colour-conversion job; the call returns once the engine is done
/// writing the destination.
pub struct ImageManager {
    lib: Rga,
}

impl ImageManager {
    /// Loads `librga.so` and returns a manager ready to convert.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Library`] when librga or one of its entry points
    /// cannot be loaded.
    pub fn new() -> Result<Self> {
        let lib = unsafe { Rga::new("librga.so") }.map_err(|source| Error::Library {
            library: "librga.so",
            source,
        })?;
        let manager = Self { lib };
        debug!("RGA opened: {}", manager.version());
        Ok(manager)
    }

    pub fn version(&self) -> String {
        let info = unsafe { (self.lib.querystring)(rockchip_sys::rga::RGA_VERSION) };
        if info.is_null() {
            return "unknown".to_string();
        }
        unsafe { CStr::from_ptr(info) }
            .to_string_lossy()
            .trim()
            .to_string()
    }

    fn wrap(surface: &Surface<'_>) -> Result<rga_buffer_t> {
        let format =
            rga_format(surface.format()).ok_or(Error::UnsupportedFormat(surface.format()))?;
        let Geometry { width, height } = surface.geometry();
        Ok(match surface.memory() {
            Memory::Dma { fd, .. } => {
                rga_buffer_t::from_fd(fd.as_raw_fd(), width as c_int, height as c_int, format)
            }
            Memory::Virtual(data) => rga_buffer_t::from_virtual(
                data.as_ptr() as *mut c_void,
                width as c_int,
                height as c_int,
                format,
            ),
        })
    }
}

impl FrameTransform for ImageManager {
    #[instrument(skip_all, fields(src = %src, dst = %dst))]
    fn blit(&self, src: &Surface<'_>, dst: &Surface<'_>) -> Result<()> {
        let src = Self::wrap(src)?;
        let dst = Self::wrap(dst)?;

        let status = unsafe { (self.lib.imresize_t)(src, dst, 0.0, 0.0, INTER_LINEAR, 1) };
        if status != IM_STATUS_SUCCESS {
            let msg = unsafe { (self.lib.imStrError_t)(status) };
            let msg = if msg.is_null() {
                format!("status {status}")
            } else {
                unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
            };
            return Err(Error::Convert(msg));
        }

        Ok(())
    }
}
