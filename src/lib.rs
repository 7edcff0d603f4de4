// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # rkstream
//!
//! Zero-copy camera pipeline for Rockchip SoCs. Frames are captured from a
//! V4L2 camera, converted on the RGA engine into physically contiguous DMA
//! buffers, then H.264 encoded on the MPP encoder and sent as UDP datagrams
//! and/or run through a detection model on the RKNN NPU.
//!
//! ## Modules
//!
//! - [`dma`]: DMA heap allocation of physical buffers with cache sync.
//! - [`capture`]: V4L2 MMAP capture ring with scoped frame leases.
//! - [`image`]: Surface descriptors and the RGA conversion engine.
//! - [`video`]: MPP H.264 encoder session.
//! - [`detect`]: RKNN inference session; [`yolo`] holds the default decoder.
//! - [`transport`]: Fixed-size datagram chunking of encoded frames.
//! - [`pipeline`]: The single-threaded control loop tying them together.
//!
//! ## Example
//!
//! ```no_run
//! use rkstream::{
//!     dma::DmaAllocator,
//!     image::{image_size, FrameTransform, Geometry, ImageManager, Surface, NV12, YUYV},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let imgmgr = ImageManager::new()?;
//! let alloc = DmaAllocator::default();
//!
//! let size = Geometry::new(640, 480);
//! let src = alloc.allocate(image_size(640, 480, YUYV).unwrap())?;
//! let mut dst = alloc.allocate(image_size(640, 480, NV12).unwrap())?;
//!
//! imgmgr.convert(
//!     &Surface::source(&src, size, YUYV),
//!     &Surface::target(&mut dst, size, NV12),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel 5.10+ with V4L2 and DMA heap support
//! - **Vendor runtimes**: `librga`, `librockchip_mpp` and `librknnrt`,
//!   loaded at run time
//!
//! ## Safety
//!
//! This library uses `unsafe` code for FFI interactions with the vendor
//! runtimes, V4L2 ioctls and buffer mappings. All unsafe operations are
//! isolated to specific modules and wrapped with safe APIs.

pub mod capture;
pub mod detect;
pub mod dma;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod transport;
pub mod v4l2;
pub mod video;
pub mod yolo;

pub use error::{Error, Result};
