// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Runtime-loaded FFI bindings for the Rockchip vendor libraries.
//!
//! Each library is exposed as a struct holding the opened [`Library`] and the
//! resolved function pointers, in the style of `bindgen --dynamic-loading`.
//! Nothing is linked at build time, so crates depending on these bindings
//! build and test on hosts without the vendor SDK installed.
//!
//! - [`rga::Rga`]: `librga.so`, the 2D raster graphics accelerator (im2d API)
//! - [`mpp::Mpp`]: `librockchip_mpp.so`, the media process platform
//! - [`rknn::Rknn`]: `librknnrt.so`, the NPU runtime
//!
//! [`Library`]: libloading::Library

pub mod mpp;
pub mod rga;
pub mod rknn;

pub use libloading;

/// Resolves `name` from `lib` as a plain function pointer.
///
/// # Safety
///
/// `T` must match the C signature of the symbol.
pub(crate) unsafe fn symbol<T: Copy>(
    lib: &libloading::Library,
    name: &[u8],
) -> Result<T, libloading::Error> {
    Ok(*lib.get::<T>(name)?)
}
