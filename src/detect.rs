// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Object detection on the RKNN NPU.
//!
//! An [`InferenceSession`] owns one loaded model. Each call binds an RGB
//! frame as the model input, runs it synchronously and hands the raw int8
//! outputs to a [`Decoder`], which turns them into [`Detection`]s. The
//! default decoder is [`crate::yolo::Yolov5Decoder`].

use crate::{
    error::{Error, Result},
    v4l2::fixed_str,
    yolo::Yolov5Decoder,
};
use rockchip_sys::rknn::*;
use serde_json::json;
use std::{
    ffi::{c_char, c_void},
    fmt, fs,
    mem::size_of,
    path::{Path, PathBuf},
    ptr::null_mut,
};
use tracing::{debug, info, instrument, warn};

/// Outputs a detection head must expose.
pub const REQUIRED_OUTPUTS: usize = 3;

/// One detected object in model-input pixel space.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Detection {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// The record written to the detection log.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "class": self.label,
            "class_id": self.class_id,
            "score": self.confidence,
            "bbox": {
                "x1": self.left,
                "y1": self.top,
                "x2": self.right,
                "y2": self.bottom,
                "width": self.width(),
                "height": self.height(),
            }
        })
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}) {:.2} [{}, {}, {}, {}]",
            self.label, self.class_id, self.confidence, self.left, self.top, self.right, self.bottom
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Shape and quantisation of one model tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorInfo {
    pub index: u32,
    pub name: String,
    pub dims: Vec<u32>,
    pub layout: TensorLayout,
    pub n_elems: usize,
    /// Bytes the runtime writes for this tensor.
    pub size: usize,
    pub zero_point: i32,
    pub scale: f32,
}

impl From<&rknn_tensor_attr> for TensorInfo {
    fn from(attr: &rknn_tensor_attr) -> Self {
        let n_dims = (attr.n_dims as usize).min(RKNN_MAX_DIMS);
        Self {
            index: attr.index,
            name: c_chars(&attr.name),
            dims: attr.dims[..n_dims].to_vec(),
            layout: if attr.fmt == RKNN_TENSOR_NCHW {
                TensorLayout::Nchw
            } else {
                TensorLayout::Nhwc
            },
            n_elems: attr.n_elems as usize,
            size: attr.size as usize,
            zero_point: attr.zp,
            scale: attr.scale,
        }
    }
}

/// Input geometry of a model, derived from its first input tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModelGeometry {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub layout: TensorLayout,
}

impl ModelGeometry {
    pub fn from_input(input: &TensorInfo) -> Result<Self> {
        let &[_, a, b, c] = input.dims.as_slice() else {
            return Err(Error::Inference(format!(
                "input tensor {} has shape {:?}, expected 4 dimensions",
                input.name, input.dims
            )));
        };
        Ok(match input.layout {
            TensorLayout::Nchw => Self {
                width: c,
                height: b,
                channels: a,
                layout: input.layout,
            },
            TensorLayout::Nhwc => Self {
                width: b,
                height: a,
                channels: c,
                layout: input.layout,
            },
        })
    }

    /// Bytes of packed 8-bit pixels one input frame occupies.
    pub fn input_size(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// A raw int8 output with the affine parameters to dequantise it.
#[derive(Copy, Clone, Debug)]
pub struct QuantizedTensor<'a> {
    pub data: &'a [i8],
    pub dims: &'a [u32],
    pub zero_point: i32,
    pub scale: f32,
}

impl QuantizedTensor<'_> {
    #[inline]
    pub fn dequantize(&self, value: i8) -> f32 {
        (value as i32 - self.zero_point) as f32 * self.scale
    }

    /// The int8 value closest to `value`, saturating.
    #[inline]
    pub fn quantize(&self, value: f32) -> i8 {
        let q = value / self.scale + self.zero_point as f32;
        q.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }
}

/// Turns raw model outputs into detections.
pub trait Decoder {
    fn decode(&self, outputs: &[QuantizedTensor<'_>], input: &ModelGeometry)
        -> Result<Vec<Detection>>;
}

/// The accelerator side of an inference session.
pub trait InferenceBackend {
    fn input(&self) -> &TensorInfo;

    fn outputs(&self) -> &[TensorInfo];

    /// Runs the model on `pixels` (NHWC UINT8) and writes every output into
    /// the matching caller-owned buffer.
    fn run(&mut self, pixels: &[u8], outputs: &mut [Vec<i8>]) -> Result<()>;
}

/// Anything that produces detections from an RGB frame.
pub trait Detector {
    fn geometry(&self) -> ModelGeometry;

    fn detect(&mut self, pixels: &[u8]) -> Result<Vec<Detection>>;
}

const RKNN_LIBRARY: &str = "librknnrt.so";

fn check(ret: i32, call: &str) -> Result<()> {
    if ret < RKNN_SUCC {
        return Err(Error::Inference(format!("{call} failed: {ret}")));
    }
    Ok(())
}

/// A model loaded into the RKNN runtime.
pub struct RknnBackend {
    ctx: rknn_context,
    input: TensorInfo,
    outputs: Vec<TensorInfo>,
    lib: Rknn,
}

impl RknnBackend {
    pub fn open(model: &Path) -> Result<Self> {
        let mut data = fs::read(model).map_err(|source| Error::Model {
            path: model.to_path_buf(),
            source,
        })?;
        let lib = unsafe { Rknn::new(RKNN_LIBRARY) }.map_err(|source| Error::Library {
            library: RKNN_LIBRARY,
            source,
        })?;

        let mut ctx: rknn_context = 0;
        let ret = unsafe {
            (lib.rknn_init)(
                &mut ctx,
                data.as_mut_ptr().cast(),
                data.len() as u32,
                0,
                null_mut(),
            )
        };
        if ret < RKNN_SUCC {
            return Err(Error::Inference(format!(
                "rknn_init rejected {}: {}",
                model.display(),
                ret
            )));
        }
        let mut backend = Self {
            ctx,
            input: TensorInfo::from(&rknn_tensor_attr::with_index(0)),
            outputs: Vec::new(),
            lib,
        };

        let mut version: rknn_sdk_version = unsafe { std::mem::zeroed() };
        if backend.query(RKNN_QUERY_SDK_VERSION, &mut version).is_ok() {
            info!(
                "RKNN api {} driver {}",
                c_chars(&version.api_version),
                c_chars(&version.drv_version)
            );
        }

        let mut io_num = rknn_input_output_num::default();
        backend.query(RKNN_QUERY_IN_OUT_NUM, &mut io_num)?;
        info!(
            "model {} has {} inputs and {} outputs",
            model.display(),
            io_num.n_input,
            io_num.n_output
        );
        if io_num.n_input == 0 {
            return Err(Error::Inference(format!(
                "model {} has no inputs",
                model.display()
            )));
        }

        let mut attr = rknn_tensor_attr::with_index(0);
        backend.query(RKNN_QUERY_INPUT_ATTR, &mut attr)?;
        backend.input = TensorInfo::from(&attr);
        debug!("input {:?}", backend.input);

        for index in 0..io_num.n_output {
            let mut attr = rknn_tensor_attr::with_index(index);
            backend.query(RKNN_QUERY_OUTPUT_ATTR, &mut attr)?;
            let info = TensorInfo::from(&attr);
            debug!("output {:?}", info);
            backend.outputs.push(info);
        }

        Ok(backend)
    }

    fn query<T>(&self, cmd: rknn_query_cmd, info: &mut T) -> Result<()> {
        let ret = unsafe {
            (self.lib.rknn_query)(
                self.ctx,
                cmd,
                (info as *mut T).cast(),
                size_of::<T>() as u32,
            )
        };
        check(ret, "rknn_query")
    }
}

impl InferenceBackend for RknnBackend {
    fn input(&self) -> &TensorInfo {
        &self.input
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn run(&mut self, pixels: &[u8], outputs: &mut [Vec<i8>]) -> Result<()> {
        let mut input = rknn_input {
            index: 0,
            buf: pixels.as_ptr() as *mut c_void,
            size: pixels.len() as u32,
            pass_through: 0,
            type_: RKNN_TENSOR_UINT8,
            fmt: RKNN_TENSOR_NHWC,
        };
        check(
            unsafe { (self.lib.rknn_inputs_set)(self.ctx, 1, &mut input) },
            "rknn_inputs_set",
        )?;
        check(unsafe { (self.lib.rknn_run)(self.ctx, null_mut()) }, "rknn_run")?;

        let mut raw: Vec<rknn_output> = outputs
            .iter_mut()
            .enumerate()
            .map(|(index, buf)| rknn_output {
                want_float: 0,
                is_prealloc: 1,
                index: index as u32,
                buf: buf.as_mut_ptr().cast(),
                size: buf.len() as u32,
            })
            .collect();
        let n = raw.len() as u32;
        check(
            unsafe { (self.lib.rknn_outputs_get)(self.ctx, n, raw.as_mut_ptr(), null_mut()) },
            "rknn_outputs_get",
        )?;
        let ret = unsafe { (self.lib.rknn_outputs_release)(self.ctx, n, raw.as_mut_ptr()) };
        if ret < RKNN_SUCC {
            warn!("rknn_outputs_release failed: {}", ret);
        }
        Ok(())
    }
}

impl Drop for RknnBackend {
    fn drop(&mut self) {
        if self.ctx == 0 {
            return;
        }
        let ret = unsafe { (self.lib.rknn_destroy)(self.ctx) };
        if ret < RKNN_SUCC {
            warn!("rknn_destroy failed: {}", ret);
        }
        self.ctx = 0;
    }
}

/// A model plus the output buffers and decoder used to run it.
pub struct InferenceSession<B: InferenceBackend = RknnBackend, D: Decoder = Yolov5Decoder> {
    outputs: Vec<Vec<i8>>,
    geometry: ModelGeometry,
    decoder: D,
    backend: B,
}

impl<D: Decoder> InferenceSession<RknnBackend, D> {
    /// Loads `model` into the NPU runtime.
    pub fn open(model: impl Into<PathBuf>, decoder: D) -> Result<Self> {
        let model = model.into();
        let backend = RknnBackend::open(&model)?;
        Self::with_backend(backend, decoder)
    }
}

impl<B: InferenceBackend, D: Decoder> InferenceSession<B, D> {
    /// Wraps a loaded backend. The model input must be a 4-dimensional
    /// tensor; output count is checked on every call instead.
    pub fn with_backend(backend: B, decoder: D) -> Result<Self> {
        let geometry = ModelGeometry::from_input(backend.input())?;
        info!(
            "model input {}x{}x{} {:?}",
            geometry.width, geometry.height, geometry.channels, geometry.layout
        );
        if backend.outputs().len() < REQUIRED_OUTPUTS {
            warn!(
                "model has {} outputs, inference will fail until a model with {} is loaded",
                backend.outputs().len(),
                REQUIRED_OUTPUTS
            );
        }
        let outputs = backend
            .outputs()
            .iter()
            .map(|info| vec![0i8; info.size.max(info.n_elems)])
            .collect();
        Ok(Self {
            outputs,
            geometry,
            decoder,
            backend,
        })
    }

    pub fn geometry(&self) -> ModelGeometry {
        self.geometry
    }

    /// Runs the model on one packed RGB frame.
    ///
    /// # Errors
    ///
    /// [`Error::InputSize`] when `pixels` is smaller than the model input,
    /// [`Error::OutputCount`] when the model exposes fewer than three
    /// outputs. Neither touches the accelerator.
    #[instrument(skip_all)]
    pub fn infer(&mut self, pixels: &[u8]) -> Result<Vec<Detection>> {
        let expected = self.geometry.input_size();
        if pixels.len() < expected {
            return Err(Error::InputSize {
                actual: pixels.len(),
                expected,
            });
        }
        let found = self.backend.outputs().len();
        if found < REQUIRED_OUTPUTS {
            return Err(Error::OutputCount {
                found,
                required: REQUIRED_OUTPUTS,
            });
        }

        self.backend.run(&pixels[..expected], &mut self.outputs)?;

        let tensors: Vec<QuantizedTensor> = self
            .backend
            .outputs()
            .iter()
            .zip(&self.outputs)
            .map(|(info, data)| QuantizedTensor {
                data,
                dims: &info.dims,
                zero_point: info.zero_point,
                scale: info.scale,
            })
            .collect();
        self.decoder.decode(&tensors, &self.geometry)
    }

    /// Releases the output buffers and the runtime context.
    pub fn close(self) {
        debug!("inference session closed");
    }
}

impl<B: InferenceBackend, D: Decoder> Detector for InferenceSession<B, D> {
    fn geometry(&self) -> ModelGeometry {
        self.geometry
    }

    fn detect(&mut self, pixels: &[u8]) -> Result<Vec<Detection>> {
        self.infer(pixels)
    }
}

/// Reads a fixed-size name field, which the runtime may fill without a
/// terminator.
fn c_chars(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars.iter().map(|c| *c as u8).collect();
    fixed_str(&bytes)
}
