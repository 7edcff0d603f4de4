// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::image::{FourCC, Geometry};
use std::{io, path::PathBuf};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the pipeline treats an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Start-up failure: a device, library or session could not be brought
    /// up. The process exits.
    Fatal,
    /// A single hardware call failed. The iteration is abandoned and the loop
    /// continues with the next frame.
    Transient,
    /// Data was lost but the hardware is healthy (encoder output exceeding
    /// the scratch region). Counted and logged.
    Loss,
    /// The caller broke an API contract.
    Usage,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no DMA heap could allocate {size} bytes ({tried})")]
    AllocationExhausted { size: usize, tried: String },

    #[error("failed to map {len} byte buffer: {source}")]
    Map { len: usize, source: io::Error },

    #[error("dma-buf cache sync failed: {0}")]
    Sync(String),

    #[error("{context} failed on {device}: {source}")]
    Device {
        device: PathBuf,
        context: &'static str,
        source: nix::Error,
    },

    #[error("{device} is not a streaming capture device")]
    NotCapture { device: PathBuf },

    #[error("{device} negotiated {actual} but {requested} was requested")]
    GeometryMismatch {
        device: PathBuf,
        requested: Geometry,
        actual: Geometry,
    },

    #[error("{device} negotiated pixel format {actual} instead of {requested}")]
    FormatRejected {
        device: PathBuf,
        requested: FourCC,
        actual: FourCC,
    },

    #[error(
        "{device} lays out {geometry} frames as {stride} byte rows in {size} bytes, \
         expected {expected_stride} byte rows in at least {expected_size} bytes"
    )]
    LayoutMismatch {
        device: PathBuf,
        geometry: Geometry,
        stride: u32,
        size: u32,
        expected_stride: usize,
        expected_size: usize,
    },

    #[error("{device} granted {granted} capture buffers, at least {required} are needed")]
    RingTooSmall {
        device: PathBuf,
        granted: u32,
        required: u32,
    },

    #[error("capture dequeue failed: {0}")]
    Dequeue(#[source] nix::Error),

    #[error("capture buffer {index} held {bytes_used} bytes, expected {expected}")]
    ShortFrame {
        index: u32,
        bytes_used: usize,
        expected: usize,
    },

    #[error("capture buffer {index} was flagged as corrupt by the driver")]
    CorruptFrame { index: u32 },

    #[error("capture buffer {index} does not exist")]
    UnknownIndex { index: u32 },

    #[error("capture buffer {index} is not dequeued")]
    NotDequeued { index: u32 },

    #[error("capture buffer {index} is already dequeued")]
    AlreadyDequeued { index: u32 },

    #[error("invalid surface: {0}")]
    Surface(String),

    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(FourCC),

    #[error("RGA conversion failed: {0}")]
    Convert(String),

    #[error("encoder: {0}")]
    Encoder(String),

    #[error("encoded frame needs {required} bytes but the scratch region holds {capacity}")]
    InsufficientCapacity { required: usize, capacity: usize },

    #[error("failed to read model {path}: {source}")]
    Model { path: PathBuf, source: io::Error },

    #[error("inference: {0}")]
    Inference(String),

    #[error("model declares {found} outputs, at least {required} are required")]
    OutputCount { found: usize, required: usize },

    #[error("input holds {actual} bytes, model expects {expected}")]
    InputSize { actual: usize, expected: usize },

    #[error("failed to load {library}: {source}")]
    Library {
        library: &'static str,
        source: libloading::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Dequeue(_)
            | Error::ShortFrame { .. }
            | Error::CorruptFrame { .. }
            | Error::Convert(_)
            | Error::Encoder(_)
            | Error::Inference(_)
            | Error::Sync(_) => Severity::Transient,
            Error::InsufficientCapacity { .. } => Severity::Loss,
            Error::UnknownIndex { .. }
            | Error::NotDequeued { .. }
            | Error::AlreadyDequeued { .. }
            | Error::Surface(_)
            | Error::InputSize { .. }
            | Error::OutputCount { .. } => Severity::Usage,
            _ => Severity::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.severity() == Severity::Transient
    }
}
