// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use rkstream::{
    capture::CaptureConfig,
    dma::HeapPool,
    image::Geometry,
    transport::DEFAULT_CHUNK_SIZE,
    video::{EncoderConfig, ScratchPolicy, DEFAULT_BITRATE, DEFAULT_SCRATCH_CAPACITY},
};
use std::{net::SocketAddr, path::PathBuf};

/// H.264 encoding bitrate presets.
///
/// Controls the trade-off between video quality and bandwidth.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum H264Bitrate {
    /// 3 Mibit/s, suited to 640x640 streaming over Wi-Fi
    Auto,
    /// 5 Mbps (suitable for 720p)
    Mbps5,
    /// 25 Mbps (suitable for 1080p)
    Mbps25,
    /// 50 Mbps (suitable for high-quality 1080p)
    Mbps50,
    /// 100 Mbps (suitable for 4K or very high quality)
    Mbps100,
}

impl H264Bitrate {
    /// Target bitrate in bits per second.
    pub fn bits_per_second(self) -> u32 {
        match self {
            H264Bitrate::Auto => DEFAULT_BITRATE,
            H264Bitrate::Mbps5 => 5_000_000,
            H264Bitrate::Mbps25 => 25_000_000,
            H264Bitrate::Mbps50 => 50_000_000,
            H264Bitrate::Mbps100 => 100_000_000,
        }
    }
}

/// Command-line arguments for the Rockchip camera streamer.
///
/// Arguments can be specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Stream H.264 to a workstation and run detection
/// rkstream --camera /dev/video0 --h264 --dest 192.168.1.115:8888 \
///     --model yolov5s.rknn
///
/// # Via environment variables
/// export CAMERA=/dev/video11
/// export H264=true
/// rkstream
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(group(
    clap::ArgGroup::new("output")
        .required(true)
        .multiple(true)
        .args(["h264", "model"]),
))]
pub struct Args {
    /// Camera capture device path (e.g., /dev/video0)
    #[arg(short, long, env = "CAMERA", default_value = "/dev/video0")]
    pub camera: PathBuf,

    /// Camera capture resolution in pixels (width height)
    #[arg(
        long,
        env = "CAMERA_SIZE",
        default_value = "640 480",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub camera_size: Vec<u32>,

    /// Camera frame rate
    #[arg(long, env = "FPS", default_value = "30")]
    pub fps: u32,

    /// Number of capture buffers to request from the driver
    #[arg(long, env = "BUFFERS", default_value = "4")]
    pub buffers: u32,

    /// Continue with the resolution the camera picks when it differs from
    /// the requested one
    #[arg(long, env = "ALLOW_GEOMETRY_CHANGE")]
    pub allow_geometry_change: bool,

    /// Enable H.264 video streaming output
    #[arg(long, env = "H264")]
    pub h264: bool,

    /// Output streaming resolution in pixels (width height)
    #[arg(
        short,
        long,
        env = "STREAM_SIZE",
        default_value = "640 640",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub stream_size: Vec<u32>,

    /// H.264 encoding bitrate preset
    #[arg(long, env = "H264_BITRATE", default_value = "auto")]
    pub h264_bitrate: H264Bitrate,

    /// Encoder output scratch size in bytes
    #[arg(long, env = "SCRATCH_SIZE", default_value_t = DEFAULT_SCRATCH_CAPACITY)]
    pub scratch_size: usize,

    /// Grow the encoder scratch instead of dropping frames that exceed it
    #[arg(long, env = "SCRATCH_GROW")]
    pub scratch_grow: bool,

    /// UDP destination for the H.264 stream
    #[arg(long, env = "DEST", default_value = "192.168.1.115:8888")]
    pub dest: SocketAddr,

    /// Maximum UDP datagram payload in bytes
    #[arg(long, env = "CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// RKNN detection model; enables object detection
    #[arg(long, env = "MODEL")]
    pub model: Option<PathBuf>,

    /// DMA heaps to allocate from, in order of preference
    #[arg(
        long,
        env = "DMA_HEAP",
        default_value = "cma,system-uncached,system",
        value_delimiter = ','
    )]
    pub dma_heap: Vec<HeapPool>,

    /// Log pipeline counters every N iterations (0 disables)
    #[arg(long, env = "STATS_INTERVAL", default_value = "300")]
    pub stats_interval: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Send logs to the systemd journal as well as stdout
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn camera_geometry(&self) -> Geometry {
        Geometry::new(self.camera_size[0], self.camera_size[1])
    }

    pub fn stream_geometry(&self) -> Geometry {
        Geometry::new(self.stream_size[0], self.stream_size[1])
    }
}

impl From<&Args> for CaptureConfig {
    fn from(args: &Args) -> Self {
        CaptureConfig {
            device: args.camera.clone(),
            geometry: args.camera_geometry(),
            frame_rate: args.fps,
            buffers: args.buffers,
            allow_geometry_change: args.allow_geometry_change,
        }
    }
}

impl From<&Args> for EncoderConfig {
    fn from(args: &Args) -> Self {
        EncoderConfig {
            bitrate: args.h264_bitrate.bits_per_second(),
            scratch_capacity: args.scratch_size,
            scratch_policy: if args.scratch_grow {
                ScratchPolicy::Grow
            } else {
                ScratchPolicy::Fixed
            },
            ..EncoderConfig::new(args.stream_geometry(), args.fps)
        }
    }
}
