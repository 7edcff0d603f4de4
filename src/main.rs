// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::Args;
use clap::Parser;
use rkstream::{
    capture::{CaptureConfig, CaptureSource},
    detect::InferenceSession,
    dma::DmaAllocator,
    image::ImageManager,
    pipeline::{stop_on_signal, DetectStage, EncodeStage, Pipeline},
    transport::{DatagramSink, Transport, UdpSink},
    video::{EncoderConfig, VideoManager},
    yolo::Yolov5Decoder,
};
use std::error::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod args;


fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let journald = if args.journald {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer),
            Err(e) => {
                eprintln!("journald unavailable, logging to stdout only: {e}");
                None
            }
        }
    } else {
        None
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default())
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;
    let stop = stop_on_signal();
    info!("rkstream {}", env!("CARGO_PKG_VERSION"));

    let allocator = DmaAllocator::new(args.dma_heap.clone());
    let imgmgr = ImageManager::new()?;
    info!("RGA {}", imgmgr.version());

    let cam = CaptureSource::open(&CaptureConfig::from(&args))?;
    let mut pipeline = Pipeline::new(cam, Box::new(imgmgr));

    if args.h264 {
        let config = EncoderConfig::from(&args);
        let target = allocator.allocate(config.input_size())?;
        let geometry = config.geometry;
        let vidmgr = VideoManager::new(config)?;
        let sink: Box<dyn DatagramSink> = Box::new(UdpSink::connect(args.dest)?);
        let transport = Transport::new(sink, args.chunk_size);
        info!(
            "streaming H.264 {} to {} in {} byte datagrams",
            geometry,
            args.dest,
            transport.chunk_size()
        );
        pipeline =
            pipeline.with_encoder(EncodeStage::new(Box::new(vidmgr), transport, target, geometry)?);
    }

    if let Some(model) = &args.model {
        let session = InferenceSession::open(model.clone(), Yolov5Decoder::default())?;
        let target = allocator.allocate(session.geometry().input_size())?;
        pipeline = pipeline.with_detector(DetectStage::new(Box::new(session), target)?);
    }

    let stats = pipeline.run(&stop, args.stats_interval);
    info!(
        "{} frames processed, {} skipped, {} failed",
        stats.frames, stats.skipped, stats.failures
    );

    if let Err(e) = pipeline.into_source().close() {
        warn!("camera shutdown: {}", e);
    }
    Ok(())
}
