// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The capture → convert → encode/detect → send loop.

use crate::{
    capture::{Frame, FrameSource},
    detect::{Detection, Detector},
    dma::PhysicalBuffer,
    error::{Error, Result, Severity},
    image::{image_size, FourCC, FrameTransform, Geometry, Surface, NV12, RGB3, YUYV},
    transport::{DatagramSink, SendReport, Transport},
    video::FrameEncoder,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, info_span, warn};

/// Converts frames to NV12, encodes them and sends the result.
pub struct EncodeStage {
    // The session goes before the buffer it reads.
    encoder: Box<dyn FrameEncoder>,
    transport: Transport<Box<dyn DatagramSink>>,
    target: PhysicalBuffer,
    geometry: Geometry,
}

impl EncodeStage {
    pub fn new(
        encoder: Box<dyn FrameEncoder>,
        transport: Transport<Box<dyn DatagramSink>>,
        target: PhysicalBuffer,
        geometry: Geometry,
    ) -> Result<Self> {
        check_target(&target, geometry, NV12)?;
        Ok(Self {
            encoder,
            transport,
            target,
            geometry,
        })
    }

    pub fn transport(&self) -> &Transport<Box<dyn DatagramSink>> {
        &self.transport
    }
}

/// Converts frames to packed RGB at the model input size and runs detection.
pub struct DetectStage {
    detector: Box<dyn Detector>,
    target: PhysicalBuffer,
    geometry: Geometry,
}

impl DetectStage {
    pub fn new(detector: Box<dyn Detector>, target: PhysicalBuffer) -> Result<Self> {
        let model = detector.geometry();
        if model.channels != 3 {
            return Err(Error::Inference(format!(
                "model expects {} channels, only RGB input is produced",
                model.channels
            )));
        }
        let geometry = Geometry::new(model.width, model.height);
        check_target(&target, geometry, RGB3)?;
        Ok(Self {
            detector,
            target,
            geometry,
        })
    }
}

fn check_target(target: &PhysicalBuffer, geometry: Geometry, format: FourCC) -> Result<()> {
    if geometry.width == 0 || geometry.height == 0 {
        return Err(Error::Surface(format!("empty geometry {}", geometry)));
    }
    if matches!(format, NV12 | YUYV) && (geometry.width % 2 != 0 || geometry.height % 2 != 0) {
        return Err(Error::Surface(format!(
            "{} {} requires even dimensions",
            geometry, format
        )));
    }
    let required = image_size(geometry.width, geometry.height, format)
        .ok_or(Error::UnsupportedFormat(format))?;
    if target.len() < required {
        return Err(Error::Surface(format!(
            "{} {} needs {} bytes, target holds {}",
            geometry,
            format,
            required,
            target.len()
        )));
    }
    Ok(())
}

/// Counters kept across the life of the loop.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub iterations: u64,
    /// Iterations that completed every enabled stage.
    pub frames: u64,
    /// Iterations abandoned on a transient error.
    pub skipped: u64,
    /// Iterations abandoned on any other error.
    pub failures: u64,
    pub overflows: u64,
    pub detections: u64,
    pub bytes_sent: u64,
    pub datagrams: u64,
    pub send_failures: u64,
}

/// What one completed iteration produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Iteration {
    pub frame: Frame,
    /// `None` when encoding is disabled or the frame overflowed the encoder
    /// scratch.
    pub sent: Option<SendReport>,
    pub detections: Vec<Detection>,
}

/// Moving average of the loop rate over the last `window` iterations.
#[derive(Debug)]
pub struct FpsCounter {
    prev: Instant,
    history: Vec<f64>,
    index: usize,
}

impl FpsCounter {
    pub fn new(window: usize) -> Self {
        Self {
            prev: Instant::now(),
            history: vec![0.0; window.max(1)],
            index: 0,
        }
    }

    pub fn update(&mut self) -> f64 {
        let now = Instant::now();
        self.record(now.duration_since(self.prev));
        self.prev = now;
        self.average()
    }

    pub fn record(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.history[self.index] = if secs > 0.0 { 1.0 / secs } else { 0.0 };
        self.index = (self.index + 1) % self.history.len();
    }

    pub fn average(&self) -> f64 {
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }
}

/// A single-threaded pipeline over one capture source.
///
/// Every iteration dequeues one frame, converts it into each enabled
/// stage's target, runs the stages and re-queues the frame. Errors abandon
/// the iteration; the frame is still returned to the source.
pub struct Pipeline<S: FrameSource> {
    encode: Option<EncodeStage>,
    detect: Option<DetectStage>,
    transform: Box<dyn FrameTransform>,
    source: S,
    stats: PipelineStats,
    fps: FpsCounter,
}

impl<S: FrameSource> Pipeline<S> {
    pub fn new(source: S, transform: Box<dyn FrameTransform>) -> Self {
        Self {
            encode: None,
            detect: None,
            transform,
            source,
            stats: PipelineStats::default(),
            fps: FpsCounter::new(30),
        }
    }

    pub fn with_encoder(mut self, stage: EncodeStage) -> Self {
        self.encode = Some(stage);
        self
    }

    pub fn with_detector(mut self, stage: DetectStage) -> Self {
        self.detect = Some(stage);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs one iteration. Only an encoder overflow is counted here.
    pub fn step(&mut self) -> Result<Iteration> {
        let lease = self.source.next_frame()?;
        let frame = *lease.frame();
        let src = lease.surface()?;

        if let Some(stage) = self.encode.as_mut() {
            let dst = Surface::target(&mut stage.target, stage.geometry, NV12);
            self.transform.convert(&src, &dst)?;
        }
        if let Some(stage) = self.detect.as_mut() {
            let dst = Surface::target(&mut stage.target, stage.geometry, RGB3);
            self.transform.convert(&src, &dst)?;
        }

        let mut sent = None;
        if let Some(stage) = self.encode.as_mut() {
            match stage.encoder.encode(&stage.target) {
                Ok(encoded) => {
                    sent = Some(stage.transport.send_frame(encoded.data));
                }
                Err(e) if e.severity() == Severity::Loss => {
                    warn!("frame {} not sent: {}", frame.sequence, e);
                    self.stats.overflows += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut detections = Vec::new();
        if let Some(stage) = self.detect.as_mut() {
            let detector = &mut stage.detector;
            detections = stage.target.cpu_read(|pixels| detector.detect(pixels))??;
            for detection in &detections {
                info!(target: "detections", "{}", detection.to_json());
            }
        }

        lease.release()?;
        Ok(Iteration {
            frame,
            sent,
            detections,
        })
    }

    /// Runs one iteration and folds its outcome into the loop counters.
    pub fn run_once(&mut self) -> Result<Iteration> {
        self.stats.iterations += 1;
        let span = info_span!("iteration", n = self.stats.iterations);
        let _guard = span.enter();

        let start = Instant::now();
        let result = self.step();
        match &result {
            Ok(iteration) => {
                self.stats.frames += 1;
                self.stats.detections += iteration.detections.len() as u64;
                if let Some(sent) = iteration.sent {
                    self.stats.bytes_sent += sent.bytes as u64;
                    self.stats.datagrams += sent.datagrams as u64;
                    self.stats.send_failures += sent.failures as u64;
                }
                debug!(
                    "frame {} took {:?} fps: {:.1}",
                    iteration.frame.sequence,
                    start.elapsed(),
                    self.fps.update()
                );
            }
            Err(e) if e.is_transient() => {
                self.stats.skipped += 1;
                warn!("iteration skipped: {}", e);
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!("iteration failed: {}", e);
            }
        }

        #[cfg(feature = "tracy")]
        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }

        result
    }

    /// Loops until `stop` is raised, logging the counters every
    /// `stats_interval` iterations (never when zero).
    pub fn run(&mut self, stop: &AtomicBool, stats_interval: u64) -> PipelineStats {
        info!("pipeline running");
        while !stop.load(Ordering::Relaxed) {
            let _ = self.run_once();
            if stats_interval > 0 && self.stats.iterations % stats_interval == 0 {
                self.log_stats();
            }
        }
        info!("pipeline stopping");
        self.log_stats();
        self.stats
    }

    fn log_stats(&self) {
        let s = &self.stats;
        info!(
            "iterations {} frames {} skipped {} failed {} overflows {} detections {} fps {:.1}",
            s.iterations,
            s.frames,
            s.skipped,
            s.failures,
            s.overflows,
            s.detections,
            self.fps.average()
        );
        info!(
            "sent {} bytes in {} datagrams ({} dropped)",
            s.bytes_sent, s.datagrams, s.send_failures
        );
    }

    /// Tears the pipeline down in dependency order: sessions, then their
    /// buffers, then the capture source.
    pub fn into_source(self) -> S {
        let Self {
            encode,
            detect,
            source,
            ..
        } = self;
        drop(encode);
        drop(detect);
        source
    }
}

/// Returns a flag raised on SIGINT or SIGTERM, for [`Pipeline::run`]. The
/// handler can be installed once per process; later calls return a flag
/// that is never raised.
pub fn stop_on_signal() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install signal handler: {err}");
        }
    }
    stop
}
