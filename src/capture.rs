// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Camera capture through a fixed ring of V4L2 MMAP buffers.
//!
//! The kernel owns a ring entry while it is queued and fills it; the
//! application owns it between a dequeue and the matching re-queue. The
//! application side of that hand-off is a [`FrameLease`]: it exists for
//! exactly one dequeued entry and re-queues it when dropped, so every exit
//! path of a pipeline iteration returns the buffer to the camera.

use crate::{
    error::{Error, Result},
    image::{format_row_stride, FourCC, Geometry, Memory, Surface, YUYV},
    v4l2::*,
};
use nix::errno::Errno;
use std::{
    ffi::c_int,
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    ptr::null_mut,
    slice::from_raw_parts,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Ownership state of one ring entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the kernel, waiting to be filled.
    Queued,
    /// Owned by the application, holding a frame.
    Dequeued,
    /// Released by the application but refused by the kernel. Retried before
    /// the next dequeue.
    Stranded,
}

/// Book-keeping for the capture ring: which entries the application holds.
#[derive(Clone, Debug)]
pub struct BufferRing {
    states: Vec<BufferState>,
}

impl BufferRing {
    /// A ring of `count` entries, all queued.
    pub fn new(count: usize) -> Self {
        Self {
            states: vec![BufferState::Queued; count],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.states.get(index as usize).copied()
    }

    fn count(&self, state: BufferState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    /// Number of entries currently held by the application.
    pub fn outstanding(&self) -> usize {
        self.count(BufferState::Dequeued)
    }

    /// Number of entries neither the kernel nor the application holds.
    pub fn stranded(&self) -> usize {
        self.count(BufferState::Stranded)
    }

    /// Records that the kernel handed `index` to the application.
    pub fn mark_dequeued(&mut self, index: u32) -> Result<()> {
        match self.states.get_mut(index as usize) {
            None => Err(Error::UnknownIndex { index }),
            Some(BufferState::Dequeued) => Err(Error::AlreadyDequeued { index }),
            Some(state) => {
                if *state == BufferState::Stranded {
                    warn!("capture buffer {} came back while stranded", index);
                }
                *state = BufferState::Dequeued;
                Ok(())
            }
        }
    }

    /// Checks `index` may be handed back to the kernel.
    pub fn check_release(&self, index: u32) -> Result<()> {
        match self.state(index) {
            None => Err(Error::UnknownIndex { index }),
            Some(BufferState::Queued | BufferState::Stranded) => Err(Error::NotDequeued { index }),
            Some(BufferState::Dequeued) => Ok(()),
        }
    }

    /// Records that `index` went back to the kernel.
    pub fn mark_queued(&mut self, index: u32) -> Result<()> {
        self.check_release(index)?;
        self.states[index as usize] = BufferState::Queued;
        Ok(())
    }

    /// Hands dequeued `index` back through `queue`. When `queue` fails the
    /// entry is marked [`BufferState::Stranded`] and the error returned; the
    /// application no longer holds it either way.
    pub fn release_with(
        &mut self,
        index: u32,
        queue: impl FnOnce(u32) -> Result<()>,
    ) -> Result<()> {
        self.check_release(index)?;
        match queue(index) {
            Ok(()) => {
                self.states[index as usize] = BufferState::Queued;
                Ok(())
            }
            Err(e) => {
                self.states[index as usize] = BufferState::Stranded;
                Err(e)
            }
        }
    }

    /// Retries `queue` for every stranded entry and returns how many went
    /// back to the kernel.
    pub fn requeue_stranded(&mut self, mut queue: impl FnMut(u32) -> Result<()>) -> usize {
        let mut recovered = 0;
        for (index, state) in self.states.iter_mut().enumerate() {
            if *state != BufferState::Stranded {
                continue;
            }
            match queue(index as u32) {
                Ok(()) => {
                    *state = BufferState::Queued;
                    recovered += 1;
                }
                Err(e) => debug!("capture buffer {} still stranded: {}", index, e),
            }
        }
        recovered
    }
}

/// Metadata of one dequeued frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub index: u32,
    pub sequence: u32,
    pub bytes_used: usize,
    pub timestamp: Duration,
}

/// A producer of captured frames with explicit buffer hand-back.
pub trait FrameSource {
    /// Geometry of every frame the source yields.
    fn geometry(&self) -> Geometry;

    fn format(&self) -> FourCC;

    /// Blocks until a filled buffer is available and takes it from the
    /// kernel. Use [`FrameSource::next_frame`] to get a lease instead.
    fn dequeue(&mut self) -> Result<Frame>;

    /// Hands `index` back to the kernel. Must be called exactly once per
    /// dequeued frame; unknown or not-dequeued indices are rejected.
    fn release_frame(&mut self, index: u32) -> Result<()>;

    /// Memory of ring entry `index`, for building conversion surfaces.
    fn memory(&self, index: u32) -> Result<Memory<'_>>;

    /// Dequeues the next frame as a lease that re-queues it when dropped.
    fn next_frame(&mut self) -> Result<FrameLease<'_, Self>>
    where
        Self: Sized,
    {
        let frame = self.dequeue()?;
        Ok(FrameLease {
            source: self,
            frame,
            released: false,
        })
    }
}

/// Scoped ownership of one dequeued ring entry.
pub struct FrameLease<'a, S: FrameSource> {
    source: &'a mut S,
    frame: Frame,
    released: bool,
}

impl<S: FrameSource> FrameLease<'_, S> {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn index(&self) -> u32 {
        self.frame.index
    }

    /// The frame as a conversion source. The surface borrows the lease, so
    /// the frame cannot be released while a conversion may still read it.
    pub fn surface(&self) -> Result<Surface<'_>> {
        let memory = self.source.memory(self.frame.index)?;
        Ok(Surface::new(
            memory,
            self.source.geometry(),
            self.source.format(),
        ))
    }

    /// Re-queues the frame now, reporting any failure. A refused re-queue
    /// leaves the entry stranded for the source to retry.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.source.release_frame(self.frame.index)
    }
}

impl<S: FrameSource> Drop for FrameLease<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.source.release_frame(self.frame.index) {
            error!("failed to re-queue capture buffer {}: {}", self.frame.index, e);
        }
    }
}

/// Parameters for [`CaptureSource::open`].
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub geometry: Geometry,
    pub frame_rate: u32,
    pub buffers: u32,
    /// Accept a geometry adjusted by the driver instead of failing.
    pub allow_geometry_change: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            geometry: Geometry::new(640, 480),
            frame_rate: 30,
            buffers: 4,
            allow_geometry_change: false,
        }
    }
}

const MIN_BUFFERS: u32 = 2;

struct MappedEntry {
    ptr: *mut u8,
    len: usize,
    dmabuf: Option<OwnedFd>,
}

impl MappedEntry {
    fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedEntry {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } != 0 {
            warn!("unmap of capture buffer failed: {}", io::Error::last_os_error());
        }
    }
}

/// A V4L2 camera streaming YUYV into a ring of MMAP buffers.
pub struct CaptureSource {
    // Mappings must go before the device is closed.
    entries: Vec<MappedEntry>,
    ring: BufferRing,
    file: File,
    device: PathBuf,
    geometry: Geometry,
    frame_size: usize,
    frame_interval: Option<Duration>,
    streaming: bool,
}

impl CaptureSource {
    /// Opens the device, negotiates format, geometry and frame interval,
    /// maps the buffer ring and starts streaming.
    ///
    /// # Errors
    ///
    /// Any rejection by the device is returned. All mappings made before the
    /// failure are released.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let device = config.device.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&device)?;
        let fd = file.as_raw_fd();
        let ioctl_err = |context| device_error(&config.device, context);

        let mut caps = v4l2_capability::default();
        unsafe { vidioc_querycap(fd, &mut caps) }.map_err(ioctl_err("VIDIOC_QUERYCAP"))?;
        let node_caps = caps.node_caps();
        if node_caps & V4L2_CAP_VIDEO_CAPTURE == 0 || node_caps & V4L2_CAP_STREAMING == 0 {
            return Err(Error::NotCapture { device });
        }
        info!(
            "camera {} driver {} card {}",
            device.display(),
            caps.driver_name(),
            caps.card_name()
        );

        let mut fmt = v4l2_format::capture(v4l2_pix_format {
            width: config.geometry.width,
            height: config.geometry.height,
            pixelformat: YUYV.into(),
            field: V4L2_FIELD_NONE,
            ..Default::default()
        });
        unsafe { vidioc_s_fmt(fd, &mut fmt) }.map_err(ioctl_err("VIDIOC_S_FMT"))?;
        let (geometry, frame_size) = check_negotiated_format(config, &fmt.pix())?;

        let frame_interval =
            set_frame_rate(fd, config.frame_rate).map_err(ioctl_err("VIDIOC_S_PARM"))?;

        let mut req = v4l2_requestbuffers {
            count: config.buffers,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        unsafe { vidioc_reqbufs(fd, &mut req) }.map_err(ioctl_err("VIDIOC_REQBUFS"))?;
        if req.count < MIN_BUFFERS {
            return Err(Error::RingTooSmall {
                device,
                granted: req.count,
                required: MIN_BUFFERS,
            });
        }
        if req.count != config.buffers {
            warn!(
                "requested {} capture buffers, driver granted {}",
                config.buffers, req.count
            );
        }

        let mut entries = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf = v4l2_buffer::mmap_capture(index);
            unsafe { vidioc_querybuf(fd, &mut buf) }.map_err(ioctl_err("VIDIOC_QUERYBUF"))?;

            let len = buf.length as usize;
            let ptr = unsafe {
                libc::mmap(
                    null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    buf.offset() as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::Map {
                    len,
                    source: io::Error::last_os_error(),
                });
            }

            let dmabuf = export_buffer(fd, index);
            debug!(
                "capture buffer {} mapped at {:p} len {} dmabuf {:?}",
                index,
                ptr,
                len,
                dmabuf.as_ref().map(|fd| fd.as_raw_fd())
            );
            entries.push(MappedEntry {
                ptr: ptr.cast(),
                len,
                dmabuf,
            });

            unsafe { vidioc_qbuf(fd, &mut buf) }.map_err(ioctl_err("VIDIOC_QBUF"))?;
        }

        let buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        unsafe { vidioc_streamon(fd, &buf_type) }.map_err(ioctl_err("VIDIOC_STREAMON"))?;

        info!(
            "capture started {} {} {} buffers {:?} per frame",
            geometry,
            YUYV,
            entries.len(),
            frame_interval
        );

        Ok(Self {
            ring: BufferRing::new(entries.len()),
            entries,
            file,
            device,
            geometry,
            frame_size,
            frame_interval,
            streaming: true,
        })
    }

    pub fn device(&self) -> &PathBuf {
        &self.device
    }

    pub fn ring(&self) -> &BufferRing {
        &self.ring
    }

    /// Negotiated frame interval, when the driver supports setting it.
    pub fn frame_interval(&self) -> Option<Duration> {
        self.frame_interval
    }

    fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        let buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        unsafe { vidioc_streamoff(self.file.as_raw_fd(), &buf_type) }
            .map_err(device_error(&self.device, "VIDIOC_STREAMOFF"))?;
        Ok(())
    }

    /// Stops streaming, unmaps the ring and closes the device.
    pub fn close(mut self) -> Result<()> {
        self.stream_off()?;
        self.entries.clear();
        let mut req = v4l2_requestbuffers {
            count: 0,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        unsafe { vidioc_reqbufs(self.file.as_raw_fd(), &mut req) }
            .map_err(device_error(&self.device, "VIDIOC_REQBUFS"))?;
        info!("capture stopped {}", self.device.display());
        Ok(())
    }

}

impl FrameSource for CaptureSource {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn format(&self) -> FourCC {
        YUYV
    }

    fn dequeue(&mut self) -> Result<Frame> {
        let fd = self.file.as_raw_fd();
        if self.ring.stranded() > 0 {
            let device = &self.device;
            let recovered = self.ring.requeue_stranded(|index| queue_buffer(fd, device, index));
            debug!("re-queued {} stranded capture buffers", recovered);
        }

        let mut buf = v4l2_buffer::mmap_capture(0);
        unsafe { vidioc_dqbuf(fd, &mut buf) }.map_err(Error::Dequeue)?;

        let index = buf.index;
        self.ring.mark_dequeued(index)?;

        let bytes_used = buf.bytesused as usize;
        let failure = if buf.flags & V4L2_BUF_FLAG_ERROR != 0 {
            Some(Error::CorruptFrame { index })
        } else if bytes_used < self.frame_size {
            Some(Error::ShortFrame {
                index,
                bytes_used,
                expected: self.frame_size,
            })
        } else {
            None
        };
        if let Some(e) = failure {
            self.release_frame(index)?;
            return Err(e);
        }

        Ok(Frame {
            index,
            sequence: buf.sequence,
            bytes_used,
            timestamp: Duration::from_secs(buf.timestamp.tv_sec as u64)
                + Duration::from_micros(buf.timestamp.tv_usec as u64),
        })
    }

    fn release_frame(&mut self, index: u32) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let device = &self.device;
        self.ring.release_with(index, |index| queue_buffer(fd, device, index))
    }

    fn memory(&self, index: u32) -> Result<Memory<'_>> {
        let entry = self
            .entries
            .get(index as usize)
            .ok_or(Error::UnknownIndex { index })?;
        Ok(match &entry.dmabuf {
            Some(fd) => Memory::Dma {
                fd: fd.as_fd(),
                len: entry.len,
            },
            None => Memory::Virtual(entry.as_slice()),
        })
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!("{}", e);
        }
    }
}

/// Checks the format the driver settled on after `VIDIOC_S_FMT` and returns
/// the geometry and frame size to capture with.
///
/// The frame must be YUYV in the requested geometry (or any geometry when
/// `allow_geometry_change` is set), with unpadded rows and an image size
/// that holds a whole frame.
pub fn check_negotiated_format(
    config: &CaptureConfig,
    pix: &v4l2_pix_format,
) -> Result<(Geometry, usize)> {
    let device = &config.device;
    let format = FourCC::from(pix.pixelformat);
    if format != YUYV {
        return Err(Error::FormatRejected {
            device: device.clone(),
            requested: YUYV,
            actual: format,
        });
    }

    let geometry = Geometry::new(pix.width, pix.height);
    if geometry != config.geometry {
        if !config.allow_geometry_change {
            return Err(Error::GeometryMismatch {
                device: device.clone(),
                requested: config.geometry,
                actual: geometry,
            });
        }
        warn!(
            "requested {} resolution but camera set {} resolution",
            config.geometry, geometry
        );
    }

    let stride =
        format_row_stride(YUYV, geometry.width).ok_or(Error::UnsupportedFormat(YUYV))?;
    let frame_size = stride * geometry.height as usize;
    if pix.bytesperline as usize != stride || (pix.sizeimage as usize) < frame_size {
        return Err(Error::LayoutMismatch {
            device: device.clone(),
            geometry,
            stride: pix.bytesperline,
            size: pix.sizeimage,
            expected_stride: stride,
            expected_size: frame_size,
        });
    }
    Ok((geometry, frame_size))
}

/// Sets the frame interval to 1/`frame_rate` when the driver supports it and
/// returns the interval the driver settled on.
fn set_frame_rate(fd: c_int, frame_rate: u32) -> nix::Result<Option<Duration>> {
    let mut parm = v4l2_streamparm::capture();
    unsafe { vidioc_g_parm(fd, &mut parm) }?;
    let capture = unsafe { parm.parm.capture };
    if capture.capability & V4L2_CAP_TIMEPERFRAME == 0 {
        debug!("driver does not support setting the frame interval");
        return Ok(None);
    }

    let mut parm = v4l2_streamparm::capture();
    parm.parm.capture = v4l2_captureparm {
        timeperframe: v4l2_fract {
            numerator: 1,
            denominator: frame_rate,
        },
        ..capture
    };
    unsafe { vidioc_s_parm(fd, &mut parm) }?;

    let interval = unsafe { parm.parm.capture.timeperframe };
    if interval.denominator == 0 {
        return Ok(None);
    }
    if interval.numerator != 1 || interval.denominator != frame_rate {
        warn!(
            "requested 1/{} frame interval but camera set {}/{}",
            frame_rate, interval.numerator, interval.denominator
        );
    }
    Ok(Some(Duration::from_secs_f64(
        interval.numerator as f64 / interval.denominator as f64,
    )))
}

/// Exports ring entry `index` as a dma-buf so the conversion engine can read
/// it by handle. Drivers without export support fall back to the mapping.
fn export_buffer(fd: c_int, index: u32) -> Option<OwnedFd> {
    let mut exp = v4l2_exportbuffer {
        type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
        index,
        flags: (libc::O_RDONLY | libc::O_CLOEXEC) as u32,
        ..Default::default()
    };
    match unsafe { vidioc_expbuf(fd, &mut exp) } {
        // SAFETY: the kernel returned a fresh descriptor we now own.
        Ok(_) => Some(unsafe { OwnedFd::from_raw_fd(exp.fd) }),
        Err(e) => {
            debug!("VIDIOC_EXPBUF for buffer {} unavailable: {}", index, e);
            None
        }
    }
}

fn queue_buffer(fd: c_int, device: &Path, index: u32) -> Result<()> {
    let mut buf = v4l2_buffer::mmap_capture(index);
    unsafe { vidioc_qbuf(fd, &mut buf) }.map_err(device_error(device, "VIDIOC_QBUF"))?;
    Ok(())
}

fn device_error(device: &Path, context: &'static str) -> impl FnOnce(Errno) -> Error {
    let device = device.to_path_buf();
    move |source| Error::Device {
        device,
        context,
        source,
    }
}
