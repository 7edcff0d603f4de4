// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#![allow(dead_code)]

use rkstream::{
    capture::{BufferRing, BufferState, Frame, FrameSource},
    dma::PhysicalBuffer,
    error::{Error, Result},
    image::{image_size, FourCC, FrameTransform, Geometry, Memory, Surface, YUYV},
};
use std::{
    cell::Cell,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

/// A sized memfd.
pub fn memfd(len: usize) -> OwnedFd {
    let fd = unsafe { libc::memfd_create(c"rkstream-test".as_ptr(), libc::MFD_CLOEXEC) };
    assert!(fd >= 0, "memfd_create failed");
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    assert_eq!(unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) }, 0);
    fd
}

/// A memfd-backed buffer standing in for a dma-buf.
pub fn memfd_buffer(len: usize) -> PhysicalBuffer {
    PhysicalBuffer::from_fd(memfd(len), len).unwrap()
}

/// An in-memory camera cycling through a fixed ring.
pub struct MockSource {
    pub ring: BufferRing,
    pub buffers: Vec<Vec<u8>>,
    pub geometry: Geometry,
    pub sequence: u32,
    /// Dequeues that fail before frames are delivered again.
    pub failures: usize,
    /// Re-queues the kernel refuses before accepting them again.
    pub requeue_failures: usize,
    /// Raised once this many frames were delivered.
    pub stop_after: Option<(u32, &'static AtomicBool)>,
}

impl MockSource {
    pub fn new(count: usize, geometry: Geometry) -> Self {
        let size = image_size(geometry.width, geometry.height, YUYV).unwrap();
        Self {
            ring: BufferRing::new(count),
            buffers: (0..count).map(|i| vec![i as u8; size]).collect(),
            geometry,
            sequence: 0,
            failures: 0,
            requeue_failures: 0,
            stop_after: None,
        }
    }
}

impl FrameSource for MockSource {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn format(&self) -> FourCC {
        YUYV
    }

    fn dequeue(&mut self) -> Result<Frame> {
        let refused = &mut self.requeue_failures;
        self.ring.requeue_stranded(|_| refuse_queue(refused));
        if self.failures > 0 {
            self.failures -= 1;
            return Err(Error::Dequeue(nix::errno::Errno::EIO));
        }
        let count = self.ring.len() as u32;
        let mut index = None;
        for i in 0..count {
            let candidate = (self.sequence + i) % count;
            if self.ring.state(candidate) == Some(BufferState::Queued) {
                self.ring.mark_dequeued(candidate)?;
                index = Some(candidate);
                break;
            }
        }
        let index = index.ok_or(Error::Dequeue(nix::errno::Errno::EAGAIN))?;
        let frame = Frame {
            index,
            sequence: self.sequence,
            bytes_used: self.buffers[index as usize].len(),
            timestamp: Duration::from_millis(self.sequence as u64 * 33),
        };
        self.sequence += 1;
        if let Some((limit, stop)) = self.stop_after {
            if self.sequence >= limit {
                stop.store(true, Ordering::Relaxed);
            }
        }
        Ok(frame)
    }

    fn release_frame(&mut self, index: u32) -> Result<()> {
        let refused = &mut self.requeue_failures;
        self.ring.release_with(index, |_| refuse_queue(refused))
    }

    fn memory(&self, index: u32) -> Result<Memory<'_>> {
        self.buffers
            .get(index as usize)
            .map(|b| Memory::Virtual(b))
            .ok_or(Error::UnknownIndex { index })
    }
}

fn refuse_queue(refused: &mut usize) -> Result<()> {
    if *refused == 0 {
        return Ok(());
    }
    *refused -= 1;
    Err(Error::Device {
        device: PathBuf::from("/dev/video-mock"),
        context: "VIDIOC_QBUF",
        source: nix::errno::Errno::EIO,
    })
}

/// Records conversions instead of running them.
#[derive(Default)]
pub struct MockTransform {
    pub calls: Cell<usize>,
    pub fail: Cell<bool>,
}

impl FrameTransform for MockTransform {
    fn blit(&self, _src: &Surface<'_>, _dst: &Surface<'_>) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        if self.fail.get() {
            return Err(Error::Convert("engine busy".to_string()));
        }
        Ok(())
    }
}
