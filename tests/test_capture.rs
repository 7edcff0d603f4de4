// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use common::MockSource;
use rkstream::{
    capture::{
        check_negotiated_format, BufferRing, BufferState, CaptureConfig, CaptureSource,
        FrameSource,
    },
    error::{Error, Result, Severity},
    image::{self, Geometry, Memory},
    v4l2::{v4l2_capability, v4l2_pix_format},
};
use serial_test::serial;
use std::{path::PathBuf, time::Instant};

#[test]
fn test_ring_states() {
    let mut ring = BufferRing::new(4);
    assert_eq!(ring.len(), 4);
    assert_eq!(ring.outstanding(), 0);
    assert_eq!(ring.state(2), Some(BufferState::Queued));
    assert_eq!(ring.state(4), None);

    ring.mark_dequeued(1).unwrap();
    assert_eq!(ring.state(1), Some(BufferState::Dequeued));
    assert_eq!(ring.outstanding(), 1);

    assert!(matches!(
        ring.mark_dequeued(1),
        Err(Error::AlreadyDequeued { index: 1 })
    ));
    assert!(matches!(
        ring.mark_queued(2),
        Err(Error::NotDequeued { index: 2 })
    ));
    let err = ring.mark_queued(7).unwrap_err();
    assert!(matches!(err, Error::UnknownIndex { index: 7 }));
    assert_eq!(err.severity(), Severity::Usage);

    ring.mark_queued(1).unwrap();
    assert_eq!(ring.outstanding(), 0);
    assert!(matches!(
        ring.mark_queued(1),
        Err(Error::NotDequeued { index: 1 })
    ));
}

#[test]
fn test_lease_requeues_on_drop() -> Result<()> {
    let mut cam = MockSource::new(4, Geometry::new(64, 48));
    {
        let lease = cam.next_frame()?;
        assert_eq!(lease.index(), 0);
        assert_eq!(lease.frame().bytes_used, 64 * 48 * 2);
        let surface = lease.surface()?;
        assert_eq!(surface.format(), image::YUYV);
        surface.validate()?;
    }
    assert_eq!(cam.ring.outstanding(), 0);

    let lease = cam.next_frame()?;
    assert_eq!(lease.index(), 1);
    lease.release()?;
    assert_eq!(cam.ring.outstanding(), 0);
    Ok(())
}

fn failing_iteration(cam: &mut MockSource) -> Result<()> {
    let _lease = cam.next_frame()?;
    Err(Error::Convert("engine busy".to_string()))
}

#[test]
fn test_lease_requeues_on_error() {
    let mut cam = MockSource::new(2, Geometry::new(64, 48));
    for _ in 0..5 {
        assert!(failing_iteration(&mut cam).is_err());
        assert_eq!(cam.ring.outstanding(), 0);
    }
    assert_eq!(cam.sequence, 5);
}

#[test]
fn test_ring_exhaustion() -> Result<()> {
    let mut cam = MockSource::new(2, Geometry::new(64, 48));
    let a = cam.dequeue()?;
    let b = cam.dequeue()?;
    assert_ne!(a.index, b.index);
    assert!(matches!(cam.dequeue(), Err(Error::Dequeue(_))));

    cam.release_frame(a.index)?;
    assert!(matches!(
        cam.release_frame(a.index),
        Err(Error::NotDequeued { .. })
    ));
    assert!(matches!(
        cam.release_frame(9),
        Err(Error::UnknownIndex { index: 9 })
    ));
    assert_eq!(cam.dequeue()?.index, a.index);
    Ok(())
}

#[test]
fn test_stranded_requeue() -> Result<()> {
    let mut cam = MockSource::new(2, Geometry::new(64, 48));
    cam.requeue_failures = 1;

    let lease = cam.next_frame()?;
    let index = lease.index();
    assert!(matches!(lease.release(), Err(Error::Device { .. })));
    assert_eq!(cam.ring.outstanding(), 0);
    assert_eq!(cam.ring.stranded(), 1);
    assert_eq!(cam.ring.state(index), Some(BufferState::Stranded));
    assert!(matches!(
        cam.release_frame(index),
        Err(Error::NotDequeued { .. })
    ));

    // The next dequeue hands the stranded entry back first.
    let lease = cam.next_frame()?;
    assert_eq!(cam.ring.stranded(), 0);
    drop(lease);

    let a = cam.dequeue()?;
    let b = cam.dequeue()?;
    assert_ne!(a.index, b.index);
    Ok(())
}

#[test]
fn test_stranded_on_drop() {
    let mut cam = MockSource::new(2, Geometry::new(64, 48));
    cam.requeue_failures = 2;
    {
        let _lease = cam.next_frame().unwrap();
    }
    assert_eq!(cam.ring.stranded(), 1);

    // Refused again on the retry: the entry stays stranded, the other is used.
    let lease = cam.next_frame().unwrap();
    assert_eq!(cam.ring.stranded(), 1);
    assert_eq!(cam.ring.outstanding(), 1);
    lease.release().unwrap();

    let mut ring = BufferRing::new(2);
    ring.mark_dequeued(0).unwrap();
    assert!(ring
        .release_with(0, |_| Err(Error::Dequeue(nix::errno::Errno::EIO)))
        .is_err());
    assert_eq!(ring.requeue_stranded(|_| Ok(())), 1);
    assert_eq!(ring.state(0), Some(BufferState::Queued));
}

fn yuyv_config(width: u32, height: u32) -> CaptureConfig {
    CaptureConfig {
        geometry: Geometry::new(width, height),
        ..Default::default()
    }
}

fn yuyv_pix(width: u32, height: u32, bytesperline: u32, sizeimage: u32) -> v4l2_pix_format {
    v4l2_pix_format {
        width,
        height,
        pixelformat: image::YUYV.into(),
        bytesperline,
        sizeimage,
        ..Default::default()
    }
}

#[test]
fn test_negotiated_format() -> Result<()> {
    let config = yuyv_config(640, 480);
    let (geometry, size) = check_negotiated_format(&config, &yuyv_pix(640, 480, 1280, 614400))?;
    assert_eq!(geometry, Geometry::new(640, 480));
    assert_eq!(size, 640 * 480 * 2);

    // Trailing bytes past the frame are harmless.
    check_negotiated_format(&config, &yuyv_pix(640, 480, 1280, 614400 + 4096))?;

    let mut nv12 = yuyv_pix(640, 480, 640, 460800);
    nv12.pixelformat = image::NV12.into();
    assert!(matches!(
        check_negotiated_format(&config, &nv12),
        Err(Error::FormatRejected { .. })
    ));

    assert!(matches!(
        check_negotiated_format(&config, &yuyv_pix(320, 240, 640, 153600)),
        Err(Error::GeometryMismatch { .. })
    ));
    let lenient = CaptureConfig {
        allow_geometry_change: true,
        ..config
    };
    let (geometry, _) = check_negotiated_format(&lenient, &yuyv_pix(320, 240, 640, 153600))?;
    assert_eq!(geometry, Geometry::new(320, 240));
    Ok(())
}

#[test]
fn test_padded_rows() {
    let config = yuyv_config(640, 480);
    let err = check_negotiated_format(&config, &yuyv_pix(640, 480, 1344, 1344 * 480))
        .unwrap_err();
    match &err {
        Error::LayoutMismatch {
            stride,
            expected_stride,
            ..
        } => {
            assert_eq!(*stride, 1344);
            assert_eq!(*expected_stride, 1280);
        }
        other => panic!("expected layout mismatch, got {:?}", other),
    }
    assert_eq!(err.severity(), Severity::Fatal);

    assert!(matches!(
        check_negotiated_format(&config, &yuyv_pix(640, 480, 1280, 1280 * 479)),
        Err(Error::LayoutMismatch { size, .. }) if size == 1280 * 479
    ));
}

#[test]
fn test_unterminated_driver() {
    let mut caps = v4l2_capability::default();
    caps.driver = *b"uvcvideo-extnded";
    caps.card[..9].copy_from_slice(b"HD Webcam");
    assert_eq!(caps.driver_name(), "uvcvideo-extnded");
    assert_eq!(caps.card_name(), "HD Webcam");
}

#[test]
fn test_memory() -> Result<()> {
    let cam = MockSource::new(2, Geometry::new(64, 48));
    match cam.memory(1)? {
        Memory::Virtual(data) => assert!(data.iter().all(|b| *b == 1)),
        Memory::Dma { .. } => panic!("mock source is virtual"),
    }
    assert!(matches!(cam.memory(2), Err(Error::UnknownIndex { index: 2 })));
    Ok(())
}

#[test]
#[cfg(target_pointer_width = "64")]
fn test_uapi_layout() {
    use rkstream::v4l2::*;
    use std::mem::size_of;

    assert_eq!(size_of::<v4l2_capability>(), 104);
    assert_eq!(size_of::<v4l2_pix_format>(), 48);
    assert_eq!(size_of::<v4l2_format>(), 208);
    assert_eq!(size_of::<v4l2_streamparm>(), 204);
    assert_eq!(size_of::<v4l2_requestbuffers>(), 20);
    assert_eq!(size_of::<v4l2_buffer>(), 88);
    assert_eq!(size_of::<v4l2_exportbuffer>(), 64);
}

#[test]
fn test_missing_device() {
    let config = CaptureConfig {
        device: PathBuf::from("/dev/nonexistent-video"),
        ..Default::default()
    };
    let err = CaptureSource::open(&config).err().unwrap();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(err.severity(), Severity::Fatal);
}

#[test]
#[serial]
#[ignore = "camera test is disabled by default (run with --include-ignored to enable)"]
fn test_capture() -> Result<()> {
    let config = CaptureConfig {
        device: std::env::var("CAMERA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/dev/video0")),
        allow_geometry_change: true,
        ..Default::default()
    };
    let mut cam = CaptureSource::open(&config)?;
    println!("{} {:?}", cam.geometry(), cam.frame_interval());

    let mut last = None;
    for _ in 0..30 {
        let now = Instant::now();
        let lease = match cam.next_frame() {
            Ok(lease) => lease,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e),
        };
        let frame = *lease.frame();
        lease.surface()?.validate()?;
        println!("frame {} index {} read: {:?}", frame.sequence, frame.index, now.elapsed());
        if let Some(prev) = last {
            assert!(frame.sequence > prev);
        }
        last = Some(frame.sequence);
    }
    assert_eq!(cam.ring().outstanding(), 0);
    cam.close()
}
