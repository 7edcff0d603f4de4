// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use common::{memfd, memfd_buffer};
use rkstream::{
    dma::{DmaAllocator, HeapPool, PhysicalBuffer, SyncDirection},
    error::{Error, Severity},
    image::{image_size, NV12},
};
use serial_test::serial;
use std::{error::Error as _, os::fd::OwnedFd, path::PathBuf};

#[test]
fn test_cpu_access() -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = memfd_buffer(4096);
    assert_eq!(buf.len(), 4096);
    assert!(!buf.is_empty());
    assert!(!buf.is_dmabuf());
    println!("{}", buf);

    buf.cpu_write(|data| data.fill(0x5a))?;
    let sum = buf.cpu_read(|data| data.iter().map(|b| *b as usize).sum::<usize>())?;
    assert_eq!(sum, 0x5a * 4096);

    buf.sync(SyncDirection::Invalidate)?;
    buf.sync(SyncDirection::Flush)?;
    buf.release()?;
    Ok(())
}

#[test]
fn test_sync_bracket() {
    // A memfd mapped as a dma-buf rejects DMA_BUF_IOCTL_SYNC, so the
    // bracket surfaces as a sync error instead of being skipped.
    let mut buf = PhysicalBuffer::from_dmabuf(memfd(4096), 4096).unwrap();
    assert!(buf.is_dmabuf());

    let mut ran = false;
    let err = buf.cpu_write(|_| ran = true).unwrap_err();
    assert!(matches!(err, Error::Sync(_)), "{:?}", err);
    assert_eq!(err.severity(), Severity::Transient);
    assert!(!ran);

    assert!(matches!(buf.cpu_read(|_| ()), Err(Error::Sync(_))));
    assert!(matches!(
        buf.sync(SyncDirection::Invalidate),
        Err(Error::Sync(_))
    ));
}

#[test]
fn test_zero_length() {
    let fd = OwnedFd::from(std::fs::File::open("/dev/zero").unwrap());
    match PhysicalBuffer::from_fd(fd, 0) {
        Err(Error::Map { len: 0, .. }) => {}
        other => panic!("expected map error, got {:?}", other),
    }
    assert!(matches!(
        PhysicalBuffer::from_dmabuf(memfd(4096), 0),
        Err(Error::Map { len: 0, .. })
    ));
}

#[test]
fn test_heap_names() {
    assert_eq!("cma".parse::<HeapPool>().unwrap(), HeapPool::Cma);
    assert_eq!("linux,cma".parse::<HeapPool>().unwrap(), HeapPool::Cma);
    assert_eq!("system".parse::<HeapPool>().unwrap(), HeapPool::System);
    assert_eq!(
        "system-uncached".parse::<HeapPool>().unwrap(),
        HeapPool::Path(PathBuf::from("/dev/dma_heap/system-uncached"))
    );
    assert_eq!(
        "/dev/dma_heap/reserved".parse::<HeapPool>().unwrap(),
        HeapPool::Path(PathBuf::from("/dev/dma_heap/reserved"))
    );
    assert!("".parse::<HeapPool>().is_err());
    assert_eq!(HeapPool::Cma.to_string(), "/dev/dma_heap/linux,cma");
}

#[test]
fn test_default_order() {
    let alloc = DmaAllocator::default();
    assert_eq!(
        alloc.pools(),
        &[
            HeapPool::Cma,
            HeapPool::Path(PathBuf::from("/dev/dma_heap/system-uncached")),
            HeapPool::System,
        ]
    );
}

#[test]
fn test_exhausted() {
    let alloc = DmaAllocator::new(vec![
        HeapPool::Path(PathBuf::from("/nonexistent/heap-a")),
        HeapPool::Path(PathBuf::from("/nonexistent/heap-b")),
    ]);
    let err = alloc.allocate(4096).unwrap_err();
    match &err {
        Error::AllocationExhausted { size, tried } => {
            assert_eq!(*size, 4096);
            assert!(tried.contains("heap-a"));
            assert!(tried.contains("heap-b"));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(err.severity(), Severity::Fatal);
    assert!(err.source().is_none());
}

#[test]
fn test_no_pools() {
    let alloc = DmaAllocator::new(Vec::new());
    assert!(matches!(
        alloc.allocate(4096),
        Err(Error::AllocationExhausted { size: 4096, .. })
    ));
}

#[test]
#[serial]
#[ignore = "DMA heap test is disabled by default (run with --include-ignored to enable)"]
fn test_allocate() -> Result<(), Box<dyn std::error::Error>> {
    let alloc = DmaAllocator::default();
    let size = image_size(640, 640, NV12).unwrap();

    let mut bufs = Vec::new();
    for _ in 0..4 {
        let mut buf = alloc.allocate(size)?;
        assert!(buf.is_dmabuf());
        buf.cpu_write(|data| data.fill(0x80))?;
        assert!(buf.cpu_read(|data| data.iter().all(|b| *b == 0x80))?);
        bufs.push(buf);
    }
    for buf in bufs {
        alloc.release(buf)?;
    }
    Ok(())
}
