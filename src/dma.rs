// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Physically contiguous, hardware-shareable buffers backed by the Linux DMA
//! heaps.
//!
//! A [`PhysicalBuffer`] owns a dma-buf file descriptor together with a
//! process-local mapping of it. The descriptor is what RGA, MPP and the
//! capture device exchange; the mapping is what the CPU (and the RKNN input
//! binding, which copies through the CPU) reads. The mapping is valid exactly
//! as long as the descriptor is open, and both are released together.
//!
//! Lending a buffer to a hardware engine is expressed as a Rust borrow: a
//! conversion target is borrowed mutably for the duration of the conversion,
//! a consumer borrows it shared. No engine can hold a buffer past the call
//! that lent it.

use crate::error::{Error, Result};
use dma_buf::{DmaBuf, MappedDmaBuf};
use dma_heap::{Heap, HeapKind};
use nix::ioctl_readwrite;
use std::{
    cell::Cell,
    ffi::c_void,
    fmt,
    fs::OpenOptions,
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::PathBuf,
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
    str::FromStr,
};
use tracing::{debug, trace, warn};

const DMA_HEAP_DIR: &str = "/dev/dma_heap";

#[repr(C)]
#[derive(Debug, Default)]
pub struct DmaHeapAllocationData {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

ioctl_readwrite!(dma_heap_alloc, b'H', 0x0, DmaHeapAllocationData);

/// A DMA heap the allocator may draw from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapPool {
    /// `/dev/dma_heap/linux,cma`, physically contiguous reserved memory.
    Cma,
    /// `/dev/dma_heap/system`, cached page-backed memory.
    System,
    /// Any other heap node, such as the vendor `system-uncached` heap.
    Path(PathBuf),
}

impl HeapPool {
    fn allocate(&self, size: usize) -> Result<OwnedFd, String> {
        match self {
            HeapPool::Cma => allocate_from(HeapKind::Cma, size),
            HeapPool::System => allocate_from(HeapKind::System, size),
            HeapPool::Path(path) => {
                let heap = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(libc::O_CLOEXEC)
                    .open(path)
                    .map_err(|e| e.to_string())?;
                let mut data = DmaHeapAllocationData {
                    len: size as u64,
                    fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
                    ..Default::default()
                };
                unsafe { dma_heap_alloc(heap.as_raw_fd(), &mut data) }
                    .map_err(|e| e.to_string())?;
                // SAFETY: the kernel returned a fresh descriptor we now own.
                Ok(unsafe { OwnedFd::from_raw_fd(data.fd as i32) })
            }
        }
    }
}

fn allocate_from(kind: HeapKind, size: usize) -> Result<OwnedFd, String> {
    let heap = Heap::new(kind).map_err(|e| e.to_string())?;
    heap.allocate(size).map_err(|e| e.to_string())
}

impl fmt::Display for HeapPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapPool::Cma => write!(f, "{DMA_HEAP_DIR}/linux,cma"),
            HeapPool::System => write!(f, "{DMA_HEAP_DIR}/system"),
            HeapPool::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for HeapPool {
    type Err = String;

    /// Accepts `cma`, `system`, a heap name under `/dev/dma_heap` or an
    /// absolute path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("empty heap name".to_string()),
            "cma" | "linux,cma" => Ok(HeapPool::Cma),
            "system" => Ok(HeapPool::System),
            s if s.starts_with('/') => Ok(HeapPool::Path(PathBuf::from(s))),
            s => Ok(HeapPool::Path(PathBuf::from(DMA_HEAP_DIR).join(s))),
        }
    }
}

/// Allocates [`PhysicalBuffer`]s from an ordered list of heaps.
///
/// Contiguous reserved memory is preferred; the uncached and cached system
/// heaps follow as fallbacks. The first heap that can both allocate and be
/// mapped wins.
#[derive(Clone, Debug)]
pub struct DmaAllocator {
    pools: Vec<HeapPool>,
}

impl Default for DmaAllocator {
    fn default() -> Self {
        Self::new(vec![
            HeapPool::Cma,
            HeapPool::Path(PathBuf::from(DMA_HEAP_DIR).join("system-uncached")),
            HeapPool::System,
        ])
    }
}

impl DmaAllocator {
    pub fn new(pools: Vec<HeapPool>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &[HeapPool] {
        &self.pools
    }

    /// Allocates and maps `size` bytes from the first usable heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationExhausted`] naming every heap tried when
    /// none can satisfy the request, or [`Error::Map`] when the allocation
    /// succeeded but could not be mapped.
    pub fn allocate(&self, size: usize) -> Result<PhysicalBuffer> {
        let mut tried = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            match pool.allocate(size) {
                Ok(fd) => {
                    let buffer = PhysicalBuffer::from_dmabuf(fd, size)?;
                    debug!("allocated {} from {}", buffer, pool);
                    return Ok(buffer);
                }
                Err(e) => {
                    trace!("heap {} unusable: {}", pool, e);
                    tried.push(format!("{pool}: {e}"));
                }
            }
        }

        if tried.is_empty() {
            tried.push("no heaps configured".to_string());
        }
        Err(Error::AllocationExhausted {
            size,
            tried: tried.join(", "),
        })
    }

    /// Unmaps and closes `buffer`. Dropping the buffer does the same; this
    /// form reports an unmap failure instead of logging it.
    pub fn release(&self, buffer: PhysicalBuffer) -> Result<()> {
        buffer.release()
    }
}

/// Cache maintenance around CPU access to hardware-shared memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    /// Discard stale CPU cache lines before the CPU reads data a device
    /// wrote.
    Invalidate,
    /// Write back CPU cache lines after the CPU wrote data a device will
    /// read.
    Flush,
}

/// How a buffer is mapped into the process.
enum Mapping {
    /// A dma-buf mapping. CPU access is bracketed by `DMA_BUF_IOCTL_SYNC`.
    DmaBuf(MappedDmaBuf),
    /// A plain shared mapping of cache-coherent memory, such as a memfd.
    Coherent { ptr: *mut u8, len: usize },
}

/// A hardware-shareable descriptor and its mapping.
pub struct PhysicalBuffer {
    mapping: Mapping,
    fd: OwnedFd,
    len: usize,
}

// SAFETY: the mapping is owned by this value and only reachable through its
// borrows.
unsafe impl Send for PhysicalBuffer {}

impl PhysicalBuffer {
    /// Takes ownership of dma-buf `fd` and maps its `len` bytes. CPU access
    /// goes through the dma-buf cache sync bracket.
    pub fn from_dmabuf(fd: OwnedFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(zero_length());
        }
        let mapped = fd
            .try_clone()
            .map(DmaBuf::from)
            .and_then(|dma| dma.memory_map().map_err(|e| io::Error::other(e.to_string())))
            .map_err(|source| Error::Map { len, source })?;
        Ok(Self {
            mapping: Mapping::DmaBuf(mapped),
            fd,
            len,
        })
    }

    /// Maps `len` bytes of `fd` read-write and takes ownership of `fd`.
    ///
    /// The memory is treated as cache-coherent: no sync is issued around CPU
    /// access. Use [`PhysicalBuffer::from_dmabuf`] for dma-bufs.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(zero_length());
        }

        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Map {
                len,
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            mapping: Mapping::Coherent {
                ptr: ptr.cast::<u8>(),
                len,
            },
            fd,
            len,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether CPU access is bracketed by dma-buf cache sync.
    pub fn is_dmabuf(&self) -> bool {
        matches!(self.mapping, Mapping::DmaBuf(_))
    }

    /// Runs an empty CPU access bracket: a read bracket invalidates stale
    /// lines before hardware-written data is read, a write bracket flushes
    /// CPU writes for hardware readers.
    pub fn sync(&mut self, direction: SyncDirection) -> Result<()> {
        match direction {
            SyncDirection::Invalidate => self.cpu_read(|_| ()),
            SyncDirection::Flush => self.cpu_write(|_| ()),
        }
    }

    /// Runs `f` over the buffer contents bracketed by a read-side
    /// begin/end cache sync.
    pub fn cpu_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        match &self.mapping {
            Mapping::DmaBuf(mem) => {
                let f = Cell::new(Some(f));
                mem.read(
                    |data: &[u8], _: Option<()>| {
                        let f = f.take().ok_or("buffer access ran twice")?;
                        Ok(f(data))
                    },
                    None,
                )
                .map_err(|e| Error::Sync(e.to_string()))
            }
            Mapping::Coherent { ptr, len } => {
                trace!("fd {} is cache-coherent, sync skipped", self.raw_fd());
                Ok(f(unsafe { from_raw_parts(*ptr, *len) }))
            }
        }
    }

    /// Runs `f` over the buffer contents bracketed by a write-side
    /// begin/end cache sync, leaving the data flushed for hardware readers.
    pub fn cpu_write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let fd = self.fd.as_raw_fd();
        match &mut self.mapping {
            Mapping::DmaBuf(mem) => {
                let f = Cell::new(Some(f));
                let out = Cell::new(None);
                mem.write(
                    |data: &mut [u8], _: Option<()>| {
                        let f = f.take().ok_or("buffer access ran twice")?;
                        out.set(Some(f(data)));
                        Ok(())
                    },
                    None,
                )
                .map_err(|e| Error::Sync(e.to_string()))?;
                out.take()
                    .ok_or_else(|| Error::Sync("buffer access did not run".into()))
            }
            Mapping::Coherent { ptr, len } => {
                trace!("fd {} is cache-coherent, sync skipped", fd);
                Ok(f(unsafe { from_raw_parts_mut(*ptr, *len) }))
            }
        }
    }

    /// Unmaps the buffer and closes its descriptor.
    pub fn release(mut self) -> Result<()> {
        self.unmap().map_err(|source| Error::Map {
            len: self.len,
            source,
        })
    }

    fn unmap(&mut self) -> io::Result<()> {
        let Mapping::Coherent { ptr, len } = &mut self.mapping else {
            // Unmapped by `MappedDmaBuf` when dropped.
            return Ok(());
        };
        if ptr.is_null() {
            return Ok(());
        }
        let ret = unsafe { libc::munmap(ptr.cast::<c_void>(), *len) };
        *ptr = null_mut();
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn zero_length() -> Error {
    Error::Map {
        len: 0,
        source: io::Error::new(io::ErrorKind::InvalidInput, "zero length buffer"),
    }
}

impl Drop for PhysicalBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("unmap of fd {} failed: {}", self.fd.as_raw_fd(), e);
        }
    }
}

impl fmt::Debug for PhysicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PhysicalBuffer")
            .field("fd", &self.fd.as_raw_fd())
            .field("len", &self.len)
            .finish()
    }
}

impl fmt::Display for PhysicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} bytes fd:{}", self.len, self.fd.as_raw_fd())
    }
}
