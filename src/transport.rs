// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Datagram delivery of encoded frames.
//!
//! A frame is cut into fixed-size chunks sent in order, the last chunk
//! holding the remainder. Nothing marks frame boundaries on the wire; the
//! receiver reassembles from the H.264 byte stream itself.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
};
use tracing::{debug, trace, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Where chunks go.
pub trait DatagramSink {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<usize>;
}

impl<T: DatagramSink + ?Sized> DatagramSink for Box<T> {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<usize> {
        (**self).send_datagram(payload)
    }
}

/// A [`UdpSocket`] bound to one destination.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpSink {
    /// Binds an ephemeral local port for sending to `dest`.
    pub fn connect(dest: impl ToSocketAddrs) -> io::Result<Self> {
        let dest = dest.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "destination resolved to nothing")
        })?;
        let bind: SocketAddr = if dest.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        debug!("sending to {} from {}", dest, socket.local_addr()?);
        Ok(Self { socket, dest })
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }
}

impl DatagramSink for UdpSink {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, self.dest)
    }
}

/// Result of sending one frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    pub datagrams: usize,
    pub bytes: usize,
    /// Chunks the sink refused. They are dropped, not retried.
    pub failures: usize,
}

pub struct Transport<S: DatagramSink = UdpSink> {
    sink: S,
    chunk_size: usize,
    total: SendReport,
}

impl<S: DatagramSink> Transport<S> {
    /// A chunk size of zero is treated as one byte.
    pub fn new(sink: S, chunk_size: usize) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
            total: SendReport::default(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Totals across every frame sent so far.
    pub fn total(&self) -> SendReport {
        self.total
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Sends `payload` as `ceil(len / chunk_size)` datagrams in order.
    /// A failed chunk is logged and counted; the rest are still sent.
    pub fn send_frame(&mut self, payload: &[u8]) -> SendReport {
        let mut report = SendReport::default();
        for chunk in payload.chunks(self.chunk_size) {
            match self.sink.send_datagram(chunk) {
                Ok(n) => {
                    report.datagrams += 1;
                    report.bytes += n;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!("dropped {} byte chunk: {}", chunk.len(), e);
                }
            }
        }
        trace!(
            "sent {} bytes in {} datagrams",
            report.bytes,
            report.datagrams
        );

        self.total.datagrams += report.datagrams;
        self.total.bytes += report.bytes;
        self.total.failures += report.failures;
        report
    }
}
