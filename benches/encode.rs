// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rkstream::{
    transport::{DatagramSink, Transport},
    video::{PacketAssembler, ScratchPolicy, DEFAULT_SCRATCH_CAPACITY},
};
use std::{hint::black_box, io};

struct NullSink;

impl DatagramSink for NullSink {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<usize> {
        Ok(black_box(payload).len())
    }
}

pub fn benchmark_assemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble");
    let unit = vec![0x5a; 16 * 1024];
    for frame in [64 * 1024, 256 * 1024, 1024 * 1024] {
        let units = frame / unit.len();
        let mut assembler = PacketAssembler::new(DEFAULT_SCRATCH_CAPACITY, ScratchPolicy::Fixed);
        group.throughput(Throughput::Bytes(frame as u64));
        group.bench_with_input(BenchmarkId::from_parameter(frame), &units, |b, &units| {
            b.iter(|| {
                assembler.begin();
                for i in 0..units {
                    assembler.push(&unit, i == 0);
                }
                black_box(assembler.finish().unwrap().0.len())
            })
        });
    }
    group.finish();
}

pub fn benchmark_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    let frame = vec![0xa5; 256 * 1024];
    for chunk in [512, 1024, 1400, 8192] {
        let mut transport = Transport::new(NullSink, chunk);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &frame, |b, frame| {
            b.iter(|| transport.send_frame(frame))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_assemble, benchmark_chunking);
criterion_main!(benches);
