// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use bytes::Bytes;
use catloop::collections::BufferDeque;
use criterion::{criterion_group, criterion_main, Criterion};

static CHUNK: [u8; 1024] = [0xa5; 1024];

fn bench_merge_prefix(c: &mut Criterion) {
    c.bench_function("merge_prefix 64x1k", |b| {
        b.iter(|| {
            let mut buf = BufferDeque::new();
            for _ in 0..64 {
                buf.push_back(Bytes::from_static(&CHUNK));
            }
            buf.merge_prefix(65535);
            buf.pop_all()
        })
    });

    c.bench_function("pop_prefix 16 of 64x1k", |b| {
        b.iter(|| {
            let mut buf = BufferDeque::new();
            for _ in 0..64 {
                buf.push_back(Bytes::from_static(&CHUNK));
            }
            let mut out = Vec::new();
            while !buf.is_empty() {
                out.push(buf.pop_prefix((16 * 1024).min(buf.len())));
            }
            out
        })
    });
}

criterion_group!(benches, bench_merge_prefix);
criterion_main!(benches);
