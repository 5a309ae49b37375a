//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Performance benchmarks for the forward protocol codec and handshake
//! digests: the two hot paths a high-throughput client/server exercise on
//! every chunk.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fluent_forward::codec::{decode_entry_frame, encode_entries, EventMode};
use fluent_forward::event_time::EventTime;
use fluent_forward::record::Record;
use std::time::Duration;

const ENTRY_COUNTS: &[usize] = &[1, 10, 100, 1000];

fn sample_entries(count: usize) -> Vec<(EventTime, Record)> {
    (0..count)
        .map(|i| {
            let mut record = Record::new();
            record.insert("message", format!("log line number {i} with a bit of text"));
            record.insert("severity", "info");
            (EventTime::from_epoch(1_700_000_000 + i as u64, 0).unwrap(), record)
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_entries");

    for mode in [
        EventMode::Forward,
        EventMode::PackedForward,
        EventMode::CompressedPackedForward,
    ] {
        for &count in ENTRY_COUNTS {
            let entries = sample_entries(count);
            group.throughput(Throughput::Elements(count as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{mode:?}"), count),
                &entries,
                |b, entries| {
                    b.iter(|| {
                        let bytes =
                            encode_entries(mode, "bench.tag", black_box(entries), None).unwrap();
                        black_box(bytes);
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_entry_frame");

    for mode in [
        EventMode::Forward,
        EventMode::PackedForward,
        EventMode::CompressedPackedForward,
    ] {
        for &count in ENTRY_COUNTS {
            let entries = sample_entries(count);
            let bytes = encode_entries(mode, "bench.tag", &entries, None).unwrap();
            let value = rmpv::decode::read_value(&mut std::io::Cursor::new(&bytes)).unwrap();

            group.throughput(Throughput::Elements(count as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{mode:?}"), count),
                &value,
                |b, value| {
                    b.iter(|| {
                        let frame = decode_entry_frame(black_box(value)).unwrap();
                        black_box(frame);
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_event_time_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_time");
    let et = EventTime::from_epoch(1_700_000_000, 123_456_789).unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(et.encode()));
    });

    let bytes = et.encode();
    group.bench_function("decode", |b| {
        b.iter(|| black_box(EventTime::decode(black_box(&bytes)).unwrap()));
    });

    group.finish();
}

fn bench_handshake_digests(c: &mut Criterion) {
    use fluent_forward::auth::{password_hexdigest, shared_key_hexdigest};

    let mut group = c.benchmark_group("handshake_digests");
    let nonce = vec![0u8; 16];
    let salt = vec![1u8; 16];

    group.bench_function("shared_key_hexdigest", |b| {
        b.iter(|| {
            black_box(shared_key_hexdigest(
                black_box(&salt),
                black_box("client-host"),
                black_box(&nonce),
                black_box(b"shared-secret"),
            ))
        });
    });

    group.bench_function("password_hexdigest", |b| {
        b.iter(|| {
            black_box(password_hexdigest(
                black_box(&salt),
                black_box("alice"),
                black_box("hunter2"),
            ))
        });
    });

    group.finish();
}

fn configure_criterion() -> Criterion {
    let is_fast = std::env::var("BENCH_FAST").is_ok();

    if is_fast {
        Criterion::default()
            .measurement_time(Duration::from_secs(2))
            .sample_size(20)
            .warm_up_time(Duration::from_secs(1))
    } else {
        Criterion::default()
            .measurement_time(Duration::from_secs(5))
            .sample_size(50)
            .warm_up_time(Duration::from_secs(1))
    }
}

criterion_group!(
    name = benches;
    config = configure_criterion();
    targets = bench_encode, bench_decode, bench_event_time_roundtrip, bench_handshake_digests
);
criterion_main!(benches);
