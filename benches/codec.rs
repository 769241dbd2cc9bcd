//! Benchmarks for the hot paths of a log download
//!
//! Run with: cargo bench

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sensorboard::codec::{CodecContext, ProcessorConfig, ThresholdMode};
use sensorboard::config::DEFAULT_TICK_PERIOD_MS;
use sensorboard::logging::{parse_entries, DataLogger, LogEntry, LogSlice, TimeKeeper};
use sensorboard::{FirmwareVersion, LoggerId, ProducerId};

fn entries(count: usize, slots: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(count * 9);
    for i in 0..count {
        let entry = LogEntry {
            slot: (i % slots as usize) as u8,
            reset_uid: 0,
            tick: (i / slots as usize) as u32,
            payload: (i as u32).to_le_bytes(),
        };
        body.extend_from_slice(&entry.to_bytes());
    }
    body
}

fn bench_processor_config(c: &mut Criterion) {
    let mut group = c.benchmark_group("processor_config");
    let ctx = CodecContext::new(FirmwareVersion::new(1, 5, 0), 2);
    let config = ProcessorConfig::Threshold {
        size: 2,
        signed: true,
        mode: ThresholdMode::Absolute,
        boundary: 500,
        hysteresis: 50,
    };
    let encoded = config.encode(&ctx).unwrap_or_default();

    group.bench_function("encode_threshold", |b| {
        b.iter(|| black_box(config.encode(&ctx)));
    });
    group.bench_function("decode_threshold", |b| {
        b.iter(|| black_box(ProcessorConfig::decode(&encoded, &ctx)));
    });

    group.finish();
}

fn bench_entry_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_parsing");

    for count in [2usize, 16, 256].iter() {
        let body = entries(*count, 1);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("parse_entries", count), &body, |b, body| {
            b.iter(|| black_box(parse_entries(body)));
        });
    }

    group.finish();
}

fn bench_multi_slot_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_slot_merge");

    for slots in [1u8, 2, 3].iter() {
        let parsed = parse_entries(&entries(300, *slots));
        let slices: Vec<LogSlice> = (0..*slots)
            .map(|slot| LogSlice {
                slot,
                start: slot as usize * 4,
                length: 4,
            })
            .collect();

        group.throughput(Throughput::Elements(parsed.len() as u64));
        group.bench_with_input(BenchmarkId::new("accept", slots), &parsed, |b, parsed| {
            b.iter(|| {
                let mut logger = DataLogger::new(LoggerId(0), ProducerId(0), slices.clone());
                for entry in parsed {
                    black_box(logger.accept(*entry));
                }
            });
        });
    }

    group.finish();
}

fn bench_tick_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_conversion");
    let now = Utc::now();
    let mut time = TimeKeeper::new(DEFAULT_TICK_PERIOD_MS);
    time.on_time_reply(0, 0, now);

    group.bench_function("convert_monotonic", |b| {
        let mut tick = 0u32;
        b.iter(|| {
            tick = tick.wrapping_add(7);
            black_box(time.convert(0, tick, now));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_processor_config,
    bench_entry_parsing,
    bench_multi_slot_merge,
    bench_tick_conversion
);
criterion_main!(benches);
