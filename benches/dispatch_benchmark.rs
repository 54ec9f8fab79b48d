//! Performance benchmarks for Tether
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::File;
use std::io::{Read, Write};
use tempfile::TempDir;
use tether::connection::EndOfStream;
use tether::transport::LocalCopy;
use tether::{Address, ConnectOptions, Connection, FileTransfer, Registry, Result};

/// Create a test file of the specified size
fn create_test_file(dir: &std::path::Path, name: &str, size: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();

    let chunk_size = 64 * 1024;
    let chunk: Vec<u8> = (0..chunk_size).map(|i| (i % 256) as u8).collect();
    let mut remaining = size;

    while remaining > 0 {
        let to_write = remaining.min(chunk_size);
        file.write_all(&chunk[..to_write]).unwrap();
        remaining -= to_write;
    }

    path
}

fn null_transport(address: &Address, _options: &ConnectOptions) -> Result<Connection> {
    Ok(Connection::without_stderr(
        address.clone(),
        Box::new(std::io::sink()),
        Box::new(std::io::empty()),
    ))
}

fn bench_address_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_parse");

    for raw in ["local:", "ssh:build01.example.com:2222", "smb:[fe80::1]:445", "daemon:10.0.0.7"] {
        group.bench_with_input(BenchmarkId::from_parameter(raw), raw, |b, raw| {
            b.iter(|| Address::parse(black_box(raw)).unwrap());
        });
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let registry = Registry::new();
    registry.register("null", null_transport).unwrap();
    let address = Address::parse("null:somewhere").unwrap();
    let options = ConnectOptions::new();

    c.bench_function("dispatch_null_transport", |b| {
        b.iter(|| {
            let mut conn = registry.dispatch(black_box(&address), &options).unwrap();
            conn.close().unwrap();
        });
    });

    c.bench_function("dispatch_unknown_scheme", |b| {
        let unknown = Address::parse("nope:x").unwrap();
        b.iter(|| registry.dispatch(black_box(&unknown), &options).is_err());
    });
}

fn bench_stub_stderr(c: &mut Criterion) {
    let mut buf = [0u8; 4096];
    c.bench_function("end_of_stream_read", |b| {
        b.iter(|| EndOfStream.read(black_box(&mut buf)).unwrap());
    });
}

fn bench_local_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_copy");

    for size in [64 * 1024, 1024 * 1024, 16 * 1024 * 1024] {
        let dir = TempDir::new().unwrap();
        let source = create_test_file(dir.path(), "source.bin", size);
        let dest = dir.path().join("dest.bin");

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| LocalCopy.putfile(&source, dest.to_str().unwrap()).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_address_parse,
    bench_dispatch,
    bench_stub_stderr,
    bench_local_copy,
);

criterion_main!(benches);
