//! Benchmarks for the Lua sandbox.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lua_sandbox_rs::prelude::*;

/// Benchmark sandbox creation with and without libraries.
fn bench_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("creation");

    group.bench_function("bare", |b| {
        b.iter(|| black_box(LuaSandbox::new(0).unwrap()));
    });

    group.bench_function("safe_libraries", |b| {
        b.iter(|| {
            let config = SandboxConfig::builder()
                .memory_limit(1024 * 1024)
                .libraries(StdLib::SAFE)
                .build();
            black_box(LuaSandbox::with_config(config).unwrap())
        });
    });

    group.finish();
}

/// Benchmark compiling and running small chunks.
fn bench_execution(c: &mut Criterion) {
    let config = SandboxConfig::builder()
        .memory_limit(4 * 1024 * 1024)
        .libraries(StdLib::SAFE)
        .build();
    let sandbox = LuaSandbox::with_config(config).unwrap();

    let mut group = c.benchmark_group("execution");

    // Simple arithmetic
    group.bench_function("return_sum", |b| {
        b.iter(|| black_box(sandbox.eval("return 1 + 1").unwrap()));
    });

    // Loop computation
    group.bench_function("loop_100", |b| {
        b.iter(|| {
            black_box(
                sandbox
                    .eval("local s = 0 for i = 1, 100 do s = s + i end return s")
                    .unwrap(),
            )
        });
    });

    // String manipulation
    group.bench_function("string_ops", |b| {
        b.iter(|| black_box(sandbox.eval("return #string.rep('hello', 100)").unwrap()));
    });

    group.finish();
}

/// Benchmark moving values across the boundary.
fn bench_marshalling(c: &mut Criterion) {
    let sandbox = LuaSandbox::new(0).unwrap();
    let payload = "x".repeat(1024);

    let mut group = c.benchmark_group("marshalling");

    group.bench_function("push_pop_number", |b| {
        b.iter(|| {
            sandbox.push(black_box(42.5)).unwrap();
            black_box(sandbox.pop().unwrap())
        });
    });

    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("push_pop_string_1k", |b| {
        b.iter(|| {
            sandbox.push(payload.as_str()).unwrap();
            black_box(sandbox.pop().unwrap())
        });
    });

    group.finish();
}

/// Benchmark table reads through a handle versus eager copies.
fn bench_tables(c: &mut Criterion) {
    let sandbox = LuaSandbox::new(0).unwrap();

    let mut group = c.benchmark_group("tables");

    for size in [10, 100, 1000].iter() {
        let results = sandbox
            .eval(format!(
                "local t = {{}} for i = 1, {size} do t[i] = {{id = i}} end return t"
            ))
            .unwrap();
        let table = results[0].as_table().unwrap().clone();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("handle_get", size), size, |b, &size| {
            b.iter(|| black_box(table.get(size).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("eager_copy", size), size, |b, _| {
            b.iter(|| black_box(table.to_map().unwrap()));
        });
    }

    group.finish();
}

/// Benchmark how the memory ceiling affects an allocation-heavy chunk.
fn bench_memory_limits(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_limits");
    group.sample_size(10);

    for memory_mb in [1, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::new("allocation", format!("{}MB", memory_mb)),
            memory_mb,
            |b, &memory_mb| {
                let sandbox = LuaSandbox::new(memory_mb * 1024 * 1024).unwrap();

                b.iter(|| {
                    // Allocate some memory but stay within limits
                    let result = sandbox
                        .eval("local data = {} for i = 1, 10000 do data[i] = i end return #data")
                        .unwrap();
                    black_box(result)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_creation,
    bench_execution,
    bench_marshalling,
    bench_tables,
    bench_memory_limits,
);

criterion_main!(benches);
