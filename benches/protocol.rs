use std::hint::black_box;

use bytes::{BufMut, BytesMut};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use pgvictoria::executor;
use pgvictoria::messages::frontend;

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    let queries = vec![
        ("short", "SELECT 1"),
        (
            "medium",
            "SELECT * FROM pg_stat_replication WHERE state = 'streaming'",
        ),
        (
            "long",
            "SELECT slot_name, plugin, slot_type, datoid, active, restart_lsn, confirmed_flush_lsn FROM pg_replication_slots WHERE slot_type = 'physical' AND active ORDER BY slot_name LIMIT 100",
        ),
    ];

    for (name, query) in queries {
        group.bench_with_input(BenchmarkId::from_parameter(name), &query, |b, &query| {
            b.iter(|| frontend::query(black_box(query)).unwrap());
        });
    }

    group.finish();
}

fn bench_startup(c: &mut Criterion) {
    c.bench_function("startup", |b| {
        b.iter(|| frontend::startup(black_box("replicator"), black_box("postgres"), true));
    });
}

fn bench_standby_status_update(c: &mut Criterion) {
    c.bench_function("standby_status_update", |b| {
        b.iter(|| {
            frontend::standby_status_update_at(
                black_box(0x0000000102030405),
                black_box(0x0000000102030400),
                black_box(0x0000000102030300),
                black_box(812345678),
            )
        });
    });
}

fn bench_has_message(c: &mut Criterion) {
    let mut data = BytesMut::new();

    // A run of DataRow frames ahead of the terminator.
    for _ in 0..512 {
        data.put_u8(b'D');
        frontend::frame(&mut data, |b| {
            b.put_i16(1);
            b.put_i32(8);
            b.put_slice(b"01234567");
        });
    }
    data.put_u8(b'Z');
    frontend::frame(&mut data, |b| b.put_u8(b'I'));

    c.bench_function("has_message", |b| {
        b.iter(|| executor::has_message(black_box(b'Z'), black_box(&data)));
    });
}

criterion_group!(
    benches,
    bench_query,
    bench_startup,
    bench_standby_status_update,
    bench_has_message
);
criterion_main!(benches);
