//! Throughput benchmarks for the bus fast paths and the parked pipeline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use corobus::lab::Lab;
use corobus::Bus;

fn bench_try_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_pingpong");
    group.throughput(Throughput::Elements(1));

    group.bench_function("cap1", |b| {
        let bus = Bus::new();
        let id = bus.open(1);
        b.iter(|| {
            bus.try_send(id, black_box(7)).expect("slot free");
            black_box(bus.try_recv(id).expect("message queued"));
        });
    });

    group.finish();
}

fn bench_batch_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_transfer");

    for batch in [8usize, 64, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let bus = Bus::new();
            let id = bus.open(batch);
            let payload: Vec<u32> = (0..batch as u32).collect();
            let mut sink = vec![0u32; batch];
            b.iter(|| {
                bus.try_send_many(id, black_box(&payload)).expect("fits");
                bus.try_recv_many(id, black_box(&mut sink)).expect("drains");
            });
        });
    }

    group.finish();
}

fn bench_open_close_churn(c: &mut Criterion) {
    c.bench_function("open_close_churn", |b| {
        let bus = Bus::new();
        b.iter(|| {
            let id = bus.open(black_box(4));
            bus.close(id);
        });
    });
}

fn bench_parked_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("parked_pipeline");
    const MESSAGES: u32 = 256;
    group.throughput(Throughput::Elements(u64::from(MESSAGES)));

    // Capacity far below the message count, so both sides park repeatedly
    // and every transfer exercises the wakeup protocol.
    group.bench_function("cap4", |b| {
        b.iter(|| {
            let bus = Bus::new();
            let id = bus.open(4);
            let mut lab = Lab::new();

            let producer = bus.clone();
            lab.spawn(async move {
                for n in 0..MESSAGES {
                    producer.send(id, n).await.expect("pipeline send");
                }
            });
            let consumer = bus.clone();
            lab.spawn(async move {
                for _ in 0..MESSAGES {
                    black_box(consumer.recv(id).await.expect("pipeline recv"));
                }
            });

            lab.run_until_stalled();
            assert!(lab.is_quiescent());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_try_pingpong,
    bench_batch_transfer,
    bench_open_close_churn,
    bench_parked_pipeline
);
criterion_main!(benches);
