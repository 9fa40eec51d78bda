use std::hint::black_box;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use zumic_channels::{Hub, HubConfig, Subscription};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn hub(rt: &Runtime) -> Hub {
    rt.block_on(Hub::new(
        HubConfig::builder()
            .max_backlog(1000)
            .queue_capacity(1024)
            .build(),
    ))
    .unwrap()
}

fn bench_publish_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_fanout");

    for subscribers in [0usize, 1, 10, 100] {
        let hub = hub(&rt);
        // очереди подписок ограничены ёмкостью и не разбираются
        let _subs: Vec<Subscription> = (0..subscribers)
            .map(|_| rt.block_on(hub.subscribe(["chan"], false)).unwrap())
            .collect();
        let payload = Bytes::from_static(b"payload");

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.to_async(&rt).iter(|| {
                    let hub = hub.clone();
                    let payload = payload.clone();
                    async move {
                        black_box(hub.publish("chan", payload).await.unwrap());
                    }
                })
            },
        );
        rt.block_on(hub.shutdown());
    }
    group.finish();
}

fn bench_subscribe_unsubscribe(c: &mut Criterion) {
    let rt = runtime();
    let hub = hub(&rt);
    c.bench_function("subscribe_unsubscribe", |b| {
        b.to_async(&rt).iter(|| {
            let hub = hub.clone();
            async move {
                let sub = hub.subscribe(["chan"], false).await.unwrap();
                drop(black_box(sub));
            }
        })
    });
}

fn bench_replay(c: &mut Criterion) {
    let rt = runtime();
    let hub = hub(&rt);
    rt.block_on(async {
        for i in 0..1000u32 {
            hub.publish("history", i.to_be_bytes().to_vec()).await.unwrap();
        }
    });

    c.bench_function("subscribe_replay_1000", |b| {
        b.to_async(&rt).iter(|| {
            let hub = hub.clone();
            async move {
                let sub = hub.subscribe(["history"], true).await.unwrap();
                black_box(sub.len());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_publish_fanout,
    bench_subscribe_unsubscribe,
    bench_replay
);
criterion_main!(benches);
