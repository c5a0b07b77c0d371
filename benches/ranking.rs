use std::net::{IpAddr, Ipv4Addr};

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use threat_mitigation_service::core::collector::{parse_counters, rank_samples, top_talkers, TrafficSample};

fn samples(count: u32) -> Vec<TrafficSample> {
    let now = Utc::now();
    (0..count)
        .map(|i| TrafficSample {
            address: IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)),
            // Many ties so the packet and address tie-breaks are exercised
            bytes: u64::from(i % 64) * 1500,
            packets: u64::from(i % 7),
            window_start: now,
            window_end: now,
        })
        .collect()
}

fn listing(count: u32) -> String {
    let elems: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{"elem":{{"val":"{}","counter":{{"packets":{},"bytes":{}}}}}}}"#,
                Ipv4Addr::from(0x0a00_0000 + i),
                i % 7,
                (i % 64) * 1500
            )
        })
        .collect();
    format!(
        r#"{{"nftables":[{{"set":{{"family":"inet","name":"src_acct","table":"tms_mon","elem":[{}]}}}}]}}"#,
        elems.join(",")
    )
}

fn ranking_benchmark(c: &mut Criterion) {
    let base = samples(10_000);
    c.bench_function("rank_samples_10k", |b| {
        b.iter(|| {
            let mut batch = base.clone();
            rank_samples(&mut batch);
            black_box(top_talkers(&batch, 10))
        })
    });

    let text = listing(10_000);
    c.bench_function("parse_counters_10k", |b| {
        b.iter(|| black_box(parse_counters(black_box(&text))))
    });
}

criterion_group!(benches, ranking_benchmark);
criterion_main!(benches);
