use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tsbridge::bridge::classify::{ClassifiedEvent, Classifier};
use tsbridge::bridge::field::FieldSpec;
use tsbridge::bridge::registry::{UnitKey, UnitLabel};
use tsbridge::bridge::scheduler::SchedulePolicy;
use tsbridge::bridge::table::AggregationTable;
use tsbridge::config::Config;

const TELEMETRY: &[u8] =
    br#"[{"bn":"dht/","bt":1717000000,"n":"temp","u":"Cel","v":21.4},{"n":"hum","v":44.0}]"#;
const ALERT: &[u8] = br#"{"events":[{"status":"ALERT","msg":"bpm high"},{"status":"OK"}]}"#;

fn build_table(keys: usize) -> (AggregationTable, Vec<(UnitKey, UnitLabel)>) {
    let cfg = Config::default();
    let spec = Arc::new(FieldSpec::new(&cfg.fields).expect("spec"));
    let table = AggregationTable::new(
        spec,
        SchedulePolicy {
            min_period: Duration::from_secs(15),
            flush_interval: Duration::from_secs(15),
        },
    );

    let keys = (0..keys)
        .map(|i| {
            let user = format!("user{i}");
            (
                UnitKey::canonical(&user, "Room1").expect("key"),
                UnitLabel::new(&user, "Room1"),
            )
        })
        .collect();

    (table, keys)
}

fn bench_classify(c: &mut Criterion) {
    let classifier = Classifier::new(&Config::default().channels).expect("classifier");

    c.bench_function("classify/telemetry_senml", |b| {
        b.iter(|| {
            classifier
                .classify(black_box("SC/alice/Room1/dht"), black_box(TELEMETRY))
                .expect("classify")
        })
    });

    c.bench_function("classify/alert_events", |b| {
        b.iter(|| {
            classifier
                .classify(black_box("SC/alerts/alice/Room1/bed"), black_box(ALERT))
                .expect("classify")
        })
    });
}

fn bench_apply(c: &mut Criterion) {
    let classifier = Classifier::new(&Config::default().channels).expect("classifier");
    let updates = match classifier
        .classify("SC/alice/Room1/dht", TELEMETRY)
        .expect("classify")
        .map(|c| c.event)
    {
        Some(ClassifiedEvent::Fields(updates)) => updates,
        other => panic!("unexpected event: {other:?}"),
    };

    let (table, keys) = build_table(256);
    let now = Instant::now();
    let mut i = 0usize;

    c.bench_function("table/apply_256_keys", |b| {
        b.iter(|| {
            let (key, label) = &keys[i % keys.len()];
            i = i.wrapping_add(1);
            for update in &updates {
                black_box(table.apply(key, label, update, now));
            }
        })
    });

    c.bench_function("table/collect_due_256_keys", |b| {
        b.iter(|| black_box(table.collect_due(black_box(now)).len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_classify(c);
    bench_apply(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
