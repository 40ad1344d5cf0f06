use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logwatch::reader::event::LogEvent;
use logwatch::reader::parse::AccessLogParser;
use logwatch::stat::{by_request_count, StatisticAggregator, StatisticBuckets};

const LINE: &str =
    "127.0.0.1 - james [09/May/2018:16:00:39 +0000] \"GET /report/daily HTTP/1.0\" 200 123";

const SECTIONS: [&str; 8] = ["api", "report", "user", "shop", "blog", "wiki", "", "static"];

fn events(count: usize) -> Vec<LogEvent> {
    (0..count)
        .map(|i| {
            LogEvent::new(
                1_525_881_600_000 + (i as i64) * 7,
                SECTIONS[i % SECTIONS.len()],
                Some(100 + i as u64 % 900),
            )
        })
        .collect()
}

fn bench_parse_line(c: &mut Criterion) {
    let parser = AccessLogParser::default();

    c.bench_function("parse/access_log_line", |b| {
        b.iter(|| parser.parse(black_box(LINE)).expect("parse line"))
    });
}

fn bench_accept(c: &mut Criterion) {
    let events = events(1_024);
    let aggregator = StatisticAggregator::new(100, by_request_count);

    c.bench_function("aggregator/accept_1024", |b| {
        b.iter(|| {
            for event in &events {
                aggregator.accept(black_box(event));
            }
        })
    });
}

fn bench_reduce(c: &mut Criterion) {
    let events = events(100_000);
    let buckets = StatisticBuckets::new(
        Duration::from_millis(100),
        100,
        by_request_count,
        Arc::new(AtomicUsize::new(0)),
    )
    .expect("buckets");
    for event in &events {
        buckets.accept(event);
    }
    let until = events.last().map_or(0, |e| e.timestamp_millis);

    c.bench_function("buckets/reduce_latest_10s", |b| {
        b.iter(|| buckets.reduce_latest(black_box(until), Duration::from_secs(10)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_line(c);
    bench_accept(c);
    bench_reduce(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
