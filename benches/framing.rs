//! Framing and pattern-matching benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use switchboard::{DataFramer, NewlineFramer};

fn framing_benchmark(c: &mut Criterion) {
    let mut data = String::new();
    for i in 0..256 {
        data.push_str(&format!("[APP] sensor {} reading {}\r\n", i % 8, i * 37));
    }
    // Leave a trailing partial line like a real read would.
    data.push_str("[APP] partial tail without newline");

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(data.len() as u64));

    let framer = NewlineFramer::new();
    group.bench_function("newline_split", |b| {
        b.iter(|| {
            let lines = framer.get_lines(black_box(&data), 0, None).unwrap();
            black_box(lines)
        })
    });

    group.bench_function("newline_split_resumed", |b| {
        // Rescanning after 4 KiB already framed, as the log filter does.
        let begin = 4096;
        b.iter(|| {
            let lines = framer.get_lines(black_box(&data), begin, None).unwrap();
            black_box(lines)
        })
    });

    group.finish();
}

fn expect_window_benchmark(c: &mut Criterion) {
    let window: String = (0..50)
        .map(|i| format!("boot stage {} complete\n", i))
        .collect::<String>()
        + "login: admin\n";

    let mut group = c.benchmark_group("expect_window");
    group.throughput(Throughput::Bytes(window.len() as u64));

    group.bench_function("regex_search", |b| {
        let re = regex::Regex::new(r"(?sm)login: (\w+)").unwrap();
        b.iter(|| {
            let found = re.find(black_box(&window));
            black_box(found)
        })
    });

    group.bench_function("regex_search_miss", |b| {
        let re = regex::Regex::new(r"(?sm)kernel panic").unwrap();
        b.iter(|| {
            let found = re.find(black_box(&window));
            black_box(found)
        })
    });

    group.finish();
}

criterion_group!(benches, framing_benchmark, expect_window_benchmark);
criterion_main!(benches);
