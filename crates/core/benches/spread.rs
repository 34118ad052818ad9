use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use spread_core::{ExchangeId, PriceSample, SpreadCalculator};

fn bench_compute(c: &mut Criterion) {
    let start = Utc::now();
    let calc = SpreadCalculator::default();
    let samples: Vec<PriceSample> = (0..8)
        .map(|i| PriceSample::new("BTC", ExchangeId::new(format!("ex{i}")), 50_000.0 + i as f64 * 10.0, start))
        .collect();

    c.bench_function("spread_compute_8_exchanges", |b| {
        b.iter(|| calc.compute(black_box("BTC"), start, black_box(&samples)))
    });
}

criterion_group!(benches, bench_compute);
criterion_main!(benches);
