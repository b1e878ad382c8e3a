//! Benchmarks for batch analysis.

use codonflow::analysis::{benjamini_hochberg, correct, HypothesisTester, ModelRun};
use codonflow::core::UnitId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::PathBuf;

fn p_values(n: usize) -> Vec<f64> {
    (0..n).map(|i| ((i * 7919) % n) as f64 / n as f64).collect()
}

fn run(unit: &UnitId, label: &str, lnl: f64, np: u32) -> ModelRun {
    ModelRun {
        unit: unit.clone(),
        label: label.to_string(),
        log_likelihood: lnl,
        parameter_count: np,
        source: PathBuf::from("bench.out"),
        foreground: None,
    }
}

fn correction_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("benjamini_hochberg");
    for n in [1_000, 20_000, 100_000] {
        let p = p_values(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &p, |b, p| {
            b.iter(|| benjamini_hochberg(black_box(p)));
        });
    }
    group.finish();

    let results: Vec<_> = (0..5_000)
        .map(|i| {
            let unit = UnitId::new(format!("gene{i}"));
            let delta = (i % 17) as f64 * 0.7;
            HypothesisTester::test(&run(&unit, "M7", -1000.0, 3), &run(&unit, "M8", -1000.0 + delta, 5))
        })
        .collect::<Result<_, _>>()
        .unwrap_or_default();
    c.bench_function("correct_5000_units", |b| {
        b.iter(|| correct(black_box(&results)));
    });
}

criterion_group!(benches, correction_benchmark);
criterion_main!(benches);
