//! Change matching benchmarks

use criterion::{Criterion, criterion_group, criterion_main};
use evo_common::prelude::*;
use evo_hal::{Hal, ThreadOptions};
use std::hint::black_box;

/// Group of `n` float signals, all monitored.
fn group_of(hal: &Hal, n: usize) {
    hal.group_new("bench", 0, GROUP_REPORT_ON_CHANGE | GROUP_MONITOR_ALL_MEMBERS)
        .unwrap();
    for i in 0..n {
        let name = format!("sig.{i:03}");
        hal.signal_new(&name, HalType::Float).unwrap();
        hal.member_new("bench", &name, 0, 0).unwrap();
    }
}

/// Benchmark matching a 100 member group with no changes
fn bench_match_unchanged(c: &mut Criterion) {
    let hal = Hal::anonymous().unwrap();
    group_of(&hal, 100);
    let mut cg = hal.compile_group("bench").unwrap();

    c.bench_function("match_100_unchanged", |b| {
        b.iter(|| black_box(cg.match_changes()));
    });
}

/// Benchmark matching and reporting with one changed member per round
fn bench_match_one_change(c: &mut Criterion) {
    let hal = Hal::anonymous().unwrap();
    group_of(&hal, 100);
    let mut cg = hal.compile_group("bench").unwrap();
    let mut v = 0.0;

    c.bench_function("match_report_100_one_change", |b| {
        b.iter(|| {
            v += 1.0;
            hal.signal_set("sig.050", HalValue::Float(v)).unwrap();
            let n = cg.match_changes();
            cg.report(false, |ev| {
                black_box(ev);
                Ok::<(), HalError>(())
            })
            .unwrap();
            black_box(n)
        });
    });
}

/// Benchmark one manual thread cycle with an empty function list
fn bench_thread_cycle(c: &mut Criterion) {
    let hal = Hal::anonymous().unwrap();
    hal.create_thread("bench", ThreadOptions::new(1_000_000)).unwrap();
    hal.start_threads().unwrap();

    c.bench_function("thread_cycle_empty", |b| {
        b.iter(|| hal.run_thread_once("bench").unwrap());
    });
}

criterion_group!(benches, bench_match_unchanged, bench_match_one_change, bench_thread_cycle);
criterion_main!(benches);
