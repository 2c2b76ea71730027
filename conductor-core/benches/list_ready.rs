//! Ready-Set Benchmarks
//!
//! Measures how readiness evaluation scales with project size:
//! - `ready_tasks` over linear chains and wide fan-in graphs (100, 1000, 10000 tasks)
//! - Cycle detection on a long dependency chain
//!
//! Uses criterion.rs with the default warm-up.

use std::collections::BTreeSet;

use conductor_core::task::{ready_tasks, TaskIndex};
use conductor_types::{Task, TaskLifecycleStatus, TaskSessionStatus};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

// ============================================================================
// Graph Generation Helpers
// ============================================================================

/// Linear chain: task-0 <- task-1 <- ... <- task-n, first half completed.
fn linear_chain(size: usize) -> Vec<Task> {
    (0..size)
        .map(|i| {
            let mut task = Task::new("bench", format!("task-{}", i));
            task.id = format!("task-{}", i);
            if i > 0 {
                task.dependencies = BTreeSet::from([format!("task-{}", i - 1)]);
            }
            if i < size / 2 {
                task.lifecycle_status = TaskLifecycleStatus::Completed;
            }
            task
        })
        .collect()
}

/// Wide graph: every task depends on the same ten completed roots, every
/// third one is assigned to a session.
fn fan_in(size: usize) -> Vec<Task> {
    let roots = 10.min(size);
    (0..size)
        .map(|i| {
            let mut task = Task::new("bench", format!("task-{}", i));
            task.id = format!("task-{}", i);
            if i < roots {
                task.lifecycle_status = TaskLifecycleStatus::Completed;
            } else {
                task.dependencies = (0..roots).map(|r| format!("task-{}", r)).collect();
            }
            if i % 3 == 0 {
                task.session_ids.insert("s1".into());
                task.per_session_status
                    .insert("s1".into(), TaskSessionStatus::Working);
            }
            task
        })
        .collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_ready_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_tasks");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));

        let chain = linear_chain(size);
        group.bench_with_input(BenchmarkId::new("linear", size), &chain, |b, tasks| {
            b.iter(|| ready_tasks(black_box(tasks), false))
        });

        let wide = fan_in(size);
        group.bench_with_input(BenchmarkId::new("fan_in", size), &wide, |b, tasks| {
            b.iter(|| ready_tasks(black_box(tasks), false))
        });
    }

    group.finish();
}

fn bench_cycle_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_cycle");

    for size in [100usize, 1_000] {
        let chain = linear_chain(size);
        let index = TaskIndex::new(&chain);
        let closing = vec![format!("task-{}", size - 1)];
        group.bench_with_input(BenchmarkId::new("closing_edge", size), &closing, |b, deps| {
            b.iter(|| index.dependency_cycle(black_box("task-0"), black_box(deps)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ready_tasks, bench_cycle_detection);
criterion_main!(benches);
