//! Task-level wiring: spill arbitration, reserve handover, isolation

use memtarget::{
    targets, Error, MemoryConfig, MemoryTarget, Result, TaskId, TaskMemoryAllocator,
    TaskMemoryContext, TaskScopedTarget,
};
use std::thread;

fn config(capacity: i64, ratio: f64) -> MemoryConfig {
    MemoryConfig {
        task_capacity_bytes: capacity,
        over_acquire_ratio: ratio,
        throw_on_oom: false,
    }
}

fn repaying_spiller(target: &dyn MemoryTarget, size: i64) -> Result<i64> {
    let held = target.used_bytes();
    if held == 0 {
        return Ok(0);
    }
    target.repay(size.min(held))
}

#[test]
fn test_reserve_is_handed_over_to_non_spillable_phase() {
    let ctx = TaskMemoryContext::new(TaskId::new(1), config(300, 1.0)).unwrap();

    // Build phase is over: the operator itself can no longer spill.
    let build = ctx.operator_target("build", None).unwrap();
    assert_eq!(build.borrow(100).unwrap(), 100);
    assert_eq!(ctx.used_bytes(), 200);

    // The probe side needs 150 with only 100 free; the reserve covers the gap.
    let probe = ctx.new_consumer("probe", None).unwrap();
    assert_eq!(probe.borrow(150).unwrap(), 150);
    assert_eq!(build.used_bytes(), 150);
    assert_eq!(ctx.used_bytes(), 300);

    // Repaying drains whatever is left of the reserve.
    assert_eq!(build.repay(100).unwrap(), 100);
    assert_eq!(build.used_bytes(), 0);
    assert_eq!(ctx.used_bytes(), 150);
}

#[test]
fn test_without_reserve_the_probe_is_starved() {
    let ctx = TaskMemoryContext::new(TaskId::new(1), config(300, 0.0)).unwrap();
    let build = ctx.operator_target("build", None).unwrap();
    assert_eq!(build.borrow(200).unwrap(), 200);
    let probe = ctx.new_consumer("probe", None).unwrap();
    // Partial grant is backpressure, not an error.
    assert_eq!(probe.borrow(150).unwrap(), 100);
}

#[test]
fn test_spillable_operator_gives_way() {
    let ctx = TaskMemoryContext::new(TaskId::new(1), config(1000, 0.0)).unwrap();
    let sort = ctx
        .new_consumer("sort", Some(Box::new(repaying_spiller)))
        .unwrap();
    let agg = ctx.new_consumer("agg", None).unwrap();

    assert_eq!(sort.borrow(900).unwrap(), 900);
    assert_eq!(agg.borrow(500).unwrap(), 500);
    assert_eq!(sort.used_bytes(), 500);
    assert_eq!(ctx.used_bytes(), 1000);
}

#[test]
fn test_throw_on_oom_chain() {
    let cfg = MemoryConfig {
        throw_on_oom: true,
        ..config(100, 0.0)
    };
    let ctx = TaskMemoryContext::new(TaskId::new(1), cfg).unwrap();
    let op = ctx.operator_target("join", None).unwrap();
    assert_eq!(op.borrow(80).unwrap(), 80);
    let err = op.borrow(40).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { requested: 40, granted: 20, .. }));
    // The partial grant was handed back.
    assert_eq!(ctx.used_bytes(), 80);
}

#[test]
fn test_task_stats_cover_every_consumer() {
    let ctx = TaskMemoryContext::new(TaskId::new(1), config(10_000, 0.5)).unwrap();
    let op = ctx.operator_target("window", None).unwrap();
    op.borrow(400).unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.current, 600);
    assert_eq!(stats.peak, 600);
    assert_eq!(stats.children.len(), 2);
    let currents: Vec<i64> = stats.children.values().map(|c| c.current).collect();
    assert!(currents.contains(&400));
    assert!(currents.contains(&200));
    assert_eq!(ctx.stats(), stats);

    let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
    assert_eq!(json["current"], 600);
}

#[test]
fn test_dropping_targets_returns_memory() {
    let ctx = TaskMemoryContext::new(TaskId::new(1), config(10_000, 0.5)).unwrap();
    {
        let op = ctx.operator_target("scratch", None).unwrap();
        op.borrow(1000).unwrap();
        assert_eq!(ctx.used_bytes(), 1500);
    }
    assert_eq!(ctx.used_bytes(), 0);
    assert!(ctx.manager().consumer_usage().is_empty());
}

#[test]
fn test_tasks_are_isolated() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let ctx = TaskMemoryContext::new(TaskId::new(i), config(1_000, 0.5)).unwrap();
                let op = ctx.operator_target(format!("op-{i}"), None).unwrap();
                for _ in 0..500 {
                    let granted = op.borrow(400).unwrap();
                    assert_eq!(granted, 400);
                    assert_eq!(ctx.used_bytes(), 600);
                    op.repay(granted).unwrap();
                    assert_eq!(ctx.used_bytes(), 0);
                }
                ctx.manager().task_id()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().expect("task panicked"), TaskId::new(i as u64));
    }
}

#[test]
fn test_factory_keeps_targets_in_one_task() {
    let ctx = TaskMemoryContext::new(TaskId::new(3), config(1_000, 0.0)).unwrap();
    let leaf = targets::host_backed(ctx.allocator(), "leaf", None).unwrap();
    let wrapped = targets::over_acquire(leaf, 0.25).unwrap();
    let guarded = targets::throw_on_oom(wrapped);
    guarded.borrow(400).unwrap();
    assert_eq!(ctx.used_bytes(), 500);
    let alloc = guarded.task_allocator().upgrade().unwrap();
    assert_eq!(alloc.task_id(), TaskId::new(3));
}
