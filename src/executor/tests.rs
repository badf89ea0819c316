//! Executor Module Tests
//!
//! ## Test Scopes
//! - **Governor**: budget enforcement, duplicate detection and the ratchet.
//! - **Scheduler**: routing, fallback, chaining and delayed execution.
//! - **Cyclic Tasks**: schedules survive failing and panicking runs.
//! - **Rejection**: what a saturated pool does under each policy.

#[cfg(test)]
mod tests {
    use crate::error::ClusterError;
    use crate::executor::types::{
        ExecutorType, PoolDescriptor, QueueCapacity, RejectionPolicy, ResourceCaps,
    };
    use crate::executor::{CyclicTaskEnvelope, ResourceGovernor, TaskEnvelope, TaskScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn small(executor_type: ExecutorType) -> PoolDescriptor {
        PoolDescriptor::new(executor_type, 1, 2)
    }

    fn thread_name() -> String {
        std::thread::current().name().unwrap_or_default().to_string()
    }

    fn scheduler_with(pools: &[ExecutorType]) -> TaskScheduler {
        let governor = Arc::new(ResourceGovernor::new(ResourceCaps::default()));
        for executor_type in pools {
            governor.register_pool(small(*executor_type)).unwrap();
        }
        governor.register_scheduled_pool(1, true).unwrap();
        TaskScheduler::new(governor)
    }

    // ============================================================
    // GOVERNOR: Budgets
    // ============================================================

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registration_over_global_core_cap_is_rejected() {
        // ARRANGE: Global core budget of 100
        let caps = ResourceCaps {
            normal_core_total: 100,
            ..ResourceCaps::default()
        };
        let governor = ResourceGovernor::new(caps);

        // ACT
        let first = governor.register_pool(PoolDescriptor::new(ExecutorType::Default, 50, 50));
        let second = governor.register_pool(PoolDescriptor::new(ExecutorType::Archive, 60, 60));

        // ASSERT: First fits, second breaches and leaves no trace
        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(ClusterError::ResourceExceeded {
                requested: 110,
                limit: 100,
                ..
            })
        ));
        assert!(governor.pool(ExecutorType::Archive).is_none());
        assert_eq!(governor.registered_types(), vec![ExecutorType::Default]);
        assert_eq!(governor.accounting().normal_core, 50);
        assert_eq!(governor.accounting().normal_max, 50);

        governor.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registration_over_global_max_cap_is_rejected() {
        let caps = ResourceCaps {
            normal_max_total: 10,
            ..ResourceCaps::default()
        };
        let governor = ResourceGovernor::new(caps);

        governor.register_pool(PoolDescriptor::new(ExecutorType::Default, 1, 6)).unwrap();
        let result = governor.register_pool(PoolDescriptor::new(ExecutorType::Compact, 1, 6));

        assert!(matches!(result, Err(ClusterError::ResourceExceeded { .. })));
        assert_eq!(governor.accounting().normal_core, 1);
        assert_eq!(governor.accounting().normal_max, 6);

        governor.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_pool_caps() {
        let caps = ResourceCaps {
            per_pool_core: 4,
            per_pool_max: 8,
            ..ResourceCaps::default()
        };
        let governor = ResourceGovernor::new(caps);

        let too_many_core = governor.register_pool(PoolDescriptor::new(ExecutorType::Default, 5, 5));
        let too_many_max = governor.register_pool(PoolDescriptor::new(ExecutorType::Default, 2, 9));

        assert!(matches!(too_many_core, Err(ClusterError::ResourceExceeded { .. })));
        assert!(matches!(too_many_max, Err(ClusterError::ResourceExceeded { .. })));
        assert_eq!(governor.accounting().normal_core, 0);
        assert!(governor.registered_types().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_executor_type_is_rejected() {
        let governor = ResourceGovernor::new(ResourceCaps::default());

        governor.register_pool(small(ExecutorType::Default)).unwrap();
        let duplicate = governor.register_pool(small(ExecutorType::Default));

        assert!(matches!(duplicate, Err(ClusterError::DuplicateRegistration { .. })));
        assert_eq!(governor.accounting().normal_core, 1);

        governor.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_only_one_scheduled_pool() {
        let governor = ResourceGovernor::new(ResourceCaps::default());

        assert!(governor.register_scheduled_pool(1, true).is_ok());
        assert!(matches!(
            governor.register_scheduled_pool(1, true),
            Err(ClusterError::DuplicateRegistration { .. })
        ));
        assert!(governor.register_pool(small(ExecutorType::Scheduled)).is_err());
        assert_eq!(governor.accounting().scheduled_core, 1);

        governor.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_cap() {
        let caps = ResourceCaps {
            scheduled_core_total: 2,
            ..ResourceCaps::default()
        };
        let governor = ResourceGovernor::new(caps);

        let result = governor.register_scheduled_pool(3, true);

        assert!(matches!(result, Err(ClusterError::ResourceExceeded { .. })));
        assert!(governor.scheduled_pool().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_clears_pools_but_keeps_totals() {
        // ARRANGE
        let scheduler = scheduler_with(&[ExecutorType::Default, ExecutorType::Archive]);
        let governor = scheduler.governor().clone();
        let before = governor.accounting();

        // ACT
        scheduler.stop();

        // ASSERT
        assert!(governor.registered_types().is_empty());
        assert!(governor.scheduled_pool().is_none());
        assert_eq!(governor.accounting(), before);

        let result = scheduler.submit(TaskEnvelope::new(ExecutorType::Default, "late", async { Ok(1) }));
        assert!(matches!(result, Err(ClusterError::Configuration(_))));
    }

    // ============================================================
    // SCHEDULER: Routing
    // ============================================================

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_runs_on_its_pool() {
        let scheduler = scheduler_with(&[ExecutorType::Default, ExecutorType::Compact]);

        let handle = scheduler
            .submit(TaskEnvelope::new(ExecutorType::Compact, "compact-1", async {
                Ok(thread_name())
            }))
            .unwrap();
        let name = handle.await.unwrap();

        assert!(name.starts_with("thread-compact-"), "ran on {}", name);
        let report = scheduler.governor().latency_report();
        assert_eq!(report[&ExecutorType::Compact].count, 1);
        assert_eq!(scheduler.fallback_count(), 0);

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unregistered_type_falls_back_to_default() {
        // ARRANGE: Only DEFAULT exists
        let scheduler = scheduler_with(&[ExecutorType::Default]);

        // ACT: Submit work tagged ARCHIVE
        let handle = scheduler
            .submit(TaskEnvelope::new(ExecutorType::Archive, "archive-1", async {
                Ok(thread_name())
            }))
            .unwrap();

        // ASSERT: It ran on the DEFAULT pool and the reroute was counted
        let name = handle.await.unwrap();
        assert!(name.starts_with("thread-default-"), "ran on {}", name);
        assert_eq!(handle_count(&scheduler, ExecutorType::Default), 1);
        assert_eq!(scheduler.fallback_count(), 1);

        scheduler.stop();
    }

    fn handle_count(scheduler: &TaskScheduler, executor_type: ExecutorType) -> u64 {
        scheduler.governor().latency_report()[&executor_type].count
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_error_surfaces_as_fault() {
        let scheduler = scheduler_with(&[ExecutorType::Default]);

        let handle = scheduler
            .submit(TaskEnvelope::<()>::new(ExecutorType::Default, "broken", async {
                Err(anyhow::anyhow!("disk full"))
            }))
            .unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err, ClusterError::Fault(_)));
        assert!(err.to_string().contains("disk full"));

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_envelope() {
        let scheduler = scheduler_with(&[ExecutorType::Default, ExecutorType::Archive]);

        let handle = scheduler
            .submit(TaskEnvelope::blocking(ExecutorType::Archive, "fsync", || {
                std::thread::sleep(Duration::from_millis(20));
                Ok(thread_name())
            }))
            .unwrap();

        let name = handle.await.unwrap();
        assert!(name.starts_with("thread-archive-"), "ran on {}", name);

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_then_chains_on_default() {
        // ARRANGE
        let scheduler = scheduler_with(&[ExecutorType::Default, ExecutorType::Archive]);
        let envelope = TaskEnvelope::new(ExecutorType::Archive, "stage-1", async { Ok(21u32) });

        // ACT
        let handle = scheduler
            .submit_then(envelope, |value| async move { Ok((value * 2, thread_name())) })
            .unwrap();

        // ASSERT
        let (value, name) = handle.await.unwrap();
        assert_eq!(value, 42);
        assert!(name.starts_with("thread-default-"), "ran on {}", name);

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_then_propagates_first_stage_error() {
        let scheduler = scheduler_with(&[ExecutorType::Default]);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();

        let envelope = TaskEnvelope::<u32>::new(ExecutorType::Default, "stage-1", async {
            Err(anyhow::anyhow!("stage one failed"))
        });
        let handle = scheduler
            .submit_then(envelope, move |value| async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
            .unwrap();

        assert!(handle.await.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_delayed_waits() {
        let scheduler = scheduler_with(&[ExecutorType::Default]);
        let started = Instant::now();

        let handle = scheduler
            .submit_delayed(
                TaskEnvelope::new(ExecutorType::Default, "later", async { Ok(thread_name()) }),
                Duration::from_millis(150),
            )
            .unwrap();
        let name = handle.await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(name.starts_with("thread-schedule-"), "ran on {}", name);

        scheduler.stop();
    }

    // ============================================================
    // CYCLIC TASKS
    // ============================================================

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cyclic_task_survives_panic_on_first_run() {
        // ARRANGE: Body panics once, then succeeds
        let scheduler = scheduler_with(&[ExecutorType::Default]);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let envelope = CyclicTaskEnvelope::fixed_rate("flaky", Duration::from_millis(50), move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run blows up");
                }
                Ok(())
            }
        });

        // ACT: Let it run for 10 periods
        let handle = scheduler.submit_cyclic(envelope).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // ASSERT: Every tick after the panic still ran
        assert!(handle.executions() >= 8, "only {} runs", handle.executions());
        assert_eq!(handle.failures(), 1);
        assert!(!handle.is_cancelled());

        handle.cancel();
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fixed_delay_task_survives_error() {
        let scheduler = scheduler_with(&[ExecutorType::Default]);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let envelope = CyclicTaskEnvelope::fixed_delay("erring", Duration::from_millis(40), move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first run fails");
                }
                Ok(())
            }
        });

        let handle = scheduler.submit_cyclic(envelope).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(handle.executions() >= 5, "only {} runs", handle.executions());
        assert_eq!(handle.failures(), 1);

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cyclic_initial_delay_and_cancel() {
        let scheduler = scheduler_with(&[ExecutorType::Default]);
        let envelope = CyclicTaskEnvelope::fixed_rate("delayed", Duration::from_millis(20), || async { Ok(()) })
            .with_initial_delay(Duration::from_millis(200));

        let handle = scheduler.submit_cyclic(envelope).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.executions(), 0);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.executions(), 0);
        assert!(handle.is_cancelled());

        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_period_is_rejected() {
        let scheduler = scheduler_with(&[ExecutorType::Default]);

        let result = scheduler.submit_cyclic(CyclicTaskEnvelope::fixed_delay("spin", Duration::ZERO, || async { Ok(()) }));

        assert!(matches!(result, Err(ClusterError::Configuration(_))));
        scheduler.stop();
    }

    /// Fixed-delay schedule whose body sleeps 50 ms and records how many
    /// bodies were running at once.
    fn overlap_tracker(label: &'static str, active: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> CyclicTaskEnvelope {
        let active = active.clone();
        let peak = peak.clone();
        CyclicTaskEnvelope::fixed_delay(label, Duration::from_millis(10), move || {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_thread_scheduled_pool_serializes_periodic_work() {
        // ARRANGE: Two schedules on a one-thread scheduled pool
        let scheduler = scheduler_with(&[ExecutorType::Default]);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        // ACT
        let first = scheduler.submit_cyclic(overlap_tracker("first", &active, &peak)).unwrap();
        let second = scheduler.submit_cyclic(overlap_tracker("second", &active, &peak)).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // ASSERT: Both made progress, never side by side
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(first.executions() >= 2, "first ran {} times", first.executions());
        assert!(second.executions() >= 2, "second ran {} times", second.executions());

        first.cancel();
        second.cancel();
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_thread_scheduled_pool_allows_overlap() {
        let governor = Arc::new(ResourceGovernor::new(ResourceCaps::default()));
        governor.register_pool(small(ExecutorType::Default)).unwrap();
        governor.register_scheduled_pool(2, true).unwrap();
        let scheduler = TaskScheduler::new(governor);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let first = scheduler.submit_cyclic(overlap_tracker("first", &active, &peak)).unwrap();
        let second = scheduler.submit_cyclic(overlap_tracker("second", &active, &peak)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);

        first.cancel();
        second.cancel();
        scheduler.stop();
    }

    // ============================================================
    // REJECTION POLICIES
    // ============================================================

    /// A one-slot rendezvous pool with its slot already taken.
    async fn saturated(policy: RejectionPolicy) -> (TaskScheduler, tokio::sync::oneshot::Sender<()>) {
        let governor = Arc::new(ResourceGovernor::new(ResourceCaps::default()));
        governor.register_pool(small(ExecutorType::Default)).unwrap();
        governor
            .register_pool(
                PoolDescriptor::new(ExecutorType::Archive, 1, 1)
                    .with_queue(QueueCapacity::Rendezvous)
                    .with_rejection(policy),
            )
            .unwrap();
        let scheduler = TaskScheduler::new(governor);

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        scheduler
            .submit(TaskEnvelope::new(ExecutorType::Archive, "hog", async move {
                let _ = wait.await;
                Ok(())
            }))
            .unwrap();
        (scheduler, release)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_policy_fails_submission() {
        let (scheduler, release) = saturated(RejectionPolicy::Abort).await;

        let result = scheduler.submit(TaskEnvelope::new(ExecutorType::Archive, "extra", async { Ok(()) }));

        assert!(matches!(result, Err(ClusterError::Rejected { .. })));
        let _ = release.send(());
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discard_policy_resolves_rejected() {
        let (scheduler, release) = saturated(RejectionPolicy::Discard).await;
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();

        let handle = scheduler
            .submit(TaskEnvelope::new(ExecutorType::Archive, "extra", async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        assert!(handle.is_discarded());
        assert!(matches!(handle.await, Err(ClusterError::Rejected { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let _ = release.send(());
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_caller_runs_policy_uses_submitter_runtime() {
        let (scheduler, release) = saturated(RejectionPolicy::CallerRuns).await;

        let handle = scheduler
            .submit(TaskEnvelope::new(ExecutorType::Archive, "extra", async { Ok(thread_name()) }))
            .unwrap();

        let name = handle.await.unwrap();
        assert!(!name.starts_with("thread-archive-"), "ran on {}", name);
        let _ = release.send(());
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slot_frees_after_completion() {
        let (scheduler, release) = saturated(RejectionPolicy::Abort).await;
        let pool = scheduler.governor().pool(ExecutorType::Archive).unwrap();
        assert_eq!(pool.in_flight(), 1);

        let _ = release.send(());
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let handle = scheduler
            .submit(TaskEnvelope::new(ExecutorType::Archive, "next", async { Ok(7) }))
            .unwrap();
        assert_eq!(handle.await.unwrap(), 7);
        scheduler.stop();
    }
}
