//! Compute Module Tests
//!
//! ## Test Scopes
//! - **Records**: staleness, "most recent wins" and default aggregation.
//! - **Worker**: parked starts, failures and panics, stop relay and late stops,
//!   verdict storage and retention.
//! - **Work Coordinator**: single-node and all-node tasks on in-process clusters,
//!   run-once tasks, suspected and silent nodes, timeouts, stop and take-over.

#[cfg(test)]
mod tests {
    use crate::compute::protocol::TaskSpec;
    use crate::compute::task::{FnTask, GridTask, first_completed_or_failed};
    use crate::compute::types::{ExecutionMode, TaskProgress, TaskState, TaskStatus};
    use crate::config::GridConfig;
    use crate::error::{GridError, GridResult};
    use crate::grid::context::GridContext;
    use crate::grid::service::Grid;
    use crate::storage::memory::MemoryStore;
    use crate::transport::local::LocalCluster;

    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const TEST_DEADLINE: Duration = Duration::from_secs(15);

    fn cluster_with(size: usize, config: GridConfig) -> (LocalCluster, Vec<Arc<Grid>>) {
        let cluster = LocalCluster::new();
        let store = MemoryStore::new();
        let grids = (0..size)
            .map(|_| Grid::new(cluster.join(), store.clone(), config.clone()))
            .collect();
        (cluster, grids)
    }

    fn cluster_of(size: usize) -> (LocalCluster, Vec<Arc<Grid>>) {
        cluster_with(size, GridConfig::for_tests())
    }

    fn counting_task(id: &str, counter: Arc<AtomicUsize>) -> FnTask {
        FnTask::new(id, move |_context: GridContext| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, anyhow::Error>(Some(json!(n)))
            }
        })
    }

    fn failing_task(id: &str) -> FnTask {
        FnTask::new(id, |context: GridContext| async move {
            Err::<Option<serde_json::Value>, _>(anyhow::anyhow!("boom on {}", context.node_id()))
        })
    }

    /// Every node makes the same call, as an application would.
    async fn execute_everywhere(
        grids: &[Arc<Grid>],
        task: Arc<dyn GridTask>,
    ) -> Vec<GridResult<TaskStatus>> {
        let handles: Vec<_> = grids
            .iter()
            .map(|grid| {
                let compute = grid.compute();
                let task = task.clone();
                tokio::spawn(async move { compute.execute_task(task).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            let joined = tokio::time::timeout(TEST_DEADLINE, handle)
                .await
                .expect("execute_task did not return");
            outcomes.push(joined.unwrap());
        }
        outcomes
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(TEST_DEADLINE, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    // ============================================================
    // RECORD TESTS
    // ============================================================

    #[test]
    fn test_progress_staleness_uses_latest_reference() {
        let progress = TaskProgress {
            status: TaskStatus::running(),
            last_heartbeat: Some(1_000),
        };

        assert!(!progress.is_stale(0, 1_500, 1_000));
        assert!(progress.is_stale(0, 2_500, 1_000));
        // A later task start resets the reference
        assert!(!progress.is_stale(2_000, 2_500, 1_000));
        assert!(TaskProgress::unknown().is_stale(0, 5_000, 1_000));
    }

    #[test]
    fn test_progress_most_recent_wins() {
        let older = TaskProgress {
            status: TaskStatus::running(),
            last_heartbeat: Some(100),
        };
        let newer = TaskProgress {
            status: TaskStatus::completed(None),
            last_heartbeat: Some(200),
        };
        let terminal_same_time = TaskProgress {
            status: TaskStatus::failed("x"),
            last_heartbeat: Some(100),
        };

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(terminal_same_time.supersedes(&older));
        assert!(!TaskProgress::unknown().supersedes(&older));
    }

    #[test]
    fn test_aggregation_one_completed_wins() {
        let statuses = vec![
            TaskStatus::failed("disk full"),
            TaskStatus::completed(Some(json!(7))),
            TaskStatus::failed("oom"),
        ];

        let aggregate = first_completed_or_failed(&statuses);

        assert_eq!(aggregate, TaskStatus::completed(Some(json!(7))));
    }

    #[test]
    fn test_aggregation_all_failed_joins_errors() {
        let statuses = vec![TaskStatus::failed("disk full"), TaskStatus::failed("oom")];

        let aggregate = first_completed_or_failed(&statuses);

        assert_eq!(aggregate.state, TaskState::Failed);
        assert_eq!(aggregate.error.as_deref(), Some("disk full; oom"));
        assert_eq!(first_completed_or_failed(&[]).state, TaskState::Failed);
    }

    #[test]
    fn test_task_descriptor_reflects_builder() {
        let task = counting_task("described", Arc::new(AtomicUsize::new(0)))
            .all_nodes()
            .once();

        assert_eq!(
            task.spec(),
            TaskSpec {
                id: "described".to_string(),
                mode: ExecutionMode::AllNodes,
                once: true,
            }
        );
    }

    // ============================================================
    // WORKER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_start_before_register_is_parked() {
        // ARRANGE
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let counter = Arc::new(AtomicUsize::new(0));

        // ACT: the start request wins the race against registration
        worker.start_node_task(TaskSpec {
            id: "late".to_string(),
            mode: ExecutionMode::SingleNode,
            once: false,
        });
        let before = worker.node_task_progress("late");
        worker.register_task(counting_task("late", counter.clone()).into_task());

        // ASSERT
        assert_eq!(before.last_heartbeat, None);
        wait_until(|| worker.node_task_progress("late").state().is_terminal()).await;
        assert_eq!(worker.node_task_progress("late").state(), TaskState::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_runs_once() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("dup", counter.clone());
        let spec = task.spec();
        worker.register_task(task.into_task());

        worker.start_node_task(spec.clone());
        worker.start_node_task(spec);

        wait_until(|| worker.node_task_progress("dup").state().is_terminal()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_body_is_failed() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let task = FnTask::new("panics", |_context: GridContext| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<_, anyhow::Error>(None)
        });
        let spec = task.spec();
        worker.register_task(task.into_task());

        worker.start_node_task(spec);

        wait_until(|| worker.node_task_progress("panics").state().is_terminal()).await;
        let progress = worker.node_task_progress("panics");
        assert_eq!(progress.state(), TaskState::Failed);
        assert!(progress.status.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_stop_is_relayed_to_running_body() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let task = FnTask::new("loops", move |_context: GridContext| {
            let stop = stop.clone();
            async move {
                while !stop.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok::<_, anyhow::Error>(Some(json!("stopped")))
            }
        })
        .on_stop(move || flag.store(true, Ordering::SeqCst));
        let spec = task.spec();
        worker.register_task(task.into_task());
        worker.start_node_task(spec);

        worker.stop_node_task("loops");

        wait_until(|| worker.node_task_progress("loops").state().is_terminal()).await;
        assert_eq!(
            worker.node_task_progress("loops").status,
            TaskStatus::completed(Some(json!("stopped")))
        );
    }

    #[tokio::test]
    async fn test_clear_forgets_the_run() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let task = counting_task("clear", Arc::new(AtomicUsize::new(0)));
        let spec = task.spec();
        worker.register_task(task.into_task());
        worker.start_node_task(spec);
        wait_until(|| worker.node_task_progress("clear").state().is_terminal()).await;

        worker.clear_task_status("clear");

        assert_eq!(worker.node_task_progress("clear"), TaskProgress::unknown());
        assert!(worker.registered_tasks().is_empty());
        assert_eq!(worker.running_task_count(), 0);
    }

    #[tokio::test]
    async fn test_verdict_keeps_most_recent_and_is_taken_once() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let newer = TaskProgress {
            status: TaskStatus::completed(None),
            last_heartbeat: Some(200),
        };
        let older = TaskProgress {
            status: TaskStatus::running(),
            last_heartbeat: Some(100),
        };

        worker.set_grid_task_progress("t", newer.clone());
        worker.set_grid_task_progress("t", older);

        assert_eq!(worker.grid_task_progress("t"), Some(newer.clone()));
        assert_eq!(worker.take_terminal_grid_task_progress("t"), Some(newer));
        assert_eq!(worker.take_terminal_grid_task_progress("t"), None);
    }

    #[tokio::test]
    async fn test_running_verdict_is_not_taken() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();

        worker.set_grid_task_progress("t", TaskProgress::now(TaskStatus::running()));

        assert_eq!(worker.take_terminal_grid_task_progress("t"), None);
        assert!(worker.grid_task_progress("t").is_some());
    }

    #[tokio::test]
    async fn test_stop_for_unregistered_task_is_dropped() {
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();

        worker.stop_node_task("never-registered");

        assert!(!worker.is_stop_requested("never-registered"));
    }

    #[tokio::test]
    async fn test_stop_landing_after_clear_does_not_reach_next_run() {
        // ARRANGE: a run that finished and was cleared
        let (_cluster, grids) = cluster_of(1);
        let worker = grids[0].worker();
        let stopped = Arc::new(AtomicBool::new(false));
        let make_task = || {
            let flag = stopped.clone();
            FnTask::new("rerun", |_context: GridContext| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(Some(json!("done")))
            })
            .on_stop(move || flag.store(true, Ordering::SeqCst))
        };
        let first = make_task();
        let spec = first.spec();
        worker.register_task(first.into_task());
        worker.start_node_task(spec.clone());
        wait_until(|| worker.node_task_progress("rerun").state().is_terminal()).await;
        worker.clear_task_status("rerun");

        // ACT: a stop cast from the finished run arrives late, then the id runs again
        worker.stop_node_task("rerun");
        worker.register_task(make_task().into_task());
        worker.start_node_task(spec);

        // ASSERT: several heartbeats pass without the new run being stopped
        assert!(!worker.is_stop_requested("rerun"));
        wait_until(|| worker.node_task_progress("rerun").state().is_terminal()).await;
        assert_eq!(
            worker.node_task_progress("rerun").status,
            TaskStatus::completed(Some(json!("done")))
        );
        assert!(!stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_untaken_terminal_verdict_expires() {
        // ARRANGE
        let config = GridConfig {
            progress_cleanup_delay_ms: 50,
            ..GridConfig::for_tests()
        };
        let (_cluster, grids) = cluster_with(1, config);
        let worker = grids[0].worker();

        // ACT
        worker.set_grid_task_progress("finished", TaskProgress::now(TaskStatus::completed(None)));
        worker.set_grid_task_progress("in-flight", TaskProgress::now(TaskStatus::running()));

        // ASSERT
        assert!(worker.grid_task_progress("finished").is_some());
        wait_until(|| worker.grid_task_progress("finished").is_none()).await;
        assert!(worker.grid_task_progress("in-flight").is_some());
    }

    #[tokio::test]
    async fn test_verdict_retention_keeps_newer_verdict() {
        let config = GridConfig {
            progress_cleanup_delay_ms: 100,
            ..GridConfig::for_tests()
        };
        let (_cluster, grids) = cluster_with(1, config);
        let worker = grids[0].worker();
        let first = TaskProgress {
            status: TaskStatus::failed("first run"),
            last_heartbeat: Some(100),
        };
        let second = TaskProgress {
            status: TaskStatus::completed(None),
            last_heartbeat: Some(200),
        };

        worker.set_grid_task_progress("t", first);
        tokio::time::sleep(Duration::from_millis(60)).await;
        worker.set_grid_task_progress("t", second.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The first verdict's cleanup fired but must not remove the second
        assert_eq!(worker.grid_task_progress("t"), Some(second));
    }

    // ============================================================
    // WORK COORDINATOR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_single_node_task_on_lone_coordinator() {
        let (_cluster, grids) = cluster_of(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let status = grids[0]
            .compute()
            .execute_task(counting_task("solo", counter.clone()).into_task())
            .await
            .unwrap();

        assert_eq!(status, TaskStatus::completed(Some(json!(1))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_node_task_runs_once_cluster_wide() {
        // ARRANGE
        let (_cluster, grids) = cluster_of(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("one", counter.clone()).into_task();

        // ACT
        let outcomes = execute_everywhere(&grids, task).await;

        // ASSERT
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().state, TaskState::Completed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_nodes_task_runs_on_every_member() {
        let (_cluster, grids) = cluster_of(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("all", counter.clone()).all_nodes().into_task();

        let outcomes = execute_everywhere(&grids, task).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        let statuses: Vec<TaskStatus> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert!(statuses.iter().all(|s| s.state == TaskState::Completed));
        // Every node sees the same verdict
        assert!(statuses.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_everywhere_is_failed() {
        let (_cluster, grids) = cluster_of(2);
        let task = failing_task("fails").all_nodes().into_task();

        let outcomes = execute_everywhere(&grids, task).await;

        for outcome in outcomes {
            let status = outcome.unwrap();
            assert_eq!(status.state, TaskState::Failed);
            assert!(status.error.unwrap().contains("boom"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_completed_node_is_enough() {
        let (_cluster, grids) = cluster_of(3);
        let coordinator = grids[0].node_id();
        let task = FnTask::new("mixed", move |context: GridContext| {
            let coordinator = coordinator.clone();
            async move {
                if context.node_id() == coordinator {
                    Ok(Some(json!("done")))
                } else {
                    Err(anyhow::anyhow!("worker failure"))
                }
            }
        })
        .all_nodes()
        .into_task();

        let outcomes = execute_everywhere(&grids, task).await;

        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), TaskStatus::completed(Some(json!("done"))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_once_task_is_not_repeated() {
        let (_cluster, grids) = cluster_of(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("once", counter.clone()).once().into_task();

        let first = execute_everywhere(&grids, task.clone()).await;
        let second = execute_everywhere(&grids, task).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        for outcome in first.into_iter().chain(second) {
            assert_eq!(outcome.unwrap(), TaskStatus::completed(Some(json!(1))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_plain_task_runs_again() {
        let (_cluster, grids) = cluster_of(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("again", counter.clone()).all_nodes().into_task();

        execute_everywhere(&grids, task.clone()).await;
        execute_everywhere(&grids, task).await;

        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_suspected_node_is_settled_as_failed() {
        // ARRANGE: the third node is suspected and never calls execute_task
        let (cluster, grids) = cluster_of(3);
        cluster.set_suspected(&grids[2].node_id(), true);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("suspect", counter.clone()).all_nodes().into_task();

        // ACT
        let outcomes = execute_everywhere(&grids[..2], task).await;

        // ASSERT: the aggregate still completes on the nodes that ran it
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().state, TaskState::Completed);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_member_without_the_task_goes_stale() {
        let config = GridConfig {
            heartbeat_expiry_ms: 300,
            ..GridConfig::for_tests()
        };
        let (_cluster, grids) = cluster_with(2, config);
        let task = failing_task("silent").all_nodes().into_task();

        // Only the coordinator registers the task
        let status = tokio::time::timeout(TEST_DEADLINE, grids[0].compute().execute_task(task))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error.unwrap().contains("No heartbeat"));
    }

    #[tokio::test]
    async fn test_task_exceeding_max_duration_fails() {
        let config = GridConfig {
            max_task_duration_ms: 150,
            ..GridConfig::for_tests()
        };
        let (_cluster, grids) = cluster_with(1, config);
        let task = FnTask::new("slow", |_context: GridContext| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(None)
        })
        .into_task();

        let status = grids[0].compute().execute_task(task).await.unwrap();

        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error.unwrap().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_task_ends_running_task() {
        let (_cluster, grids) = cluster_of(2);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let task = FnTask::new("stoppable", move |_context: GridContext| {
            let stop = stop.clone();
            async move {
                while !stop.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok::<_, anyhow::Error>(None)
            }
        })
        .on_stop(move || flag.store(true, Ordering::SeqCst))
        .into_task();

        let compute = grids[0].compute();
        let running = tokio::spawn({
            let task = task.clone();
            async move { compute.execute_task(task).await }
        });
        wait_until(|| grids[0].worker().running_task_count() == 1).await;
        grids[1].compute().stop_task("stoppable").await;

        let status = tokio::time::timeout(TEST_DEADLINE, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status.state, TaskState::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_late_stop_does_not_end_next_run_early() {
        // ARRANGE: one finished run, then a stop for it arrives after the clear
        let (_cluster, grids) = cluster_of(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("again", counter.clone()).into_task();
        execute_everywhere(&grids, task.clone()).await;
        grids[1].compute().stop_task("again").await;

        // ACT
        let outcomes = execute_everywhere(&grids, task).await;

        // ASSERT: the member waits for the real verdict instead of returning at once
        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), TaskStatus::completed(Some(json!(2))));
        }
        assert!(grids.iter().all(|grid| !grid.worker().is_stop_requested("again")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiter_takes_over_when_coordinator_leaves() {
        // ARRANGE: the coordinator never runs the task
        let (cluster, grids) = cluster_of(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("takeover", counter.clone()).into_task();
        let compute = grids[1].compute();
        let waiting = tokio::spawn(async move { compute.execute_task(task).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ACT
        cluster.leave(&grids[0].node_id());

        // ASSERT
        let status = tokio::time::timeout(TEST_DEADLINE, waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_gives_up_without_coordinator_heartbeat() {
        let config = GridConfig {
            heartbeat_expiry_ms: 100,
            ..GridConfig::for_tests()
        };
        let (_cluster, grids) = cluster_with(2, config);
        let task = counting_task("orphan", Arc::new(AtomicUsize::new(0))).into_task();

        let outcome = grids[1].compute().execute_task(task).await;

        assert!(matches!(outcome, Err(GridError::CoordinatorExpired(id)) if id == "orphan"));
    }

    #[tokio::test]
    async fn test_verdict_is_persisted() {
        let (_cluster, grids) = cluster_of(1);
        let compute = grids[0].compute();

        compute
            .execute_task(failing_task("persisted").into_task())
            .await
            .unwrap();

        let stored = crate::compute::coordinator::WorkCoordinator::new(grids[0].clone())
            .stored_status("persisted")
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, TaskState::Failed);
    }
}
