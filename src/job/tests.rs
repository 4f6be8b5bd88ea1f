//! Job Module Tests
//!
//! ## Test Scopes
//! - **Aggregation**: the all-node verdict from per-node reports.
//! - **Executor**: outcome mapping, persistence, shutdown.
//! - **Listener**: broadcast path and the durable-state fallback.
//! - **Policies**: run_on_one / run_on_all and their `_once` variants on
//!   in-process clusters.

#[cfg(test)]
mod tests {
    use crate::config::GridConfig;
    use crate::error::GridError;
    use crate::grid::service::Grid;
    use crate::job::executor::JobExecutor;
    use crate::job::listener::JobListener;
    use crate::job::runner::aggregate_node_states;
    use crate::job::types::{JOB_STATES_NAMESPACE, JobState, JobStateAtTime, node_job_name};
    use crate::membership::types::NodeId;
    use crate::storage::DurableMap;
    use crate::storage::memory::MemoryStore;
    use crate::transport::local::LocalCluster;

    use std::collections::HashMap;
    use std::future::Future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TEST_DEADLINE: Duration = Duration::from_secs(15);

    fn cluster_of(size: usize) -> (LocalCluster, Vec<Arc<Grid>>) {
        let cluster = LocalCluster::new();
        let store = MemoryStore::new();
        let grids = (0..size)
            .map(|_| Grid::new(cluster.join(), store.clone(), GridConfig::for_tests()))
            .collect();
        (cluster, grids)
    }

    fn job_states(grid: &Arc<Grid>) -> DurableMap<JobStateAtTime> {
        DurableMap::new(grid.storage().clone(), JOB_STATES_NAMESPACE)
    }

    async fn count_job(counter: Arc<AtomicUsize>) -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn failing_job() -> anyhow::Result<()> {
        anyhow::bail!("job exploded")
    }

    /// Every node calls run_on_all (or run_on_all_once) with the job `make_job` builds for it.
    async fn run_on_all_everywhere<F, Fut>(
        grids: &[Arc<Grid>],
        job_name: &str,
        once: bool,
        make_job: F,
    ) -> Vec<JobState>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handles: Vec<_> = grids
            .iter()
            .enumerate()
            .map(|(index, grid)| {
                let compute = grid.compute();
                let job = make_job(index);
                let job_name = job_name.to_string();
                tokio::spawn(async move {
                    if once {
                        compute.run_on_all_once(&job_name, job).await
                    } else {
                        compute.run_on_all(&job_name, job).await
                    }
                })
            })
            .collect();

        let mut states = Vec::new();
        for handle in handles {
            let joined = tokio::time::timeout(TEST_DEADLINE, handle)
                .await
                .expect("run_on_all did not return");
            states.push(joined.unwrap().unwrap());
        }
        states
    }

    fn report(node: &str, state: JobState, time: u64) -> (String, JobStateAtTime) {
        (
            node.to_string(),
            JobStateAtTime {
                job_name: "job__NODE".to_string(),
                state,
                time,
                node_name: node.to_string(),
            },
        )
    }

    fn members(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|name| NodeId::from(*name)).collect()
    }

    // ============================================================
    // AGGREGATION TESTS
    // ============================================================

    #[test]
    fn test_single_completed_node_completes_job() {
        let reports = HashMap::from([
            report("a", JobState::Failed, 100),
            report("b", JobState::Completed, 100),
            report("c", JobState::Failed, 100),
        ]);

        let state = aggregate_node_states(&members(&["a", "b", "c"]), &reports, 0, 200, 1_000);

        assert_eq!(state, JobState::Completed);
    }

    #[test]
    fn test_all_failed_fails_job() {
        let reports = HashMap::from([report("a", JobState::Failed, 100), report("b", JobState::Failed, 100)]);

        let state = aggregate_node_states(&members(&["a", "b"]), &reports, 0, 200, 1_000);

        assert_eq!(state, JobState::Failed);
    }

    #[test]
    fn test_unreported_member_keeps_job_running_until_expiry() {
        let reports = HashMap::from([report("a", JobState::Completed, 100)]);
        let nodes = members(&["a", "b"]);

        assert_eq!(aggregate_node_states(&nodes, &reports, 0, 500, 1_000), JobState::Running);
        assert_eq!(aggregate_node_states(&nodes, &reports, 0, 1_500, 1_000), JobState::Completed);
    }

    #[test]
    fn test_silent_running_member_expires() {
        let reports = HashMap::from([report("a", JobState::Running, 1_000)]);
        let nodes = members(&["a"]);

        assert_eq!(aggregate_node_states(&nodes, &reports, 0, 1_800, 1_000), JobState::Running);
        assert_eq!(aggregate_node_states(&nodes, &reports, 0, 2_500, 1_000), JobState::Failed);
    }

    #[test]
    fn test_node_job_name_suffix() {
        assert_eq!(node_job_name("nightly"), "nightly__NODE");
    }

    // ============================================================
    // EXECUTOR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_executor_maps_outcomes() {
        let (_cluster, grids) = cluster_of(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let ok = JobExecutor::new(grids[0].clone(), "ok")
            .execute(count_job(counter.clone()))
            .await
            .unwrap();
        let failed = JobExecutor::new(grids[0].clone(), "err")
            .execute(failing_job())
            .await
            .unwrap();
        let panicked = JobExecutor::new(grids[0].clone(), "panic")
            .execute(async {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();

        assert_eq!(ok, JobState::Completed);
        assert_eq!(failed, JobState::Failed);
        assert_eq!(panicked, JobState::Failed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_executor_persists_only_when_asked() {
        let (_cluster, grids) = cluster_of(1);

        JobExecutor::new(grids[0].clone(), "volatile")
            .execute(async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        JobExecutor::new(grids[0].clone(), "durable")
            .persist_state(true)
            .execute(async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();

        let states = job_states(&grids[0]);
        assert!(states.get("volatile").unwrap().is_none());
        let stored = states.get("durable").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.node_name, grids[0].node_id().as_str());
    }

    #[tokio::test]
    async fn test_executor_interrupted_by_shutdown() {
        let (_cluster, grids) = cluster_of(1);
        let grid = grids[0].clone();
        let running = tokio::spawn(async move {
            JobExecutor::new(grid, "endless")
                .persist_state(true)
                .execute(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, anyhow::Error>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        grids[0].shutdown().await;

        let outcome = tokio::time::timeout(TEST_DEADLINE, running).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(GridError::Interrupted(_))));
        let stored = job_states(&grids[0]).get("endless").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }

    // ============================================================
    // LISTENER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_listener_follows_remote_executor() {
        // ARRANGE
        let (_cluster, grids) = cluster_of(2);
        let listener = JobListener::start_listening(grids[1].clone(), "remote");

        // ACT
        JobExecutor::new(grids[0].clone(), "remote")
            .execute(failing_job())
            .await
            .unwrap();

        // ASSERT
        let state = tokio::time::timeout(TEST_DEADLINE, listener.wait_for_completion())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_listener_ignores_other_jobs() {
        let (_cluster, grids) = cluster_of(1);
        let listener = JobListener::start_listening(grids[0].clone(), "mine");

        JobExecutor::new(grids[0].clone(), "other")
            .execute(async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();

        assert_eq!(listener.state(), JobState::Idle);
        assert_eq!(listener.job_name(), "mine");
    }

    #[tokio::test]
    async fn test_listener_falls_back_to_stored_terminal_state() {
        // ARRANGE: the outcome is only in durable state, never broadcast
        let (_cluster, grids) = cluster_of(1);
        let listener = JobListener::start_listening(grids[0].clone(), "quiet");
        tokio::time::sleep(Duration::from_millis(5)).await;

        // ACT
        job_states(&grids[0])
            .put("quiet", &JobStateAtTime::new("quiet", JobState::Completed, "elsewhere"))
            .unwrap();

        // ASSERT
        let state = tokio::time::timeout(TEST_DEADLINE, listener.wait_for_completion())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_listener_treats_expired_running_state_as_failed() {
        let (_cluster, grids) = cluster_of(1);
        let stale = JobStateAtTime {
            job_name: "crashed".to_string(),
            state: JobState::Running,
            time: crate::compute::types::now_ms().saturating_sub(60_000),
            node_name: "gone".to_string(),
        };
        job_states(&grids[0]).put("crashed", &stale).unwrap();

        let listener = JobListener::start_listening(grids[0].clone(), "crashed");
        let state = tokio::time::timeout(TEST_DEADLINE, listener.wait_for_completion())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_dropped_listener_unregisters() {
        let (_cluster, grids) = cluster_of(1);
        let before = grids[0].listener_count();

        let listener = JobListener::start_listening(grids[0].clone(), "short-lived");
        assert_eq!(grids[0].listener_count(), before + 1);
        drop(listener);

        assert_eq!(grids[0].listener_count(), before);
    }

    // ============================================================
    // RUN ON ONE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_run_on_one_only_on_coordinator() {
        let (_cluster, grids) = cluster_of(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let on_coordinator = grids[0]
            .compute()
            .run_on_one("report", count_job(counter.clone()))
            .await
            .unwrap();
        let on_member = grids[1]
            .compute()
            .run_on_one("report", count_job(counter.clone()))
            .await
            .unwrap();

        assert_eq!(on_coordinator, JobState::Completed);
        assert_eq!(on_member, JobState::Idle);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_on_one_repeats_but_once_variant_does_not() {
        let (_cluster, grids) = cluster_of(1);
        let compute = grids[0].compute();
        let counter = Arc::new(AtomicUsize::new(0));

        compute.run_on_one("repeat", count_job(counter.clone())).await.unwrap();
        compute.run_on_one("repeat", count_job(counter.clone())).await.unwrap();
        compute.run_on_one_once("migrate", count_job(counter.clone())).await.unwrap();
        let second = compute
            .run_on_one_once("migrate", count_job(counter.clone()))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(second, JobState::Completed);
    }

    #[tokio::test]
    async fn test_failed_once_job_is_not_retried() {
        let (_cluster, grids) = cluster_of(1);
        let compute = grids[0].compute();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = compute.run_on_one_once("brittle", failing_job()).await.unwrap();
        let second = compute
            .run_on_one_once("brittle", count_job(counter.clone()))
            .await
            .unwrap();

        assert_eq!(first, JobState::Failed);
        assert_eq!(second, JobState::Failed);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    // ============================================================
    // RUN ON ALL TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_on_all_runs_everywhere() {
        let (_cluster, grids) = cluster_of(3);
        let counter = Arc::new(AtomicUsize::new(0));

        let states = run_on_all_everywhere(&grids, "warmup", false, |_| count_job(counter.clone())).await;

        assert_eq!(states, vec![JobState::Completed; 3]);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        let stored = job_states(&grids[0]).get("warmup").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_on_all_completes_if_any_node_completes() {
        let (_cluster, grids) = cluster_of(3);
        let counter = Arc::new(AtomicUsize::new(0));

        let states = run_on_all_everywhere(&grids, "partial", false, |index| {
            let counter = counter.clone();
            async move {
                if index == 2 {
                    count_job(counter).await
                } else {
                    failing_job().await
                }
            }
        })
        .await;

        assert_eq!(states, vec![JobState::Completed; 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_on_all_fails_when_every_node_fails() {
        let (_cluster, grids) = cluster_of(2);

        let states = run_on_all_everywhere(&grids, "doomed", false, |_| failing_job()).await;

        assert_eq!(states, vec![JobState::Failed; 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_on_all_once_skips_second_run() {
        let (_cluster, grids) = cluster_of(3);
        let counter = Arc::new(AtomicUsize::new(0));

        let first = run_on_all_everywhere(&grids, "bootstrap", true, |_| count_job(counter.clone())).await;
        let second = run_on_all_everywhere(&grids, "bootstrap", true, |_| count_job(counter.clone())).await;

        assert_eq!(first, vec![JobState::Completed; 3]);
        assert_eq!(second, vec![JobState::Completed; 3]);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
