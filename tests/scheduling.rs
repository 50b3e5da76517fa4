//! End-to-end scheduling behaviour through the public `Orchestrator` API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use testgrid::driver::MemoryDriver;
use testgrid::events::{Event, RecordingSink};
use testgrid::model::{ActionKind, Priority, Step, TestDefinition, TestStatus, WorkerStatus};
use testgrid::orchestrator::{
    EngineSettings, Orchestrator, OrchestratorSettings, PoolSettings, QueueSettings,
};

fn settings(min_workers: usize, max_workers: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        queue: QueueSettings {
            max_size: 100,
            timeout: Duration::from_secs(600),
        },
        pool: PoolSettings {
            min_workers,
            max_workers,
            idle_timeout: Duration::from_secs(300),
        },
        engine: EngineSettings {
            test_retry_delay: Duration::from_millis(10),
        },
        dispatch_poll: Duration::from_millis(20),
        ..OrchestratorSettings::default()
    }
}

fn build(
    driver: &MemoryDriver,
    settings: OrchestratorSettings,
) -> (Orchestrator, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let orchestrator = Orchestrator::builder(Arc::new(driver.clone()))
        .settings(settings)
        .events(sink.clone())
        .build();
    (orchestrator, sink)
}

fn test(name: &str, priority: Priority) -> TestDefinition {
    TestDefinition::new(name)
        .with_priority(priority)
        .with_screenshots(false)
        .with_step(Step::click("#button"))
}

fn started_order(sink: &RecordingSink) -> Vec<String> {
    sink.on_topic("/topic/tests/status")
        .into_iter()
        .filter_map(|event| match event {
            Event::TestStatus(status) if status.status == TestStatus::Running => Some(status.name),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn higher_priority_dispatches_first_and_ties_keep_submission_order() {
    let driver = MemoryDriver::lenient();
    let (orchestrator, sink) = build(&driver, settings(1, 1));

    let mut handles = Vec::new();
    for (name, priority) in [
        ("low", Priority::Low),
        ("medium-1", Priority::Medium),
        ("high", Priority::High),
        ("medium-2", Priority::Medium),
        ("critical", Priority::Critical),
    ] {
        handles.push(orchestrator.submit(test(name, priority)).await.unwrap());
    }
    assert_eq!(orchestrator.queue_status().length, 5);

    orchestrator.start().await;
    for handle in handles {
        assert!(handle.wait().await.unwrap().success());
    }

    assert_eq!(
        started_order(&sink),
        vec!["critical", "high", "medium-1", "medium-2", "low"]
    );
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_worker_runs_at_most_one_test_at_a_time() {
    let driver = MemoryDriver::lenient().with_action_delay(Duration::from_millis(15));
    let (orchestrator, _) = build(&driver, settings(1, 3));
    orchestrator.start().await;

    let handles: Vec<_> = orchestrator
        .submit_batch((0..12).map(|i| test(&format!("t{i}"), Priority::Medium)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let mut by_worker: HashMap<String, Vec<_>> = HashMap::new();
    for handle in handles {
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.success());
        let result = outcome.result.unwrap();
        by_worker
            .entry(result.worker_id.clone().unwrap())
            .or_default()
            .push((result.started_at, result.ended_at.unwrap()));
    }

    assert!(driver.max_concurrent_sessions() <= 3);
    assert!(by_worker.len() <= 3);
    for intervals in by_worker.values_mut() {
        intervals.sort();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping executions on one worker");
        }
    }

    let status = orchestrator.pool_status();
    assert!(status.total <= 3);
    assert_eq!(status.busy, 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn pool_grows_on_demand_up_to_max() {
    let driver = MemoryDriver::lenient().with_action_delay(Duration::from_millis(20));
    let (orchestrator, _) = build(&driver, settings(0, 2));
    orchestrator.start().await;
    assert_eq!(orchestrator.pool_status().total, 0);

    let handles: Vec<_> = orchestrator
        .submit_batch((0..5).map(|i| test(&format!("t{i}"), Priority::Medium)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    for handle in handles {
        assert!(handle.wait().await.unwrap().success());
    }

    let status = orchestrator.pool_status();
    assert_eq!(status.total, 2);
    assert_eq!(status.idle, 2);
    assert_err!(orchestrator.create_worker().await);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_running_test_frees_its_worker() {
    let driver = MemoryDriver::lenient();
    let (orchestrator, _) = build(&driver, settings(1, 1));
    orchestrator.start().await;

    let slow = TestDefinition::new("slow")
        .with_screenshots(false)
        .with_step(Step::new(ActionKind::Wait).with_value("10000"))
        .with_step(Step::click("#never"));
    let handle = assert_ok!(orchestrator.submit(slow).await);
    let id = handle.test_id().to_string();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        orchestrator.test_status(&id).await.unwrap().status,
        TestStatus::Running
    );
    assert_eq!(
        assert_ok!(orchestrator.cancel_test(&id).await),
        TestStatus::Running
    );

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status(), TestStatus::Cancelled);
    let result = outcome.result.unwrap();
    assert_eq!(result.status, TestStatus::Cancelled);
    assert_eq!(result.steps.len(), 1);
    assert!(!driver.journal().iter().any(|line| line.contains("#never")));

    let workers = orchestrator.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, WorkerStatus::Idle);

    // The freed worker picks up new work.
    let next = orchestrator.submit(test("next", Priority::Medium)).await.unwrap();
    assert!(next.wait().await.unwrap().success());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn removing_a_busy_worker_cancels_its_test() {
    let driver = MemoryDriver::lenient();
    let (orchestrator, _) = build(&driver, settings(1, 1));
    orchestrator.start().await;

    let slow = TestDefinition::new("slow")
        .with_screenshots(false)
        .with_step(Step::new(ActionKind::Wait).with_value("10000"))
        .with_step(Step::click("#never"));
    let handle = assert_ok!(orchestrator.submit(slow).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let worker = orchestrator.workers()[0].clone();
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(orchestrator.pool_status().total, 1);

    assert!(orchestrator.remove_worker(&worker.id).await);
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status(), TestStatus::Cancelled);
    assert_eq!(outcome.result.unwrap().status, TestStatus::Cancelled);
    assert!(!driver.journal().iter().any(|line| line.contains("#never")));

    assert_eq!(orchestrator.pool_status().total, 0);
    assert!(orchestrator.workers().is_empty());
    let stored = orchestrator
        .store()
        .find_worker(&worker.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, WorkerStatus::Offline);
    assert!(!orchestrator.remove_worker(&worker.id).await);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn whole_test_retries_until_success() {
    let driver = MemoryDriver::lenient().flaky("#next", 2);
    let (orchestrator, _) = build(&driver, settings(1, 1));
    orchestrator.start().await;

    let flaky = TestDefinition::new("flaky")
        .with_screenshots(false)
        .with_max_retries(2)
        .with_step(Step::click("#next"));
    let id = flaky.id.clone();
    let outcome = orchestrator.submit(flaky).await.unwrap().wait().await.unwrap();

    assert!(outcome.success());
    let result = outcome.result.unwrap();
    assert_eq!(result.attempts, 3);
    assert_eq!(result.steps.len(), 1);
    assert!(result.steps[0].success);

    let stored = orchestrator.results_for_test(&id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(orchestrator.summary().await.unwrap().flaky_tests, 1);
    assert_eq!(orchestrator.engine().retries().in_flight(), 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn retries_exhausted_reports_failure() {
    let driver = MemoryDriver::lenient().flaky("#next", 5);
    let (orchestrator, _) = build(&driver, settings(1, 1));
    orchestrator.start().await;

    let flaky = TestDefinition::new("broken")
        .with_screenshots(false)
        .with_max_retries(1)
        .with_step(Step::click("#next"));
    let outcome = orchestrator.submit(flaky).await.unwrap().wait().await.unwrap();

    assert_eq!(outcome.status(), TestStatus::Failed);
    let result = outcome.result.unwrap();
    assert_eq!(result.attempts, 2);
    assert!(!result.success);
    assert!(outcome.test.error.is_some());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn submit_auto_runs_immediately_on_an_idle_worker() {
    let driver = MemoryDriver::lenient();
    let (orchestrator, _) = build(&driver, settings(1, 1));
    orchestrator.start().await;

    let outcome = orchestrator
        .submit_auto(test("auto", Priority::Low))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.success());

    let summary = orchestrator.summary().await.unwrap();
    assert_eq!(summary.count(TestStatus::Completed), 1);
    assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_queued_tests() {
    let driver = MemoryDriver::lenient();
    let (orchestrator, _) = build(&driver, settings(1, 1));

    let handle = orchestrator.submit(test("never", Priority::Medium)).await.unwrap();
    orchestrator.shutdown().await;

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status(), TestStatus::Cancelled);
    assert!(outcome.result.is_none());
}
