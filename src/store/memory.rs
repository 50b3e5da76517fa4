//! In-memory store.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Record, Store, StoreError, StoreResult};
use crate::model::{Suite, SuiteResult, TestDefinition, TestResult, Worker};

/// Store backed by concurrent hash maps.
///
/// [`set_unavailable`](Self::set_unavailable) makes every call fail, which
/// lets callers exercise their fault paths.
#[derive(Default)]
pub struct MemoryStore {
    tests: DashMap<String, TestDefinition>,
    results: DashMap<String, TestResult>,
    workers: DashMap<String, Worker>,
    suites: DashMap<String, Suite>,
    suite_results: DashMap<String, SuiteResult>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn put<T: Record>(&self, map: &DashMap<String, T>, record: &T) -> StoreResult<()> {
        self.check()?;
        map.insert(record.record_id().to_string(), record.clone());
        Ok(())
    }

    fn get<T: Record>(&self, map: &DashMap<String, T>, id: &str) -> StoreResult<Option<T>> {
        self.check()?;
        Ok(map.get(id).map(|r| r.value().clone()))
    }

    fn list<T: Record>(&self, map: &DashMap<String, T>) -> StoreResult<Vec<T>> {
        self.check()?;
        Ok(map.iter().map(|r| r.value().clone()).collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_test(&self, test: &TestDefinition) -> StoreResult<()> {
        self.put(&self.tests, test)
    }

    async fn find_test(&self, id: &str) -> StoreResult<Option<TestDefinition>> {
        self.get(&self.tests, id)
    }

    async fn all_tests(&self) -> StoreResult<Vec<TestDefinition>> {
        self.list(&self.tests)
    }

    async fn save_result(&self, result: &TestResult) -> StoreResult<()> {
        self.put(&self.results, result)
    }

    async fn all_results(&self) -> StoreResult<Vec<TestResult>> {
        self.list(&self.results)
    }

    async fn save_worker(&self, worker: &Worker) -> StoreResult<()> {
        self.put(&self.workers, worker)
    }

    async fn find_worker(&self, id: &str) -> StoreResult<Option<Worker>> {
        self.get(&self.workers, id)
    }

    async fn all_workers(&self) -> StoreResult<Vec<Worker>> {
        self.list(&self.workers)
    }

    async fn save_suite(&self, suite: &Suite) -> StoreResult<()> {
        self.put(&self.suites, suite)
    }

    async fn find_suite(&self, id: &str) -> StoreResult<Option<Suite>> {
        self.get(&self.suites, id)
    }

    async fn save_suite_result(&self, result: &SuiteResult) -> StoreResult<()> {
        self.put(&self.suite_results, result)
    }

    async fn find_suite_result(&self, id: &str) -> StoreResult<Option<SuiteResult>> {
        self.get(&self.suite_results, id)
    }

    async fn all_suite_results(&self) -> StoreResult<Vec<SuiteResult>> {
        self.list(&self.suite_results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TestStatus, WorkerStatus};

    #[tokio::test]
    async fn test_save_and_find_test() {
        let store = MemoryStore::new();
        let mut test = TestDefinition::new("login");
        store.save_test(&test).await.unwrap();

        test.transition(TestStatus::Running, None);
        store.save_test(&test).await.unwrap();

        let found = store.find_test(&test.id).await.unwrap().unwrap();
        assert_eq!(found.status, TestStatus::Running);
        assert_eq!(store.all_tests().await.unwrap().len(), 1);
        assert!(store.find_test("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filters_by_status_and_worker() {
        let store = MemoryStore::new();
        let mut running = TestDefinition::new("running");
        running.transition(TestStatus::Running, None);
        running.worker_id = Some("w-1".into());
        store.save_test(&running).await.unwrap();
        store.save_test(&TestDefinition::new("queued")).await.unwrap();

        let by_status = store.find_tests_by_status(TestStatus::Running).await.unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].name, "running");

        let by_worker = store.find_tests_by_worker("w-1").await.unwrap();
        assert_eq!(by_worker.len(), 1);
    }

    #[tokio::test]
    async fn test_results_by_test() {
        let store = MemoryStore::new();
        let test = TestDefinition::new("login");
        let first = TestResult::unexecuted(&test, TestStatus::Failed, None);
        let second = TestResult::unexecuted(&test, TestStatus::Completed, None);
        store.save_result(&first).await.unwrap();
        store.save_result(&second).await.unwrap();
        store
            .save_result(&TestResult::unexecuted(
                &TestDefinition::new("other"),
                TestStatus::Completed,
                None,
            ))
            .await
            .unwrap();

        let results = store.find_results_by_test(&test.id).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let worker = Worker::new(WorkerStatus::Idle);
        assert!(matches!(
            store.save_worker(&worker).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.all_workers().await.is_err());

        store.set_unavailable(false);
        store.save_worker(&worker).await.unwrap();
        assert!(store.find_worker(&worker.id).await.unwrap().is_some());
    }
}
