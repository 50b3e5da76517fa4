//! Persistence boundary.
//!
//! The scheduler writes every state change through a [`Store`] but never
//! depends on it for correctness: store faults are logged by the caller and
//! scheduling carries on from in-memory state.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: concurrent maps, the default for embedding and tests
//! - [`FileStore`]: one JSON file per record under a directory tree

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::model::{Suite, SuiteResult, TestDefinition, TestResult, TestStatus, Worker};

pub use file::FileStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A persistable record kind.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name, also the directory name used by [`FileStore`].
    const KIND: &'static str;

    fn record_id(&self) -> &str;
}

impl Record for TestDefinition {
    const KIND: &'static str = "tests";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for TestResult {
    const KIND: &'static str = "test_results";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Worker {
    const KIND: &'static str = "workers";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Suite {
    const KIND: &'static str = "suites";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for SuiteResult {
    const KIND: &'static str = "suite_results";

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Storage for tests, results, workers, suites and suite results.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_test(&self, test: &TestDefinition) -> StoreResult<()>;
    async fn find_test(&self, id: &str) -> StoreResult<Option<TestDefinition>>;
    async fn all_tests(&self) -> StoreResult<Vec<TestDefinition>>;

    async fn find_tests_by_status(&self, status: TestStatus) -> StoreResult<Vec<TestDefinition>> {
        let tests = self.all_tests().await?;
        Ok(tests.into_iter().filter(|t| t.status == status).collect())
    }

    async fn find_tests_by_worker(&self, worker_id: &str) -> StoreResult<Vec<TestDefinition>> {
        let tests = self.all_tests().await?;
        Ok(tests
            .into_iter()
            .filter(|t| t.worker_id.as_deref() == Some(worker_id))
            .collect())
    }

    async fn save_result(&self, result: &TestResult) -> StoreResult<()>;
    async fn all_results(&self) -> StoreResult<Vec<TestResult>>;

    /// Results for one test, oldest first.
    async fn find_results_by_test(&self, test_id: &str) -> StoreResult<Vec<TestResult>> {
        let mut results: Vec<_> = self
            .all_results()
            .await?
            .into_iter()
            .filter(|r| r.test_id == test_id)
            .collect();
        results.sort_by_key(|r| r.started_at);
        Ok(results)
    }

    async fn find_results_by_worker(&self, worker_id: &str) -> StoreResult<Vec<TestResult>> {
        let results = self.all_results().await?;
        Ok(results
            .into_iter()
            .filter(|r| r.worker_id.as_deref() == Some(worker_id))
            .collect())
    }

    async fn save_worker(&self, worker: &Worker) -> StoreResult<()>;
    async fn find_worker(&self, id: &str) -> StoreResult<Option<Worker>>;
    async fn all_workers(&self) -> StoreResult<Vec<Worker>>;

    async fn save_suite(&self, suite: &Suite) -> StoreResult<()>;
    async fn find_suite(&self, id: &str) -> StoreResult<Option<Suite>>;

    async fn save_suite_result(&self, result: &SuiteResult) -> StoreResult<()>;
    async fn find_suite_result(&self, id: &str) -> StoreResult<Option<SuiteResult>>;
    async fn all_suite_results(&self) -> StoreResult<Vec<SuiteResult>>;

    /// Results for one suite, oldest first.
    async fn find_suite_results_by_suite(&self, suite_id: &str) -> StoreResult<Vec<SuiteResult>> {
        let mut results: Vec<_> = self
            .all_suite_results()
            .await?
            .into_iter()
            .filter(|r| r.suite_id == suite_id)
            .collect();
        results.sort_by_key(|r| r.started_at);
        Ok(results)
    }
}
