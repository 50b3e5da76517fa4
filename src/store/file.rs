//! JSON file store.
//!
//! Records live at `{root}/{kind}/{id}.json`, e.g. `results/tests/3f2a….json`.
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so readers never observe a half-written record. Unreadable files
//! are skipped with a warning instead of failing the whole listing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Record, Store, StoreError, StoreResult};
use crate::model::{Suite, SuiteResult, TestDefinition, TestResult, Worker};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir<T: Record>(&self) -> PathBuf {
        self.root.join(T::KIND)
    }

    async fn put<T: Record>(&self, record: &T) -> StoreResult<()> {
        let dir = self.kind_dir::<T>();
        let path = dir.join(file_name(record.record_id()));
        let contents = serde_json::to_vec_pretty(record)?;
        blocking(move || write_atomic(&dir, &path, &contents)).await
    }

    async fn get<T: Record>(&self, id: &str) -> StoreResult<Option<T>> {
        let path = self.kind_dir::<T>().join(file_name(id));
        blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            let contents = fs::read(&path)?;
            Ok(Some(serde_json::from_slice(&contents)?))
        })
        .await
    }

    async fn list<T: Record>(&self) -> StoreResult<Vec<T>> {
        let dir = self.kind_dir::<T>();
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut records = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fs::read(&path).map(|c| serde_json::from_slice::<T>(&c)) {
                    Ok(Ok(record)) => records.push(record),
                    Ok(Err(e)) => {
                        tracing::warn!("Skipping unreadable record {}: {}", path.display(), e)
                    }
                    Err(e) => tracing::warn!("Failed to read record {}: {}", path.display(), e),
                }
            }
            Ok(records)
        })
        .await
    }
}

/// Maps an id onto a safe file name.
fn file_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.json")
}

fn write_atomic(dir: &Path, path: &Path, contents: &[u8]) -> StoreResult<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

#[async_trait]
impl Store for FileStore {
    async fn save_test(&self, test: &TestDefinition) -> StoreResult<()> {
        self.put(test).await
    }

    async fn find_test(&self, id: &str) -> StoreResult<Option<TestDefinition>> {
        self.get(id).await
    }

    async fn all_tests(&self) -> StoreResult<Vec<TestDefinition>> {
        self.list().await
    }

    async fn save_result(&self, result: &TestResult) -> StoreResult<()> {
        self.put(result).await
    }

    async fn all_results(&self) -> StoreResult<Vec<TestResult>> {
        self.list().await
    }

    async fn save_worker(&self, worker: &Worker) -> StoreResult<()> {
        self.put(worker).await
    }

    async fn find_worker(&self, id: &str) -> StoreResult<Option<Worker>> {
        self.get(id).await
    }

    async fn all_workers(&self) -> StoreResult<Vec<Worker>> {
        self.list().await
    }

    async fn save_suite(&self, suite: &Suite) -> StoreResult<()> {
        self.put(suite).await
    }

    async fn find_suite(&self, id: &str) -> StoreResult<Option<Suite>> {
        self.get(id).await
    }

    async fn save_suite_result(&self, result: &SuiteResult) -> StoreResult<()> {
        self.put(result).await
    }

    async fn find_suite_result(&self, id: &str) -> StoreResult<Option<SuiteResult>> {
        self.get(id).await
    }

    async fn all_suite_results(&self) -> StoreResult<Vec<SuiteResult>> {
        self.list().await
    }
}
