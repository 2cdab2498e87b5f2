// Task storage
//
// The persisted task is the single source of truth between runs. Every status
// change goes through compare_and_swap_status so two writers racing from the
// same prior status cannot both succeed.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::types::{Task, TaskId, TaskPatch, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("result for stage '{stage}' of task {task_id} is already recorded")]
    DuplicateStageResult { task_id: TaskId, stage: String },

    #[error("task id '{0}' cannot be stored")]
    InvalidId(TaskId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    async fn load(&self, task_id: &TaskId) -> Result<Task, StoreError>;

    /// Set `status` to `new` and apply `patch` only if the stored status equals `expected`.
    async fn compare_and_swap_status(
        &self,
        task_id: &TaskId,
        expected: &TaskStatus,
        new: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, StoreError>;

    /// Record a stage result. Results are append-only per stage name.
    async fn append_stage_result(
        &self,
        task_id: &TaskId,
        stage: &str,
        payload: Value,
    ) -> Result<(), StoreError>;

    async fn list_ids(&self) -> Result<Vec<TaskId>, StoreError>;
}

fn swap(task: &mut Task, expected: &TaskStatus, new: TaskStatus, patch: &TaskPatch) -> bool {
    if &task.status != expected {
        return false;
    }
    task.status = new;
    patch.apply(task);
    true
}

fn append(task: &mut Task, stage: &str, payload: Value) -> Result<(), StoreError> {
    if task.stage_results.contains_key(stage) {
        return Err(StoreError::DuplicateStageResult {
            task_id: task.id.clone(),
            stage: stage.to_string(),
        });
    }
    task.stage_results.insert(stage.to_string(), payload);
    task.updated_at = chrono::Utc::now();
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn load(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task_id.clone()))
    }

    async fn compare_and_swap_status(
        &self,
        task_id: &TaskId,
        expected: &TaskStatus,
        new: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.clone()))?;
        Ok(swap(task, expected, new, &patch))
    }

    async fn append_stage_result(
        &self,
        task_id: &TaskId,
        stage: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.clone()))?;
        append(task, stage, payload)
    }

    async fn list_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let mut ids: Vec<TaskId> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON document per task under a directory.
///
/// Writes go to a `.tmp` file first and are renamed into place. Compare-and-swap
/// is atomic within one process; separate processes sharing a directory need an
/// external lock.
#[derive(Debug)]
pub struct JsonFileTaskStore {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileTaskStore {
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        debug!(directory = %directory.display(), "Opened JSON task store");
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn task_path(&self, task_id: &TaskId) -> Result<PathBuf, StoreError> {
        let id = task_id.as_str();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(task_id.clone()));
        }
        Ok(self.directory.join(format!("{id}.json")))
    }

    async fn read(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        let path = self.task_path(task_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(task_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn write(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.task_path(&task.id)?;
        let serialized = serde_json::to_string_pretty(task)?;
        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.task_path(&task.id)?).await? {
            return Err(StoreError::AlreadyExists(task.id));
        }
        self.write(&task).await
    }

    async fn load(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        self.read(task_id).await
    }

    async fn compare_and_swap_status(
        &self,
        task_id: &TaskId,
        expected: &TaskStatus,
        new: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self.read(task_id).await?;
        if !swap(&mut task, expected, new, &patch) {
            return Ok(false);
        }
        self.write(&task).await?;
        Ok(true)
    }

    async fn append_stage_result(
        &self,
        task_id: &TaskId,
        stage: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self.read(task_id).await?;
        append(&mut task, stage, payload)?;
        self.write(&task).await
    }

    async fn list_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => ids.push(TaskId::from(stem)),
                None => warn!(path = %path.display(), "Skipping unreadable task file name"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn exercise_cas(store: &dyn TaskStore) {
        let task = Task::with_id(TaskId::from("cas-task"), json!({"topic": "tides"}), 3);
        store.insert(task.clone()).await.unwrap();

        let swapped = store
            .compare_and_swap_status(
                &task.id,
                &TaskStatus::Pending,
                TaskStatus::running(0),
                TaskPatch::new().progress(0.1),
            )
            .await
            .unwrap();
        assert!(swapped);

        let stale = store
            .compare_and_swap_status(
                &task.id,
                &TaskStatus::Pending,
                TaskStatus::Cancelled,
                TaskPatch::new(),
            )
            .await
            .unwrap();
        assert!(!stale);

        let loaded = store.load(&task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::running(0));
        assert_eq!(loaded.progress, 0.1);
    }

    async fn exercise_append(store: &dyn TaskStore) {
        let task = Task::with_id(TaskId::from("append-task"), json!({}), 3);
        store.insert(task.clone()).await.unwrap();

        store
            .append_stage_result(&task.id, "style", json!({"style": "noir"}))
            .await
            .unwrap();
        let duplicate = store
            .append_stage_result(&task.id, "style", json!({"style": "pastel"}))
            .await;
        assert!(matches!(duplicate, Err(StoreError::DuplicateStageResult { .. })));

        let loaded = store.load(&task.id).await.unwrap();
        assert_eq!(loaded.stage_results["style"], json!({"style": "noir"}));
    }

    #[tokio::test]
    async fn test_memory_store_cas() {
        exercise_cas(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_store_append_only() {
        exercise_append(&InMemoryTaskStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_store_missing_task() {
        let store = InMemoryTaskStore::new();
        let result = store.load(&TaskId::from("ghost")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_single_winner() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = Task::with_id(TaskId::from("race"), json!({}), 3);
        store.insert(task.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap_status(&id, &TaskStatus::Pending, TaskStatus::Cancelled, TaskPatch::new())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_file_store_cas_and_append() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileTaskStore::open(temp_dir.path()).await.unwrap();
        exercise_cas(&store).await;
        exercise_append(&store).await;

        let ids = store.list_ids().await.unwrap();
        assert_eq!(ids, vec![TaskId::from("append-task"), TaskId::from("cas-task")]);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let task = Task::with_id(TaskId::from("durable"), json!({"topic": "owls"}), 2);
        {
            let store = JsonFileTaskStore::open(temp_dir.path()).await.unwrap();
            store.insert(task.clone()).await.unwrap();
        }

        let reopened = JsonFileTaskStore::open(temp_dir.path()).await.unwrap();
        let loaded = reopened.load(&task.id).await.unwrap();
        assert_eq!(loaded.input, json!({"topic": "owls"}));
        assert_eq!(loaded.max_retries, 2);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileTaskStore::open(temp_dir.path()).await.unwrap();
        let task = Task::with_id(TaskId::from("../escape"), json!({}), 1);
        assert!(matches!(store.insert(task).await, Err(StoreError::InvalidId(_))));
    }
}
