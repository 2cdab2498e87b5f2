#[cfg(feature = "database")]
pub use sqlite::SqliteTaskStore;

#[cfg(feature = "database")]
mod sqlite {
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
    use tracing::info;

    use crate::pipeline::{StoreError, Task, TaskId, TaskPatch, TaskStatus, TaskStore};

    fn backend(e: impl std::fmt::Display) -> StoreError {
        StoreError::Backend(e.to_string())
    }

    /// Task store backed by SQLite.
    ///
    /// The task document and its status live in `tasks`; stage results are rows in
    /// `stage_results` keyed by (task, stage), so appends never race with status
    /// updates. Compare-and-swap is a single `UPDATE ... WHERE status = ?`.
    pub struct SqliteTaskStore {
        pool: SqlitePool,
    }

    impl SqliteTaskStore {
        /// Open (creating if needed) the database and run migrations.
        pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
            let in_memory = database_url.contains(":memory:");
            if !in_memory && !sqlx::Sqlite::database_exists(database_url).await.map_err(backend)? {
                info!("Creating database at {}", database_url);
                sqlx::Sqlite::create_database(database_url)
                    .await
                    .map_err(backend)?;
            }

            // Every connection to `:memory:` is a separate database.
            let pool = SqlitePoolOptions::new()
                .max_connections(if in_memory { 1 } else { 5 })
                .connect(database_url)
                .await
                .map_err(backend)?;

            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(backend)?;
            info!("Database migrations completed");

            Ok(Self { pool })
        }

        pub fn pool(&self) -> &SqlitePool {
            &self.pool
        }

        pub async fn shutdown(&self) {
            info!("Shutting down database connections...");
            self.pool.close().await;
            info!("Database connections closed");
        }

        fn document(task: &Task) -> Result<String, StoreError> {
            let mut stripped = task.clone();
            stripped.stage_results.clear();
            Ok(serde_json::to_string(&stripped)?)
        }

        async fn load_document(&self, task_id: &TaskId) -> Result<Task, StoreError> {
            let row = sqlx::query("SELECT document FROM tasks WHERE id = ?1")
                .bind(task_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?
                .ok_or_else(|| StoreError::NotFound(task_id.clone()))?;
            let document: String = row.get("document");
            Ok(serde_json::from_str(&document)?)
        }
    }

    #[async_trait]
    impl TaskStore for SqliteTaskStore {
        async fn insert(&self, task: Task) -> Result<(), StoreError> {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (id, status, document, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(task.id.as_str())
            .bind(task.status.to_string())
            .bind(Self::document(&task)?)
            .bind(task.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    Err(StoreError::AlreadyExists(task.id))
                }
                Err(e) => Err(backend(e)),
            }
        }

        async fn load(&self, task_id: &TaskId) -> Result<Task, StoreError> {
            let mut task = self.load_document(task_id).await?;
            let rows = sqlx::query("SELECT stage, payload FROM stage_results WHERE task_id = ?1")
                .bind(task_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            for row in rows {
                let stage: String = row.get("stage");
                let payload: String = row.get("payload");
                task.stage_results
                    .insert(stage, serde_json::from_str(&payload)?);
            }
            Ok(task)
        }

        async fn compare_and_swap_status(
            &self,
            task_id: &TaskId,
            expected: &TaskStatus,
            new: TaskStatus,
            patch: TaskPatch,
        ) -> Result<bool, StoreError> {
            let mut task = self.load_document(task_id).await?;
            if &task.status != expected {
                return Ok(false);
            }
            task.status = new;
            patch.apply(&mut task);

            let updated = sqlx::query(
                r#"
                UPDATE tasks SET status = ?1, document = ?2, updated_at = ?3
                WHERE id = ?4 AND status = ?5
                "#,
            )
            .bind(task.status.to_string())
            .bind(Self::document(&task)?)
            .bind(task.updated_at.to_rfc3339())
            .bind(task_id.as_str())
            .bind(expected.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

            Ok(updated.rows_affected() == 1)
        }

        async fn append_stage_result(
            &self,
            task_id: &TaskId,
            stage: &str,
            payload: Value,
        ) -> Result<(), StoreError> {
            // Surfaces NotFound before the foreign key does.
            self.load_document(task_id).await?;

            let result = sqlx::query(
                r#"
                INSERT INTO stage_results (task_id, stage, payload, recorded_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(task_id.as_str())
            .bind(stage)
            .bind(serde_json::to_string(&payload)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    Err(StoreError::DuplicateStageResult {
                        task_id: task_id.clone(),
                        stage: stage.to_string(),
                    })
                }
                Err(e) => Err(backend(e)),
            }
        }

        async fn list_ids(&self) -> Result<Vec<TaskId>, StoreError> {
            let rows = sqlx::query("SELECT id FROM tasks ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            Ok(rows
                .into_iter()
                .map(|row| TaskId::from(row.get::<String, _>("id")))
                .collect())
        }
    }

}
