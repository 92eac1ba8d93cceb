use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use rill_cache::{CacheError, CacheIndex, CallRef, Fingerprint, PriorResult};
use rill_core::{CallKey, CallStatus, WorkflowId, WorkflowStatus};

use crate::types::{shard_to_db, CallRow, WorkflowRow};
use crate::{Store, StoreError};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and run migrations.
  pub async fn open(path: &std::path::Path) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
      .busy_timeout(std::time::Duration::from_secs(30));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// An in-memory database with migrations applied. Used by tests.
  pub async fn in_memory() -> Result<Self, StoreError> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations")
      .run(&self.pool)
      .await
      .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))
  }

  fn json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_workflow(&self, row: &WorkflowRow) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO workflow (workflow_id, name, status, document, inputs, options, labels, dependencies, workflow_root, submitted_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(row.id.to_string())
    .bind(&row.name)
    .bind(row.status.as_str())
    .bind(Self::json(&row.document)?)
    .bind(Self::json(&row.inputs)?)
    .bind(Self::json(&row.options)?)
    .bind(Self::json(&row.labels)?)
    .bind(&row.dependencies)
    .bind(&row.workflow_root)
    .bind(row.submitted_at)
    .bind(row.completed_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRow, StoreError> {
    sqlx::query_as(
      r#"
            SELECT workflow_id, name, status, document, inputs, options, labels, dependencies, workflow_root, submitted_at, completed_at
            FROM workflow
            WHERE workflow_id = ?
            "#,
    )
    .bind(id.to_string())
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("workflow {}", id)))
  }

  async fn update_workflow_status(
    &self,
    id: WorkflowId,
    status: WorkflowStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            UPDATE workflow
            SET status = ?, completed_at = ?
            WHERE workflow_id = ?
            "#,
    )
    .bind(status.as_str())
    .bind(completed_at)
    .bind(id.to_string())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_non_terminal_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError> {
    sqlx::query_as(
      r#"
            SELECT workflow_id, name, status, document, inputs, options, labels, dependencies, workflow_root, submitted_at, completed_at
            FROM workflow
            WHERE status IN ('submitted', 'running')
            ORDER BY submitted_at ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await
    .map_err(StoreError::Database)
  }

  async fn create_call(&self, row: &CallRow) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO call (workflow_id, node_id, task, shard_index, attempt, kind, status, attributes, inputs, outputs, call_root, failure, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(row.key.workflow.to_string())
    .bind(&row.node_id)
    .bind(&row.key.task)
    .bind(shard_to_db(row.key.shard))
    .bind(row.key.attempt as i64)
    .bind(row.kind.as_str())
    .bind(row.status.as_str())
    .bind(Self::json(&row.attributes)?)
    .bind(Self::json(&row.inputs)?)
    .bind(row.outputs.as_ref().map(Self::json).transpose()?)
    .bind(&row.call_root)
    .bind(&row.failure)
    .bind(row.created_at)
    .bind(row.completed_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_call(&self, key: &CallKey) -> Result<CallRow, StoreError> {
    sqlx::query_as(
      r#"
            SELECT workflow_id, node_id, task, shard_index, attempt, kind, status, attributes, inputs, outputs, call_root, failure, created_at, completed_at
            FROM call
            WHERE workflow_id = ? AND task = ? AND shard_index = ? AND attempt = ?
            "#,
    )
    .bind(key.workflow.to_string())
    .bind(&key.task)
    .bind(shard_to_db(key.shard))
    .bind(key.attempt as i64)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("call {}", key)))
  }

  async fn list_calls(&self, workflow: WorkflowId) -> Result<Vec<CallRow>, StoreError> {
    sqlx::query_as(
      r#"
            SELECT workflow_id, node_id, task, shard_index, attempt, kind, status, attributes, inputs, outputs, call_root, failure, created_at, completed_at
            FROM call
            WHERE workflow_id = ?
            ORDER BY task ASC, shard_index ASC, attempt ASC
            "#,
    )
    .bind(workflow.to_string())
    .fetch_all(&self.pool)
    .await
    .map_err(StoreError::Database)
  }

  async fn transition_call(
    &self,
    row: &CallRow,
    info: &[(String, Option<String>)],
  ) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
            UPDATE call
            SET status = ?, attributes = ?, inputs = ?, outputs = ?, failure = ?, completed_at = ?
            WHERE workflow_id = ? AND task = ? AND shard_index = ? AND attempt = ?
            "#,
    )
    .bind(row.status.as_str())
    .bind(Self::json(&row.attributes)?)
    .bind(Self::json(&row.inputs)?)
    .bind(row.outputs.as_ref().map(Self::json).transpose()?)
    .bind(&row.failure)
    .bind(row.completed_at)
    .bind(row.key.workflow.to_string())
    .bind(&row.key.task)
    .bind(shard_to_db(row.key.shard))
    .bind(row.key.attempt as i64)
    .execute(&mut *tx)
    .await?;

    for (key, value) in info {
      sqlx::query(
        r#"
                INSERT OR REPLACE INTO execution_info (workflow_id, task, shard_index, attempt, info_key, info_value)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
      )
      .bind(row.key.workflow.to_string())
      .bind(&row.key.task)
      .bind(shard_to_db(row.key.shard))
      .bind(row.key.attempt as i64)
      .bind(key)
      .bind(value)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn set_starting_status(
    &self,
    workflow: WorkflowId,
    keys: &[CallKey],
  ) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    for key in keys {
      sqlx::query(
        r#"
                UPDATE call
                SET status = 'starting'
                WHERE workflow_id = ? AND task = ? AND shard_index = ? AND attempt = ?
                "#,
      )
      .bind(workflow.to_string())
      .bind(&key.task)
      .bind(shard_to_db(key.shard))
      .bind(key.attempt as i64)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn reset_transient_executions(
    &self,
    workflow: WorkflowId,
    statuses: &[CallStatus],
  ) -> Result<Vec<CallKey>, StoreError> {
    // Status names come from the fixed enum, so inlining them is safe.
    let status_list = statuses
      .iter()
      .map(|s| format!("'{}'", s.as_str()))
      .collect::<Vec<_>>()
      .join(", ");

    let transient_filter = format!(
      r#"
            workflow_id = ? AND status IN ({}) AND NOT EXISTS (
                SELECT 1 FROM execution_info ei
                WHERE ei.workflow_id = call.workflow_id
                  AND ei.task = call.task
                  AND ei.shard_index = call.shard_index
                  AND ei.attempt = call.attempt
                  AND ei.info_key = 'externalJobId'
                  AND ei.info_value IS NOT NULL
            )
            "#,
      status_list
    );

    let mut tx = self.pool.begin().await?;

    let rows: Vec<CallRow> = sqlx::query_as(&format!(
      r#"
            SELECT workflow_id, node_id, task, shard_index, attempt, kind, status, attributes, inputs, outputs, call_root, failure, created_at, completed_at
            FROM call
            WHERE {}
            "#,
      transient_filter
    ))
    .bind(workflow.to_string())
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query(&format!(
      r#"
            UPDATE call SET status = 'not_started' WHERE {}
            "#,
      transient_filter
    ))
    .bind(workflow.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(rows.into_iter().map(|r| r.key).collect())
  }

  async fn execution_info(
    &self,
    key: &CallKey,
  ) -> Result<BTreeMap<String, Option<String>>, StoreError> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
      r#"
            SELECT info_key, info_value
            FROM execution_info
            WHERE workflow_id = ? AND task = ? AND shard_index = ? AND attempt = ?
            "#,
    )
    .bind(key.workflow.to_string())
    .bind(&key.task)
    .bind(shard_to_db(key.shard))
    .bind(key.attempt as i64)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().collect())
  }

  async fn record_cache_entry(&self, fingerprint: &str, call: &CallRef) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO cache_entry (fingerprint, workflow_id, task, shard_index, attempt, call_root, outputs, detritus, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(fingerprint)
    .bind(call.key.workflow.to_string())
    .bind(&call.key.task)
    .bind(shard_to_db(call.key.shard))
    .bind(call.key.attempt as i64)
    .bind(&call.call_root)
    .bind(Self::json(&call.outputs)?)
    .bind(Self::json(&call.detritus)?)
    .bind(call.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn lookup_cache(&self, fingerprint: &str) -> Result<Vec<CallRef>, StoreError> {
    let rows: Vec<(String, String, i64, i64, String, String, String, DateTime<Utc>)> =
      sqlx::query_as(
        r#"
            SELECT workflow_id, task, shard_index, attempt, call_root, outputs, detritus, created_at
            FROM cache_entry
            WHERE fingerprint = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
      )
      .bind(fingerprint)
      .fetch_all(&self.pool)
      .await?;

    rows
      .into_iter()
      .map(
        |(workflow_id, task, shard, attempt, call_root, outputs, detritus, created_at)| {
          Ok(CallRef {
            key: CallKey {
              workflow: WorkflowId(
                workflow_id
                  .parse()
                  .map_err(|e| StoreError::Corrupt(format!("workflow id: {}", e)))?,
              ),
              task,
              shard: crate::types::shard_from_db(shard),
              attempt: attempt as u32,
            },
            call_root,
            outputs: serde_json::from_str(&outputs)
              .map_err(|e| StoreError::Corrupt(format!("cache outputs: {}", e)))?,
            detritus: serde_json::from_str(&detritus)
              .map_err(|e| StoreError::Corrupt(format!("cache detritus: {}", e)))?,
            created_at,
          })
        },
      )
      .collect()
  }
}

#[async_trait]
impl CacheIndex for SqliteStore {
  async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<PriorResult>, CacheError> {
    let candidates = self
      .lookup_cache(fingerprint.as_str())
      .await
      .map_err(|e| CacheError::Index {
        message: e.to_string(),
      })?;

    if candidates.is_empty() {
      return Ok(None);
    }
    Ok(Some(PriorResult {
      fingerprint: fingerprint.clone(),
      candidates,
    }))
  }

  async fn record(&self, fingerprint: &Fingerprint, call: CallRef) -> Result<(), CacheError> {
    self
      .record_cache_entry(fingerprint.as_str(), &call)
      .await
      .map_err(|e| CacheError::Index {
        message: e.to_string(),
      })
  }
}
