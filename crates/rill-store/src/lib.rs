//! Rill Store
//!
//! This crate provides the persistence adapter for the engine. Data is
//! persisted to SQLite via sqlx; the [`Store`] trait keeps the engine
//! agnostic of the concrete database.
//!
//! The [`Store`] trait defines operations for:
//! - Workflow rows: creation, status transitions, non-terminal scans
//! - Call rows: creation, transactional transitions with execution-info
//!   upserts, the atomic restart batches
//! - Cache entries: recording and fingerprint lookups
//!
//! Every call state transition is a single transaction: the call row update
//! and its execution-info rows commit together, and metadata is published by
//! the engine only after the commit returns.

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::{CallRow, WorkflowRow};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rill_cache::CallRef;
use rill_core::{CallKey, CallStatus, WorkflowId, WorkflowStatus};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested row was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A row failed to decode into its model type.
  #[error("corrupt row: {0}")]
  Corrupt(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for workflow, call, execution-info, and cache rows.
#[async_trait]
pub trait Store: Send + Sync {
  /// Insert a new workflow row.
  async fn create_workflow(&self, row: &WorkflowRow) -> Result<(), StoreError>;

  /// Get a workflow row by id.
  async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRow, StoreError>;

  /// Update the status of a workflow. Terminal transitions set
  /// `completed_at`.
  async fn update_workflow_status(
    &self,
    id: WorkflowId,
    status: WorkflowStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), StoreError>;

  /// All workflows not yet terminal, in submission order.
  async fn list_non_terminal_workflows(&self) -> Result<Vec<WorkflowRow>, StoreError>;

  /// Insert a new call row.
  async fn create_call(&self, row: &CallRow) -> Result<(), StoreError>;

  /// Get a call row by key.
  async fn get_call(&self, key: &CallKey) -> Result<CallRow, StoreError>;

  /// All call rows of a workflow, ordered by (task, shard, attempt).
  async fn list_calls(&self, workflow: WorkflowId) -> Result<Vec<CallRow>, StoreError>;

  /// One durable state transition: update the call row and upsert the given
  /// execution-info pairs in a single transaction.
  async fn transition_call(
    &self,
    row: &CallRow,
    info: &[(String, Option<String>)],
  ) -> Result<(), StoreError>;

  /// Atomically mark the given calls `Starting`.
  async fn set_starting_status(
    &self,
    workflow: WorkflowId,
    keys: &[CallKey],
  ) -> Result<(), StoreError>;

  /// Atomically reset to `NotStarted` every call of the workflow whose
  /// status is in `statuses` and which has no recorded external job id (a
  /// "transient" execution). Returns the reset keys.
  async fn reset_transient_executions(
    &self,
    workflow: WorkflowId,
    statuses: &[CallStatus],
  ) -> Result<Vec<CallKey>, StoreError>;

  /// Execution-info map for one call.
  async fn execution_info(
    &self,
    key: &CallKey,
  ) -> Result<BTreeMap<String, Option<String>>, StoreError>;

  /// Record a completed call under a fingerprint.
  async fn record_cache_entry(&self, fingerprint: &str, call: &CallRef) -> Result<(), StoreError>;

  /// Prior calls for a fingerprint, most-recent first (insertion order as
  /// the tie-break, so the order is total).
  async fn lookup_cache(&self, fingerprint: &str) -> Result<Vec<CallRef>, StoreError>;
}
