use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use rill_core::{
  CallKey, CallKind, CallStatus, RuntimeAttributes, Value, WorkflowDocument, WorkflowId,
  WorkflowOptions, WorkflowStatus,
};

/// A workflow as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRow {
  pub id: WorkflowId,
  pub name: String,
  pub status: WorkflowStatus,
  pub document: WorkflowDocument,
  pub inputs: serde_json::Map<String, serde_json::Value>,
  pub options: WorkflowOptions,
  pub labels: BTreeMap<String, String>,
  /// Opaque reference to the submission's import bundle, when one was
  /// attached.
  pub dependencies: Option<String>,
  pub workflow_root: String,
  pub submitted_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

/// A call (one task invocation at a shard and attempt) as stored in the
/// database. Scatter parents and collectors are rows of the same table,
/// distinguished by `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRow {
  pub key: CallKey,
  /// Graph node this call belongs to.
  pub node_id: String,
  pub kind: CallKind,
  pub status: CallStatus,
  pub attributes: RuntimeAttributes,
  pub inputs: BTreeMap<String, Value>,
  pub outputs: Option<BTreeMap<String, Value>>,
  pub call_root: String,
  pub failure: Option<String>,
  pub created_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl CallRow {
  /// A fresh `NotStarted` row for a call about to be created.
  pub fn not_started(
    key: CallKey,
    node_id: impl Into<String>,
    kind: CallKind,
    attributes: RuntimeAttributes,
    call_root: impl Into<String>,
  ) -> Self {
    Self {
      key,
      node_id: node_id.into(),
      kind,
      status: CallStatus::NotStarted,
      attributes,
      inputs: BTreeMap::new(),
      outputs: None,
      call_root: call_root.into(),
      failure: None,
      created_at: Utc::now(),
      completed_at: None,
    }
  }
}

/// Database form of a shard index: -1 means "not sharded".
pub(crate) fn shard_to_db(shard: Option<u32>) -> i64 {
  shard.map(|s| s as i64).unwrap_or(-1)
}

pub(crate) fn shard_from_db(shard: i64) -> Option<u32> {
  (shard >= 0).then_some(shard as u32)
}

fn decode<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, sqlx::Error> {
  serde_json::from_str(raw).map_err(|e| sqlx::Error::ColumnDecode {
    index: column.to_string(),
    source: Box::new(e),
  })
}

fn decode_status<T>(
  column: &str,
  raw: &str,
  parse: impl Fn(&str) -> Option<T>,
) -> Result<T, sqlx::Error> {
  parse(raw).ok_or_else(|| sqlx::Error::ColumnDecode {
    index: column.to_string(),
    source: format!("unknown value '{}'", raw).into(),
  })
}

impl<'r> FromRow<'r, SqliteRow> for WorkflowRow {
  fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
    let id: String = row.try_get("workflow_id")?;
    let status: String = row.try_get("status")?;
    let document: String = row.try_get("document")?;
    let inputs: String = row.try_get("inputs")?;
    let options: String = row.try_get("options")?;
    let labels: String = row.try_get("labels")?;

    Ok(Self {
      id: WorkflowId(id.parse().map_err(|e| sqlx::Error::ColumnDecode {
        index: "workflow_id".to_string(),
        source: Box::new(e),
      })?),
      name: row.try_get("name")?,
      status: decode_status("status", &status, WorkflowStatus::parse)?,
      document: decode("document", &document)?,
      inputs: decode("inputs", &inputs)?,
      options: decode("options", &options)?,
      labels: decode("labels", &labels)?,
      dependencies: row.try_get("dependencies")?,
      workflow_root: row.try_get("workflow_root")?,
      submitted_at: row.try_get("submitted_at")?,
      completed_at: row.try_get("completed_at")?,
    })
  }
}

impl<'r> FromRow<'r, SqliteRow> for CallRow {
  fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
    let workflow_id: String = row.try_get("workflow_id")?;
    let shard: i64 = row.try_get("shard_index")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let attributes: String = row.try_get("attributes")?;
    let inputs: String = row.try_get("inputs")?;
    let outputs: Option<String> = row.try_get("outputs")?;

    Ok(Self {
      key: CallKey {
        workflow: WorkflowId(workflow_id.parse().map_err(|e| sqlx::Error::ColumnDecode {
          index: "workflow_id".to_string(),
          source: Box::new(e),
        })?),
        task: row.try_get("task")?,
        shard: shard_from_db(shard),
        attempt: row.try_get::<i64, _>("attempt")? as u32,
      },
      node_id: row.try_get("node_id")?,
      kind: decode_status("kind", &kind, CallKind::parse)?,
      status: decode_status("status", &status, CallStatus::parse)?,
      attributes: decode("attributes", &attributes)?,
      inputs: decode("inputs", &inputs)?,
      outputs: outputs.as_deref().map(|o| decode("outputs", o)).transpose()?,
      call_root: row.try_get("call_root")?,
      failure: row.try_get("failure")?,
      created_at: row.try_get("created_at")?,
      completed_at: row.try_get("completed_at")?,
    })
  }
}
