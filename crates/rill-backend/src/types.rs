use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rill_core::{CallKey, Detritus, RuntimeAttributes, TaskDef, Value};

/// Opaque per-workflow initialization data, produced by
/// `initialize_workflow` and threaded through `prepare_call` and cleanup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitData {
  pub entries: BTreeMap<String, String>,
}

/// Everything the engine has resolved about a call before handing it to a
/// backend: the task body, the attempt's runtime attributes, and the input
/// values (file-producing expressions already evaluated).
#[derive(Debug, Clone)]
pub struct CallPlan {
  pub key: CallKey,
  pub task: TaskDef,
  pub attributes: RuntimeAttributes,
  pub inputs: BTreeMap<String, Value>,
  /// Workflow root; the backend assigns the call root beneath it.
  pub workflow_root: String,
  /// Optional user script run alongside the call; its stdout delocalizes to
  /// `monitoring.log` in the call root.
  pub monitoring_script: Option<String>,
}

/// A call bound to a backend: call root assigned, inputs localized, command
/// rendered. Produced by `prepare_call`, consumed by `execute` and the
/// cache-hit copy.
#[derive(Debug, Clone)]
pub struct BoundCall {
  pub key: CallKey,
  pub task: TaskDef,
  pub attributes: RuntimeAttributes,
  /// Inputs after the backend's localization rewrite.
  pub inputs: BTreeMap<String, Value>,
  /// Rendered command, ready for the substrate.
  pub command: String,
  pub call_root: String,
  pub detritus: Detritus,
  pub monitoring_script: Option<String>,
}

/// Handle to a running execution, backend-specific.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionHandle {
  /// The local backend watches the call root for the rc file; the pid is
  /// recorded for abort and as the external job id.
  Local { call_root: String, pid: Option<u32> },
  /// The scripted backend identifies executions by task name.
  Scripted { task: String },
}

impl ExecutionHandle {
  /// External job id recorded in execution info, when the substrate has one.
  pub fn external_id(&self) -> Option<String> {
    match self {
      ExecutionHandle::Local { pid, .. } => pid.map(|p| p.to_string()),
      ExecutionHandle::Scripted { task } => Some(format!("scripted-{}", task)),
    }
  }
}

/// Minimum error-code set the engine interprets from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCode {
  /// Host reclaimed; retryable under the preemption attempt budget.
  Preempted,
  /// External abort observed.
  Canceled,
  /// Transient IO failure; retried on the bounded curve.
  TransientIo,
  /// Terminal failure.
  Nonretryable,
}

impl FailureCode {
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Preempted | Self::TransientIo)
  }
}

/// A timestamped execution event reported alongside poll outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
  pub timestamp: DateTime<Utc>,
  pub description: String,
}

impl ExecutionEvent {
  pub fn now(description: impl Into<String>) -> Self {
    Self {
      timestamp: Utc::now(),
      description: description.into(),
    }
  }
}

/// Result of polling an execution handle.
#[derive(Debug, Clone)]
pub enum PollOutcome {
  /// Still running; poll again with the returned handle.
  Running(ExecutionHandle),
  /// The process completed and outputs were evaluated. The engine still
  /// applies the return-code and stderr policies before declaring success.
  Succeeded {
    outputs: BTreeMap<String, Value>,
    return_code: i32,
    events: Vec<ExecutionEvent>,
  },
  Failed {
    code: FailureCode,
    message: String,
    events: Vec<ExecutionEvent>,
  },
  Aborted,
}
