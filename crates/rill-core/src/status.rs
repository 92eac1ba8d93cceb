use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow.
///
/// `Submitted → Running → (Succeeded | Failed | Aborted)`. Terminal states
/// are immutable: a workflow takes exactly one terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
  Submitted,
  Running,
  Succeeded,
  Failed,
  Aborted,
}

impl WorkflowStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
  }

  /// Stable snake_case name, matching the serde form. Used for row columns
  /// and log fields.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Submitted => "submitted",
      Self::Running => "running",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
      Self::Aborted => "aborted",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "submitted" => Some(Self::Submitted),
      "running" => Some(Self::Running),
      "succeeded" => Some(Self::Succeeded),
      "failed" => Some(Self::Failed),
      "aborted" => Some(Self::Aborted),
      _ => None,
    }
  }
}

/// Lifecycle status of a call (one task invocation at a shard and attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
  NotStarted,
  Starting,
  Running,
  Succeeded,
  Failed,
  Aborted,
  RetryableFailure,
  Preempted,
}

impl CallStatus {
  /// Terminal for the call row itself. `RetryableFailure` and `Preempted`
  /// are terminal for the attempt; continuation happens through a new call
  /// row with the next attempt number.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Self::Succeeded | Self::Failed | Self::Aborted | Self::RetryableFailure | Self::Preempted
    )
  }

  /// Terminal and successful: downstream nodes may consume this call's
  /// outputs.
  pub fn is_terminal_success(&self) -> bool {
    matches!(self, Self::Succeeded)
  }

  /// Stable snake_case name, matching the serde form.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::NotStarted => "not_started",
      Self::Starting => "starting",
      Self::Running => "running",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
      Self::Aborted => "aborted",
      Self::RetryableFailure => "retryable_failure",
      Self::Preempted => "preempted",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "not_started" => Some(Self::NotStarted),
      "starting" => Some(Self::Starting),
      "running" => Some(Self::Running),
      "succeeded" => Some(Self::Succeeded),
      "failed" => Some(Self::Failed),
      "aborted" => Some(Self::Aborted),
      "retryable_failure" => Some(Self::RetryableFailure),
      "preempted" => Some(Self::Preempted),
      _ => None,
    }
  }
}

/// What a call row represents: a task invocation, a scatter parent, or the
/// collector that projects shard results back into an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
  Task,
  Scatter,
  Collector,
}

impl CallKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Task => "task",
      Self::Scatter => "scatter",
      Self::Collector => "collector",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "task" => Some(Self::Task),
      "scatter" => Some(Self::Scatter),
      "collector" => Some(Self::Collector),
      _ => None,
    }
  }
}
