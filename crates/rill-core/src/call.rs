use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution-info key under which a backend records its external job id.
pub const EXEC_INFO_JOB_ID: &str = "externalJobId";

/// Execution-info key under which a backend records its external status.
pub const EXEC_INFO_STATUS: &str = "externalStatus";

/// Opaque 128-bit workflow identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
  pub fn generate() -> Self {
    Self(Uuid::new_v4())
  }
}

impl fmt::Display for WorkflowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// Uniquely identifies one invocation of one task.
///
/// A call key never repeats once its call is terminal; retries mint a new key
/// with the attempt counter incremented. Attempt numbers start at 1 and are
/// contiguous per (workflow, task, shard).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
  pub workflow: WorkflowId,
  /// Fully qualified task name, e.g. `main.say_hello`.
  pub task: String,
  /// Shard index when the call was produced by a scatter expansion.
  pub shard: Option<u32>,
  /// Attempt number, starting at 1.
  pub attempt: u32,
}

impl CallKey {
  pub fn new(workflow: WorkflowId, task: impl Into<String>) -> Self {
    Self {
      workflow,
      task: task.into(),
      shard: None,
      attempt: 1,
    }
  }

  pub fn shard(mut self, index: u32) -> Self {
    self.shard = Some(index);
    self
  }

  /// The key of the next attempt for the same (workflow, task, shard).
  pub fn next_attempt(&self) -> Self {
    Self {
      attempt: self.attempt + 1,
      ..self.clone()
    }
  }

  /// Directory name for this call under the workflow root, without the
  /// attempt segment: `call-<task>` or `call-<task>-<shard>`.
  pub fn call_dir(&self) -> String {
    match self.shard {
      Some(shard) => format!("call-{}-{}", self.task, shard),
      None => format!("call-{}", self.task),
    }
  }

  /// Attempt directory name: `attempt-<n>`.
  pub fn attempt_dir(&self) -> String {
    format!("attempt-{}", self.attempt)
  }
}

impl fmt::Display for CallKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.task)?;
    if let Some(shard) = self.shard {
      write!(f, ":shard-{}", shard)?;
    }
    write!(f, ":attempt-{}", self.attempt)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_call_dir_without_shard() {
    let key = CallKey::new(WorkflowId::generate(), "main.say_hello");
    assert_eq!(key.call_dir(), "call-main.say_hello");
    assert_eq!(key.attempt_dir(), "attempt-1");
  }

  #[test]
  fn test_call_dir_with_shard() {
    let key = CallKey::new(WorkflowId::generate(), "main.count").shard(3);
    assert_eq!(key.call_dir(), "call-main.count-3");
  }

  #[test]
  fn test_next_attempt_increments() {
    let key = CallKey::new(WorkflowId::generate(), "main.t").shard(1);
    let next = key.next_attempt();
    assert_eq!(next.attempt, 2);
    assert_eq!(next.shard, Some(1));
    assert_eq!(next.task, key.task);
  }
}
