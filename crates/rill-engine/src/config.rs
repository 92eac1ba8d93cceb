use std::path::PathBuf;
use std::time::Duration;

use rill_cache::HitStrategy;
use rill_retry::RetryPolicy;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Default base path for execution products; a submission's
  /// `workflow_root` overrides it.
  pub workflow_root: PathBuf,
  /// Workflows concurrently active.
  pub max_active_workflows: usize,
  /// Calls concurrently dispatched to the backend.
  pub max_dispatched_calls: usize,
  /// Retry policy wrapping dispatch and IO.
  pub retry: RetryPolicy,
  /// Deadline on each backend call; expiry classifies as a transient IO
  /// failure and rides the retry curve.
  pub backend_deadline: Duration,
  /// How cache hits are materialized.
  pub hit_strategy: HitStrategy,
  /// Submission queue depth.
  pub submission_buffer: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      workflow_root: PathBuf::from("rill-executions"),
      max_active_workflows: 16,
      max_dispatched_calls: 64,
      retry: RetryPolicy::default(),
      backend_deadline: Duration::from_secs(600),
      hit_strategy: HitStrategy::UseOriginal,
      submission_buffer: 100,
    }
  }
}
