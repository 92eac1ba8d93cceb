//! Rill Backend
//!
//! The backend dispatch contract and the in-tree backends. A backend is a
//! pluggable execution substrate: the engine prepares a call, the backend
//! runs it somewhere, and the engine polls the returned handle until a
//! terminal outcome arrives.
//!
//! Backends are one enum with per-variant state held by value - tagged
//! dispatch, not a class hierarchy. Adding a substrate means adding a
//! variant and its module.

mod cache_hit;
mod local;
mod scripted;
mod template;
mod types;

pub use local::LocalBackend;
pub use scripted::{ScriptedBackend, ScriptedOutcome};
pub use types::{
  BoundCall, CallPlan, ExecutionEvent, ExecutionHandle, FailureCode, InitData, PollOutcome,
};

use rill_cache::{HitStrategy, PriorResult};
use rill_core::{Value, WorkflowId, WorkflowOptions};
use rill_retry::BackoffCurve;

use std::collections::BTreeMap;

/// Error type for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
  /// Submission to the substrate failed; usually transient.
  #[error("submit failed: {message}")]
  Submit { message: String },

  /// A path or data-movement operation failed.
  #[error("backend io failed")]
  Io {
    #[from]
    source: rill_io::IoError,
  },

  /// The command template could not be rendered against the inputs.
  #[error("command template render failed: {message}")]
  Template { message: String },

  /// A declared output could not be evaluated after the call completed.
  #[error("output '{name}' evaluation failed: {message}")]
  Output { name: String, message: String },

  /// Every cache candidate was rejected; the caller treats this as a miss.
  #[error("no usable cache candidate: {message}")]
  CacheHit { message: String },

  /// This backend does not support the operation.
  #[error("operation '{op}' not supported by this backend")]
  Unsupported { op: &'static str },
}

impl BackendError {
  /// Whether the engine may retry the operation in place (submit-time
  /// transients), as opposed to failing the attempt.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Submit { .. } | Self::Io { .. })
  }
}

/// A pluggable execution substrate.
///
/// Every operation is async and may suspend; the engine wraps each one in a
/// deadline and its retry policy.
pub enum Backend {
  Local(LocalBackend),
  Scripted(ScriptedBackend),
}

impl Backend {
  pub fn name(&self) -> &'static str {
    match self {
      Backend::Local(_) => "local",
      Backend::Scripted(_) => "scripted",
    }
  }

  /// Poll backoff schedule for this backend.
  pub fn poll_backoff(&self) -> BackoffCurve {
    match self {
      Backend::Local(b) => b.poll_backoff(),
      Backend::Scripted(b) => b.poll_backoff(),
    }
  }

  /// Validate workflow options before any state is created. Returns error
  /// descriptors; empty means admissible.
  pub fn validate_options(&self, options: &WorkflowOptions) -> Vec<String> {
    let mut errors = options.validate();
    if let Backend::Local(b) = self {
      errors.extend(b.validate_options(options));
    }
    errors
  }

  /// Per-workflow initialization (credentials, scratch areas). The returned
  /// data is handed back to every `prepare_call` and to cleanup.
  pub async fn initialize_workflow(
    &self,
    workflow: WorkflowId,
    options: &WorkflowOptions,
  ) -> Result<InitData, BackendError> {
    match self {
      Backend::Local(b) => b.initialize_workflow(workflow, options).await,
      Backend::Scripted(b) => b.initialize_workflow(workflow, options).await,
    }
  }

  /// Assign the call root, localize file inputs, and render the command.
  pub async fn prepare_call(
    &self,
    plan: CallPlan,
    init: &InitData,
  ) -> Result<BoundCall, BackendError> {
    match self {
      Backend::Local(b) => b.prepare_call(plan, init).await,
      Backend::Scripted(b) => b.prepare_call(plan, init).await,
    }
  }

  /// Dispatch a prepared call. The returned handle is what `poll` consumes.
  pub async fn execute(&self, bound: &BoundCall) -> Result<ExecutionHandle, BackendError> {
    match self {
      Backend::Local(b) => b.execute(bound).await,
      Backend::Scripted(b) => b.execute(bound).await,
    }
  }

  /// Reattach to an execution recorded before a restart.
  pub async fn resume(
    &self,
    bound: &BoundCall,
    token: &str,
  ) -> Result<ExecutionHandle, BackendError> {
    match self {
      Backend::Local(b) => b.resume(bound, token).await,
      Backend::Scripted(b) => b.resume(bound, token).await,
    }
  }

  /// Observe the execution. Non-terminal outcomes carry the (possibly
  /// renewed) handle for the next poll.
  pub async fn poll(
    &self,
    bound: &BoundCall,
    handle: ExecutionHandle,
  ) -> Result<PollOutcome, BackendError> {
    match self {
      Backend::Local(b) => b.poll(bound, handle).await,
      Backend::Scripted(b) => b.poll(bound, handle).await,
    }
  }

  pub async fn abort(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
    match self {
      Backend::Local(b) => b.abort(handle).await,
      Backend::Scripted(b) => b.abort(handle).await,
    }
  }

  /// Satisfy a call from a prior result instead of executing. Candidates
  /// are tried in order; a rejected candidate falls through to the next.
  /// Returns the outputs and the detritus the new call should record.
  pub async fn copy_cache_hit(
    &self,
    bound: &BoundCall,
    prior: &PriorResult,
    strategy: HitStrategy,
  ) -> Result<(BTreeMap<String, Value>, rill_core::Detritus), BackendError> {
    let io = match self {
      Backend::Local(b) => b.io(),
      Backend::Scripted(b) => b.io(),
    };
    cache_hit::copy_cache_hit(io, bound, prior, strategy).await
  }

  /// Tear down whatever `initialize_workflow` set up. Invoked on terminal
  /// workflows, including initialization failures.
  pub async fn cleanup_workflow(
    &self,
    workflow: WorkflowId,
    init: &InitData,
  ) -> Result<(), BackendError> {
    match self {
      Backend::Local(b) => b.cleanup_workflow(workflow, init).await,
      Backend::Scripted(b) => b.cleanup_workflow(workflow, init).await,
    }
  }
}
