//! Engine errors.
//!
//! All error propagation in the engine uses one of these kinds. Local
//! recovery happens only for `CallTransient`, `CacheLookup`, and
//! `CacheCopy`; everything else propagates to the workflow state machine,
//! which records a terminal state and publishes metadata before returning.

use rill_core::ModelError;
use rill_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The submission was rejected before any state was created.
  #[error("validation failed: {message}")]
  Validation { message: String },

  /// The workflow failed before any call ran; backend cleanup still runs.
  #[error("workflow initialization failed: {message}")]
  Initialization { message: String },

  /// A retryable call failure whose attempts are exhausted.
  #[error("call '{call}' failed transiently: {message}")]
  CallTransient { call: String, message: String },

  /// A preempted call; surfaced as `CallTransient` once the preemption
  /// budget is exhausted.
  #[error("call '{call}' was preempted: {message}")]
  CallPreempted { call: String, message: String },

  /// A call failed terminally; the workflow fails unless
  /// `continue_on_failure` is set.
  #[error("call '{call}' failed: {message}")]
  CallFatal { call: String, message: String },

  /// A cache lookup failed; logged and treated as a miss.
  #[error("cache lookup failed: {message}")]
  CacheLookup { message: String },

  /// A cache candidate copy failed; the next candidate is tried, and when
  /// none remain the hit is treated as a miss.
  #[error("cache copy failed: {message}")]
  CacheCopy { message: String },

  /// Durable progress can no longer be guaranteed; fatal to the workflow.
  #[error("persistence failed")]
  Persistence {
    #[from]
    source: StoreError,
  },

  /// Cancellation observed at a suspension point.
  #[error("execution aborted")]
  Aborted,
}

impl EngineError {
  pub(crate) fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub(crate) fn fatal(call: &rill_core::CallKey, message: impl std::fmt::Display) -> Self {
    Self::CallFatal {
      call: call.to_string(),
      message: message.to_string(),
    }
  }
}

impl From<ModelError> for EngineError {
  fn from(e: ModelError) -> Self {
    Self::Validation {
      message: e.to_string(),
    }
  }
}
