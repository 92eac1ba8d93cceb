//! Rill Metadata
//!
//! An append-only event stream of state transitions for observers. Events
//! are emitted after the owning persistence transaction commits - the stream
//! is observability, not the source of truth.
//!
//! The publisher contract is fire-and-forget with bounded buffering: a slow
//! consumer loses events rather than backpressuring the engine, and every
//! loss is logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use rill_core::{CallKey, CallStatus, DetritusKind, RuntimeAttributes, WorkflowId, WorkflowStatus};

/// One metadata record: a keyed value at a point in time, scoped to a
/// workflow and optionally to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvent {
  pub workflow: WorkflowId,
  pub call: Option<CallKey>,
  /// Dotted key path, e.g. `status` or `detritus.stdout`.
  pub key: String,
  pub timestamp: DateTime<Utc>,
  pub value: serde_json::Value,
}

impl MetadataEvent {
  fn new(
    workflow: WorkflowId,
    call: Option<CallKey>,
    key: impl Into<String>,
    value: serde_json::Value,
  ) -> Self {
    Self {
      workflow,
      call,
      key: key.into(),
      timestamp: Utc::now(),
      value,
    }
  }

  /// Workflow status transition.
  pub fn workflow_status(workflow: WorkflowId, status: WorkflowStatus) -> Self {
    Self::new(
      workflow,
      None,
      "status",
      serde_json::to_value(status).expect("status serialization is infallible"),
    )
  }

  /// Call status transition.
  pub fn call_status(call: CallKey, status: CallStatus) -> Self {
    Self::new(
      call.workflow,
      Some(call),
      "status",
      serde_json::to_value(status).expect("status serialization is infallible"),
    )
  }

  /// Runtime-attributes snapshot taken at call start.
  pub fn runtime_attributes(call: CallKey, attributes: &RuntimeAttributes) -> Self {
    Self::new(
      call.workflow,
      Some(call),
      "runtimeAttributes",
      serde_json::to_value(attributes).expect("attributes serialization is infallible"),
    )
  }

  /// Registration of one detritus path for a call.
  pub fn detritus_path(call: CallKey, kind: DetritusKind, path: &str) -> Self {
    let key = format!(
      "detritus.{}",
      serde_json::to_value(kind)
        .expect("kind serialization is infallible")
        .as_str()
        .unwrap_or("unknown")
    );
    Self::new(call.workflow, Some(call), key, serde_json::Value::String(path.to_string()))
  }
}

/// Trait for receiving metadata events.
///
/// The engine calls `publish` after each durable transition - implementations
/// decide what to do with the events (persist, stream, aggregate, ignore).
pub trait MetadataPublisher: Send + Sync {
  fn publish(&self, event: MetadataEvent);
}

/// A publisher that discards all events. Useful for tests.
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

impl MetadataPublisher for NoopPublisher {
  fn publish(&self, _event: MetadataEvent) {
    // Intentionally empty
  }
}

/// A publisher that sends events to a bounded channel.
///
/// A full buffer drops the event rather than blocking the engine; the
/// contract permits loss but requires it to be logged.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
  sender: mpsc::Sender<MetadataEvent>,
}

impl ChannelPublisher {
  /// Create a publisher and its consumer half.
  pub fn bounded(buffer: usize) -> (Self, mpsc::Receiver<MetadataEvent>) {
    let (sender, receiver) = mpsc::channel(buffer);
    (Self { sender }, receiver)
  }
}

impl MetadataPublisher for ChannelPublisher {
  fn publish(&self, event: MetadataEvent) {
    if let Err(e) = self.sender.try_send(event) {
      let (event, reason) = match &e {
        mpsc::error::TrySendError::Full(ev) => (ev, "buffer full"),
        mpsc::error::TrySendError::Closed(ev) => (ev, "consumer gone"),
      };
      warn!(
        workflow_id = %event.workflow,
        key = %event.key,
        "metadata event dropped: {}",
        reason
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_call_status_event_shape() {
    let key = CallKey::new(WorkflowId::generate(), "main.t");
    let event = MetadataEvent::call_status(key.clone(), CallStatus::Running);
    assert_eq!(event.workflow, key.workflow);
    assert_eq!(event.call, Some(key));
    assert_eq!(event.key, "status");
    assert_eq!(event.value, serde_json::json!("running"));
  }

  #[test]
  fn test_detritus_key_path() {
    let key = CallKey::new(WorkflowId::generate(), "main.t");
    let event = MetadataEvent::detritus_path(key, DetritusKind::ReturnCode, "/root/rc");
    assert_eq!(event.key, "detritus.returnCode");
  }

  #[tokio::test]
  async fn test_bounded_publisher_drops_on_overflow() {
    let (publisher, mut receiver) = ChannelPublisher::bounded(1);
    let wf = WorkflowId::generate();

    publisher.publish(MetadataEvent::workflow_status(wf, WorkflowStatus::Running));
    // Buffer full: dropped, not blocked.
    publisher.publish(MetadataEvent::workflow_status(wf, WorkflowStatus::Succeeded));

    let first = receiver.recv().await.unwrap();
    assert_eq!(first.value, serde_json::json!("running"));
    assert!(receiver.try_recv().is_err());
  }
}
