//! The engine supervisor.
//!
//! Admits submissions FIFO from an mpsc queue, enforces the global
//! workflow-concurrency maximum, recovers persisted workflows at startup,
//! and coordinates shutdown: stop accepting, cancel in-flight work at its
//! next suspension point, drain, exit.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rill_core::WorkflowSubmission;

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::workflow::{WorkflowExecution, WorkflowOutcome};

/// Supervises workflow admission and lifecycle.
///
/// # Usage
///
/// ```ignore
/// let supervisor = Supervisor::new(ctx);
/// let sender = supervisor.sender();
/// let cancel = supervisor.cancellation_token();
/// supervisor.run().await?;
/// ```
pub struct Supervisor {
  ctx: Arc<EngineContext>,
  sender: mpsc::Sender<WorkflowSubmission>,
  receiver: mpsc::Receiver<WorkflowSubmission>,
  cancel: CancellationToken,
}

impl Supervisor {
  pub fn new(ctx: Arc<EngineContext>) -> Self {
    let (sender, receiver) = mpsc::channel(ctx.config.submission_buffer);
    Self {
      ctx,
      sender,
      receiver,
      cancel: CancellationToken::new(),
    }
  }

  /// Handle for submitting workflows. Admission is FIFO.
  pub fn sender(&self) -> mpsc::Sender<WorkflowSubmission> {
    self.sender.clone()
  }

  /// Cancelling this token initiates shutdown.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Recover every non-terminal workflow from the store and drive each to a
  /// terminal state. Rejected restarts are recorded as failed workflows and
  /// reported in the outcomes.
  pub async fn recover_all(&self) -> Result<Vec<WorkflowOutcome>, EngineError> {
    let open = self.ctx.store.list_non_terminal_workflows().await?;
    info!(count = open.len(), "recovering persisted workflows");

    let mut outcomes = Vec::with_capacity(open.len());
    for row in open {
      let id = row.id;
      match WorkflowExecution::recover(self.ctx.clone(), row, self.cancel.child_token()).await {
        Ok(execution) => match execution.run().await {
          Ok(outcome) => outcomes.push(outcome),
          Err(e) => {
            error!(workflow_id = %id, error = %e, "recovered workflow failed to run");
            return Err(e);
          }
        },
        Err(e) => {
          warn!(workflow_id = %id, error = %e, "workflow not recoverable");
          outcomes.push(WorkflowOutcome {
            id,
            status: rill_core::WorkflowStatus::Failed,
            outputs: Default::default(),
            failure: Some(e.to_string()),
          });
        }
      }
    }
    Ok(outcomes)
  }

  /// The admission loop. Blocks until the cancellation token fires or the
  /// submission channel closes, then drains in-flight workflows.
  pub async fn run(mut self) -> Result<(), EngineError> {
    let workflow_permits = Arc::new(Semaphore::new(self.ctx.config.max_active_workflows));
    let mut active: JoinSet<()> = JoinSet::new();
    info!(
      max_active = self.ctx.config.max_active_workflows,
      "supervisor started"
    );

    loop {
      tokio::select! {
        _ = self.cancel.cancelled() => {
          info!("shutdown requested; no further submissions accepted");
          break;
        }
        submission = self.receiver.recv() => {
          let Some(submission) = submission else {
            info!("submission channel closed");
            break;
          };

          // FIFO admission: the next submission waits here until a
          // workflow slot frees up.
          let permit = tokio::select! {
            _ = self.cancel.cancelled() => break,
            permit = workflow_permits.clone().acquire_owned() => {
              match permit {
                Ok(permit) => permit,
                Err(_) => break,
              }
            }
          };

          let ctx = self.ctx.clone();
          let cancel = self.cancel.child_token();
          active.spawn(async move {
            let _permit = permit;
            match WorkflowExecution::submit(ctx, submission, cancel).await {
              Ok(execution) => {
                let id = execution.id();
                match execution.run().await {
                  Ok(outcome) => {
                    info!(workflow_id = %id, status = outcome.status.as_str(), "workflow finished");
                  }
                  Err(e) => {
                    error!(workflow_id = %id, error = %e, "workflow lost durable progress");
                  }
                }
              }
              Err(e) => {
                warn!(error = %e, "submission rejected");
              }
            }
          });
        }
      }
    }

    // Quiesce: every in-flight task observes the cancellation at its next
    // suspension point and persists a terminal state on the way out.
    info!(in_flight = active.len(), "draining in-flight workflows");
    while active.join_next().await.is_some() {}
    info!("supervisor stopped");
    Ok(())
  }
}
