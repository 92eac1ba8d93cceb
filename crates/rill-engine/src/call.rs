//! The per-call state machine.
//!
//! One invocation of one task: cache lookup, dispatch, poll, return-code
//! policy, and the attempt loop (preemption budget, bounded retries, memory
//! retry). Every retry is a new call row with the next attempt number; rows
//! are never mutated across attempts.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use rill_backend::{BackendError, BoundCall, CallPlan, ExecutionHandle, FailureCode, PollOutcome};
use rill_cache::{fingerprint, CallRef, Fingerprint};
use rill_core::{
  CallKey, CallKind, CallStatus, Detritus, DetritusKind, RuntimeAttributes, TaskDef, Value,
};
use rill_metadata::MetadataEvent;
use rill_retry::{cancellable_sleep, retry, FailureClass, RetryError};
use rill_store::CallRow;

use crate::context::{EngineContext, WorkflowEnv};
use crate::error::EngineError;

/// A task invocation the workflow state machine wants executed.
#[derive(Debug, Clone)]
pub(crate) struct CallRequest {
  pub node_id: String,
  pub task_name: String,
  pub task: TaskDef,
  pub shard: Option<u32>,
  /// Resolved input values (file-producing expressions already evaluated).
  pub inputs: BTreeMap<String, Value>,
}

/// How one attempt ended, from the attempt loop's point of view.
enum AttemptVerdict {
  Done(BTreeMap<String, Value>),
  /// Try again: the status the finished attempt was recorded with, and the
  /// attributes for the next attempt.
  Again {
    recorded: CallStatus,
    next_attributes: RuntimeAttributes,
  },
}

pub(crate) struct CallRunner<'a> {
  ctx: &'a EngineContext,
  env: &'a WorkflowEnv,
  req: CallRequest,
}

impl<'a> CallRunner<'a> {
  pub fn new(ctx: &'a EngineContext, env: &'a WorkflowEnv, req: CallRequest) -> Self {
    Self { ctx, env, req }
  }

  /// Drive the call to a terminal state, across attempts.
  #[instrument(name = "call_execute", skip(self), fields(workflow_id = %self.env.id, task = %self.req.task_name))]
  pub async fn run(self) -> Result<BTreeMap<String, Value>, EngineError> {
    // A restart may have planned this call for resumption instead.
    if let Some((row, external_id)) = self
      .env
      .resume
      .get(&(self.req.task_name.clone(), self.req.shard))
      .cloned()
    {
      return self.resume(row, &external_id).await;
    }

    let mut attributes =
      RuntimeAttributes::resolve(&self.req.task.runtime, self.env.options.preemptible());
    let preemption_budget = attributes.preemptible;
    let mut retries_left = attributes.max_retries;

    // The fingerprint is a function of the task body, the resolved inputs,
    // and the image identity; it does not change across attempts.
    let print = self.compute_fingerprint(&attributes).await;

    // Adopt durable rows left by a previous engine process: a Succeeded row
    // short-circuits, a reset NotStarted row is reused at its attempt
    // number, and terminal attempts push the counter past themselves.
    let mut attempt: u32 = 1;
    let mut reuse_row = false;
    let existing: Vec<CallRow> = self
      .ctx
      .store
      .list_calls(self.env.id)
      .await?
      .into_iter()
      .filter(|r| {
        r.kind == CallKind::Task
          && r.key.task == self.req.task_name
          && r.key.shard == self.req.shard
      })
      .collect();
    if let Some(last) = existing.iter().max_by_key(|r| r.key.attempt) {
      match last.status {
        CallStatus::Succeeded => return Ok(last.outputs.clone().unwrap_or_default()),
        CallStatus::NotStarted => {
          attempt = last.key.attempt;
          reuse_row = true;
        }
        _ => attempt = last.key.attempt + 1,
      }
      let prior_retries = existing
        .iter()
        .filter(|r| r.status == CallStatus::RetryableFailure)
        .count() as u32;
      retries_left = retries_left.saturating_sub(prior_retries);
      if attempt > preemption_budget {
        attributes = attributes.non_preemptible();
      }
    }

    loop {
      let key = CallKey {
        workflow: self.env.id,
        task: self.req.task_name.clone(),
        shard: self.req.shard,
        attempt,
      };

      match self
        .run_attempt(
          &key,
          &attributes,
          preemption_budget,
          retries_left,
          print.as_ref(),
          reuse_row,
        )
        .await?
      {
        AttemptVerdict::Done(outputs) => return Ok(outputs),
        AttemptVerdict::Again {
          recorded,
          next_attributes,
        } => {
          if recorded == CallStatus::RetryableFailure {
            retries_left -= 1;
          }
          attributes = next_attributes;
          attempt += 1;
          reuse_row = false;
        }
      }
    }
  }

  /// Re-attach to a call that was `Running` with an external job id when
  /// the engine stopped. No new attempt is minted; the existing row
  /// resumes and runs to a terminal state.
  #[instrument(name = "call_resume", skip(self, row), fields(workflow_id = %self.env.id, call = %row.key))]
  pub async fn resume(
    self,
    mut row: CallRow,
    external_id: &str,
  ) -> Result<BTreeMap<String, Value>, EngineError> {
    let budget = row.attributes.preemptible;
    let plan = self.plan_for(&row.key, &row.attributes);
    let bound = self.prepare_or_terminalize(plan, &mut row).await?;

    let handle = match self.ctx.backend.resume(&bound, external_id).await {
      Ok(handle) => handle,
      Err(e) => {
        let message = format!("resume failed: {}", e);
        self.record_failed(&mut row, message.clone()).await?;
        return Err(EngineError::fatal(&row.key, message));
      }
    };

    info!(call = %row.key, external_id, "resumed execution");
    let outcome = self.poll_to_outcome(&bound, handle).await?;
    // Resumed rows own no retry budget here; a retryable failure surfaces
    // and restart policy decides what happens next.
    match self
      .conclude_attempt(&mut row, &bound, outcome, budget, 0, None)
      .await?
    {
      AttemptVerdict::Done(outputs) => Ok(outputs),
      AttemptVerdict::Again { .. } => Err(EngineError::CallTransient {
        call: row.key.to_string(),
        message: "resumed execution did not complete".to_string(),
      }),
    }
  }

  /// One attempt: a row driven from `NotStarted` to a terminal state.
  async fn run_attempt(
    &self,
    key: &CallKey,
    attributes: &RuntimeAttributes,
    preemption_budget: u32,
    retries_left: u32,
    print: Option<&Fingerprint>,
    reuse_row: bool,
  ) -> Result<AttemptVerdict, EngineError> {
    if self.env.cancel.is_cancelled() {
      return Err(EngineError::Aborted);
    }

    let call_root = format!(
      "{}/{}/{}",
      self.env.root.trim_end_matches('/'),
      key.call_dir(),
      key.attempt_dir()
    );
    let mut row = CallRow::not_started(
      key.clone(),
      &self.req.node_id,
      CallKind::Task,
      attributes.clone(),
      &call_root,
    );
    row.inputs = self.req.inputs.clone();
    // A reused row (reset to NotStarted by restart recovery) already exists
    // in the table; it is re-driven in place rather than re-inserted.
    if !reuse_row {
      self.ctx.store.create_call(&row).await?;
    }
    self.publish_status(&row);

    // Cache shortcut: NotStarted -> Succeeded via the hit copy.
    if self.env.options.read_from_cache() {
      if let Some(print) = print {
        if let Some(outputs) = self.try_cache_hit(&mut row, print).await? {
          return Ok(AttemptVerdict::Done(outputs));
        }
      }
    }

    // Prepare: the backend assigns the call root, localizes inputs, and
    // renders the command.
    let plan = self.plan_for(key, attributes);
    let bound = self.prepare_or_terminalize(plan, &mut row).await?;
    row.inputs = bound.inputs.clone();

    row.status = CallStatus::Starting;
    self
      .ctx
      .store
      .set_starting_status(self.env.id, std::slice::from_ref(key))
      .await?;
    self.publish_status(&row);
    self
      .ctx
      .publisher
      .publish(MetadataEvent::runtime_attributes(key.clone(), attributes));

    // Throughput gate: the backend semaphore is the only global
    // coordination point for dispatch.
    let _permit = tokio::select! {
      _ = self.env.cancel.cancelled() => {
        self.record_aborted(&mut row, None).await?;
        return Err(EngineError::Aborted);
      }
      permit = self.ctx.dispatch_permits.acquire() => {
        permit.map_err(|_| EngineError::Aborted)?
      }
    };

    // Dispatch, retrying transient submit errors in place (same state).
    let deadline = self.ctx.config.backend_deadline;
    let handle = match retry(
      &self.ctx.config.retry,
      &self.env.cancel,
      classify_backend_error,
      || with_deadline(deadline, self.ctx.backend.execute(&bound)),
    )
    .await
    {
      Ok(handle) => handle,
      Err(RetryError::Cancelled) => {
        self.record_aborted(&mut row, None).await?;
        return Err(EngineError::Aborted);
      }
      Err(RetryError::Fatal(e)) => {
        let message = e.to_string();
        self.record_failed(&mut row, message.clone()).await?;
        return Err(EngineError::fatal(key, message));
      }
      Err(RetryError::Exhausted { last, attempts }) => {
        let message = format!("submit failed after {} attempts: {}", attempts, last);
        self.record_failed(&mut row, message.clone()).await?;
        return Err(EngineError::CallTransient {
          call: key.to_string(),
          message,
        });
      }
    };

    row.status = CallStatus::Running;
    self
      .ctx
      .store
      .transition_call(
        &row,
        &[(
          rill_core::EXEC_INFO_JOB_ID.to_string(),
          handle.external_id(),
        )],
      )
      .await?;
    self.publish_status(&row);

    let outcome = self.poll_to_outcome(&bound, handle).await?;
    self
      .conclude_attempt(
        &mut row,
        &bound,
        outcome,
        preemption_budget,
        retries_left,
        print,
      )
      .await
  }

  /// Poll the handle on the backend's backoff schedule until a terminal
  /// outcome. Transient poll errors ride the same schedule, unbounded.
  async fn poll_to_outcome(
    &self,
    bound: &BoundCall,
    mut handle: ExecutionHandle,
  ) -> Result<PollOutcome, EngineError> {
    let curve = self.ctx.backend.poll_backoff();
    let mut step: u32 = 0;
    loop {
      if self.env.cancel.is_cancelled() {
        let _ = self.ctx.backend.abort(&handle).await;
        return Ok(PollOutcome::Aborted);
      }

      match self.ctx.backend.poll(bound, handle.clone()).await {
        Ok(PollOutcome::Running(renewed)) => handle = renewed,
        Ok(outcome) => return Ok(outcome),
        Err(e) if e.is_transient() => {
          debug!(call = %bound.key, error = %e, "transient poll failure");
        }
        Err(e) => {
          return Ok(PollOutcome::Failed {
            code: FailureCode::Nonretryable,
            message: e.to_string(),
            events: vec![],
          });
        }
      }

      if !cancellable_sleep(curve.interval(step), &self.env.cancel).await {
        let _ = self.ctx.backend.abort(&handle).await;
        return Ok(PollOutcome::Aborted);
      }
      step += 1;
    }
  }

  /// Apply the terminal outcome to the row: success policies, the attempt
  /// policy for failures, and the matching durable transition.
  async fn conclude_attempt(
    &self,
    row: &mut CallRow,
    bound: &BoundCall,
    outcome: PollOutcome,
    preemption_budget: u32,
    retries_left: u32,
    print: Option<&Fingerprint>,
  ) -> Result<AttemptVerdict, EngineError> {
    let key = row.key.clone();
    match outcome {
      PollOutcome::Succeeded {
        outputs,
        return_code,
        ..
      } => {
        if let Some(reason) = self.acceptance_failure(bound, return_code).await? {
          self.record_failed(row, reason.clone()).await?;
          return Err(EngineError::fatal(&key, reason));
        }
        let outputs = self
          .finish_success(row, outputs, bound.detritus.clone(), print)
          .await?;
        Ok(AttemptVerdict::Done(outputs))
      }

      PollOutcome::Failed { code, message, .. } => {
        self
          .apply_failure_policy(row, code, message, preemption_budget, retries_left)
          .await
      }

      PollOutcome::Aborted => {
        self.record_aborted(row, None).await?;
        Err(EngineError::Aborted)
      }

      PollOutcome::Running(_) => unreachable!("poll_to_outcome only returns terminal outcomes"),
    }
  }

  /// Return-code and stderr policy. `None` means the outcome is accepted.
  async fn acceptance_failure(
    &self,
    bound: &BoundCall,
    return_code: i32,
  ) -> Result<Option<String>, EngineError> {
    if !bound.attributes.continue_on_return_code.accepts(return_code) {
      return Ok(Some(format!("return code {} not accepted", return_code)));
    }
    if bound.attributes.fail_on_stderr {
      if let Some(stderr) = bound.detritus.get(DetritusKind::Stderr) {
        let size = self
          .ctx
          .io
          .size(&stderr.display().to_string())
          .await
          .unwrap_or(0);
        if size > 0 {
          return Ok(Some(format!(
            "stderr has {} bytes and fail_on_stderr is set",
            size
          )));
        }
      }
    }
    Ok(None)
  }

  /// The attempt policy: preemption budget first, then bounded retries with
  /// the optional memory multiplier, then terminal failure.
  async fn apply_failure_policy(
    &self,
    row: &mut CallRow,
    code: FailureCode,
    message: String,
    preemption_budget: u32,
    retries_left: u32,
  ) -> Result<AttemptVerdict, EngineError> {
    let key = row.key.clone();
    let attempt = key.attempt;

    if code == FailureCode::Canceled {
      self.record_aborted(row, Some(message)).await?;
      return Err(EngineError::Aborted);
    }

    if code == FailureCode::Preempted && attempt <= preemption_budget {
      row.status = CallStatus::Preempted;
      row.failure = Some(message);
      row.completed_at = Some(Utc::now());
      self.transition_terminal(row).await?;
      info!(call = %key, attempt, "preempted; scheduling next attempt");

      // Budget spent: the next attempt runs with preemptible cleared.
      let next_attributes = if attempt == preemption_budget {
        row.attributes.non_preemptible()
      } else {
        row.attributes.clone()
      };
      return Ok(AttemptVerdict::Again {
        recorded: CallStatus::Preempted,
        next_attributes,
      });
    }

    let memory_retry = self.env.options.memory_retry_multiplier().filter(|_| {
      self
        .env
        .options
        .memory_retry_keys()
        .iter()
        .any(|k| message.contains(k))
    });

    let retryable = match code {
      FailureCode::TransientIo => true,
      // Preempted past the budget consumes the bounded-retry budget.
      FailureCode::Preempted => true,
      // A terminal failure becomes retryable when the memory-retry policy
      // matches: the next attempt requests more memory.
      FailureCode::Nonretryable => memory_retry.is_some(),
      FailureCode::Canceled => false,
    };

    if retryable && retries_left == 0 {
      self.record_failed(row, message.clone()).await?;
      return Err(EngineError::CallTransient {
        call: key.to_string(),
        message,
      });
    }

    if retryable {
      row.status = CallStatus::RetryableFailure;
      row.failure = Some(message);
      row.completed_at = Some(Utc::now());
      self.transition_terminal(row).await?;

      let next_attributes = match memory_retry {
        Some(multiplier) => {
          let next = row.attributes.with_memory_multiplied(multiplier);
          info!(
            call = %key,
            from_mb = row.attributes.memory_mb,
            to_mb = next.memory_mb,
            "memory retry"
          );
          next
        }
        None => row.attributes.clone(),
      };
      return Ok(AttemptVerdict::Again {
        recorded: CallStatus::RetryableFailure,
        next_attributes,
      });
    }

    self.record_failed(row, message.clone()).await?;
    Err(EngineError::fatal(&key, message))
  }

  /// Record success: outputs, detritus registration, and the cache entry.
  async fn finish_success(
    &self,
    row: &mut CallRow,
    outputs: BTreeMap<String, Value>,
    detritus: Detritus,
    print: Option<&Fingerprint>,
  ) -> Result<BTreeMap<String, Value>, EngineError> {
    row.status = CallStatus::Succeeded;
    row.outputs = Some(outputs.clone());
    row.completed_at = Some(Utc::now());
    self
      .ctx
      .store
      .transition_call(
        row,
        &[(
          rill_core::EXEC_INFO_STATUS.to_string(),
          Some("succeeded".to_string()),
        )],
      )
      .await?;
    self.publish_status(row);
    self.publish_detritus(&row.key, &detritus);

    if self.env.options.write_to_cache() {
      if let Some(print) = print {
        let entry = CallRef {
          key: row.key.clone(),
          call_root: row.call_root.clone(),
          outputs: outputs.clone(),
          detritus,
          created_at: Utc::now(),
        };
        if let Err(e) = self.ctx.cache.record(print, entry).await {
          warn!(call = %row.key, error = %e, "failed to record cache entry");
        }
      }
    }

    Ok(outputs)
  }

  /// Cache lookup and hit copy. `Ok(None)` means miss, including rejected
  /// candidates and lookup failures (logged and treated as misses).
  async fn try_cache_hit(
    &self,
    row: &mut CallRow,
    print: &Fingerprint,
  ) -> Result<Option<BTreeMap<String, Value>>, EngineError> {
    let prior = match self.ctx.cache.lookup(print).await {
      Ok(Some(prior)) => prior,
      Ok(None) => return Ok(None),
      Err(e) => {
        warn!(call = %row.key, error = %e, "cache lookup failed; treating as miss");
        return Ok(None);
      }
    };

    let plan = self.plan_for(&row.key, &row.attributes);
    let bound = self.prepare_or_terminalize(plan, row).await?;
    match self
      .ctx
      .backend
      .copy_cache_hit(&bound, &prior, self.ctx.config.hit_strategy)
      .await
    {
      Ok((outputs, detritus)) => {
        info!(call = %row.key, fingerprint = %print, "call cache hit");
        row.status = CallStatus::Succeeded;
        row.outputs = Some(outputs.clone());
        row.completed_at = Some(Utc::now());
        self
          .ctx
          .store
          .transition_call(
            row,
            &[(
              rill_core::EXEC_INFO_STATUS.to_string(),
              Some("cache-hit".to_string()),
            )],
          )
          .await?;
        self.publish_status(row);
        self.publish_detritus(&row.key, &detritus);
        Ok(Some(outputs))
      }
      Err(e) => {
        debug!(call = %row.key, error = %e, "cache hit unusable; dispatching normally");
        Ok(None)
      }
    }
  }

  async fn compute_fingerprint(&self, attributes: &RuntimeAttributes) -> Option<Fingerprint> {
    match fingerprint(&self.req.task, &self.req.inputs, attributes, &self.ctx.io).await {
      Ok(print) => Some(print),
      Err(e) => {
        warn!(task = %self.req.task_name, error = %e, "fingerprint failed; caching disabled for this call");
        None
      }
    }
  }

  fn plan_for(&self, key: &CallKey, attributes: &RuntimeAttributes) -> CallPlan {
    CallPlan {
      key: key.clone(),
      task: self.req.task.clone(),
      attributes: attributes.clone(),
      inputs: self.req.inputs.clone(),
      workflow_root: self.env.root.clone(),
      monitoring_script: self
        .env
        .options
        .monitoring_script()
        .map(|p| p.display().to_string()),
    }
  }

  /// [`CallRunner::prepare`], and on failure record the row's matching
  /// terminal state first: a terminal workflow never leaves a call row
  /// non-terminal behind it.
  async fn prepare_or_terminalize(
    &self,
    plan: CallPlan,
    row: &mut CallRow,
  ) -> Result<BoundCall, EngineError> {
    match self.prepare(plan).await {
      Ok(bound) => Ok(bound),
      Err(EngineError::Aborted) => {
        self.record_aborted(row, None).await?;
        Err(EngineError::Aborted)
      }
      Err(e) => {
        self.record_failed(row, e.to_string()).await?;
        Err(e)
      }
    }
  }

  /// Prepare with transient retries; a non-transient prepare failure is
  /// fatal to the attempt.
  async fn prepare(&self, plan: CallPlan) -> Result<BoundCall, EngineError> {
    let key = plan.key.clone();
    let deadline = self.ctx.config.backend_deadline;
    retry(
      &self.ctx.config.retry,
      &self.env.cancel,
      classify_backend_error,
      || with_deadline(deadline, self.ctx.backend.prepare_call(plan.clone(), &self.env.init)),
    )
    .await
    .map_err(|e| match e {
      RetryError::Cancelled => EngineError::Aborted,
      RetryError::Fatal(e) => EngineError::fatal(&key, e),
      RetryError::Exhausted { last, .. } => EngineError::CallTransient {
        call: key.to_string(),
        message: last.to_string(),
      },
    })
  }

  async fn record_failed(&self, row: &mut CallRow, message: String) -> Result<(), EngineError> {
    row.status = CallStatus::Failed;
    row.failure = Some(message);
    row.completed_at = Some(Utc::now());
    self.transition_terminal(row).await
  }

  async fn record_aborted(
    &self,
    row: &mut CallRow,
    message: Option<String>,
  ) -> Result<(), EngineError> {
    row.status = CallStatus::Aborted;
    row.failure = message;
    row.completed_at = Some(Utc::now());
    self.transition_terminal(row).await
  }

  async fn transition_terminal(&self, row: &CallRow) -> Result<(), EngineError> {
    self
      .ctx
      .store
      .transition_call(
        row,
        &[(
          rill_core::EXEC_INFO_STATUS.to_string(),
          Some(row.status.as_str().to_string()),
        )],
      )
      .await?;
    self.publish_status(row);
    Ok(())
  }

  fn publish_status(&self, row: &CallRow) {
    self
      .ctx
      .publisher
      .publish(MetadataEvent::call_status(row.key.clone(), row.status));
  }

  fn publish_detritus(&self, key: &CallKey, detritus: &Detritus) {
    for (kind, path) in detritus.iter() {
      self.ctx.publisher.publish(MetadataEvent::detritus_path(
        key.clone(),
        kind,
        &path.display().to_string(),
      ));
    }
  }
}

/// Backend errors classify onto the fixed retry taxonomy: submit and IO
/// failures are bounded-retryable, everything else is fatal.
fn classify_backend_error(e: &BackendError) -> FailureClass {
  if e.is_transient() {
    FailureClass::Bounded
  } else {
    FailureClass::Fatal
  }
}

/// Every backend call carries a deadline; expiry classifies as a transient
/// submit failure and rides the bounded-retry curve.
async fn with_deadline<T>(
  deadline: std::time::Duration,
  fut: impl std::future::Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
  match tokio::time::timeout(deadline, fut).await {
    Ok(result) => result,
    Err(_) => Err(BackendError::Submit {
      message: format!("backend call exceeded {}s deadline", deadline.as_secs()),
    }),
  }
}
