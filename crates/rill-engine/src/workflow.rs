//! The per-workflow state machine.
//!
//! Submit persists the workflow, validates options, and initializes the
//! backend; run drives the task graph until every output expression
//! evaluates, a call fails without recourse, or an abort is observed.
//!
//! Restart recovery applies the durable-state rules: terminal-failure rows
//! reject the restart, transient executions reset, and `Running` calls with
//! a recorded external job id resume through the backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use rill_backend::InitData;
use rill_core::{
  CallKind, CallStatus, GraphNode, TaskGraph, Value, WorkflowId, WorkflowSource,
  WorkflowStatus, WorkflowSubmission,
};
use rill_metadata::MetadataEvent;
use rill_store::{CallRow, WorkflowRow};

use crate::call::{CallRequest, CallRunner};
use crate::context::{EngineContext, NodeOutputs, WorkflowEnv};
use crate::error::EngineError;
use crate::expression::{evaluate, resolve_call_inputs, EvalEnv};
use crate::scatter::{collector_task, run_conditional, run_scatter};

use crate::context::ResumePlan;

/// Terminal result of one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
  pub id: WorkflowId,
  pub status: WorkflowStatus,
  pub outputs: BTreeMap<String, Value>,
  pub failure: Option<String>,
}

/// A workflow admitted into the engine and ready to run.
pub struct WorkflowExecution {
  ctx: Arc<EngineContext>,
  row: WorkflowRow,
  cancel: CancellationToken,
  resume_plan: ResumePlan,
}

impl std::fmt::Debug for WorkflowExecution {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkflowExecution")
      .field("row", &self.row)
      .finish()
  }
}

impl WorkflowExecution {
  /// Validate and persist a submission. No call state exists until this
  /// returns; a rejection here is a pure [`EngineError::Validation`].
  pub async fn submit(
    ctx: Arc<EngineContext>,
    submission: WorkflowSubmission,
    cancel: CancellationToken,
  ) -> Result<Self, EngineError> {
    let source = match &submission.source {
      WorkflowSource::Inline(text) => text.clone(),
      WorkflowSource::Url(url) => {
        let raw = ctx.io.read_all(url).await.map_err(|e| {
          EngineError::validation(format!("failed to fetch workflow source: {}", e))
        })?;
        String::from_utf8_lossy(&raw).into_owned()
      }
    };
    let document: rill_core::WorkflowDocument = serde_json::from_str(&source)
      .map_err(|e| EngineError::validation(format!("workflow document does not parse: {}", e)))?;

    // Graph validation: unique ids, known references, acyclic.
    TaskGraph::build(&document)?;

    let errors = ctx.backend.validate_options(&submission.options);
    if !errors.is_empty() {
      return Err(EngineError::validation(errors.join("; ")));
    }

    let id = WorkflowId::generate();
    let base = submission
      .workflow_root
      .or_else(|| submission.options.workflow_root())
      .unwrap_or_else(|| ctx.config.workflow_root.clone());
    let workflow_root = format!("{}/{}", base.display(), id);

    let row = WorkflowRow {
      id,
      name: document.name.clone(),
      status: WorkflowStatus::Submitted,
      document,
      inputs: submission.inputs,
      options: submission.options,
      labels: submission.labels,
      dependencies: submission.dependencies,
      workflow_root,
      submitted_at: Utc::now(),
      completed_at: None,
    };
    ctx.store.create_workflow(&row).await?;
    ctx
      .publisher
      .publish(MetadataEvent::workflow_status(id, WorkflowStatus::Submitted));
    info!(workflow_id = %id, name = %row.name, "workflow submitted");

    Ok(Self {
      ctx,
      row,
      cancel,
      resume_plan: ResumePlan::new(),
    })
  }

  /// Recover a persisted non-terminal workflow after an engine restart.
  ///
  /// Applies the restart rules to the call table; a rejection records the
  /// workflow `Failed` before returning.
  pub async fn recover(
    ctx: Arc<EngineContext>,
    row: WorkflowRow,
    cancel: CancellationToken,
  ) -> Result<Self, EngineError> {
    let calls = ctx.store.list_calls(row.id).await?;

    if let Some(reason) = Self::restart_rejection(&calls) {
      warn!(workflow_id = %row.id, reason = %reason, "restart rejected");
      ctx
        .store
        .update_workflow_status(row.id, WorkflowStatus::Failed, Some(Utc::now()))
        .await?;
      ctx
        .publisher
        .publish(MetadataEvent::workflow_status(row.id, WorkflowStatus::Failed));
      return Err(EngineError::Initialization {
        message: format!("restart rejected: {}", reason),
      });
    }

    // Running calls with a recorded external id resume; everything else
    // transient resets to NotStarted in one atomic batch (this also resets
    // Running collectors, which carry no external id).
    let mut resume_plan = ResumePlan::new();
    for call in &calls {
      if call.kind == CallKind::Task && call.status == CallStatus::Running {
        let info = ctx.store.execution_info(&call.key).await?;
        if let Some(Some(external_id)) = info.get(rill_core::EXEC_INFO_JOB_ID) {
          resume_plan.insert(
            (call.key.task.clone(), call.key.shard),
            (call.clone(), external_id.clone()),
          );
        }
      }
    }

    let reset = ctx
      .store
      .reset_transient_executions(row.id, &[CallStatus::Starting, CallStatus::Running])
      .await?;
    info!(
      workflow_id = %row.id,
      reset = reset.len(),
      resuming = resume_plan.len(),
      "workflow recovery planned"
    );

    Ok(Self {
      ctx,
      row,
      cancel,
      resume_plan,
    })
  }

  /// The restart-rejection rules, in check order.
  fn restart_rejection(calls: &[CallRow]) -> Option<String> {
    for call in calls {
      match (call.kind, call.status) {
        (_, CallStatus::Failed) | (_, CallStatus::Aborted) => {
          return Some(format!("call {} is {}", call.key, call.status.as_str()));
        }
        // Shard creation may or may not have happened; ambiguous either way.
        (CallKind::Scatter, CallStatus::Starting) => {
          return Some(format!("scatter {} was mid-creation", call.key));
        }
        // Unspecified in the restart policy's source material; rejected the
        // same way as mid-creation scatters until a rule exists.
        (CallKind::Collector, CallStatus::Starting) => {
          return Some(format!("collector {} was mid-collection", call.key));
        }
        _ => {}
      }
    }
    None
  }

  pub fn id(&self) -> WorkflowId {
    self.row.id
  }

  /// Drive the workflow to a terminal state. The terminal status is always
  /// recorded and published before this returns; the error channel is
  /// reserved for persistence failures.
  #[instrument(name = "workflow_execute", skip(self), fields(workflow_id = %self.row.id, name = %self.row.name))]
  pub async fn run(self) -> Result<WorkflowOutcome, EngineError> {
    let id = self.row.id;

    let init = match self
      .ctx
      .backend
      .initialize_workflow(id, &self.row.options)
      .await
    {
      Ok(init) => init,
      Err(e) => {
        // Initialization failed before any call ran; cleanup still runs.
        let _ = self
          .ctx
          .backend
          .cleanup_workflow(id, &InitData::default())
          .await;
        let message = format!("backend initialization failed: {}", e);
        error!(workflow_id = %id, error = %message, "workflow_failed");
        return self.finish(WorkflowStatus::Failed, BTreeMap::new(), Some(message)).await;
      }
    };

    self
      .ctx
      .store
      .update_workflow_status(id, WorkflowStatus::Running, None)
      .await?;
    self
      .ctx
      .publisher
      .publish(MetadataEvent::workflow_status(id, WorkflowStatus::Running));

    let env = Arc::new(WorkflowEnv {
      id,
      root: self.row.workflow_root.clone(),
      document: self.row.document.clone(),
      options: self.row.options.clone(),
      init,
      inputs: self.row.inputs.clone(),
      cancel: self.cancel.clone(),
      resume: Arc::new(self.resume_plan.clone()),
    });

    let result = self.drive(&env).await;
    let _ = self.ctx.backend.cleanup_workflow(id, &env.init).await;

    match result {
      Ok(outputs) => {
        info!(workflow_id = %id, "workflow_completed");
        self.finish(WorkflowStatus::Succeeded, outputs, None).await
      }
      Err(EngineError::Aborted) => {
        warn!(workflow_id = %id, "workflow_aborted");
        self.finish(WorkflowStatus::Aborted, BTreeMap::new(), None).await
      }
      Err(EngineError::Persistence { source }) => Err(EngineError::Persistence { source }),
      Err(e) => {
        error!(workflow_id = %id, error = %e, "workflow_failed");
        self
          .finish(WorkflowStatus::Failed, BTreeMap::new(), Some(e.to_string()))
          .await
      }
    }
  }

  /// The ready-node loop: a node becomes ready when every upstream node is
  /// terminal-success; ready nodes of a wave execute concurrently.
  async fn drive(&self, env: &Arc<WorkflowEnv>) -> Result<BTreeMap<String, Value>, EngineError> {
    let graph = TaskGraph::build(&env.document)?;
    let mut completed: HashMap<String, NodeOutputs> = HashMap::new();
    let mut failed: HashSet<String> = HashSet::new();
    let mut first_failure: Option<EngineError> = None;

    // Seed from durable state: nodes whose calls already succeeded complete
    // immediately on restart.
    self.seed_completed(env, &mut completed).await?;

    let continue_on_failure = env.options.continue_on_failure();

    loop {
      if env.cancel.is_cancelled() {
        return Err(EngineError::Aborted);
      }
      if first_failure.is_some() && !continue_on_failure {
        break;
      }

      let ready: Vec<&GraphNode> = env
        .document
        .nodes
        .iter()
        .filter(|node| !completed.contains_key(node.id()) && !failed.contains(node.id()))
        .filter(|node| {
          graph
            .upstream(node.id())
            .iter()
            .all(|up| completed.contains_key(up))
        })
        .collect();
      if ready.is_empty() {
        break;
      }

      info!(
        workflow_id = %env.id,
        ready_nodes = ?ready.iter().map(|n| n.id()).collect::<Vec<_>>(),
        "executing batch of ready nodes"
      );

      let snapshot = Arc::new(completed.clone());
      let handles: Vec<_> = ready
        .into_iter()
        .map(|node| {
          let ctx = self.ctx.clone();
          let env = env.clone();
          let node = node.clone();
          let snapshot = snapshot.clone();
          tokio::spawn(async move {
            let id = node.id().to_string();
            let result = run_node(&ctx, &env, &node, &snapshot).await;
            (id, result)
          })
        })
        .collect();

      let results = futures::future::join_all(handles).await;
      for result in results {
        let (node_id, outcome) = result.map_err(|e| EngineError::Initialization {
          message: format!("node task join error: {}", e),
        })?;
        match outcome {
          Ok(outputs) => {
            completed.insert(node_id, outputs);
          }
          Err(EngineError::Aborted) => return Err(EngineError::Aborted),
          Err(e) => {
            warn!(workflow_id = %env.id, node = %node_id, error = %e, "node failed");
            failed.insert(node_id);
            if first_failure.is_none() {
              first_failure = Some(e);
            }
          }
        }
      }
    }

    if let Some(e) = first_failure {
      return Err(e);
    }

    // All output expressions must have evaluated.
    let mut outputs = BTreeMap::new();
    for node in &env.document.nodes {
      if let GraphNode::Output(out) = node {
        let value = completed
          .get(&out.id)
          .and_then(|o| o.get("value"))
          .cloned()
          .ok_or_else(|| {
            EngineError::validation(format!("output '{}' did not evaluate", out.id))
          })?;
        outputs.insert(out.id.clone(), value);
      }
    }
    Ok(outputs)
  }

  /// Complete nodes whose durable call rows already succeeded.
  async fn seed_completed(
    &self,
    env: &Arc<WorkflowEnv>,
    completed: &mut HashMap<String, NodeOutputs>,
  ) -> Result<(), EngineError> {
    let calls = self.ctx.store.list_calls(env.id).await?;
    if calls.is_empty() {
      return Ok(());
    }

    for node in &env.document.nodes {
      match node {
        GraphNode::Call(c) => {
          if let Some(row) = latest_succeeded(&calls, CallKind::Task, &c.id, None) {
            completed.insert(c.id.clone(), row.outputs.clone().unwrap_or_default());
          }
        }
        GraphNode::Conditional(c) => {
          if let Some(row) = latest_succeeded(&calls, CallKind::Task, &c.id, None) {
            completed.insert(c.id.clone(), row.outputs.clone().unwrap_or_default());
          }
        }
        GraphNode::Scatter(s) => {
          let collector = collector_task(&s.id);
          if let Some(row) = calls.iter().find(|r| {
            r.kind == CallKind::Collector
              && r.key.task == collector
              && r.status == CallStatus::Succeeded
          }) {
            completed.insert(s.id.clone(), row.outputs.clone().unwrap_or_default());
          }
        }
        GraphNode::Output(_) => {}
      }
    }

    if !completed.is_empty() {
      info!(
        workflow_id = %env.id,
        seeded = completed.len(),
        "seeded completed nodes from durable state"
      );
    }
    Ok(())
  }

  /// Record and publish the terminal status; outputs publish as metadata.
  async fn finish(
    &self,
    status: WorkflowStatus,
    outputs: BTreeMap<String, Value>,
    failure: Option<String>,
  ) -> Result<WorkflowOutcome, EngineError> {
    self
      .ctx
      .store
      .update_workflow_status(self.row.id, status, Some(Utc::now()))
      .await?;
    self
      .ctx
      .publisher
      .publish(MetadataEvent::workflow_status(self.row.id, status));

    Ok(WorkflowOutcome {
      id: self.row.id,
      status,
      outputs,
      failure,
    })
  }
}

fn latest_succeeded<'a>(
  calls: &'a [CallRow],
  kind: CallKind,
  node_id: &str,
  shard: Option<u32>,
) -> Option<&'a CallRow> {
  calls
    .iter()
    .filter(|r| {
      r.kind == kind
        && r.node_id == node_id
        && r.key.shard == shard
        && r.status == CallStatus::Succeeded
    })
    .max_by_key(|r| r.key.attempt)
}

/// Execute one graph node.
async fn run_node(
  ctx: &Arc<EngineContext>,
  env: &Arc<WorkflowEnv>,
  node: &GraphNode,
  node_outputs: &HashMap<String, NodeOutputs>,
) -> Result<NodeOutputs, EngineError> {
  let scratch_dir = format!("{}/inputs", env.root.trim_end_matches('/'));
  match node {
    GraphNode::Call(call) => {
      let task = env
        .document
        .get_task(&call.task)
        .ok_or_else(|| EngineError::validation(format!("unknown task '{}'", call.task)))?;
      let eval_env = EvalEnv {
        workflow_inputs: &env.inputs,
        node_outputs,
        scatter_item: None,
        scratch_dir: &scratch_dir,
      };
      let inputs = resolve_call_inputs(call, task, &eval_env, &ctx.io).await?;
      // Call rows key on the call's name, not the task's: two calls of the
      // same task stay distinct.
      CallRunner::new(
        ctx,
        env,
        CallRequest {
          node_id: call.id.clone(),
          task_name: call.id.clone(),
          task: task.clone(),
          shard: None,
          inputs,
        },
      )
      .run()
      .await
    }
    GraphNode::Scatter(scatter) => {
      run_scatter(ctx, env, scatter, node_outputs, &scratch_dir).await
    }
    GraphNode::Conditional(cond) => {
      run_conditional(ctx, env, cond, node_outputs, &scratch_dir).await
    }
    GraphNode::Output(out) => {
      let eval_env = EvalEnv {
        workflow_inputs: &env.inputs,
        node_outputs,
        scatter_item: None,
        scratch_dir: &scratch_dir,
      };
      let value = evaluate(&out.expression, None, &eval_env, &ctx.io).await?;
      Ok([("value".to_string(), value)].into_iter().collect())
    }
  }
}
