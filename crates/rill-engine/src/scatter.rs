//! Scatter expansion and collection.
//!
//! A scatter node expands its collection into indexed shard calls sharing
//! the non-scatter environment; the collector materializes shard results as
//! an array in shard order. The collector never leaves `NotStarted` until
//! every shard is terminal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use rill_core::{CallKey, CallKind, CallStatus, ConditionalNode, ScatterNode, Value};
use rill_metadata::MetadataEvent;
use rill_store::CallRow;

use crate::call::{CallRequest, CallRunner};
use crate::context::{EngineContext, NodeOutputs, WorkflowEnv};
use crate::error::EngineError;
use crate::expression::{evaluate, resolve_call_inputs, EvalEnv};

/// Task-table name of a scatter's collector row.
pub(crate) fn collector_task(node_id: &str) -> String {
  format!("{}.collect", node_id)
}

/// Expand and drive a scatter node to completion.
#[instrument(name = "scatter_execute", skip_all, fields(workflow_id = %env.id, node = %node.id))]
pub(crate) async fn run_scatter(
  ctx: &Arc<EngineContext>,
  env: &Arc<WorkflowEnv>,
  node: &ScatterNode,
  node_outputs: &HashMap<String, NodeOutputs>,
  scratch_dir: &str,
) -> Result<NodeOutputs, EngineError> {
  let task = env_task(env, &node.call.task)?;

  let eval_env = EvalEnv {
    workflow_inputs: &env.inputs,
    node_outputs,
    scatter_item: None,
    scratch_dir,
  };
  let collection = evaluate(&node.collection, None, &eval_env, &ctx.io).await?;
  let Value::Array(items) = collection else {
    return Err(EngineError::validation(format!(
      "scatter '{}' collection did not evaluate to an array",
      node.id
    )));
  };
  let width = items.len();
  info!(node = %node.id, width, "expanding scatter");

  // The scatter parent and collector are rows of the call table; restart
  // policy keys off their kinds. After a restart the rows already exist
  // (reset to NotStarted) and are re-driven in place.
  let mut scatter_row =
    ensure_group_row(ctx, group_row(env, &node.id, &node.id, CallKind::Scatter)).await?;
  publish(ctx, &scatter_row);

  let mut collector_row = ensure_group_row(
    ctx,
    group_row(env, &node.id, &collector_task(&node.id), CallKind::Collector),
  )
  .await?;
  publish(ctx, &collector_row);

  // Shard-creation window: a restart that finds the scatter here is
  // rejected, because shards may or may not exist yet.
  scatter_row.status = CallStatus::Starting;
  ctx
    .store
    .set_starting_status(env.id, std::slice::from_ref(&scatter_row.key))
    .await?;
  publish(ctx, &scatter_row);

  // Resolve each shard's inputs up front, with the scatter item bound.
  let mut shard_requests = Vec::with_capacity(width);
  for (index, item) in items.iter().enumerate() {
    let shard_env = EvalEnv {
      workflow_inputs: &env.inputs,
      node_outputs,
      scatter_item: Some(item),
      scratch_dir,
    };
    let inputs = resolve_call_inputs(&node.call, task, &shard_env, &ctx.io).await?;
    shard_requests.push(CallRequest {
      node_id: node.id.clone(),
      task_name: node.call.id.clone(),
      task: task.clone(),
      shard: Some(index as u32),
      inputs,
    });
  }

  scatter_row.status = CallStatus::Running;
  ctx.store.transition_call(&scatter_row, &[]).await?;
  publish(ctx, &scatter_row);

  // Shards share a scatter-scoped cancellation token: the first fatal shard
  // aborts its siblings unless continue_on_failure is set.
  let continue_on_failure = env.options.continue_on_failure();
  let shard_cancel = env.cancel.child_token();
  let mut shard_env = (**env).clone();
  shard_env.cancel = shard_cancel.clone();
  let shard_env = Arc::new(shard_env);

  let handles: Vec<_> = shard_requests
    .into_iter()
    .map(|req| {
      let ctx = ctx.clone();
      let shard_env = shard_env.clone();
      let shard_cancel = shard_cancel.clone();
      tokio::spawn(async move {
        let result = CallRunner::new(&ctx, &shard_env, req).run().await;
        if result.is_err() && !continue_on_failure {
          shard_cancel.cancel();
        }
        result
      })
    })
    .collect();

  let mut shard_outputs: Vec<NodeOutputs> = Vec::with_capacity(width);
  let mut first_error: Option<EngineError> = None;
  for handle in handles {
    match handle.await {
      Ok(Ok(outputs)) => shard_outputs.push(outputs),
      Ok(Err(e)) => {
        if first_error.is_none() {
          first_error = Some(e);
        }
      }
      Err(e) => {
        if first_error.is_none() {
          first_error = Some(EngineError::Initialization {
            message: format!("shard task join error: {}", e),
          });
        }
      }
    }
  }

  if let Some(error) = first_error {
    // Collector stays NotStarted; the scatter parent records the failure.
    scatter_row.status = if matches!(error, EngineError::Aborted) {
      CallStatus::Aborted
    } else {
      CallStatus::Failed
    };
    scatter_row.failure = Some(error.to_string());
    scatter_row.completed_at = Some(Utc::now());
    ctx.store.transition_call(&scatter_row, &[]).await?;
    publish(ctx, &scatter_row);
    return Err(error);
  }

  // All shards terminal-success: the collector may now run. Collection is
  // an idempotent projection of shard outputs, in shard order.
  collector_row.status = CallStatus::Starting;
  ctx
    .store
    .set_starting_status(env.id, std::slice::from_ref(&collector_row.key))
    .await?;
  publish(ctx, &collector_row);

  collector_row.status = CallStatus::Running;
  ctx.store.transition_call(&collector_row, &[]).await?;
  publish(ctx, &collector_row);

  let collected = collect(task, &shard_outputs);

  collector_row.status = CallStatus::Succeeded;
  collector_row.outputs = Some(collected.clone());
  collector_row.completed_at = Some(Utc::now());
  ctx.store.transition_call(&collector_row, &[]).await?;
  publish(ctx, &collector_row);

  scatter_row.status = CallStatus::Succeeded;
  scatter_row.completed_at = Some(Utc::now());
  ctx.store.transition_call(&scatter_row, &[]).await?;
  publish(ctx, &scatter_row);

  Ok(collected)
}

/// Project per-shard outputs into arrays keyed by output name.
fn collect(task: &rill_core::TaskDef, shard_outputs: &[NodeOutputs]) -> NodeOutputs {
  let mut collected = BTreeMap::new();
  for decl in &task.outputs {
    let values: Vec<Value> = shard_outputs
      .iter()
      .map(|outputs| outputs.get(&decl.name).cloned().unwrap_or(Value::Null))
      .collect();
    collected.insert(decl.name.clone(), Value::Array(values));
  }
  collected
}

/// Drive a conditional node: run the inner call when the condition is true,
/// otherwise complete with null outputs.
#[instrument(name = "conditional_execute", skip_all, fields(workflow_id = %env.id, node = %node.id))]
pub(crate) async fn run_conditional(
  ctx: &Arc<EngineContext>,
  env: &Arc<WorkflowEnv>,
  node: &ConditionalNode,
  node_outputs: &HashMap<String, NodeOutputs>,
  scratch_dir: &str,
) -> Result<NodeOutputs, EngineError> {
  let task = env_task(env, &node.call.task)?;

  let eval_env = EvalEnv {
    workflow_inputs: &env.inputs,
    node_outputs,
    scatter_item: None,
    scratch_dir,
  };
  let condition = evaluate(&node.condition, None, &eval_env, &ctx.io).await?;
  let truthy = matches!(condition, Value::Boolean(true));

  if !truthy {
    info!(node = %node.id, "conditional false; completing with null outputs");
    return Ok(
      task
        .outputs
        .iter()
        .map(|decl| (decl.name.clone(), Value::Null))
        .collect(),
    );
  }

  let inputs = resolve_call_inputs(&node.call, task, &eval_env, &ctx.io).await?;
  CallRunner::new(
    ctx,
    env,
    CallRequest {
      node_id: node.id.clone(),
      task_name: node.call.id.clone(),
      task: task.clone(),
      shard: None,
      inputs,
    },
  )
  .run()
  .await
}

fn env_task<'a>(env: &'a WorkflowEnv, name: &str) -> Result<&'a rill_core::TaskDef, EngineError> {
  env
    .document
    .get_task(name)
    .ok_or_else(|| EngineError::validation(format!("unknown task '{}'", name)))
}

fn group_row(env: &WorkflowEnv, node_id: &str, task: &str, kind: CallKind) -> CallRow {
  CallRow::not_started(
    CallKey::new(env.id, task),
    node_id,
    kind,
    rill_core::RuntimeAttributes::default(),
    format!("{}/{}", env.root.trim_end_matches('/'), node_id),
  )
}

/// Fetch the existing row for this key, or insert the fresh one.
async fn ensure_group_row(
  ctx: &EngineContext,
  fresh: CallRow,
) -> Result<CallRow, EngineError> {
  match ctx.store.get_call(&fresh.key).await {
    Ok(existing) => Ok(existing),
    Err(rill_store::StoreError::NotFound(_)) => {
      ctx.store.create_call(&fresh).await?;
      Ok(fresh)
    }
    Err(e) => Err(e.into()),
  }
}

fn publish(ctx: &EngineContext, row: &CallRow) {
  ctx
    .publisher
    .publish(MetadataEvent::call_status(row.key.clone(), row.status));
}
