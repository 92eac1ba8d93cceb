//! End-to-end engine scenarios against the local and scripted backends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rill_backend::{Backend, FailureCode, LocalBackend, ScriptedBackend, ScriptedOutcome};
use rill_core::{
  CallKey, CallKind, CallNode, CallStatus, GraphNode, InputExpr, OutputDecl, RuntimeDecl,
  ScatterNode, TaskDef, Value, ValueType, WorkflowDocument, WorkflowId, WorkflowOptions,
  WorkflowSource, WorkflowStatus, WorkflowSubmission,
};
use rill_engine::{EngineConfig, EngineContext, WorkflowExecution};
use rill_io::PathIo;
use rill_metadata::NoopPublisher;
use rill_retry::{BackoffCurve, RetryPolicy};
use rill_store::{CallRow, SqliteStore, Store};

fn fast_retry() -> RetryPolicy {
  RetryPolicy {
    curve: BackoffCurve {
      initial: Duration::from_millis(5),
      max: Duration::from_millis(20),
      multiplier: 1.1,
    },
    max_attempts: 3,
  }
}

fn fast_poll() -> BackoffCurve {
  BackoffCurve {
    initial: Duration::from_millis(10),
    max: Duration::from_millis(50),
    multiplier: 1.1,
  }
}

fn test_config(root: &Path) -> EngineConfig {
  EngineConfig {
    workflow_root: root.to_path_buf(),
    retry: fast_retry(),
    ..EngineConfig::default()
  }
}

async fn scripted_context(root: &Path) -> (Arc<EngineContext>, Arc<SqliteStore>, Arc<Backend>) {
  let store = Arc::new(SqliteStore::in_memory().await.unwrap());
  let backend = Arc::new(Backend::Scripted(ScriptedBackend::new()));
  let ctx = EngineContext::new(
    test_config(root),
    store.clone(),
    store.clone(),
    backend.clone(),
    PathIo::standard(),
    Arc::new(NoopPublisher),
  );
  (ctx, store, backend)
}

async fn local_context(root: &Path) -> (Arc<EngineContext>, Arc<SqliteStore>) {
  let store = Arc::new(SqliteStore::in_memory().await.unwrap());
  let backend = Arc::new(Backend::Local(
    LocalBackend::new().with_poll_backoff(fast_poll()),
  ));
  let ctx = EngineContext::new(
    test_config(root),
    store.clone(),
    store.clone(),
    backend,
    PathIo::standard(),
    Arc::new(NoopPublisher),
  );
  (ctx, store)
}

fn scripted(backend: &Backend) -> &ScriptedBackend {
  match backend {
    Backend::Scripted(b) => b,
    _ => panic!("not a scripted backend"),
  }
}

fn simple_task(command: &str, runtime: &[(&str, serde_json::Value)]) -> TaskDef {
  TaskDef {
    command: command.to_string(),
    inputs: BTreeMap::new(),
    outputs: vec![],
    runtime: RuntimeDecl(
      runtime
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect(),
    ),
  }
}

fn call_node(id: &str, task: &str) -> GraphNode {
  GraphNode::Call(CallNode {
    id: id.to_string(),
    task: task.to_string(),
    inputs: BTreeMap::new(),
  })
}

fn single_task_document(
  task_name: &str,
  node_id: &str,
  task: TaskDef,
) -> WorkflowDocument {
  WorkflowDocument {
    name: "test".to_string(),
    tasks: [(task_name.to_string(), task)].into_iter().collect(),
    nodes: vec![call_node(node_id, task_name)],
  }
}

fn submission(document: &WorkflowDocument, options: serde_json::Value) -> WorkflowSubmission {
  WorkflowSubmission {
    source: WorkflowSource::Inline(serde_json::to_string(document).unwrap()),
    workflow_root: None,
    inputs: serde_json::Map::new(),
    options: serde_json::from_value::<WorkflowOptions>(options).unwrap(),
    labels: BTreeMap::new(),
    dependencies: None,
  }
}

async fn run_to_outcome(
  ctx: &Arc<EngineContext>,
  submission: WorkflowSubmission,
) -> rill_engine::WorkflowOutcome {
  WorkflowExecution::submit(ctx.clone(), submission, CancellationToken::new())
    .await
    .unwrap()
    .run()
    .await
    .unwrap()
}

fn calls_for<'a>(calls: &'a [CallRow], task: &str) -> Vec<&'a CallRow> {
  let mut rows: Vec<&CallRow> = calls.iter().filter(|r| r.key.task == task).collect();
  rows.sort_by_key(|r| r.key.attempt);
  rows
}

// S1: happy path, one task on the local shell backend.
#[tokio::test]
async fn test_single_task_happy_path() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store) = local_context(dir.path()).await;

  let document = single_task_document("hello", "say_hi", simple_task("echo hi", &[]));
  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  assert_eq!(calls.len(), 1);
  let call = &calls[0];
  assert_eq!(call.key.attempt, 1);
  assert_eq!(call.status, CallStatus::Succeeded);

  // Detritus completeness: all of script/stdout/stderr/rc exist.
  let root = Path::new(&call.call_root);
  for name in ["script", "stdout", "stderr", "rc"] {
    assert!(root.join(name).exists(), "missing detritus file {}", name);
  }
  assert_eq!(std::fs::read_to_string(root.join("rc")).unwrap().trim(), "0");
  assert_eq!(std::fs::read_to_string(root.join("stdout")).unwrap(), "hi\n");
}

// Return-code policy: an accepted nonzero code still succeeds.
#[tokio::test]
async fn test_continue_on_return_code_set() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store) = local_context(dir.path()).await;

  let document = single_task_document(
    "exit3",
    "exit3",
    simple_task("exit 3", &[("continue_on_return_code", serde_json::json!([3]))]),
  );
  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  assert_eq!(calls[0].status, CallStatus::Succeeded);
}

#[tokio::test]
async fn test_fail_on_stderr() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store) = local_context(dir.path()).await;

  let document = single_task_document(
    "noisy",
    "noisy",
    simple_task(
      "echo oops 1>&2",
      &[("fail_on_stderr", serde_json::json!(true))],
    ),
  );
  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Failed);

  let calls = store.list_calls(outcome.id).await.unwrap();
  assert_eq!(calls[0].status, CallStatus::Failed);
}

// S2: preempt twice within budget, succeed on the third attempt.
#[tokio::test]
async fn test_preempt_then_succeed() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  scripted(&backend).script("hello", ScriptedOutcome::preempted());
  scripted(&backend).script("hello", ScriptedOutcome::preempted());
  scripted(&backend).script("hello", ScriptedOutcome::ok());

  let document = single_task_document(
    "hello_task",
    "hello",
    simple_task("echo hello", &[("preemptible", serde_json::json!(3))]),
  );
  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let rows = calls_for(&calls, "hello");
  assert_eq!(rows.len(), 3);
  // Monotonic, contiguous attempts.
  assert_eq!(
    rows.iter().map(|r| r.key.attempt).collect::<Vec<_>>(),
    vec![1, 2, 3]
  );
  assert_eq!(rows[0].status, CallStatus::Preempted);
  assert_eq!(rows[1].status, CallStatus::Preempted);
  assert_eq!(rows[2].status, CallStatus::Succeeded);
  // Budget never exhausted: every attempt dispatched preemptible.
  assert!(rows.iter().all(|r| r.attributes.preemptible > 0));
}

// S3: budget exhausted, the next attempt runs non-preemptible.
#[tokio::test]
async fn test_preempt_budget_exhausted_switches_to_non_preemptible() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  scripted(&backend).script("hello", ScriptedOutcome::preempted());
  scripted(&backend).script("hello", ScriptedOutcome::preempted());
  scripted(&backend).script("hello", ScriptedOutcome::ok());

  let document = single_task_document(
    "hello_task",
    "hello",
    simple_task("echo hello", &[("preemptible", serde_json::json!(2))]),
  );
  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let rows = calls_for(&calls, "hello");
  assert_eq!(rows.len(), 3);
  assert!(rows[0].attributes.preemptible > 0);
  assert!(rows[1].attributes.preemptible > 0);
  assert_eq!(rows[2].attributes.preemptible, 0);
  assert_eq!(rows[2].status, CallStatus::Succeeded);
}

// S4: identical fingerprints hit the cache; UseOriginal leaves a
// placeholder and points at the original outputs.
#[tokio::test]
async fn test_call_cache_hit_use_original() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  // The first run produces a real file; the second would fail if it ever
  // dispatched.
  let produced = dir.path().join("produced.txt");
  std::fs::write(&produced, "result data").unwrap();
  let outputs: BTreeMap<String, Value> = [(
    "out".to_string(),
    Value::File(produced.display().to_string()),
  )]
  .into_iter()
  .collect();
  scripted(&backend).script("make", ScriptedOutcome::ok_with(outputs.clone(), 0));
  scripted(&backend).script(
    "make",
    ScriptedOutcome::failed(FailureCode::Nonretryable, "must not dispatch"),
  );

  let document = single_task_document("make_task", "make", simple_task("produce", &[]));

  let first = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(first.status, WorkflowStatus::Succeeded);

  let second = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(second.status, WorkflowStatus::Succeeded);

  let second_calls = store.list_calls(second.id).await.unwrap();
  assert_eq!(second_calls.len(), 1);
  assert_eq!(second_calls[0].status, CallStatus::Succeeded);
  // Output values point at the original location.
  assert_eq!(
    second_calls[0].outputs.as_ref().unwrap().get("out"),
    Some(&Value::File(produced.display().to_string()))
  );

  // The placeholder names the source call root.
  let first_calls = store.list_calls(first.id).await.unwrap();
  let placeholder = Path::new(&second_calls[0].call_root).join("call_caching_placeholder.txt");
  let text = std::fs::read_to_string(placeholder).unwrap();
  assert!(text.contains(&first_calls[0].call_root));
}

// S5: one failing shard fails the scatter; the collector never leaves
// NotStarted and the workflow fails.
#[tokio::test]
async fn test_scatter_shard_failure_blocks_collector() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  scripted(&backend).script("count", ScriptedOutcome::ok());
  scripted(&backend).script("count", ScriptedOutcome::ok());
  scripted(&backend).script(
    "count",
    ScriptedOutcome::failed(FailureCode::Nonretryable, "bad shard"),
  );
  scripted(&backend).script("count", ScriptedOutcome::ok());

  let task = TaskDef {
    command: "count {{ x }}".to_string(),
    inputs: [("x".to_string(), ValueType::Integer)].into_iter().collect(),
    outputs: vec![],
    runtime: RuntimeDecl::default(),
  };
  let document = WorkflowDocument {
    name: "scattered".to_string(),
    tasks: [("count_task".to_string(), task)].into_iter().collect(),
    nodes: vec![GraphNode::Scatter(ScatterNode {
      id: "sc".to_string(),
      collection: InputExpr::Literal {
        value: Value::Array(vec![
          Value::Integer(0),
          Value::Integer(1),
          Value::Integer(2),
          Value::Integer(3),
        ]),
      },
      item: "x".to_string(),
      call: CallNode {
        id: "count".to_string(),
        task: "count_task".to_string(),
        inputs: [("x".to_string(), InputExpr::ScatterItem)].into_iter().collect(),
      },
    })],
  };

  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Failed);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let collector = calls
    .iter()
    .find(|r| r.kind == CallKind::Collector)
    .unwrap();
  assert_eq!(collector.status, CallStatus::NotStarted);

  let shards: Vec<&CallRow> = calls
    .iter()
    .filter(|r| r.kind == CallKind::Task && r.key.shard.is_some())
    .collect();
  assert_eq!(shards.len(), 4);
  assert!(shards.iter().any(|r| r.status == CallStatus::Failed));
  for shard in shards {
    assert!(
      matches!(
        shard.status,
        CallStatus::Succeeded | CallStatus::Aborted | CallStatus::Failed
      ),
      "unexpected shard status {:?}",
      shard.status
    );
  }
}

// P7: the collected array has the scatter's length and shard order.
#[tokio::test]
async fn test_scatter_collects_in_shard_order() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store) = local_context(dir.path()).await;

  let task = TaskDef {
    command: "echo {{ x }}".to_string(),
    inputs: [("x".to_string(), ValueType::Str)].into_iter().collect(),
    outputs: vec![OutputDecl {
      name: "echoed".to_string(),
      value_type: ValueType::Str,
      expression: "{{ x }}".to_string(),
    }],
    runtime: RuntimeDecl::default(),
  };
  let document = WorkflowDocument {
    name: "ordered".to_string(),
    tasks: [("echo_task".to_string(), task)].into_iter().collect(),
    nodes: vec![GraphNode::Scatter(ScatterNode {
      id: "sc".to_string(),
      collection: InputExpr::Literal {
        value: Value::Array(vec![
          Value::Str("a".to_string()),
          Value::Str("b".to_string()),
          Value::Str("c".to_string()),
        ]),
      },
      item: "x".to_string(),
      call: CallNode {
        id: "echo".to_string(),
        task: "echo_task".to_string(),
        inputs: [("x".to_string(), InputExpr::ScatterItem)].into_iter().collect(),
      },
    })],
  };

  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let collector = calls
    .iter()
    .find(|r| r.kind == CallKind::Collector)
    .unwrap();
  assert_eq!(collector.status, CallStatus::Succeeded);
  assert_eq!(
    collector.outputs.as_ref().unwrap().get("echoed"),
    Some(&Value::Array(vec![
      Value::Str("a".to_string()),
      Value::Str("b".to_string()),
      Value::Str("c".to_string()),
    ]))
  );
}

// S6: a Running call with a recorded external id resumes without a new
// attempt.
#[tokio::test]
async fn test_restart_resumes_running_call_with_external_id() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  scripted(&backend).script("hello", ScriptedOutcome::ok());

  let document = single_task_document("hello_task", "hello", simple_task("echo hello", &[]));
  let id = WorkflowId::generate();
  let row = rill_store::WorkflowRow {
    id,
    name: document.name.clone(),
    status: WorkflowStatus::Running,
    document,
    inputs: serde_json::Map::new(),
    options: WorkflowOptions::default(),
    labels: BTreeMap::new(),
    dependencies: None,
    workflow_root: dir.path().join(id.to_string()).display().to_string(),
    submitted_at: chrono::Utc::now(),
    completed_at: None,
  };
  store.create_workflow(&row).await.unwrap();

  let key = CallKey::new(id, "hello");
  let mut call = CallRow::not_started(
    key.clone(),
    "hello",
    CallKind::Task,
    Default::default(),
    format!("{}/call-hello/attempt-1", row.workflow_root),
  );
  store.create_call(&call).await.unwrap();
  call.status = CallStatus::Running;
  store
    .transition_call(
      &call,
      &[("externalJobId".to_string(), Some("J".to_string()))],
    )
    .await
    .unwrap();

  // Restart: recover and run.
  let loaded = store.get_workflow(id).await.unwrap();
  let outcome = WorkflowExecution::recover(ctx.clone(), loaded, CancellationToken::new())
    .await
    .unwrap()
    .run()
    .await
    .unwrap();
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  // Resumed, not re-dispatched: still exactly one attempt.
  assert_eq!(scripted(&backend).resumed_tasks(), vec!["hello".to_string()]);
  let calls = store.list_calls(id).await.unwrap();
  assert_eq!(calls.len(), 1);
  assert_eq!(calls[0].key.attempt, 1);
  assert_eq!(calls[0].status, CallStatus::Succeeded);
}

// Restart rejection: a Failed call makes the workflow unrecoverable.
#[tokio::test]
async fn test_restart_rejected_on_failed_call() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, _backend) = scripted_context(dir.path()).await;

  let document = single_task_document("hello_task", "hello", simple_task("echo hello", &[]));
  let id = WorkflowId::generate();
  let row = rill_store::WorkflowRow {
    id,
    name: document.name.clone(),
    status: WorkflowStatus::Running,
    document,
    inputs: serde_json::Map::new(),
    options: WorkflowOptions::default(),
    labels: BTreeMap::new(),
    dependencies: None,
    workflow_root: dir.path().join(id.to_string()).display().to_string(),
    submitted_at: chrono::Utc::now(),
    completed_at: None,
  };
  store.create_workflow(&row).await.unwrap();

  let mut call = CallRow::not_started(
    CallKey::new(id, "hello"),
    "hello",
    CallKind::Task,
    Default::default(),
    "unused",
  );
  store.create_call(&call).await.unwrap();
  call.status = CallStatus::Failed;
  store.transition_call(&call, &[]).await.unwrap();

  let loaded = store.get_workflow(id).await.unwrap();
  let err = WorkflowExecution::recover(ctx, loaded, CancellationToken::new())
    .await
    .unwrap_err();
  assert!(matches!(err, rill_engine::EngineError::Initialization { .. }));
  // The rejection records the workflow as failed.
  assert_eq!(
    store.get_workflow(id).await.unwrap().status,
    WorkflowStatus::Failed
  );
}

// P3 restart fidelity: succeeded calls are not re-dispatched; transient
// executions reset and re-run.
#[tokio::test]
async fn test_restart_reruns_only_transient_calls() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  // If "first" were re-dispatched it would fail the workflow.
  scripted(&backend).script(
    "first",
    ScriptedOutcome::failed(FailureCode::Nonretryable, "must not re-run"),
  );
  scripted(&backend).script("second", ScriptedOutcome::ok());

  let document = WorkflowDocument {
    name: "two-step".to_string(),
    tasks: [
      ("first_task".to_string(), simple_task("echo 1", &[])),
      ("second_task".to_string(), simple_task("echo 2", &[])),
    ]
    .into_iter()
    .collect(),
    nodes: vec![call_node("first", "first_task"), call_node("second", "second_task")],
  };

  let id = WorkflowId::generate();
  let row = rill_store::WorkflowRow {
    id,
    name: document.name.clone(),
    status: WorkflowStatus::Running,
    document,
    inputs: serde_json::Map::new(),
    options: WorkflowOptions::default(),
    labels: BTreeMap::new(),
    dependencies: None,
    workflow_root: dir.path().join(id.to_string()).display().to_string(),
    submitted_at: chrono::Utc::now(),
    completed_at: None,
  };
  store.create_workflow(&row).await.unwrap();

  // "first" already succeeded before the crash.
  let mut first = CallRow::not_started(
    CallKey::new(id, "first"),
    "first",
    CallKind::Task,
    Default::default(),
    "unused",
  );
  store.create_call(&first).await.unwrap();
  first.status = CallStatus::Succeeded;
  first.outputs = Some(BTreeMap::new());
  store.transition_call(&first, &[]).await.unwrap();

  // "second" was Starting (transient) when the engine died.
  let mut second = CallRow::not_started(
    CallKey::new(id, "second"),
    "second",
    CallKind::Task,
    Default::default(),
    "unused",
  );
  store.create_call(&second).await.unwrap();
  second.status = CallStatus::Starting;
  store.transition_call(&second, &[]).await.unwrap();

  let loaded = store.get_workflow(id).await.unwrap();
  let outcome = WorkflowExecution::recover(ctx, loaded, CancellationToken::new())
    .await
    .unwrap()
    .run()
    .await
    .unwrap();
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(id).await.unwrap();
  // "first" kept its single succeeded attempt; "second" re-ran in place.
  assert_eq!(calls_for(&calls, "first").len(), 1);
  let second_rows = calls_for(&calls, "second");
  assert_eq!(second_rows.len(), 1);
  assert_eq!(second_rows[0].status, CallStatus::Succeeded);
}

// S7: memory retry multiplies the request until success.
#[tokio::test]
async fn test_memory_retry_multiplier() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  scripted(&backend).script(
    "big",
    ScriptedOutcome::failed(FailureCode::Nonretryable, "OutOfMemory: container killed"),
  );
  scripted(&backend).script(
    "big",
    ScriptedOutcome::failed(FailureCode::Nonretryable, "OutOfMemory: container killed"),
  );
  scripted(&backend).script("big", ScriptedOutcome::ok());

  let document = single_task_document(
    "big_task",
    "big",
    simple_task(
      "sort everything",
      &[
        ("memory_mb", serde_json::json!(4096)),
        ("max_retries", serde_json::json!(3)),
      ],
    ),
  );
  let outcome = run_to_outcome(
    &ctx,
    submission(&document, serde_json::json!({"memory_retry_multiplier": 1.5})),
  )
  .await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let rows = calls_for(&calls, "big");
  assert_eq!(rows.len(), 3);
  assert_eq!(rows[0].status, CallStatus::RetryableFailure);
  assert_eq!(rows[0].attributes.memory_mb, 4096);
  assert_eq!(rows[1].status, CallStatus::RetryableFailure);
  assert_eq!(rows[1].attributes.memory_mb, 6144);
  assert_eq!(rows[2].status, CallStatus::Succeeded);
  assert_eq!(rows[2].attributes.memory_mb, 9216);
}

// Without the multiplier option the same failure is terminal.
#[tokio::test]
async fn test_oom_without_multiplier_is_fatal() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, backend) = scripted_context(dir.path()).await;

  scripted(&backend).script(
    "big",
    ScriptedOutcome::failed(FailureCode::Nonretryable, "OutOfMemory: container killed"),
  );

  let document = single_task_document(
    "big_task",
    "big",
    simple_task("sort", &[("max_retries", serde_json::json!(3))]),
  );
  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Failed);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let rows = calls_for(&calls, "big");
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].status, CallStatus::Failed);
}

// Abort: cancellation observed at a suspension point aborts the call and
// the workflow, durably.
#[tokio::test]
async fn test_abort_marks_call_and_workflow() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store) = local_context(dir.path()).await;

  let document = single_task_document("slow", "slow", simple_task("sleep 30", &[]));
  let cancel = CancellationToken::new();
  let execution = WorkflowExecution::submit(
    ctx.clone(),
    submission(&document, serde_json::json!({})),
    cancel.clone(),
  )
  .await
  .unwrap();
  let id = execution.id();

  let canceller = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    canceller.cancel();
  });

  let outcome = execution.run().await.unwrap();
  assert_eq!(outcome.status, WorkflowStatus::Aborted);

  let calls = store.list_calls(id).await.unwrap();
  assert_eq!(calls.len(), 1);
  assert_eq!(calls[0].status, CallStatus::Aborted);
}

// Validation failures reject the submission before any state exists.
#[tokio::test]
async fn test_invalid_options_rejected_before_state() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store, _backend) = scripted_context(dir.path()).await;

  let document = single_task_document("hello_task", "hello", simple_task("echo hello", &[]));
  let err = WorkflowExecution::submit(
    ctx,
    submission(&document, serde_json::json!({"memory_retry_multiplier": 0.5})),
    CancellationToken::new(),
  )
  .await
  .unwrap_err();
  assert!(matches!(err, rill_engine::EngineError::Validation { .. }));
  assert!(store.list_non_terminal_workflows().await.unwrap().is_empty());
}

// Dependent calls observe upstream outputs through input expressions.
#[tokio::test]
async fn test_dependent_calls_flow_outputs() {
  let dir = tempfile::tempdir().unwrap();
  let (ctx, store) = local_context(dir.path()).await;

  let producer = TaskDef {
    command: "echo -n banana".to_string(),
    inputs: BTreeMap::new(),
    outputs: vec![OutputDecl {
      name: "fruit".to_string(),
      value_type: ValueType::File,
      expression: "stdout".to_string(),
    }],
    runtime: RuntimeDecl::default(),
  };
  let consumer = TaskDef {
    command: "cat {{ f }}".to_string(),
    inputs: [("f".to_string(), ValueType::File)].into_iter().collect(),
    outputs: vec![OutputDecl {
      name: "copy".to_string(),
      value_type: ValueType::File,
      expression: "stdout".to_string(),
    }],
    runtime: RuntimeDecl::default(),
  };
  let document = WorkflowDocument {
    name: "pipeline".to_string(),
    tasks: [
      ("producer".to_string(), producer),
      ("consumer".to_string(), consumer),
    ]
    .into_iter()
    .collect(),
    nodes: vec![
      call_node("produce", "producer"),
      GraphNode::Call(CallNode {
        id: "consume".to_string(),
        task: "consumer".to_string(),
        inputs: [(
          "f".to_string(),
          InputExpr::NodeOutput {
            node: "produce".to_string(),
            output: "fruit".to_string(),
          },
        )]
        .into_iter()
        .collect(),
      }),
    ],
  };

  let outcome = run_to_outcome(&ctx, submission(&document, serde_json::json!({}))).await;
  assert_eq!(outcome.status, WorkflowStatus::Succeeded);

  let calls = store.list_calls(outcome.id).await.unwrap();
  let consume = calls_for(&calls, "consume")[0];
  let Some(Value::File(copy)) = consume.outputs.as_ref().unwrap().get("copy") else {
    panic!("consumer did not produce a file output");
  };
  assert_eq!(std::fs::read_to_string(copy).unwrap(), "banana");
}
