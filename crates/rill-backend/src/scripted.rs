use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use rill_core::{Detritus, DetritusKind, Value, WorkflowId, WorkflowOptions};
use rill_io::{LocalStore, PathIo};
use rill_retry::BackoffCurve;

use crate::template::render_command;
use crate::types::{BoundCall, CallPlan, ExecutionHandle, FailureCode, InitData, PollOutcome};
use crate::BackendError;

/// Outcome the scripted backend reports on its next poll for a task.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
  Succeed {
    outputs: BTreeMap<String, Value>,
    return_code: i32,
    stdout: String,
    stderr: String,
  },
  /// Host reclaimed; the engine retries under the preemption budget.
  Preempt { message: String },
  Fail { code: FailureCode, message: String },
  /// Report still-running for one poll cycle.
  StillRunning,
}

impl ScriptedOutcome {
  pub fn ok() -> Self {
    Self::Succeed {
      outputs: BTreeMap::new(),
      return_code: 0,
      stdout: String::new(),
      stderr: String::new(),
    }
  }

  pub fn ok_with(outputs: BTreeMap<String, Value>, return_code: i32) -> Self {
    Self::Succeed {
      outputs,
      return_code,
      stdout: String::new(),
      stderr: String::new(),
    }
  }

  pub fn preempted() -> Self {
    Self::Preempt {
      message: "host preempted".to_string(),
    }
  }

  pub fn failed(code: FailureCode, message: impl Into<String>) -> Self {
    Self::Fail {
      code,
      message: message.into(),
    }
  }
}

/// A deterministic backend driven by per-task queues of scripted outcomes.
///
/// Successive attempts of the same task consume successive outcomes, which
/// is exactly what preemption and retry scenarios need. With an empty queue
/// every call succeeds with no outputs and rc 0. Used by the engine's
/// integration tests and by dry-run submissions.
pub struct ScriptedBackend {
  io: PathIo,
  poll: BackoffCurve,
  outcomes: Arc<Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>>,
  resumed: Arc<Mutex<Vec<String>>>,
  aborted: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
  pub fn new() -> Self {
    let mut io = PathIo::new();
    io.register("file", Arc::new(LocalStore::new()));
    Self {
      io,
      poll: BackoffCurve {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        multiplier: 1.1,
      },
      outcomes: Arc::new(Mutex::new(HashMap::new())),
      resumed: Arc::new(Mutex::new(Vec::new())),
      aborted: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Queue the next outcome for a task.
  pub fn script(&self, task: &str, outcome: ScriptedOutcome) {
    self
      .outcomes
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .entry(task.to_string())
      .or_default()
      .push_back(outcome);
  }

  /// Tasks that have been resumed (rather than freshly executed).
  pub fn resumed_tasks(&self) -> Vec<String> {
    self.resumed.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Tasks whose executions have been aborted.
  pub fn aborted_tasks(&self) -> Vec<String> {
    self.aborted.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub(crate) fn io(&self) -> &PathIo {
    &self.io
  }

  pub(crate) fn poll_backoff(&self) -> BackoffCurve {
    self.poll
  }

  pub(crate) async fn initialize_workflow(
    &self,
    _workflow: WorkflowId,
    _options: &WorkflowOptions,
  ) -> Result<InitData, BackendError> {
    Ok(InitData::default())
  }

  pub(crate) async fn prepare_call(
    &self,
    plan: CallPlan,
    _init: &InitData,
  ) -> Result<BoundCall, BackendError> {
    let call_root = Path::new(&plan.workflow_root)
      .join(plan.key.call_dir())
      .join(plan.key.attempt_dir())
      .display()
      .to_string();
    let command = render_command(&plan.task.command, &plan.inputs)?;
    let detritus = Detritus::conventional(Path::new(&call_root));

    Ok(BoundCall {
      key: plan.key,
      task: plan.task,
      attributes: plan.attributes,
      inputs: plan.inputs,
      command,
      call_root,
      detritus,
      monitoring_script: plan.monitoring_script,
    })
  }

  pub(crate) async fn execute(&self, bound: &BoundCall) -> Result<ExecutionHandle, BackendError> {
    let script = format!("#!/bin/bash\n\n{}\n", bound.command);
    let script_path = format!(
      "{}/{}",
      bound.call_root,
      DetritusKind::Script.file_name()
    );
    self.io.write_all(&script_path, Bytes::from(script)).await?;

    Ok(ExecutionHandle::Scripted {
      task: bound.key.task.clone(),
    })
  }

  pub(crate) async fn resume(
    &self,
    bound: &BoundCall,
    _token: &str,
  ) -> Result<ExecutionHandle, BackendError> {
    self
      .resumed
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(bound.key.task.clone());
    Ok(ExecutionHandle::Scripted {
      task: bound.key.task.clone(),
    })
  }

  pub(crate) async fn poll(
    &self,
    bound: &BoundCall,
    handle: ExecutionHandle,
  ) -> Result<PollOutcome, BackendError> {
    let next = self
      .outcomes
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get_mut(&bound.key.task)
      .and_then(VecDeque::pop_front)
      .unwrap_or_else(ScriptedOutcome::ok);

    debug!(call = %bound.key, "scripted poll: {:?}", next);
    match next {
      ScriptedOutcome::StillRunning => Ok(PollOutcome::Running(handle)),
      ScriptedOutcome::Succeed {
        outputs,
        return_code,
        stdout,
        stderr,
      } => {
        self
          .write_detritus(&bound.call_root, return_code, &stdout, &stderr)
          .await?;
        Ok(PollOutcome::Succeeded {
          outputs,
          return_code,
          events: vec![],
        })
      }
      ScriptedOutcome::Preempt { message } => Ok(PollOutcome::Failed {
        code: FailureCode::Preempted,
        message,
        events: vec![],
      }),
      ScriptedOutcome::Fail { code, message } => Ok(PollOutcome::Failed {
        code,
        message,
        events: vec![],
      }),
    }
  }

  async fn write_detritus(
    &self,
    call_root: &str,
    return_code: i32,
    stdout: &str,
    stderr: &str,
  ) -> Result<(), BackendError> {
    let write = |kind: DetritusKind, body: String| {
      let path = format!("{}/{}", call_root, kind.file_name());
      let io = self.io.clone();
      async move { io.write_all(&path, Bytes::from(body)).await }
    };
    write(DetritusKind::Stdout, stdout.to_string()).await?;
    write(DetritusKind::Stderr, stderr.to_string()).await?;
    write(DetritusKind::ReturnCode, return_code.to_string()).await?;
    Ok(())
  }

  pub(crate) async fn abort(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
    let ExecutionHandle::Scripted { task } = handle else {
      return Err(BackendError::Unsupported { op: "abort" });
    };
    self
      .aborted
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(task.clone());
    Ok(())
  }

  pub(crate) async fn cleanup_workflow(
    &self,
    _workflow: WorkflowId,
    _init: &InitData,
  ) -> Result<(), BackendError> {
    Ok(())
  }
}

impl Default for ScriptedBackend {
  fn default() -> Self {
    Self::new()
  }
}
