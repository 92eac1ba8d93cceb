use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use rill_core::{Detritus, DetritusKind, Value, ValueType, WorkflowId, WorkflowOptions};
use rill_io::{PathIo, LocalStore};
use rill_retry::BackoffCurve;

use crate::template::render_command;
use crate::types::{BoundCall, CallPlan, ExecutionHandle, FailureCode, InitData, PollOutcome};
use crate::BackendError;

/// Backend that runs calls as local shell processes.
///
/// The rendered command is materialized as the `script` detritus file and
/// run under `/bin/bash` with stdout/stderr redirected to their detritus
/// files. Completion is signalled through the `rc` file, which also makes
/// resume natural: a resumed handle is just the call root being watched
/// again.
pub struct LocalBackend {
  io: PathIo,
  poll: BackoffCurve,
  children: Arc<Mutex<HashMap<String, RunningChild>>>,
}

struct RunningChild {
  child: Child,
  monitor: Option<Child>,
}

/// Registry key for a running child: workflow-qualified so cleanup can find
/// every child a workflow owns.
fn child_key(key: &rill_core::CallKey) -> String {
  format!("{}/{}", key.workflow, key)
}

impl LocalBackend {
  pub fn new() -> Self {
    let mut io = PathIo::new();
    io.register("file", Arc::new(LocalStore::with_md5_sidecar()));
    Self::with_io(io)
  }

  pub fn with_io(io: PathIo) -> Self {
    Self {
      io,
      poll: BackoffCurve::polling(),
      children: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Override the poll schedule. Tests use millisecond curves.
  pub fn with_poll_backoff(mut self, poll: BackoffCurve) -> Self {
    self.poll = poll;
    self
  }

  pub(crate) fn io(&self) -> &PathIo {
    &self.io
  }

  pub(crate) fn poll_backoff(&self) -> BackoffCurve {
    self.poll
  }

  pub(crate) fn validate_options(&self, options: &WorkflowOptions) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(root) = options.workflow_root() {
      let root = root.display().to_string();
      if PathIo::scheme_of(&root) != "file" {
        errors.push(format!(
          "local backend requires a local workflow_root, got '{}'",
          root
        ));
      }
    }
    errors
  }

  pub(crate) async fn initialize_workflow(
    &self,
    workflow: WorkflowId,
    options: &WorkflowOptions,
  ) -> Result<InitData, BackendError> {
    // Probe-write the workflow root so a bad mount fails the workflow
    // before any call is created.
    if let Some(root) = options.workflow_root() {
      let probe = root.join(format!(".rill-probe-{}", workflow)).display().to_string();
      self.io.write_all(&probe, Bytes::new()).await?;
      self.io.delete(&probe).await?;
    }
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

    // Localize: file inputs that are not already on the local scheme are
    // materialized under <call_root>/inputs and the input map is rewritten
    // to the local paths.
    let mut localized = BTreeMap::new();
    for (name, value) in &plan.inputs {
      let mut rewritten = value.clone();
      for remote in value.file_paths() {
        if PathIo::scheme_of(remote) != "file" {
          let base = remote.rsplit('/').next().unwrap_or("input");
          let local = format!("{}/inputs/{}", call_root, base);
          self
            .io
            .copy(remote, &local, &rill_io::CopyOptions::default())
            .await?;
          let from = remote.to_string();
          rewritten = rewritten.map_files(&|p| {
            if p == from {
              local.clone()
            } else {
              p.to_string()
            }
          });
        }
      }
      localized.insert(name.clone(), rewritten);
    }

    let command = render_command(&plan.task.command, &localized)?;
    let detritus = Detritus::conventional(Path::new(&call_root));

    Ok(BoundCall {
      key: plan.key,
      task: plan.task,
      attributes: plan.attributes,
      inputs: localized,
      command,
      call_root,
      detritus,
      monitoring_script: plan.monitoring_script,
    })
  }

  pub(crate) async fn execute(&self, bound: &BoundCall) -> Result<ExecutionHandle, BackendError> {
    let root = Path::new(&bound.call_root);
    tokio::fs::create_dir_all(root)
      .await
      .map_err(|e| BackendError::Submit {
        message: format!("failed to create call root: {}", e),
      })?;

    let script_path = root.join(DetritusKind::Script.file_name());
    let script = format!("#!/bin/bash\n\n{}\n", bound.command);
    self
      .io
      .write_all(&script_path.display().to_string(), Bytes::from(script))
      .await?;

    let stdout = std::fs::File::create(root.join(DetritusKind::Stdout.file_name()))
      .map_err(|e| BackendError::Submit {
        message: format!("failed to create stdout: {}", e),
      })?;
    let stderr = std::fs::File::create(root.join(DetritusKind::Stderr.file_name()))
      .map_err(|e| BackendError::Submit {
        message: format!("failed to create stderr: {}", e),
      })?;

    let child = Command::new("/bin/bash")
      .arg(&script_path)
      .current_dir(root)
      .stdin(Stdio::null())
      .stdout(Stdio::from(stdout))
      .stderr(Stdio::from(stderr))
      .spawn()
      .map_err(|e| BackendError::Submit {
        message: format!("failed to spawn: {}", e),
      })?;

    let monitor = match &bound.monitoring_script {
      Some(script) => {
        let log = std::fs::File::create(root.join("monitoring.log")).map_err(|e| {
          BackendError::Submit {
            message: format!("failed to create monitoring.log: {}", e),
          }
        })?;
        match Command::new("/bin/bash")
          .arg(script)
          .current_dir(root)
          .stdin(Stdio::null())
          .stdout(Stdio::from(log))
          .stderr(Stdio::null())
          .spawn()
        {
          Ok(child) => Some(child),
          Err(e) => {
            // Monitoring is best-effort; the call proceeds without it.
            warn!(call = %bound.key, error = %e, "failed to start monitoring script");
            None
          }
        }
      }
      None => None,
    };

    let pid = child.id();
    debug!(call = %bound.key, pid, "spawned local process");

    self
      .children
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(child_key(&bound.key), RunningChild { child, monitor });

    Ok(ExecutionHandle::Local {
      call_root: bound.call_root.clone(),
      pid,
    })
  }

  pub(crate) async fn resume(
    &self,
    bound: &BoundCall,
    token: &str,
  ) -> Result<ExecutionHandle, BackendError> {
    // The process (if it still exists) keeps writing into the call root;
    // resuming is watching that root for the rc file again.
    Ok(ExecutionHandle::Local {
      call_root: bound.call_root.clone(),
      pid: token.parse().ok(),
    })
  }

  pub(crate) async fn poll(
    &self,
    bound: &BoundCall,
    handle: ExecutionHandle,
  ) -> Result<PollOutcome, BackendError> {
    let ExecutionHandle::Local { call_root, .. } = &handle else {
      return Err(BackendError::Unsupported { op: "poll" });
    };

    let rc_path = Path::new(call_root).join(DetritusKind::ReturnCode.file_name());
    if self.io.exists(&rc_path.display().to_string()).await? {
      return self.finalize(bound, &rc_path).await;
    }

    // No rc yet: reap our own child if we still hold it.
    let exited = {
      let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
      match children.get_mut(&child_key(&bound.key)) {
        Some(running) => match running.child.try_wait() {
          Ok(Some(status)) => {
            if let Some(monitor) = running.monitor.as_mut() {
              let _ = monitor.start_kill();
            }
            children.remove(&child_key(&bound.key));
            Some(exit_code(status))
          }
          Ok(None) => None,
          Err(e) => {
            children.remove(&child_key(&bound.key));
            return Ok(PollOutcome::Failed {
              code: FailureCode::TransientIo,
              message: format!("wait failed: {}", e),
              events: vec![],
            });
          }
        },
        // Resumed execution we never spawned: keep watching the rc file.
        None => None,
      }
    };

    match exited {
      Some(code) => {
        self
          .io
          .write_all(&rc_path.display().to_string(), Bytes::from(code.to_string()))
          .await?;
        self.finalize(bound, &rc_path).await
      }
      None => Ok(PollOutcome::Running(handle)),
    }
  }

  /// The rc file exists: parse it and evaluate declared outputs.
  async fn finalize(&self, bound: &BoundCall, rc_path: &Path) -> Result<PollOutcome, BackendError> {
    let raw = self.io.read_all(&rc_path.display().to_string()).await?;
    let text = String::from_utf8_lossy(&raw);
    let return_code: i32 = match text.trim().parse() {
      Ok(rc) => rc,
      Err(_) => {
        // Undefined return code is a bounded-retryable IO failure.
        return Ok(PollOutcome::Failed {
          code: FailureCode::TransientIo,
          message: format!("unparsable rc file: '{}'", text.trim()),
          events: vec![],
        });
      }
    };

    let outputs = match self.evaluate_outputs(bound).await {
      Ok(outputs) => outputs,
      Err(e) if return_code == 0 => {
        return Ok(PollOutcome::Failed {
          code: FailureCode::Nonretryable,
          message: e.to_string(),
          events: vec![],
        });
      }
      // Nonzero rc: the command itself failed, missing outputs are expected.
      Err(_) => BTreeMap::new(),
    };

    Ok(PollOutcome::Succeeded {
      outputs,
      return_code,
      events: vec![],
    })
  }

  /// Evaluate declared outputs against the call root.
  async fn evaluate_outputs(
    &self,
    bound: &BoundCall,
  ) -> Result<BTreeMap<String, Value>, BackendError> {
    let mut outputs = BTreeMap::new();
    for decl in &bound.task.outputs {
      let rendered = render_command(&decl.expression, &bound.inputs)?;
      let value = self
        .coerce_output(&decl.name, &decl.value_type, &rendered, &bound.call_root)
        .await?;
      outputs.insert(decl.name.clone(), value);
    }
    Ok(outputs)
  }

  async fn coerce_output(
    &self,
    name: &str,
    value_type: &ValueType,
    rendered: &str,
    call_root: &str,
  ) -> Result<Value, BackendError> {
    let output_err = |message: String| BackendError::Output {
      name: name.to_string(),
      message,
    };

    Ok(match value_type {
      ValueType::File => {
        let path = if Path::new(rendered).is_absolute() {
          rendered.to_string()
        } else {
          Path::new(call_root).join(rendered).display().to_string()
        };
        self
          .io
          .exists_or_throw(&path)
          .await
          .map_err(|e| output_err(e.to_string()))?;
        Value::File(path)
      }
      ValueType::Str => Value::Str(rendered.to_string()),
      ValueType::Integer => Value::Integer(
        rendered
          .trim()
          .parse()
          .map_err(|e| output_err(format!("not an integer: {}", e)))?,
      ),
      ValueType::Float => Value::Float(
        rendered
          .trim()
          .parse()
          .map_err(|e| output_err(format!("not a float: {}", e)))?,
      ),
      ValueType::Boolean => Value::Boolean(
        rendered
          .trim()
          .parse()
          .map_err(|e| output_err(format!("not a boolean: {}", e)))?,
      ),
      ValueType::Array(item) => {
        let parsed: serde_json::Value = serde_json::from_str(rendered)
          .map_err(|e| output_err(format!("not a JSON array: {}", e)))?;
        Value::from_json(&parsed, &ValueType::Array(item.clone()))
          .map_err(|e| output_err(e.to_string()))?
      }
    })
  }

  pub(crate) async fn abort(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
    let ExecutionHandle::Local { pid, .. } = handle else {
      return Err(BackendError::Unsupported { op: "abort" });
    };

    // Kill through the held child when we have it; fall back to the pid for
    // executions resumed from a previous engine process.
    let mut killed = false;
    {
      let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
      for running in children.values_mut() {
        if running.child.id() == *pid {
          let _ = running.child.start_kill();
          if let Some(monitor) = running.monitor.as_mut() {
            let _ = monitor.start_kill();
          }
          killed = true;
        }
      }
    }

    if !killed {
      if let Some(pid) = pid {
        let _ = Command::new("kill")
          .arg("-TERM")
          .arg(pid.to_string())
          .status()
          .await;
      }
    }
    Ok(())
  }

  pub(crate) async fn cleanup_workflow(
    &self,
    workflow: WorkflowId,
    _init: &InitData,
  ) -> Result<(), BackendError> {
    // Reap any children still registered for this workflow.
    let prefix = format!("{}/", workflow);
    let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
    children.retain(|key, running| {
      let owned = key.starts_with(&prefix);
      if owned {
        let _ = running.child.start_kill();
        if let Some(monitor) = running.monitor.as_mut() {
          let _ = monitor.start_kill();
        }
      }
      !owned
    });
    Ok(())
  }
}

impl Default for LocalBackend {
  fn default() -> Self {
    Self::new()
  }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    status
      .code()
      .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
  }
  #[cfg(not(unix))]
  {
    status.code().unwrap_or(-1)
  }
}
