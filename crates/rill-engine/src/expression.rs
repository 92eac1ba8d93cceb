//! Input-expression evaluation.
//!
//! Expressions are resolved when a node becomes ready: workflow inputs are
//! coerced against the declared type at the binding site, node outputs are
//! read from the completed set, and file-producing expressions are
//! materialized before dispatch so the produced files exist as inputs.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use uuid::Uuid;

use rill_core::{InputExpr, Value, ValueType};
use rill_io::PathIo;

use crate::error::EngineError;

/// Everything an expression can reference.
pub(crate) struct EvalEnv<'a> {
  /// Raw workflow-level inputs, coerced lazily at the binding site.
  pub workflow_inputs: &'a serde_json::Map<String, serde_json::Value>,
  /// Outputs of completed nodes.
  pub node_outputs: &'a HashMap<String, BTreeMap<String, Value>>,
  /// Binding for `ScatterItem` inside scatter bodies.
  pub scatter_item: Option<&'a Value>,
  /// Directory where file-producing expressions materialize.
  pub scratch_dir: &'a str,
}

/// Evaluate an expression. `expected` is the declared type at the binding
/// site, used to coerce raw workflow inputs (a JSON string only becomes a
/// `File` through a declaration).
pub(crate) async fn evaluate(
  expr: &InputExpr,
  expected: Option<&ValueType>,
  env: &EvalEnv<'_>,
  io: &PathIo,
) -> Result<Value, EngineError> {
  match expr {
    InputExpr::Literal { value } => Ok(value.clone()),

    InputExpr::WorkflowInput { name } => {
      let raw = env
        .workflow_inputs
        .get(name)
        .ok_or_else(|| EngineError::validation(format!("missing workflow input '{}'", name)))?;
      match expected {
        Some(declared) => Value::from_json(raw, declared).map_err(EngineError::from),
        None => Ok(infer(raw)),
      }
    }

    InputExpr::NodeOutput { node, output } => env
      .node_outputs
      .get(node)
      .and_then(|outputs| outputs.get(output))
      .cloned()
      .ok_or_else(|| {
        EngineError::validation(format!("output '{}' of node '{}' is not available", output, node))
      }),

    InputExpr::ScatterItem => env
      .scatter_item
      .cloned()
      .ok_or_else(|| EngineError::validation("scatter item referenced outside a scatter body")),

    InputExpr::WriteLines { lines } => {
      let value = Box::pin(evaluate(lines, None, env, io)).await?;
      let Value::Array(items) = value else {
        return Err(EngineError::validation(
          "write_lines expects an array expression",
        ));
      };
      let mut body = String::new();
      for item in &items {
        body.push_str(&item.to_command_string());
        body.push('\n');
      }
      let path = format!("{}/write_lines_{}.txt", env.scratch_dir, Uuid::new_v4());
      io.write_all(&path, Bytes::from(body))
        .await
        .map_err(|e| EngineError::validation(format!("write_lines failed: {}", e)))?;
      Ok(Value::File(path))
    }
  }
}

/// Resolve a call node's input bindings against the task's declarations.
///
/// Every declared input must be bound; bindings without a declaration are
/// evaluated untyped and passed through.
pub(crate) async fn resolve_call_inputs(
  call: &rill_core::CallNode,
  task: &rill_core::TaskDef,
  env: &EvalEnv<'_>,
  io: &PathIo,
) -> Result<BTreeMap<String, Value>, EngineError> {
  let mut resolved = BTreeMap::new();
  for (name, declared) in &task.inputs {
    let expr = call.inputs.get(name).ok_or_else(|| {
      EngineError::validation(format!(
        "call '{}' does not bind declared input '{}'",
        call.id, name
      ))
    })?;
    resolved.insert(name.clone(), evaluate(expr, Some(declared), env, io).await?);
  }
  for (name, expr) in &call.inputs {
    if !task.inputs.contains_key(name) {
      resolved.insert(name.clone(), evaluate(expr, None, env, io).await?);
    }
  }
  Ok(resolved)
}

/// Best-effort typing for untyped binding sites (e.g. scatter collections
/// fed straight from workflow inputs).
fn infer(raw: &serde_json::Value) -> Value {
  match raw {
    serde_json::Value::Null => Value::Null,
    serde_json::Value::Bool(b) => Value::Boolean(*b),
    serde_json::Value::Number(n) => n
      .as_i64()
      .map(Value::Integer)
      .unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or(f64::NAN))),
    serde_json::Value::String(s) => Value::Str(s.clone()),
    serde_json::Value::Array(items) => Value::Array(items.iter().map(infer).collect()),
    serde_json::Value::Object(_) => Value::Str(raw.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rill_io::MemoryStore;
  use std::sync::Arc;

  fn test_io() -> PathIo {
    let mut io = PathIo::new();
    io.register("mem", Arc::new(MemoryStore::new()));
    io
  }

  fn empty_env<'a>(
    inputs: &'a serde_json::Map<String, serde_json::Value>,
    outputs: &'a HashMap<String, BTreeMap<String, Value>>,
  ) -> EvalEnv<'a> {
    EvalEnv {
      workflow_inputs: inputs,
      node_outputs: outputs,
      scatter_item: None,
      scratch_dir: "mem://scratch",
    }
  }

  #[tokio::test]
  async fn test_workflow_input_coerced_by_declaration() {
    let io = test_io();
    let mut inputs = serde_json::Map::new();
    inputs.insert("f".to_string(), serde_json::json!("/data/x.txt"));
    let outputs = HashMap::new();
    let env = empty_env(&inputs, &outputs);

    let value = evaluate(
      &InputExpr::WorkflowInput { name: "f".to_string() },
      Some(&ValueType::File),
      &env,
      &io,
    )
    .await
    .unwrap();
    assert_eq!(value, Value::File("/data/x.txt".to_string()));
  }

  #[tokio::test]
  async fn test_node_output_lookup() {
    let io = test_io();
    let inputs = serde_json::Map::new();
    let mut outputs = HashMap::new();
    outputs.insert(
      "step1".to_string(),
      [("count".to_string(), Value::Integer(7))]
        .into_iter()
        .collect::<BTreeMap<_, _>>(),
    );
    let env = empty_env(&inputs, &outputs);

    let value = evaluate(
      &InputExpr::NodeOutput {
        node: "step1".to_string(),
        output: "count".to_string(),
      },
      None,
      &env,
      &io,
    )
    .await
    .unwrap();
    assert_eq!(value, Value::Integer(7));
  }

  #[tokio::test]
  async fn test_write_lines_materializes_file() {
    let io = test_io();
    let inputs = serde_json::Map::new();
    let outputs = HashMap::new();
    let env = empty_env(&inputs, &outputs);

    let expr = InputExpr::WriteLines {
      lines: Box::new(InputExpr::Literal {
        value: Value::Array(vec![
          Value::Str("alpha".to_string()),
          Value::Str("beta".to_string()),
        ]),
      }),
    };
    let value = evaluate(&expr, Some(&ValueType::File), &env, &io).await.unwrap();

    let Value::File(path) = value else {
      panic!("expected a file value");
    };
    let body = io.read_all(&path).await.unwrap();
    assert_eq!(body, Bytes::from("alpha\nbeta\n"));
  }

  #[tokio::test]
  async fn test_missing_workflow_input_is_validation_error() {
    let io = test_io();
    let inputs = serde_json::Map::new();
    let outputs = HashMap::new();
    let env = empty_env(&inputs, &outputs);

    let err = evaluate(
      &InputExpr::WorkflowInput { name: "ghost".to_string() },
      None,
      &env,
      &io,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
  }
}
