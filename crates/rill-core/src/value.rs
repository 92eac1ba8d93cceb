use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Declared type of a task input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
  Boolean,
  Integer,
  Float,
  Str,
  File,
  Array(Box<ValueType>),
}

/// A resolved value flowing between nodes of the task graph.
///
/// Files are distinguished from plain strings so the engine can localize
/// them before dispatch and delocalize produced files after success. The
/// serialized form is tagged, so values round-trip through store JSON
/// columns without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
  Null,
  Boolean(bool),
  Integer(i64),
  Float(f64),
  Str(String),
  File(String),
  Array(Vec<Value>),
}

impl Value {
  /// Coerce a raw JSON value against a declared type.
  ///
  /// This is the seam where the (externally type-checked) submission inputs
  /// become typed values: files arrive as JSON strings and are promoted to
  /// `File` by the declaration.
  pub fn from_json(json: &serde_json::Value, declared: &ValueType) -> Result<Self, ModelError> {
    match (declared, json) {
      (ValueType::Boolean, serde_json::Value::Bool(b)) => Ok(Value::Boolean(*b)),
      (ValueType::Integer, serde_json::Value::Number(n)) => {
        n.as_i64().map(Value::Integer).ok_or_else(|| ModelError::TypeMismatch {
          expected: "integer".to_string(),
          found: n.to_string(),
        })
      }
      (ValueType::Float, serde_json::Value::Number(n)) => {
        n.as_f64().map(Value::Float).ok_or_else(|| ModelError::TypeMismatch {
          expected: "float".to_string(),
          found: n.to_string(),
        })
      }
      (ValueType::Str, serde_json::Value::String(s)) => Ok(Value::Str(s.clone())),
      (ValueType::File, serde_json::Value::String(s)) => Ok(Value::File(s.clone())),
      (ValueType::Array(item), serde_json::Value::Array(items)) => {
        let values = items
          .iter()
          .map(|v| Value::from_json(v, item))
          .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(values))
      }
      (_, serde_json::Value::Null) => Ok(Value::Null),
      (declared, found) => Err(ModelError::TypeMismatch {
        expected: format!("{:?}", declared),
        found: found.to_string(),
      }),
    }
  }

  /// Collect every file path referenced by this value, depth-first.
  pub fn file_paths(&self) -> Vec<&str> {
    let mut paths = Vec::new();
    self.collect_file_paths(&mut paths);
    paths
  }

  fn collect_file_paths<'a>(&'a self, paths: &mut Vec<&'a str>) {
    match self {
      Value::File(path) => paths.push(path),
      Value::Array(items) => {
        for item in items {
          item.collect_file_paths(paths);
        }
      }
      _ => {}
    }
  }

  /// Rewrite every file path through `f`, preserving structure.
  pub fn map_files(&self, f: &impl Fn(&str) -> String) -> Value {
    match self {
      Value::File(path) => Value::File(f(path)),
      Value::Array(items) => Value::Array(items.iter().map(|v| v.map_files(f)).collect()),
      other => other.clone(),
    }
  }

  /// Render this value for substitution into a command template.
  pub fn to_command_string(&self) -> String {
    match self {
      Value::Null => String::new(),
      Value::Boolean(b) => b.to_string(),
      Value::Integer(i) => i.to_string(),
      Value::Float(f) => f.to_string(),
      Value::Str(s) | Value::File(s) => s.clone(),
      Value::Array(items) => items
        .iter()
        .map(|v| v.to_command_string())
        .collect::<Vec<_>>()
        .join(" "),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_command_string())
  }
}
