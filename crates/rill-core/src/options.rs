use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Workflow options: an open string-keyed map with typed accessors for the
/// keys the engine recognizes. Unrecognized keys (backend credentials and
/// the like) stay in the map for backends to read under their own prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowOptions(pub serde_json::Map<String, serde_json::Value>);

impl WorkflowOptions {
  pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
    self.0.get(key)
  }

  /// Base path for execution products.
  pub fn workflow_root(&self) -> Option<PathBuf> {
    self.get("workflow_root").and_then(|v| v.as_str()).map(PathBuf::from)
  }

  pub fn read_from_cache(&self) -> bool {
    self
      .get("read_from_cache")
      .and_then(|v| v.as_bool())
      .unwrap_or(true)
  }

  pub fn write_to_cache(&self) -> bool {
    self
      .get("write_to_cache")
      .and_then(|v| v.as_bool())
      .unwrap_or(true)
  }

  /// Multiplier applied to the memory request on a matching retryable
  /// failure. Only meaningful when > 1; [`WorkflowOptions::validate`]
  /// rejects other values.
  pub fn memory_retry_multiplier(&self) -> Option<f64> {
    self.get("memory_retry_multiplier").and_then(|v| v.as_f64())
  }

  /// Substrings of a failure message that make it eligible for memory retry.
  pub fn memory_retry_keys(&self) -> Vec<String> {
    match self.get("memory_retry_keys").and_then(|v| v.as_array()) {
      Some(keys) => keys
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect(),
      None => vec!["OutOfMemory".to_string(), "Killed".to_string()],
    }
  }

  /// User script run alongside each call; stdout delocalizes to
  /// `monitoring.log` in the call root.
  pub fn monitoring_script(&self) -> Option<PathBuf> {
    self
      .get("monitoring_script")
      .and_then(|v| v.as_str())
      .map(PathBuf::from)
  }

  /// Default preemption budget for tasks that do not declare one.
  pub fn preemptible(&self) -> u32 {
    self
      .get("preemptible")
      .and_then(|v| v.as_u64())
      .unwrap_or(0) as u32
  }

  /// Keep driving sibling nodes after a call fails terminally.
  pub fn continue_on_failure(&self) -> bool {
    self
      .get("continue_on_failure")
      .and_then(|v| v.as_bool())
      .unwrap_or(false)
  }

  /// Validate recognized option values. Returns error descriptors; an empty
  /// list means the options are admissible.
  pub fn validate(&self) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(value) = self.get("memory_retry_multiplier") {
      match value.as_f64() {
        Some(m) if m > 1.0 => {}
        _ => errors.push(format!(
          "memory_retry_multiplier must be a number > 1, got {}",
          value
        )),
      }
    }

    for key in ["read_from_cache", "write_to_cache", "continue_on_failure"] {
      if let Some(value) = self.get(key) {
        if !value.is_boolean() {
          errors.push(format!("{} must be a boolean, got {}", key, value));
        }
      }
    }

    if let Some(value) = self.get("workflow_root") {
      if !value.is_string() {
        errors.push(format!("workflow_root must be a string path, got {}", value));
      }
    }

    errors
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn options(json: serde_json::Value) -> WorkflowOptions {
    serde_json::from_value(json).unwrap()
  }

  #[test]
  fn test_cache_options_default_on() {
    let opts = WorkflowOptions::default();
    assert!(opts.read_from_cache());
    assert!(opts.write_to_cache());
  }

  #[test]
  fn test_memory_retry_keys_default() {
    let opts = WorkflowOptions::default();
    assert_eq!(opts.memory_retry_keys(), vec!["OutOfMemory", "Killed"]);
  }

  #[test]
  fn test_invalid_multiplier_rejected() {
    let opts = options(json!({"memory_retry_multiplier": 0.5}));
    assert_eq!(opts.validate().len(), 1);

    let opts = options(json!({"memory_retry_multiplier": 1.5}));
    assert!(opts.validate().is_empty());
  }

  #[test]
  fn test_unrecognized_keys_kept() {
    let opts = options(json!({"local_auth_token": "abc"}));
    assert_eq!(opts.get("local_auth_token"), Some(&json!("abc")));
    assert!(opts.validate().is_empty());
  }
}
