use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Return-code acceptance policy for a call.
///
/// Mirrors the `continue_on_return_code` runtime key: `false` accepts only
/// zero, `true` accepts anything, otherwise an explicit set or an inclusive
/// range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCodePolicy {
  OnlyZero,
  Any,
  Codes(Vec<i32>),
  Range { min: i32, max: i32 },
}

impl ReturnCodePolicy {
  pub fn accepts(&self, rc: i32) -> bool {
    match self {
      Self::OnlyZero => rc == 0,
      Self::Any => true,
      Self::Codes(codes) => codes.contains(&rc),
      Self::Range { min, max } => rc >= *min && rc <= *max,
    }
  }

  /// Parse the JSON form used in task runtime declarations: a boolean, a
  /// single code, or an array of codes.
  pub fn from_json(json: &serde_json::Value) -> Option<Self> {
    match json {
      serde_json::Value::Bool(true) => Some(Self::Any),
      serde_json::Value::Bool(false) => Some(Self::OnlyZero),
      serde_json::Value::Number(n) => n.as_i64().map(|c| Self::Codes(vec![c as i32])),
      serde_json::Value::Array(items) => {
        let codes = items
          .iter()
          .filter_map(|v| v.as_i64().map(|c| c as i32))
          .collect::<Vec<_>>();
        (codes.len() == items.len()).then_some(Self::Codes(codes))
      }
      _ => None,
    }
  }
}

impl Default for ReturnCodePolicy {
  fn default() -> Self {
    Self::OnlyZero
  }
}

/// Runtime section as declared in a task body, before resolution.
///
/// Values are raw JSON so user pass-through keys survive untouched; the
/// engine resolves the keys it understands into [`RuntimeAttributes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDecl(pub BTreeMap<String, serde_json::Value>);

impl RuntimeDecl {
  pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
    self.0.get(key)
  }
}

/// Resolved runtime attributes for one call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeAttributes {
  /// Container image, when declared.
  pub docker: Option<String>,
  /// Image identity stable across tag mutation: the repo digest when the
  /// declaration carries one (`image@sha256:...`), otherwise the literal tag.
  pub docker_identity: Option<String>,
  pub cpu: u32,
  pub memory_mb: u64,
  pub disk_mb: u64,
  /// Remaining preemption budget: attempts dispatched preemptible before the
  /// flag is cleared. Zero dispatches non-preemptible from the start.
  pub preemptible: u32,
  /// Bounded retry budget for retryable failures.
  pub max_retries: u32,
  pub continue_on_return_code: ReturnCodePolicy,
  pub fail_on_stderr: bool,
  /// User-defined pass-through keys the engine does not interpret.
  pub extra: BTreeMap<String, String>,
}

impl Default for RuntimeAttributes {
  fn default() -> Self {
    Self {
      docker: None,
      docker_identity: None,
      cpu: 1,
      memory_mb: 2048,
      disk_mb: 10_240,
      preemptible: 0,
      max_retries: 0,
      continue_on_return_code: ReturnCodePolicy::OnlyZero,
      fail_on_stderr: false,
      extra: BTreeMap::new(),
    }
  }
}

impl RuntimeAttributes {
  /// Resolve declared runtime keys into attributes. Unknown keys land in
  /// `extra` as pass-through.
  pub fn resolve(decl: &RuntimeDecl, preemptible_default: u32) -> Self {
    let mut attrs = Self {
      preemptible: preemptible_default,
      ..Self::default()
    };

    for (key, value) in &decl.0 {
      match key.as_str() {
        "docker" => {
          let image = value.as_str().map(str::to_string);
          attrs.docker_identity = image.as_deref().map(image_identity);
          attrs.docker = image;
        }
        "cpu" => {
          if let Some(cpu) = value.as_u64() {
            attrs.cpu = cpu as u32;
          }
        }
        "memory_mb" => {
          if let Some(mb) = value.as_u64() {
            attrs.memory_mb = mb;
          }
        }
        "disk_mb" => {
          if let Some(mb) = value.as_u64() {
            attrs.disk_mb = mb;
          }
        }
        "preemptible" => {
          if let Some(p) = value.as_u64() {
            attrs.preemptible = p as u32;
          }
        }
        "max_retries" => {
          if let Some(n) = value.as_u64() {
            attrs.max_retries = n as u32;
          }
        }
        "continue_on_return_code" => {
          if let Some(policy) = ReturnCodePolicy::from_json(value) {
            attrs.continue_on_return_code = policy;
          }
        }
        "fail_on_stderr" => {
          if let Some(b) = value.as_bool() {
            attrs.fail_on_stderr = b;
          }
        }
        other => {
          let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
          };
          attrs.extra.insert(other.to_string(), rendered);
        }
      }
    }

    attrs
  }

  /// The next attempt's attributes after a memory-retry: memory multiplied,
  /// everything else carried over.
  pub fn with_memory_multiplied(&self, multiplier: f64) -> Self {
    Self {
      memory_mb: (self.memory_mb as f64 * multiplier).ceil() as u64,
      ..self.clone()
    }
  }

  /// The next attempt's attributes once the preemption budget is exhausted.
  pub fn non_preemptible(&self) -> Self {
    Self {
      preemptible: 0,
      ..self.clone()
    }
  }
}

/// Extract the tag-stable identity of a docker image reference: the digest
/// when pinned (`repo@sha256:...`), otherwise the reference itself.
fn image_identity(image: &str) -> String {
  match image.split_once('@') {
    Some((_, digest)) => digest.to_string(),
    None => image.to_string(),
  }
}
