use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use rill_core::{RuntimeAttributes, TaskDef, Value};
use rill_io::{HashKind, PathIo};

use crate::CacheError;

/// Deterministic content fingerprint of one unit of work.
///
/// Two calls with equal fingerprints would produce type-equivalent outputs,
/// so the second may reuse the first's results. Hashed material:
/// 1. the task body: command template, declared outputs, declared runtime;
/// 2. resolved input values, with files replaced by their content digests
///    and everything else hashed structurally;
/// 3. the docker image identity, which is stable across tag mutation (the
///    digest when the image is pinned, the literal reference otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Wrap an already-computed fingerprint, e.g. one read back from the
  /// store.
  pub fn from_hex(hex: impl Into<String>) -> Self {
    Self(hex.into())
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Compute the fingerprint for a task invocation with resolved inputs.
///
/// File inputs are digested by content through the IO layer, so a renamed
/// copy of the same bytes still hits and an edited file misses.
pub async fn fingerprint(
  task: &TaskDef,
  inputs: &BTreeMap<String, Value>,
  attributes: &RuntimeAttributes,
  io: &PathIo,
) -> Result<Fingerprint, CacheError> {
  let mut digested_inputs = BTreeMap::new();
  for (name, value) in inputs {
    digested_inputs.insert(name.clone(), digest_value(value, io).await?);
  }

  let canonical = serde_json::json!({
    "command": task.command,
    "outputs": task.outputs,
    "runtime": task.runtime,
    "inputs": digested_inputs,
    "image": attributes.docker_identity,
  });

  let mut hasher = Sha256::new();
  // BTreeMap-backed structures serialize with sorted keys, so this string
  // is canonical for the material above.
  hasher.update(canonical.to_string().as_bytes());
  Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

/// Structural stand-in for a value with file contents reduced to digests.
async fn digest_value(value: &Value, io: &PathIo) -> Result<serde_json::Value, CacheError> {
  Ok(match value {
    Value::File(path) => {
      let digest = io.checksum(path, HashKind::Sha256).await?;
      serde_json::json!({ "file_sha256": digest })
    }
    Value::Array(items) => {
      let mut digested = Vec::with_capacity(items.len());
      for item in items {
        digested.push(Box::pin(digest_value(item, io)).await?);
      }
      serde_json::Value::Array(digested)
    }
    other => serde_json::to_value(other).expect("value serialization is infallible"),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use rill_core::{RuntimeDecl, ValueType};
  use rill_io::MemoryStore;
  use std::sync::Arc;

  fn test_io() -> PathIo {
    let mut io = PathIo::new();
    io.register("mem", Arc::new(MemoryStore::new()));
    io
  }

  fn test_task(command: &str) -> TaskDef {
    TaskDef {
      command: command.to_string(),
      inputs: [("x".to_string(), ValueType::Str)].into_iter().collect(),
      outputs: vec![],
      runtime: RuntimeDecl::default(),
    }
  }

  #[tokio::test]
  async fn test_same_material_same_fingerprint() {
    let io = test_io();
    let task = test_task("echo {{ x }}");
    let inputs: BTreeMap<String, Value> =
      [("x".to_string(), Value::Str("hi".to_string()))].into_iter().collect();
    let attrs = RuntimeAttributes::default();

    let a = fingerprint(&task, &inputs, &attrs, &io).await.unwrap();
    let b = fingerprint(&task, &inputs, &attrs, &io).await.unwrap();
    assert_eq!(a, b);
  }

  #[tokio::test]
  async fn test_command_change_changes_fingerprint() {
    let io = test_io();
    let inputs: BTreeMap<String, Value> = BTreeMap::new();
    let attrs = RuntimeAttributes::default();

    let a = fingerprint(&test_task("echo 1"), &inputs, &attrs, &io).await.unwrap();
    let b = fingerprint(&test_task("echo 2"), &inputs, &attrs, &io).await.unwrap();
    assert_ne!(a, b);
  }

  #[tokio::test]
  async fn test_file_hashed_by_content_not_name() {
    let io = test_io();
    io.write_all("mem://data/a.txt", Bytes::from("same bytes"))
      .await
      .unwrap();
    io.write_all("mem://data/b.txt", Bytes::from("same bytes"))
      .await
      .unwrap();

    let task = test_task("wc -l {{ f }}");
    let attrs = RuntimeAttributes::default();
    let with = |path: &str| -> BTreeMap<String, Value> {
      [("f".to_string(), Value::File(path.to_string()))].into_iter().collect()
    };

    let a = fingerprint(&task, &with("mem://data/a.txt"), &attrs, &io).await.unwrap();
    let b = fingerprint(&task, &with("mem://data/b.txt"), &attrs, &io).await.unwrap();
    assert_eq!(a, b, "renamed copy of the same content must hit");

    io.write_all("mem://data/b.txt", Bytes::from("edited"))
      .await
      .unwrap();
    let c = fingerprint(&task, &with("mem://data/b.txt"), &attrs, &io).await.unwrap();
    assert_ne!(a, c, "edited content must miss");
  }

  #[tokio::test]
  async fn test_image_identity_participates() {
    let io = test_io();
    let task = test_task("echo hi");
    let inputs = BTreeMap::new();

    let tagged = RuntimeAttributes {
      docker_identity: Some("ubuntu:22.04".to_string()),
      ..RuntimeAttributes::default()
    };
    let pinned = RuntimeAttributes {
      docker_identity: Some("sha256:deadbeef".to_string()),
      ..RuntimeAttributes::default()
    };

    let a = fingerprint(&task, &inputs, &tagged, &io).await.unwrap();
    let b = fingerprint(&task, &inputs, &pinned, &io).await.unwrap();
    assert_ne!(a, b);
  }
}
