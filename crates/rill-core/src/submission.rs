use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::options::WorkflowOptions;

/// Where the workflow document comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSource {
  /// The document text inline.
  Inline(String),
  /// A resolvable URL the front end fetches the document from.
  Url(String),
}

/// A workflow submission as handed over by the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSubmission {
  pub source: WorkflowSource,
  /// Base path for execution products; falls back to the `workflow_root`
  /// option, then to the engine default.
  #[serde(default)]
  pub workflow_root: Option<PathBuf>,
  /// Workflow-level inputs as raw JSON, coerced against declared types when
  /// the graph is built.
  #[serde(default)]
  pub inputs: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub options: WorkflowOptions,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
  /// Optional archive of workflow imports, opaque to the engine.
  #[serde(default)]
  pub dependencies: Option<String>,
}
