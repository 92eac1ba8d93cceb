/// Errors from building or interpreting the data model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
  /// Two graph nodes share an id.
  #[error("duplicate node id '{node_id}'")]
  DuplicateNode { node_id: String },

  /// An expression references a node that does not exist.
  #[error("node '{node_id}' references unknown node '{referenced}'")]
  UnknownNodeRef { node_id: String, referenced: String },

  /// The dependency graph contains a cycle.
  #[error("task graph contains a cycle through: {nodes}")]
  CyclicGraph { nodes: String },

  /// A value did not match its declared type.
  #[error("expected {expected}, found {found}")]
  TypeMismatch { expected: String, found: String },
}
