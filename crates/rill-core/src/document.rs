use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attributes::RuntimeDecl;
use crate::value::{Value, ValueType};

/// A typed, executable workflow document.
///
/// Parsing and type-checking happen in the submission front end; by the time
/// a document reaches the engine it deserializes directly into task bodies
/// and graph nodes with resolved references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
  pub name: String,
  /// Task bodies, keyed by fully qualified task name.
  pub tasks: BTreeMap<String, TaskDef>,
  /// Graph nodes in document order.
  pub nodes: Vec<GraphNode>,
}

impl WorkflowDocument {
  pub fn get_task(&self, name: &str) -> Option<&TaskDef> {
    self.tasks.get(name)
  }

  pub fn get_node(&self, id: &str) -> Option<&GraphNode> {
    self.nodes.iter().find(|n| n.id() == id)
  }
}

/// A task body: command template, declared inputs and outputs, runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
  /// Command template rendered against resolved inputs before dispatch.
  pub command: String,
  /// Declared input names and types.
  #[serde(default)]
  pub inputs: BTreeMap<String, ValueType>,
  /// Declared outputs, evaluated against the working directory on success.
  #[serde(default)]
  pub outputs: Vec<OutputDecl>,
  #[serde(default)]
  pub runtime: RuntimeDecl,
}

/// One declared task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDecl {
  pub name: String,
  pub value_type: ValueType,
  /// Template rendered against the call's inputs; for file outputs the
  /// result is a path relative to the working directory (`stdout` names the
  /// stdout detritus file, which lives there).
  pub expression: String,
}

/// A node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphNode {
  Call(CallNode),
  Scatter(ScatterNode),
  Conditional(ConditionalNode),
  Output(OutputNode),
}

impl GraphNode {
  pub fn id(&self) -> &str {
    match self {
      GraphNode::Call(n) => &n.id,
      GraphNode::Scatter(n) => &n.id,
      GraphNode::Conditional(n) => &n.id,
      GraphNode::Output(n) => &n.id,
    }
  }

  /// Node ids this node's expressions reference.
  pub fn dependencies(&self) -> Vec<&str> {
    let mut deps = Vec::new();
    match self {
      GraphNode::Call(n) => {
        for expr in n.inputs.values() {
          expr.collect_node_refs(&mut deps);
        }
      }
      GraphNode::Scatter(n) => {
        n.collection.collect_node_refs(&mut deps);
        for expr in n.call.inputs.values() {
          expr.collect_node_refs(&mut deps);
        }
      }
      GraphNode::Conditional(n) => {
        n.condition.collect_node_refs(&mut deps);
        for expr in n.call.inputs.values() {
          expr.collect_node_refs(&mut deps);
        }
      }
      GraphNode::Output(n) => n.expression.collect_node_refs(&mut deps),
    }
    deps.sort_unstable();
    deps.dedup();
    deps
  }
}

/// A task invocation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
  pub id: String,
  /// Fully qualified task name into [`WorkflowDocument::tasks`].
  pub task: String,
  /// Input expressions, keyed by declared input name.
  #[serde(default)]
  pub inputs: BTreeMap<String, InputExpr>,
}

/// A scatter node: the collection expression is evaluated to a sequence and
/// the inner call is expanded into one shard per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterNode {
  pub id: String,
  pub collection: InputExpr,
  /// Name the scatter item is bound to inside shard input expressions.
  pub item: String,
  pub call: CallNode,
}

/// A conditional node: the inner call runs only when the condition is truthy;
/// otherwise the node completes with null outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalNode {
  pub id: String,
  pub condition: InputExpr,
  pub call: CallNode,
}

/// A workflow output expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputNode {
  pub id: String,
  pub expression: InputExpr,
}

/// An input expression, resolved by the engine when the node becomes ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum InputExpr {
  /// A literal typed value.
  Literal { value: Value },
  /// A workflow-level input by name.
  WorkflowInput { name: String },
  /// An output of another node.
  NodeOutput { node: String, output: String },
  /// The current scatter item (valid only inside scatter bodies).
  ScatterItem,
  /// A file-producing expression: the inner array is written to a file, one
  /// element per line, before dispatch, and the call receives the file.
  WriteLines { lines: Box<InputExpr> },
}

impl InputExpr {
  fn collect_node_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
    match self {
      InputExpr::NodeOutput { node, .. } => refs.push(node),
      InputExpr::WriteLines { lines } => lines.collect_node_refs(refs),
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dependencies_deduplicated_and_sorted() {
    let node = GraphNode::Call(CallNode {
      id: "c".to_string(),
      task: "main.t".to_string(),
      inputs: [
        (
          "x".to_string(),
          InputExpr::NodeOutput {
            node: "b".to_string(),
            output: "out".to_string(),
          },
        ),
        (
          "y".to_string(),
          InputExpr::NodeOutput {
            node: "a".to_string(),
            output: "out".to_string(),
          },
        ),
        (
          "z".to_string(),
          InputExpr::NodeOutput {
            node: "a".to_string(),
            output: "other".to_string(),
          },
        ),
      ]
      .into_iter()
      .collect(),
    });
    assert_eq!(node.dependencies(), vec!["a", "b"]);
  }

  #[test]
  fn test_write_lines_dependency_is_transitive() {
    let node = GraphNode::Call(CallNode {
      id: "c".to_string(),
      task: "main.t".to_string(),
      inputs: [(
        "manifest".to_string(),
        InputExpr::WriteLines {
          lines: Box::new(InputExpr::NodeOutput {
            node: "gather".to_string(),
            output: "names".to_string(),
          }),
        },
      )]
      .into_iter()
      .collect(),
    });
    assert_eq!(node.dependencies(), vec!["gather"]);
  }
}
