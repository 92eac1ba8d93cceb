use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::document::WorkflowDocument;
use crate::error::ModelError;

/// Dependency structure of a workflow document, for traversal and analysis.
///
/// Built once at workflow start; edges are the data dependencies derived from
/// node input expressions. Deterministic given the document: adjacency lists
/// are kept sorted so topological order never depends on hash iteration.
#[derive(Debug, Clone)]
pub struct TaskGraph {
  /// node_id -> downstream node_ids.
  adjacency: BTreeMap<String, Vec<String>>,
  /// node_id -> upstream node_ids.
  reverse_adjacency: BTreeMap<String, Vec<String>>,
  /// Nodes with no upstream dependencies.
  entry_points: Vec<String>,
  /// Deterministic topological order.
  topo_order: Vec<String>,
}

impl TaskGraph {
  /// Build and validate the graph: node ids unique, referenced nodes and
  /// tasks exist, no cycles.
  pub fn build(document: &WorkflowDocument) -> Result<Self, ModelError> {
    let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut reverse_adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let mut ids = BTreeSet::new();
    for node in &document.nodes {
      if !ids.insert(node.id().to_string()) {
        return Err(ModelError::DuplicateNode {
          node_id: node.id().to_string(),
        });
      }
      adjacency.entry(node.id().to_string()).or_default();
      reverse_adjacency.entry(node.id().to_string()).or_default();
    }

    for node in &document.nodes {
      for dep in node.dependencies() {
        if !ids.contains(dep) {
          return Err(ModelError::UnknownNodeRef {
            node_id: node.id().to_string(),
            referenced: dep.to_string(),
          });
        }
        adjacency
          .get_mut(dep)
          .expect("dependency id checked above")
          .push(node.id().to_string());
        reverse_adjacency
          .get_mut(node.id())
          .expect("node id inserted above")
          .push(dep.to_string());
      }
    }

    for targets in adjacency.values_mut() {
      targets.sort_unstable();
      targets.dedup();
    }
    for sources in reverse_adjacency.values_mut() {
      sources.sort_unstable();
      sources.dedup();
    }

    let entry_points: Vec<String> = reverse_adjacency
      .iter()
      .filter(|(_, upstream)| upstream.is_empty())
      .map(|(id, _)| id.clone())
      .collect();

    let topo_order = Self::topological_order(&adjacency, &reverse_adjacency)?;

    Ok(Self {
      adjacency,
      reverse_adjacency,
      entry_points,
      topo_order,
    })
  }

  /// Kahn's algorithm over sorted frontiers, so the order is a pure function
  /// of the document.
  fn topological_order(
    adjacency: &BTreeMap<String, Vec<String>>,
    reverse_adjacency: &BTreeMap<String, Vec<String>>,
  ) -> Result<Vec<String>, ModelError> {
    let mut in_degree: HashMap<&str, usize> = reverse_adjacency
      .iter()
      .map(|(id, upstream)| (id.as_str(), upstream.len()))
      .collect();

    let mut frontier: BTreeSet<&str> = in_degree
      .iter()
      .filter(|(_, d)| **d == 0)
      .map(|(id, _)| *id)
      .collect();

    let mut order = Vec::with_capacity(adjacency.len());
    while let Some(id) = frontier.pop_first() {
      order.push(id.to_string());
      for downstream in adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]) {
        let degree = in_degree
          .get_mut(downstream.as_str())
          .expect("all nodes have an in-degree entry");
        *degree -= 1;
        if *degree == 0 {
          frontier.insert(downstream);
        }
      }
    }

    if order.len() != adjacency.len() {
      let cyclic = in_degree
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(id, _)| id.to_string())
        .collect::<BTreeSet<_>>();
      return Err(ModelError::CyclicGraph {
        nodes: cyclic.into_iter().collect::<Vec<_>>().join(", "),
      });
    }

    Ok(order)
  }

  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  pub fn topo_order(&self) -> &[String] {
    &self.topo_order
  }

  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn node_ids(&self) -> impl Iterator<Item = &str> {
    self.adjacency.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.adjacency.len()
  }

  pub fn is_empty(&self) -> bool {
    self.adjacency.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::document::{CallNode, GraphNode, InputExpr, OutputNode};
  use std::collections::BTreeMap;

  fn call(id: &str, deps: &[(&str, &str)]) -> GraphNode {
    GraphNode::Call(CallNode {
      id: id.to_string(),
      task: "main.t".to_string(),
      inputs: deps
        .iter()
        .enumerate()
        .map(|(i, (node, output))| {
          (
            format!("in{}", i),
            InputExpr::NodeOutput {
              node: node.to_string(),
              output: output.to_string(),
            },
          )
        })
        .collect(),
    })
  }

  fn document(nodes: Vec<GraphNode>) -> WorkflowDocument {
    WorkflowDocument {
      name: "test".to_string(),
      tasks: BTreeMap::new(),
      nodes,
    }
  }

  #[test]
  fn test_topological_order_is_deterministic() {
    let doc = document(vec![
      call("b", &[("a", "out")]),
      call("a", &[]),
      call("c", &[("a", "out")]),
      call("d", &[("b", "out"), ("c", "out")]),
    ]);
    let graph = TaskGraph::build(&doc).unwrap();
    assert_eq!(graph.topo_order(), &["a", "b", "c", "d"]);
    assert_eq!(graph.entry_points(), &["a"]);
  }

  #[test]
  fn test_cycle_rejected() {
    let doc = document(vec![call("a", &[("b", "out")]), call("b", &[("a", "out")])]);
    let err = TaskGraph::build(&doc).unwrap_err();
    assert!(matches!(err, ModelError::CyclicGraph { .. }));
  }

  #[test]
  fn test_unknown_reference_rejected() {
    let doc = document(vec![call("a", &[("ghost", "out")])]);
    let err = TaskGraph::build(&doc).unwrap_err();
    assert!(matches!(err, ModelError::UnknownNodeRef { .. }));
  }

  #[test]
  fn test_duplicate_node_rejected() {
    let doc = document(vec![call("a", &[]), call("a", &[])]);
    let err = TaskGraph::build(&doc).unwrap_err();
    assert!(matches!(err, ModelError::DuplicateNode { .. }));
  }

  #[test]
  fn test_output_node_depends_on_call() {
    let mut doc = document(vec![call("a", &[])]);
    doc.nodes.push(GraphNode::Output(OutputNode {
      id: "out".to_string(),
      expression: InputExpr::NodeOutput {
        node: "a".to_string(),
        output: "result".to_string(),
      },
    }));
    let graph = TaskGraph::build(&doc).unwrap();
    assert_eq!(graph.upstream("out"), &["a"]);
    assert_eq!(graph.downstream("a"), &["out"]);
  }
}
