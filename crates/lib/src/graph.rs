//! Stage dependency graph.
//!
//! Nodes are stages; an edge `a -> b` means `b` reads a frozen artifact of `a`
//! (a compose layer) or was declared to run `after` it. The graph is checked
//! for unknown references and cycles on construction and then yields parallel
//! execution waves.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::plan::{Plan, StageName};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("stage '{stage}' depends on unknown stage '{missing}'")]
  UnknownStage { stage: StageName, missing: StageName },

  #[error("dependency cycle detected involving stage '{0}'")]
  Cycle(StageName),
}

pub struct StageGraph {
  graph: DiGraph<StageName, ()>,
  nodes: HashMap<StageName, NodeIndex>,
}

impl StageGraph {
  /// Build the graph for every stage in `plan`.
  pub fn from_plan(plan: &Plan) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for stage in &plan.stages {
      let idx = graph.add_node(stage.name.clone());
      nodes.insert(stage.name.clone(), idx);
    }

    for stage in &plan.stages {
      let dependent = nodes[&stage.name];
      let mut linked = HashSet::new();
      for upstream in stage.after.iter().chain(stage.layer_sources()) {
        let Some(&dep) = nodes.get(upstream) else {
          return Err(GraphError::UnknownStage {
            stage: stage.name.clone(),
            missing: upstream.clone(),
          });
        };
        if linked.insert(dep) {
          graph.add_edge(dep, dependent, ());
        }
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    toposort(&self.graph, None)
      .map(|_| ())
      .map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].clone()))
  }

  /// Stage names in an order where dependencies come first.
  pub fn topological_order(&self) -> Result<Vec<StageName>, GraphError> {
    let sorted = toposort(&self.graph, None).map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].clone()))?;
    Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
  }

  /// Group stages into waves. Every stage's dependencies live in earlier waves,
  /// so the stages of one wave can run concurrently. Names within a wave are
  /// sorted.
  pub fn waves(&self) -> Result<Vec<Vec<StageName>>, GraphError> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[*idx] == 0).copied().collect();

      if ready.is_empty() {
        let stuck = remaining.iter().map(|idx| &self.graph[*idx]).min().cloned();
        return Err(GraphError::Cycle(stuck.unwrap_or_else(|| StageName::from("?"))));
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&next) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<StageName> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }

  /// Direct upstream stages of `name`, sorted.
  pub fn dependencies(&self, name: &StageName) -> Vec<StageName> {
    self.neighbors(name, Direction::Incoming)
  }

  /// Direct downstream stages of `name`, sorted.
  pub fn dependents(&self, name: &StageName) -> Vec<StageName> {
    self.neighbors(name, Direction::Outgoing)
  }

  /// Every stage that transitively depends on `name`.
  pub fn transitive_dependents(&self, name: &StageName) -> Vec<StageName> {
    let mut seen = BTreeSet::new();
    let mut queue = self.dependents(name);
    while let Some(next) = queue.pop() {
      if seen.insert(next.clone()) {
        queue.extend(self.dependents(&next));
      }
    }
    seen.into_iter().collect()
  }

  fn neighbors(&self, name: &StageName, direction: Direction) -> Vec<StageName> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let mut out: Vec<StageName> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }
}
