//! Bipartite task/artifact dependency DAG.
//!
//! Nodes are either tasks (carrying the full record) or artifacts (a
//! path-like key). Edges run from a task's dependencies, its template name,
//! and its declaration file to the task, and from the task to each of its
//! outputs. The graph is used to:
//! - validate dependency integrity (cycles, conflicting writers),
//! - walk tasks in deterministic topological order,
//! - propagate effective priorities from sinks to sources.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use anyhow::{Context, Result, bail};

use crate::error::BuildError;
use crate::tasks::TaskRecord;

#[derive(Debug)]
pub enum Node {
    Task(TaskNode),
    Artifact,
}

#[derive(Debug)]
pub struct TaskNode {
    pub record: TaskRecord,
    pub effective_priority: f64,
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    successors: BTreeMap<String, BTreeSet<String>>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

impl Graph {
    /// Build the graph from loaded task records. The graph takes ownership
    /// of the records for the build's lifetime.
    pub fn from_tasks(tasks: BTreeMap<String, TaskRecord>) -> Result<Self> {
        let mut graph = Self::default();
        let mut producers: BTreeMap<String, String> = BTreeMap::new();

        for (id, record) in &tasks {
            for target in &record.produces {
                if let Some(first) = producers.get(target) {
                    return Err(BuildError::ConflictingProducers {
                        first: first.clone(),
                        second: id.clone(),
                        target: target.clone(),
                    }
                    .into());
                }
                producers.insert(target.clone(), id.clone());
            }
        }

        for (id, record) in &tasks {
            for dep in &record.depends_on {
                graph.add_edge(dep.clone(), id.clone());
            }
            graph.add_edge(record.template.clone(), id.clone());
            graph.add_edge(record.config_path.display().to_string(), id.clone());
            for target in &record.produces {
                graph.add_edge(id.clone(), target.clone());
            }
        }

        for (id, record) in tasks {
            let effective_priority = record.priority;
            graph.nodes.insert(
                id,
                Node::Task(TaskNode {
                    record,
                    effective_priority,
                }),
            );
        }

        graph.ensure_acyclic()?;
        Ok(graph)
    }

    fn add_edge(&mut self, from: String, to: String) {
        self.nodes.entry(from.clone()).or_insert(Node::Artifact);
        self.nodes.entry(to.clone()).or_insert(Node::Artifact);
        self.successors
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.predecessors.entry(to).or_default().insert(from);
    }

    pub fn is_task(&self, id: &str) -> bool {
        matches!(self.nodes.get(id), Some(Node::Task(_)))
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        match self.nodes.get(id) {
            Some(Node::Task(node)) => Some(node),
            _ => None,
        }
    }

    #[allow(dead_code)]
    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|(id, node)| match node {
            Node::Task(_) => Some(id.as_str()),
            Node::Artifact => None,
        })
    }

    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.predecessors
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn successors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.successors
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Dependencies and targets of a node: predecessors then successors.
    pub fn neighbors(&self, id: &str) -> Vec<String> {
        let mut neighbors: Vec<String> = self.predecessors(id).map(str::to_string).collect();
        neighbors.extend(self.successors(id).map(str::to_string));
        neighbors
    }

    /// Task nodes directly upstream of `id`: producers of its dependency
    /// artifacts.
    pub fn upstream_tasks(&self, id: &str) -> BTreeSet<String> {
        let mut upstream = BTreeSet::new();
        for pred in self.predecessors(id) {
            if self.is_task(pred) {
                upstream.insert(pred.to_string());
            }
            for producer in self.predecessors(pred) {
                if self.is_task(producer) {
                    upstream.insert(producer.to_string());
                }
            }
        }
        upstream
    }

    /// Task nodes one artifact hop downstream of `id`: consumers of any of
    /// its outputs.
    pub fn downstream_tasks(&self, id: &str) -> BTreeSet<String> {
        let mut downstream = BTreeSet::new();
        for succ in self.successors(id) {
            for consumer in self.successors(succ) {
                if self.is_task(consumer) {
                    downstream.insert(consumer.to_string());
                }
            }
        }
        downstream
    }

    /// All task nodes reachable from `id`.
    pub fn descendant_tasks(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self.successors(id).map(str::to_string).collect();
        let mut descendants = BTreeSet::new();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if self.is_task(&node) {
                descendants.insert(node.clone());
            }
            queue.extend(self.successors(&node).map(str::to_string));
        }
        descendants
    }

    /// Deterministic topological order over all nodes.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| {
                (
                    id.as_str(),
                    self.predecessors.get(id).map_or(0, BTreeSet::len),
                )
            })
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter_map(|(id, degree)| (*degree == 0).then_some(*id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for succ in self.successors(id) {
                let degree = indegree
                    .get_mut(succ)
                    .context("successor missing from indegree map")?;
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if order.len() != self.nodes.len() {
            bail!("dependency graph contains a cycle");
        }
        Ok(order)
    }

    /// Propagate effective priorities from sinks to sources:
    /// `effective(t) = declared(t) + discount × Σ effective(consumers)`
    /// where the consumers are the task nodes one artifact hop downstream.
    pub fn assign_priorities(&mut self, discount_factor: f64) -> Result<()> {
        let order = self.topological_sort()?;
        let mut effective: BTreeMap<String, f64> = BTreeMap::new();

        for id in order.iter().rev() {
            let Some(node) = self.task(id) else { continue };
            let downstream_sum: f64 = self
                .downstream_tasks(id)
                .iter()
                .filter_map(|consumer| effective.get(consumer))
                .sum();
            effective.insert(
                id.clone(),
                node.record.priority + discount_factor * downstream_sum,
            );
        }

        for (id, priority) in effective {
            if let Some(Node::Task(node)) = self.nodes.get_mut(&id) {
                node.effective_priority = priority;
            }
        }
        Ok(())
    }

    fn ensure_acyclic(&self) -> Result<()> {
        let mut states: HashMap<&str, VisitState> = HashMap::new();
        let mut path = Vec::new();
        let mut path_index: HashMap<&str, usize> = HashMap::new();

        for id in self.nodes.keys() {
            if states.contains_key(id.as_str()) {
                continue;
            }
            if let Some(cycle) = self.find_cycle(id, &mut states, &mut path, &mut path_index) {
                return Err(BuildError::Cycle { nodes: cycle }.into());
            }
        }
        Ok(())
    }

    fn find_cycle<'a>(
        &'a self,
        id: &'a str,
        states: &mut HashMap<&'a str, VisitState>,
        path: &mut Vec<&'a str>,
        path_index: &mut HashMap<&'a str, usize>,
    ) -> Option<Vec<String>> {
        states.insert(id, VisitState::Visiting);
        path_index.insert(id, path.len());
        path.push(id);

        for succ in self.successors(id) {
            match states.get(succ).copied() {
                None => {
                    if let Some(cycle) = self.find_cycle(succ, states, path, path_index) {
                        return Some(cycle);
                    }
                }
                Some(VisitState::Visiting) => {
                    let start = path_index.get(succ).copied().unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|node| node.to_string()).collect();
                    cycle.push(succ.to_string());
                    return Some(cycle);
                }
                Some(VisitState::Visited) => {}
            }
        }

        path.pop();
        path_index.remove(id);
        states.insert(id, VisitState::Visited);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn mk_task(id: &str, deps: &[&str], produces: &[&str], priority: f64) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            template: "task.py".to_string(),
            depends_on: deps.iter().map(|dep| dep.to_string()).collect(),
            produces: produces.iter().map(|target| target.to_string()).collect(),
            config_path: PathBuf::from("src/tasks.yaml"),
            run_always: false,
            priority,
            parameters: BTreeMap::new(),
        }
    }

    fn graph_of(records: Vec<TaskRecord>) -> Result<Graph> {
        let tasks = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Graph::from_tasks(tasks)
    }

    #[test]
    fn edges_connect_dependencies_template_config_and_outputs() {
        let graph = graph_of(vec![mk_task("task-1", &["data.csv"], &["out.txt"], 0.0)]).unwrap();

        let preds: Vec<&str> = graph.predecessors("task-1").collect();
        assert_eq!(preds, vec!["data.csv", "src/tasks.yaml", "task.py"]);
        let succs: Vec<&str> = graph.successors("task-1").collect();
        assert_eq!(succs, vec!["out.txt"]);

        assert!(graph.is_task("task-1"));
        assert!(!graph.is_task("data.csv"));
        assert!(!graph.is_task("out.txt"));
    }

    #[test]
    fn conflicting_producers_are_rejected() {
        let err = graph_of(vec![
            mk_task("task-1", &[], &["out.txt"], 0.0),
            mk_task("task-2", &[], &["out.txt"], 0.0),
        ])
        .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("task-1"));
        assert!(rendered.contains("task-2"));
        assert!(rendered.contains("out.txt"));
    }

    #[test]
    fn cycles_are_rejected_with_a_named_path() {
        let err = graph_of(vec![
            mk_task("task-1", &["out-2.txt"], &["out-1.txt"], 0.0),
            mk_task("task-2", &["out-1.txt"], &["out-2.txt"], 0.0),
        ])
        .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("dependency cycle detected"));
        assert!(rendered.contains("task-1"));
        assert!(rendered.contains("task-2"));
    }

    #[test]
    fn topological_sort_puts_producers_before_consumers() {
        let graph = graph_of(vec![
            mk_task("task-1", &[], &["out-1.txt"], 0.0),
            mk_task("task-2", &["out-1.txt"], &["out-2.txt"], 0.0),
            mk_task("task-3", &["out-2.txt"], &["out-3.txt"], 0.0),
        ])
        .unwrap();

        let order = graph.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|node| node == id).unwrap();
        assert!(pos("task-1") < pos("out-1.txt"));
        assert!(pos("out-1.txt") < pos("task-2"));
        assert!(pos("task-2") < pos("task-3"));
    }

    #[test]
    fn upstream_and_downstream_cross_one_artifact_hop() {
        let graph = graph_of(vec![
            mk_task("task-1", &[], &["out-1.txt"], 0.0),
            mk_task("task-2", &["out-1.txt"], &["out-2.txt"], 0.0),
        ])
        .unwrap();

        assert_eq!(
            graph.upstream_tasks("task-2"),
            BTreeSet::from(["task-1".to_string()])
        );
        assert_eq!(
            graph.downstream_tasks("task-1"),
            BTreeSet::from(["task-2".to_string()])
        );
        assert!(graph.upstream_tasks("task-1").is_empty());
    }

    #[test]
    fn descendant_tasks_are_transitive() {
        let graph = graph_of(vec![
            mk_task("task-1", &[], &["out-1.txt"], 0.0),
            mk_task("task-2", &["out-1.txt"], &["out-2.txt"], 0.0),
            mk_task("task-3", &["out-2.txt"], &["out-3.txt"], 0.0),
            mk_task("task-4", &[], &["out-4.txt"], 0.0),
        ])
        .unwrap();

        assert_eq!(
            graph.descendant_tasks("task-1"),
            BTreeSet::from(["task-2".to_string(), "task-3".to_string()])
        );
        assert!(graph.descendant_tasks("task-3").is_empty());
    }

    #[test]
    fn priorities_propagate_with_discounting() {
        // task-4 consumes task-3's output; with a discount factor of 0.5
        // task-3 inherits half of task-4's priority.
        let mut graph = graph_of(vec![
            mk_task("task-1", &[], &["out-d.txt"], 0.25),
            mk_task("task-2", &[], &["out-a.txt"], 0.75),
            mk_task("task-3", &[], &["out-b.txt"], 0.0),
            mk_task("task-4", &["out-b.txt"], &["out-c.txt"], 1.0),
        ])
        .unwrap();
        graph.assign_priorities(0.5).unwrap();

        assert_eq!(graph.task("task-1").unwrap().effective_priority, 0.25);
        assert_eq!(graph.task("task-2").unwrap().effective_priority, 0.75);
        assert_eq!(graph.task("task-3").unwrap().effective_priority, 0.5);
        assert_eq!(graph.task("task-4").unwrap().effective_priority, 1.0);
    }

    #[test]
    fn priorities_accumulate_over_chains() {
        let mut graph = graph_of(vec![
            mk_task("task-1", &[], &["out-1.txt"], 0.0),
            mk_task("task-2", &["out-1.txt"], &["out-2.txt"], 0.0),
            mk_task("task-3", &["out-2.txt"], &["out-3.txt"], 2.0),
        ])
        .unwrap();
        graph.assign_priorities(0.5).unwrap();

        assert_eq!(graph.task("task-3").unwrap().effective_priority, 2.0);
        assert_eq!(graph.task("task-2").unwrap().effective_priority, 1.0);
        assert_eq!(graph.task("task-1").unwrap().effective_priority, 0.5);
    }

    #[test]
    fn without_propagation_effective_equals_declared() {
        let graph = graph_of(vec![mk_task("task-1", &[], &["out.txt"], 0.75)]).unwrap();
        assert_eq!(graph.task("task-1").unwrap().effective_priority, 0.75);
    }

    #[test]
    fn empty_graph_is_valid() {
        let graph = Graph::from_tasks(BTreeMap::new()).unwrap();
        assert_eq!(graph.topological_sort().unwrap(), Vec::<String>::new());
        assert_eq!(graph.task_ids().count(), 0);
    }
}
