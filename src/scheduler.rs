//! Dependency-aware task scheduler.
//!
//! The scheduler never runs anything; it answers "which tasks next?" and
//! records completions. It is seeded with the unfinished set and tracks,
//! per task, the upstream tasks it still waits on. `propose` hands out
//! ready tasks (priority-ordered when enabled) and moves them in flight in
//! the same step; `complete` retires tasks and promotes newly unblocked
//! ones.

use std::collections::{BTreeMap, BTreeSet};

use crate::dag::Graph;

#[derive(Debug)]
pub struct Scheduler {
    priority_enabled: bool,
    /// Tasks still to execute, including those in flight.
    unfinished: BTreeSet<String>,
    /// Tasks handed out by `propose` and not yet completed.
    in_flight: BTreeSet<String>,
    /// Unfinished upstream tasks each task still waits on.
    remaining_deps: BTreeMap<String, BTreeSet<String>>,
    /// Effective priority snapshot taken at seeding time.
    priorities: BTreeMap<String, f64>,
}

impl Scheduler {
    pub fn new(graph: &Graph, unfinished: &BTreeSet<String>, priority_enabled: bool) -> Self {
        let remaining_deps = unfinished
            .iter()
            .map(|id| {
                let upstream: BTreeSet<String> = graph
                    .upstream_tasks(id)
                    .intersection(unfinished)
                    .cloned()
                    .collect();
                (id.clone(), upstream)
            })
            .collect();
        let priorities = unfinished
            .iter()
            .filter_map(|id| graph.task(id).map(|node| (id.clone(), node.effective_priority)))
            .collect();

        Self {
            priority_enabled,
            unfinished: unfinished.clone(),
            in_flight: BTreeSet::new(),
            remaining_deps,
            priorities,
        }
    }

    /// Hand out up to `limit` ready tasks (all of them for `None`), moving
    /// them in flight. Ready tasks are drawn in descending effective
    /// priority when priority scheduling is on; ties and the unprioritized
    /// case fall back to lexicographic id order.
    pub fn propose(&mut self, limit: Option<usize>) -> Vec<String> {
        let mut ready: Vec<String> = self
            .unfinished
            .iter()
            .filter(|id| !self.in_flight.contains(*id))
            .filter(|id| {
                self.remaining_deps
                    .get(*id)
                    .is_none_or(|deps| deps.is_empty())
            })
            .cloned()
            .collect();

        if self.priority_enabled {
            ready.sort_by(|a, b| {
                let priority_a = self.priorities.get(a).copied().unwrap_or_default();
                let priority_b = self.priorities.get(b).copied().unwrap_or_default();
                priority_b.total_cmp(&priority_a).then_with(|| a.cmp(b))
            });
        }

        if let Some(limit) = limit {
            ready.truncate(limit);
        }
        for id in &ready {
            self.in_flight.insert(id.clone());
        }
        ready
    }

    /// Record completions: retire the ids and release them from every
    /// waiter's remaining dependencies.
    pub fn complete(&mut self, ids: &[String]) {
        for id in ids {
            self.in_flight.remove(id);
            self.unfinished.remove(id);
            self.remaining_deps.remove(id);
        }
        for deps in self.remaining_deps.values_mut() {
            for id in ids {
                deps.remove(id);
            }
        }
    }

    pub fn has_work(&self) -> bool {
        !self.unfinished.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
