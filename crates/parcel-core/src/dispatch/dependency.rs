//! Dependency graph between submitted tasks.
//!
//! Design:
//! - Forward edges: task -> unfinished tasks it waits for
//! - Reverse edges: task -> tasks waiting for it
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! Dependencies can only point at tasks that were already submitted, so the graph
//! is acyclic by construction.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::TaskId;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// `task` no longer waits for `depends_on`.
    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Mark `finished` as done and return the tasks that no longer wait for anything.
    pub fn resolve(&mut self, finished: TaskId) -> Vec<TaskId> {
        let waiting = self.get_waiting_tasks(finished);
        waiting
            .into_iter()
            .filter(|&task| {
                self.remove_dependency(task, finished);
                !self.has_dependencies(task)
            })
            .collect()
    }

    /// Drop every edge touching `task`, returning the tasks that waited for it.
    pub fn remove_task(&mut self, task: TaskId) -> Vec<TaskId> {
        for dep in self.get_dependencies(task) {
            self.remove_dependency(task, dep);
        }
        let waiting = self.get_waiting_tasks(task);
        for &w in &waiting {
            self.remove_dependency(w, task);
        }
        waiting
    }

    /// Tasks waiting for `task`, in id order.
    pub fn get_waiting_tasks(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }
}
