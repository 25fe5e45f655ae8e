//! Task graph.
//!
//! A [`TaskGraph`] holds the crew's tasks plus the directed edges
//! *dependency → dependent* implied by each task's `depends_on` list.
//! Unless iterative mode is enabled the graph must be acyclic; the iterative
//! coordinator instead relies on [`TaskGraph::linearize`], which tolerates
//! cycles by breaking back-edges deterministically.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::cadre::error::CadreError;
use crate::cadre::task::{Task, TaskStatus};

/// The crew's tasks and their dependency edges.
#[derive(Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Arc<Task>>,
    /// Insertion order, used for stable iteration.
    order: Vec<String>,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task.  Fails when a task with that name already exists.
    pub fn add_task(&mut self, task: Task) -> Result<(), CadreError> {
        if self.tasks.contains_key(&task.name) {
            return Err(CadreError::config(format!(
                "duplicate task name '{}'",
                task.name
            )));
        }
        self.order.push(task.name.clone());
        self.tasks.insert(task.name.clone(), Arc::new(task));
        Ok(())
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.order
            .iter()
            .filter_map(|name| self.tasks.get(name).cloned())
            .collect()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Declared dependencies of `name`.
    pub fn parents(&self, name: &str) -> Vec<Arc<Task>> {
        self.tasks
            .get(name)
            .map(|task| {
                task.depends_on
                    .iter()
                    .filter_map(|dep| self.tasks.get(dep).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks that declare `name` as a dependency, ascending by name.
    pub fn children(&self, name: &str) -> Vec<Arc<Task>> {
        let mut children: Vec<Arc<Task>> = self
            .tasks
            .values()
            .filter(|task| task.depends_on.iter().any(|dep| dep == name))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// Tasks no other task depends on, ascending by name.
    pub fn leaves(&self) -> Vec<Arc<Task>> {
        let mut leaves: Vec<Arc<Task>> = self
            .tasks
            .values()
            .filter(|task| self.children(&task.name).is_empty())
            .cloned()
            .collect();
        leaves.sort_by(|a, b| a.name.cmp(&b.name));
        leaves
    }

    /// Check dependency references only: every declared dependency must name
    /// a known task.  Used when iterative mode is declared, because cycles
    /// are then intentional.
    pub fn validate_deps(&self) -> Result<(), CadreError> {
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if !self.tasks.contains_key(dep) {
                    return Err(CadreError::config(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.name, dep
                    )));
                }
                if dep == &task.name {
                    return Err(CadreError::config(format!(
                        "task '{}' depends on itself",
                        task.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Full validation: dependency references plus acyclicity.
    pub fn validate(&self) -> Result<(), CadreError> {
        self.validate_deps()?;
        self.topological_sort().map(|_| ())
    }

    /// Total ordering consistent with every edge, ties broken by ascending
    /// name.  Fails with a configuration error when the graph has a cycle.
    pub fn topological_sort(&self) -> Result<Vec<Arc<Task>>, CadreError> {
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .values()
            .map(|t| {
                // count unique parents so a twice-declared dependency cannot
                // leave the node undrainable
                let unique: HashSet<&str> = t.depends_on.iter().map(String::as_str).collect();
                (t.name.as_str(), unique.len())
            })
            .collect();

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut sorted = Vec::with_capacity(self.tasks.len());
        while let Some(name) = ready.iter().next().copied() {
            ready.remove(name);
            sorted.push(self.tasks[name].clone());
            for child in self.children(name) {
                let d = indegree.get_mut(child.name.as_str()).expect("known task");
                *d -= 1;
                if *d == 0 {
                    ready.insert(self.tasks[child.name.as_str()].name.as_str());
                }
            }
        }

        if sorted.len() != self.tasks.len() {
            let mut cyclic: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(name, _)| *name)
                .collect();
            cyclic.sort_unstable();
            return Err(CadreError::config(format!(
                "dependency cycle involving tasks: {}",
                cyclic.join(", ")
            )));
        }
        Ok(sorted)
    }

    /// Cycle-tolerant linearization: a stable pre-order DFS that visits every
    /// task exactly once.
    ///
    /// Roots are the zero-indegree tasks in ascending name order; children
    /// are visited in ascending name order; a back-edge to an already-visited
    /// task is skipped, so the target keeps its earlier pre-order position.
    /// Fully cyclic graphs (no zero-indegree root) fall back to starting from
    /// the lexicographically smallest task.
    pub fn linearize(&self) -> Vec<Arc<Task>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut result = Vec::with_capacity(self.tasks.len());

        let mut roots: Vec<&str> = self
            .tasks
            .values()
            .filter(|t| t.depends_on.is_empty())
            .map(|t| t.name.as_str())
            .collect();
        roots.sort_unstable();

        let mut all: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        all.sort_unstable();

        for name in roots.into_iter().chain(all) {
            self.visit(name, &mut visited, &mut result);
        }
        result
    }

    fn visit(&self, name: &str, visited: &mut HashSet<String>, result: &mut Vec<Arc<Task>>) {
        if visited.contains(name) {
            return;
        }
        visited.insert(name.to_string());
        result.push(self.tasks[name].clone());
        for child in self.children(name) {
            self.visit(&child.name, visited, result);
        }
    }

    /// Pending tasks whose declared dependencies are all `completed`,
    /// ascending by name.
    pub fn get_ready(&self) -> Vec<Arc<Task>> {
        let mut ready: Vec<Arc<Task>> = self
            .tasks
            .values()
            .filter(|task| {
                task.status() == TaskStatus::Pending
                    && task.depends_on.iter().all(|dep| {
                        self.tasks
                            .get(dep)
                            .map(|d| d.status() == TaskStatus::Completed)
                            .unwrap_or(false)
                    })
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.name.cmp(&b.name));
        ready
    }

    /// True when every task is in a terminal state.
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|task| task.status().is_terminal())
    }
}
