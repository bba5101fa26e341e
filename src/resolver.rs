//! Dependency ordering over behaviors.
//!
//! Behaviors are stored in an index arena; `requires` names become
//! adjacency lists of indices.

use crate::error::StructuralError;
use crate::model::Behavior;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Index-based view of the `requires` graph.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    behaviors: Vec<&'a Behavior>,
    /// `requires[i]` lists the indices behavior `i` depends on, in
    /// declaration order.
    requires: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph, rejecting duplicate names and unknown references.
    pub fn build(behaviors: &[&'a Behavior]) -> Result<Self, StructuralError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(behaviors.len());
        for (i, behavior) in behaviors.iter().enumerate() {
            if index.insert(behavior.name.as_str(), i).is_some() {
                return Err(StructuralError::DuplicateBehavior {
                    name: behavior.name.clone(),
                });
            }
        }

        let mut requires = Vec::with_capacity(behaviors.len());
        for behavior in behaviors {
            let mut deps = Vec::with_capacity(behavior.requires.len());
            for dep in &behavior.requires {
                let idx = index.get(dep.as_str()).copied().ok_or_else(|| {
                    StructuralError::MissingDependency {
                        behavior: behavior.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                if !deps.contains(&idx) {
                    deps.push(idx);
                }
            }
            requires.push(deps);
        }

        Ok(Self {
            behaviors: behaviors.to_vec(),
            requires,
        })
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    pub fn behavior(&self, idx: usize) -> &'a Behavior {
        self.behaviors[idx]
    }

    pub fn requires(&self, idx: usize) -> &[usize] {
        &self.requires[idx]
    }

    /// Topological order by depth-first traversal.
    ///
    /// Behaviors are visited in declaration order and each one's
    /// dependencies in the order they are listed, emitting dependencies
    /// first. Behaviors with no path between them keep their declared
    /// relative order unless one is pulled forward as a dependency of
    /// an earlier behavior: `[b requires c, a, c]` resolves to
    /// `c, b, a`.
    pub fn order(&self) -> Result<Vec<usize>, StructuralError> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(self.len());

        for idx in 0..self.len() {
            self.visit(idx, &mut marks, &mut stack, &mut order)?;
        }

        debug!(
            "Resolved behavior order: {:?}",
            order
                .iter()
                .map(|&i| self.behaviors[i].name.as_str())
                .collect::<Vec<_>>()
        );
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), StructuralError> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = stack.iter().position(|&i| i == idx).unwrap_or(0);
                let mut path: Vec<String> = stack[start..]
                    .iter()
                    .map(|&i| self.behaviors[i].name.clone())
                    .collect();
                path.push(self.behaviors[idx].name.clone());
                return Err(StructuralError::Cycle { path });
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::InProgress;
        stack.push(idx);
        for &dep in &self.requires[idx] {
            self.visit(dep, marks, stack, order)?;
        }
        stack.pop();
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }

    /// Group an order into dependency levels. Level 0 has no
    /// dependencies; every behavior sits one level above its deepest
    /// dependency. Members of a level keep their relative order.
    pub fn levels(&self, order: &[usize]) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();

        for &idx in order {
            let level = self.requires[idx]
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
            depth[idx] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(idx);
        }

        levels
    }

    /// Behaviors matching `filter` (case-insensitive name substring)
    /// and any of `tags`, plus everything they transitively require.
    pub fn select(&self, filter: Option<&str>, tags: &[String]) -> Vec<bool> {
        let filter = filter.map(str::to_lowercase);
        let mut selected = vec![false; self.len()];
        let mut pending: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let behavior = self.behaviors[i];
                let name_ok = filter
                    .as_ref()
                    .map_or(true, |f| behavior.name.to_lowercase().contains(f));
                let tag_ok = tags.is_empty() || behavior.tags.iter().any(|t| tags.contains(t));
                name_ok && tag_ok
            })
            .collect();

        while let Some(idx) = pending.pop() {
            if selected[idx] {
                continue;
            }
            selected[idx] = true;
            pending.extend(self.requires[idx].iter().copied());
        }

        selected
    }
}

/// Resolve a valid execution order for `behaviors`.
pub fn resolve_order<'a>(behaviors: &[&'a Behavior]) -> Result<Vec<&'a Behavior>, StructuralError> {
    let graph = DependencyGraph::build(behaviors)?;
    let order = graph.order()?;
    Ok(order.into_iter().map(|i| graph.behavior(i)).collect())
}
