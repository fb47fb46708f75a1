//! Per-invocation execution constraints.

use sable_ir::NodeManager;
use std::time::{Duration, Instant};

/// Budgets and warning collection for one evaluation or query.
///
/// Long-running operations check the budgets at operation boundaries and
/// abort cleanly — returning a null handle — when either is exhausted.
/// There are no suspension points: a task that starts runs to completion or
/// aborts at the next boundary.
#[derive(Debug)]
pub struct ExecutionConstraints {
    max_nodes: Option<usize>,
    max_duration: Option<Duration>,
    started: Instant,
    collect_warnings: bool,
    warnings: Vec<String>,
}

impl ExecutionConstraints {
    /// Unbounded constraints that still collect nothing.
    pub fn unlimited() -> Self {
        ExecutionConstraints {
            max_nodes: None,
            max_duration: None,
            started: Instant::now(),
            collect_warnings: false,
            warnings: Vec::new(),
        }
    }

    /// Constrain allocated node count.
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    /// Constrain wall-clock execution time, measured from construction.
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Record warnings instead of discarding them.
    pub fn collecting_warnings(mut self) -> Self {
        self.collect_warnings = true;
        self
    }

    /// True once the node budget is exceeded for `manager`.
    pub fn node_budget_exhausted(&self, manager: &NodeManager) -> bool {
        self.max_nodes.is_some_and(|max| manager.live_count() > max)
    }

    /// True once the time budget is exceeded.
    pub fn time_exhausted(&self) -> bool {
        self.max_duration.is_some_and(|max| self.started.elapsed() > max)
    }

    /// True when either budget is exhausted; callers abort by returning a
    /// null handle.
    pub fn exhausted(&self, manager: &NodeManager) -> bool {
        self.node_budget_exhausted(manager) || self.time_exhausted()
    }

    /// Record a warning when collection is enabled.
    pub fn warn(&mut self, message: impl Into<String>) {
        if self.collect_warnings {
            self.warnings.push(message.into());
        }
    }

    /// Warnings accumulated so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Default for ExecutionConstraints {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_ir::default_pool;

    #[test]
    fn node_budget_trips_on_allocation() {
        let mut manager = NodeManager::new(default_pool());
        let constraints = ExecutionConstraints::unlimited().with_max_nodes(2);
        assert!(!constraints.exhausted(&manager));

        for _ in 0..3 {
            manager.alloc_number(0.0);
        }
        assert!(constraints.node_budget_exhausted(&manager));
        assert!(constraints.exhausted(&manager));
    }

    #[test]
    fn time_budget_trips_after_deadline() {
        let constraints =
            ExecutionConstraints::unlimited().with_max_duration(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(constraints.time_exhausted());
    }

    #[test]
    fn warnings_are_collected_only_when_enabled() {
        let mut silent = ExecutionConstraints::unlimited();
        silent.warn("dropped");
        assert!(silent.warnings().is_empty());

        let mut collecting = ExecutionConstraints::unlimited().collecting_warnings();
        collecting.warn("undefined symbol: x");
        assert_eq!(collecting.warnings(), ["undefined symbol: x"]);
    }
}
