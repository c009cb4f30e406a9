//! Around-task instrumentation.
//!
//! A session holds an ordered list of hooks; each sees every task start and
//! end. Hooks stack: installing one never displaces another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kiln_core::{KilnError, Target};

use crate::node::{NodeId, NodeType};

/// The task a hook is called for.
#[derive(Debug, Clone, Copy)]
pub struct TaskInfo<'a> {
    /// Index of the task in execution order.
    pub step: usize,
    pub node: NodeId,
    pub name: &'a str,
    pub node_type: NodeType,
    pub target: Target,
}

pub trait ExecutionHook: Send {
    fn on_task_start(&mut self, _task: &TaskInfo<'_>) {}

    fn on_task_end(&mut self, _task: &TaskInfo<'_>, _elapsed: Duration, _result: Result<(), &KilnError>) {}
}

/// Per-node timing totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeTiming {
    pub runs: u64,
    pub total: Duration,
}

/// Accumulates wall time per node. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ProfilingHook {
    timings: Arc<Mutex<BTreeMap<(NodeId, String), NodeTiming>>>,
}

impl ProfilingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(node, name, timing)` in node order.
    pub fn timings(&self) -> Vec<(NodeId, String, NodeTiming)> {
        self.timings
            .lock()
            .iter()
            .map(|((id, name), t)| (*id, name.clone(), *t))
            .collect()
    }

    pub fn total(&self) -> Duration {
        self.timings.lock().values().map(|t| t.total).sum()
    }

    pub fn reset(&self) {
        self.timings.lock().clear();
    }
}

impl ExecutionHook for ProfilingHook {
    fn on_task_end(&mut self, task: &TaskInfo<'_>, elapsed: Duration, result: Result<(), &KilnError>) {
        if result.is_err() {
            return;
        }
        let mut timings = self.timings.lock();
        let entry = timings.entry((task.node, task.name.to_string())).or_default();
        entry.runs += 1;
        entry.total += elapsed;
    }
}
