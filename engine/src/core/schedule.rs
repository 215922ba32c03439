//! Execution state machine over a [`TaskGraph`].
//!
//! The scheduler is pure bookkeeping: it owns one [`ExecutionRecord`]
//! per unit, computes the ready set, and applies completions. Actual
//! dispatch, clocks, and channels live in `round` and `io`; only one
//! thread ever mutates a `Scheduler`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::graph::TaskGraph;

/// Status codes carried into the result document.
pub mod status_code {
    pub const SUCCESS: i32 = 0;
    /// Tool failure with no child exit code to report.
    pub const FAILURE: i32 = 1;
    /// Killed by per-node timeout, matching shell convention.
    pub const TIMEOUT: i32 = 124;
    /// Never dispatched because a dependency failed.
    pub const BLOCKED: i32 = 125;
    pub const CANCELLED: i32 = 130;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Blocked,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Blocked
                | NodeStatus::Completed
                | NodeStatus::Failed
                | NodeStatus::Cancelled
        )
    }
}

/// Per-unit execution record; the only state that survives a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub key: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    /// Epoch milliseconds; `None` until the unit starts/ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    /// Key of the failed ancestor that blocked this unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_on: Option<String>,
}

impl ExecutionRecord {
    fn pending(key: String) -> Self {
        ExecutionRecord {
            key,
            status: NodeStatus::Pending,
            output: None,
            error: None,
            status_code: None,
            started_at: None,
            ended_at: None,
            blocked_on: None,
        }
    }
}

/// Terminal outcome of one dispatched unit, reported back to the
/// scheduler by a worker.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    /// `Completed`, `Failed`, or `Cancelled`.
    pub status: NodeStatus,
    pub status_code: i32,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl UnitOutcome {
    pub fn completed(output: Option<String>) -> Self {
        UnitOutcome {
            status: NodeStatus::Completed,
            status_code: status_code::SUCCESS,
            output,
            error: None,
        }
    }

    pub fn failed(status_code: i32, output: Option<String>, error: Option<String>) -> Self {
        UnitOutcome {
            status: NodeStatus::Failed,
            status_code,
            output,
            error,
        }
    }

}

/// Shared cancellation flag, checked by dispatch loops between polls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-writer execution state over one graph.
#[derive(Debug)]
pub struct Scheduler {
    graph: TaskGraph,
    records: Vec<ExecutionRecord>,
}

impl Scheduler {
    pub fn new(graph: TaskGraph) -> Self {
        let records = graph
            .units
            .iter()
            .map(|unit| ExecutionRecord::pending(unit.label.clone()))
            .collect();
        Scheduler { graph, records }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ExecutionRecord> {
        self.records
    }

    /// Units that may dispatch now: `Pending`, every dependency edge
    /// `Completed`, every ordering edge terminal (not necessarily
    /// successful).
    pub fn ready(&self) -> Vec<usize> {
        self.graph
            .units
            .iter()
            .filter(|unit| {
                self.records[unit.index].status == NodeStatus::Pending
                    && unit
                        .deps
                        .iter()
                        .all(|dep| self.records[*dep].status == NodeStatus::Completed)
                    && unit
                        .order_after
                        .is_none_or(|prev| self.records[prev].status.is_terminal())
            })
            .map(|unit| unit.index)
            .collect()
    }

    pub fn mark_running(&mut self, unit: usize, started_at_ms: u64) {
        let record = &mut self.records[unit];
        record.status = NodeStatus::Running;
        record.started_at = Some(started_at_ms);
    }

    /// Apply a worker's terminal outcome. A failure immediately blocks
    /// every transitive dependent so it is never dispatched.
    pub fn finish(&mut self, unit: usize, outcome: UnitOutcome, ended_at_ms: u64) {
        {
            let record = &mut self.records[unit];
            record.status = outcome.status;
            record.status_code = Some(outcome.status_code);
            record.output = outcome.output;
            record.error = outcome.error;
            record.ended_at = Some(ended_at_ms);
        }
        if outcome.status == NodeStatus::Failed {
            self.block_dependents(unit);
        }
    }

    fn block_dependents(&mut self, failed: usize) {
        let failed_key = self.records[failed].key.clone();
        let mut frontier = vec![failed];
        while let Some(current) = frontier.pop() {
            for dependent in self.graph.dependents[current].clone() {
                let record = &mut self.records[dependent];
                if record.status != NodeStatus::Pending {
                    continue;
                }
                record.status = NodeStatus::Blocked;
                record.status_code = Some(status_code::BLOCKED);
                record.error = Some(format!("blocked by failed dependency '{failed_key}'"));
                record.blocked_on = Some(failed_key.clone());
                frontier.push(dependent);
            }
        }
    }

    /// Flip everything not yet running or finished to `Cancelled`.
    pub fn cancel_remaining(&mut self) {
        for record in &mut self.records {
            if matches!(record.status, NodeStatus::Pending | NodeStatus::Blocked) {
                record.status = NodeStatus::Cancelled;
                record.status_code = Some(status_code::CANCELLED);
                record.error = Some("cancelled".to_string());
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == NodeStatus::Running)
            .count()
    }

    pub fn is_done(&self) -> bool {
        self.records
            .iter()
            .all(|record| record.status.is_terminal())
    }
}
