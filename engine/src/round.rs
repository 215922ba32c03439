//! One request round: lex, parse, build the graph, execute, render.
//!
//! The scheduler loop runs on the calling thread and is the only writer
//! of execution state. Ready units are handed to scoped worker threads;
//! workers report terminal [`UnitOutcome`]s back over a single mpsc
//! channel. Everything built here (AST, graph, scheduler) is dropped
//! when the round ends; the records and result text are all that leave.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::ast::{CommandBlock, CommandSequence, ContainerBlock, GroupCommands};
use crate::core::graph::{GraphError, build_graph};
use crate::core::parser::{ParseError, parse_source};
use crate::core::schedule::{
    CancelToken, ExecutionRecord, NodeStatus, Scheduler, UnitOutcome, status_code,
};
use crate::core::token::LexError;
use crate::io::config::EngineConfig;
use crate::io::tools::{DispatchRequest, ToolDispatch, dispatch_with_retry};
use crate::render::render_results;

/// A fatal round error: the request never reaches execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Everything a round leaves behind.
#[derive(Debug)]
pub struct RoundOutcome {
    /// Per-unit records, in document order.
    pub records: Vec<ExecutionRecord>,
    /// Rendered result document.
    pub result_text: String,
}

impl RoundOutcome {
    pub fn succeeded(&self) -> bool {
        self.records
            .iter()
            .all(|record| record.status == NodeStatus::Completed)
    }
}

/// Run one full round. Lex/parse/graph errors abort before any
/// dispatch; execution failures are reported inside the outcome.
#[instrument(skip_all, fields(bytes = source.len()))]
pub fn run_round<D: ToolDispatch + Sync + ?Sized>(
    source: &str,
    dispatcher: &D,
    config: &EngineConfig,
    cancel: &CancelToken,
) -> Result<RoundOutcome, RoundError> {
    let sequence = parse_source(source)?;
    let graph = build_graph(&sequence)?;
    info!(units = graph.units.len(), "request validated");

    let mut scheduler = Scheduler::new(graph);
    execute(&mut scheduler, &sequence, dispatcher, config, cancel);

    let records = scheduler.into_records();
    let result_text = render_results(&records);
    Ok(RoundOutcome {
        records,
        result_text,
    })
}

fn execute<D: ToolDispatch + Sync + ?Sized>(
    scheduler: &mut Scheduler,
    sequence: &CommandSequence,
    dispatcher: &D,
    config: &EngineConfig,
    cancel: &CancelToken,
) {
    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, UnitOutcome)>();
        let mut cancel_applied = false;

        while !scheduler.is_done() {
            if cancel.is_cancelled() && !cancel_applied {
                info!("cancellation requested, draining running units");
                scheduler.cancel_remaining();
                cancel_applied = true;
                continue;
            }

            let mut dispatched = 0;
            if !cancel.is_cancelled() {
                let capacity = config.workers.saturating_sub(scheduler.running_count());
                for unit in scheduler.ready().into_iter().take(capacity) {
                    let timeout = Duration::from_secs(
                        scheduler.graph().units[unit]
                            .timeout_secs
                            .unwrap_or(config.default_timeout_secs),
                    );
                    scheduler.mark_running(unit, now_ms());
                    debug!(unit, "dispatching unit");

                    let block = &sequence.blocks[unit];
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    scope.spawn(move || {
                        let outcome = execute_unit(block, dispatcher, config, timeout, &cancel);
                        let _ = tx.send((unit, outcome));
                    });
                    dispatched += 1;
                }
            }

            if scheduler.running_count() > 0 {
                match rx.recv() {
                    Ok((unit, outcome)) => {
                        debug!(unit, status = ?outcome.status, "unit finished");
                        scheduler.finish(unit, outcome, now_ms());
                    }
                    Err(_) => break,
                }
            } else if dispatched == 0 {
                // Unreachable given the failure cascade, but never hang.
                warn!("no unit is ready, running, or dispatchable");
                scheduler.cancel_remaining();
                break;
            }
        }
    });
}

/// Run one unit to a terminal outcome: a lone leaf, or a container's
/// groups in textual order, nested blocks inline and depth-first.
fn execute_unit<D: ToolDispatch + ?Sized>(
    block: &CommandBlock,
    dispatcher: &D,
    config: &EngineConfig,
    timeout: Duration,
    cancel: &CancelToken,
) -> UnitOutcome {
    let mut run = UnitRun {
        dispatcher,
        config,
        cancel,
        outputs: Vec::new(),
        errors: Vec::new(),
    };
    match run.run_block(block, timeout) {
        Ok(()) => UnitOutcome::completed(join(run.outputs)),
        Err(halt) => halt,
    }
}

struct UnitRun<'a, D: ?Sized> {
    dispatcher: &'a D,
    config: &'a EngineConfig,
    cancel: &'a CancelToken,
    outputs: Vec<String>,
    errors: Vec<String>,
}

impl<D: ToolDispatch + ?Sized> UnitRun<'_, D> {
    fn run_block(&mut self, block: &CommandBlock, timeout: Duration) -> Result<(), UnitOutcome> {
        match block {
            CommandBlock::Bash { content } => self.run_step("bash", content, timeout),
            CommandBlock::Python { content } => self.run_step("python", content, timeout),
            CommandBlock::Container(container) => self.run_container(container, timeout),
        }
    }

    fn run_container(
        &mut self,
        container: &ContainerBlock,
        inherited: Duration,
    ) -> Result<(), UnitOutcome> {
        let timeout = container
            .timeout_secs()
            .map_or(inherited, Duration::from_secs);
        for group in &container.groups {
            match &group.commands {
                // A raw command body runs through the shell tool.
                GroupCommands::Raw(commands) => self.run_step("bash", commands, timeout)?,
                GroupCommands::Block(block) => self.run_block(block, timeout)?,
            }
        }
        Ok(())
    }

    /// One tool invocation. A failed or cancelled step halts the unit.
    fn run_step(
        &mut self,
        tool: &str,
        commands: &str,
        timeout: Duration,
    ) -> Result<(), UnitOutcome> {
        if self.cancel.is_cancelled() {
            return Err(self.halt(NodeStatus::Cancelled, status_code::CANCELLED, None));
        }

        let request = DispatchRequest::new(tool, commands, timeout);
        let mut outcome =
            match dispatch_with_retry(self.dispatcher, &request, &self.config.retry, self.cancel) {
                Ok((outcome, _attempts)) => outcome,
                Err(err) => {
                    return Err(self.halt(
                        NodeStatus::Failed,
                        status_code::FAILURE,
                        Some(format!("{err:#}")),
                    ));
                }
            };

        if let Some(output) = outcome.output.take() {
            self.outputs.push(output);
        }
        if outcome.is_cancelled() {
            return Err(self.halt(NodeStatus::Cancelled, outcome.status_code, outcome.error));
        }
        if !outcome.is_success() {
            return Err(self.halt(NodeStatus::Failed, outcome.status_code, outcome.error));
        }
        Ok(())
    }

    fn halt(&mut self, status: NodeStatus, code: i32, error: Option<String>) -> UnitOutcome {
        if let Some(error) = error {
            self.errors.push(error);
        }
        UnitOutcome {
            status,
            status_code: code,
            output: join(std::mem::take(&mut self.outputs)),
            error: join(std::mem::take(&mut self.errors)),
        }
    }
}

fn join(parts: Vec<String>) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
