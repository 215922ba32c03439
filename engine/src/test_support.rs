//! Shared test fixtures: a scripted tool dispatcher that records every
//! call and returns predetermined outcomes without spawning processes.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::core::schedule::CancelToken;
use crate::io::tools::{COMMANDS_ARG, DispatchRequest, ToolDispatch, ToolOutcome};

/// Dispatcher scripted by command text. Unscripted commands succeed
/// with no output.
pub struct ScriptedDispatch {
    outcomes: HashMap<String, ToolOutcome>,
    calls: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<u64>>,
}

impl ScriptedDispatch {
    pub fn new() -> Self {
        ScriptedDispatch {
            outcomes: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    /// Return the given outcome when `commands` is dispatched.
    pub fn outcome_for(mut self, commands: &str, outcome: ToolOutcome) -> Self {
        self.outcomes.insert(commands.to_string(), outcome);
        self
    }

    /// Succeed with the given stdout when `commands` is dispatched.
    pub fn output_for(self, commands: &str, output: &str) -> Self {
        let outcome = ToolOutcome {
            status_code: 0,
            output: Some(output.to_string()),
            error: None,
        };
        self.outcome_for(commands, outcome)
    }

    /// Fail with the given status code and stderr when `commands` is
    /// dispatched.
    pub fn fail_on(self, commands: &str, status_code: i32, error: &str) -> Self {
        let outcome = ToolOutcome {
            status_code,
            output: None,
            error: Some(error.to_string()),
        };
        self.outcome_for(commands, outcome)
    }

    /// Every dispatch so far, as `tool:commands`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Timeout of every dispatch so far, in seconds, in call order.
    pub fn timeout_secs(&self) -> Vec<u64> {
        self.timeouts.lock().expect("timeouts lock").clone()
    }
}

impl ToolDispatch for ScriptedDispatch {
    fn execute(&self, request: &DispatchRequest, _cancel: &CancelToken) -> Result<ToolOutcome> {
        let commands = request
            .arguments
            .get(COMMANDS_ARG)
            .cloned()
            .unwrap_or_default();
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("{}:{commands}", request.name));
        self.timeouts
            .lock()
            .expect("timeouts lock")
            .push(request.timeout.as_secs());

        Ok(self
            .outcomes
            .get(&commands)
            .cloned()
            .unwrap_or(ToolOutcome {
                status_code: 0,
                output: None,
                error: None,
            }))
    }
}
