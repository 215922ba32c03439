//! Tool dispatch abstraction.
//!
//! The [`ToolDispatch`] trait decouples scheduling from the actual tool
//! backends (currently `bash` and `python3`). Tests use scripted
//! dispatchers that return predetermined outcomes without spawning
//! processes.

use std::collections::BTreeMap;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::schedule::{CancelToken, status_code};
use crate::io::config::RetryPolicy;
use crate::io::process::run_command_with_timeout;

/// Argument key carrying the command body for the built-in tools.
pub const COMMANDS_ARG: &str = "commands";

/// Parameters for one tool invocation.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Tool name (`bash`, `python`, ...).
    pub name: String,
    pub arguments: BTreeMap<String, String>,
    /// Wall-clock budget for this invocation.
    pub timeout: Duration,
}

impl DispatchRequest {
    pub fn new(name: &str, commands: &str, timeout: Duration) -> Self {
        let mut arguments = BTreeMap::new();
        arguments.insert(COMMANDS_ARG.to_string(), commands.to_string());
        DispatchRequest {
            name: name.to_string(),
            arguments,
            timeout,
        }
    }
}

/// Terminal result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// 0 on success, child exit code on failure, 124 timeout, 130
    /// cancelled.
    pub status_code: i32,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        self.status_code == status_code::SUCCESS
    }

    pub fn is_cancelled(&self) -> bool {
        self.status_code == status_code::CANCELLED
    }
}

/// Abstraction over tool backends.
pub trait ToolDispatch {
    /// Run one tool invocation to a terminal outcome. Errors mean the
    /// tool could not run at all (unknown name, spawn failure); a tool
    /// that ran and failed is an `Ok` outcome with a nonzero status.
    fn execute(&self, request: &DispatchRequest, cancel: &CancelToken) -> Result<ToolOutcome>;

    /// Whether a failed `attempt` (1-based) is worth repeating. The
    /// retry budget itself lives in [`RetryPolicy`].
    fn should_retry(&self, _name: &str, _attempt: u32, _outcome: &ToolOutcome) -> bool {
        false
    }
}

/// Built-in dispatcher: `bash -c` and `python3 -c`.
#[derive(Debug, Clone)]
pub struct ShellTools {
    pub output_limit_bytes: usize,
}

impl ToolDispatch for ShellTools {
    #[instrument(skip_all, fields(tool = %request.name, timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &DispatchRequest, cancel: &CancelToken) -> Result<ToolOutcome> {
        let commands = request
            .arguments
            .get(COMMANDS_ARG)
            .ok_or_else(|| anyhow!("tool '{}' called without '{COMMANDS_ARG}'", request.name))?;

        let cmd = match request.name.as_str() {
            "bash" => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(commands);
                cmd
            }
            "python" => {
                let mut cmd = Command::new("python3");
                cmd.arg("-c").arg(commands);
                cmd
            }
            other => return Err(anyhow!("unknown tool '{other}'")),
        };

        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            self.output_limit_bytes,
            cancel,
        )?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&output.stdout_truncated_notice());
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.push_str(&output.stderr_truncated_notice());

        let status_code = if output.cancelled {
            status_code::CANCELLED
        } else if output.timed_out {
            stderr = format!(
                "timed out after {}s{}",
                request.timeout.as_secs(),
                if stderr.is_empty() { String::new() } else { format!("\n{stderr}") }
            );
            status_code::TIMEOUT
        } else if output.status.success() {
            status_code::SUCCESS
        } else {
            output.status.code().unwrap_or(status_code::FAILURE)
        };

        debug!(status_code, "tool finished");
        Ok(ToolOutcome {
            status_code,
            output: non_empty(stdout),
            error: non_empty(stderr),
        })
    }

    /// Failures and timeouts are retryable; cancellation never is.
    fn should_retry(&self, _name: &str, _attempt: u32, outcome: &ToolOutcome) -> bool {
        !outcome.is_success() && !outcome.is_cancelled()
    }
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Dispatch with the configured retry budget and linear backoff.
/// Returns the final outcome plus the number of attempts made.
pub fn dispatch_with_retry<D: ToolDispatch + ?Sized>(
    dispatcher: &D,
    request: &DispatchRequest,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<(ToolOutcome, u32)> {
    let mut attempt = 1;
    loop {
        let outcome = dispatcher.execute(request, cancel)?;
        let retry = !outcome.is_success()
            && !outcome.is_cancelled()
            && attempt < policy.max_attempts
            && !cancel.is_cancelled()
            && dispatcher.should_retry(&request.name, attempt, &outcome);
        if !retry {
            return Ok((outcome, attempt));
        }
        warn!(
            tool = %request.name,
            attempt,
            status_code = outcome.status_code,
            "tool failed, retrying"
        );
        thread::sleep(Duration::from_millis(policy.backoff_ms * u64::from(attempt)));
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn shell() -> ShellTools {
        ShellTools {
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn bash_captures_stdout() {
        let outcome = shell()
            .execute(
                &DispatchRequest::new("bash", "echo hi", Duration::from_secs(5)),
                &CancelToken::new(),
            )
            .expect("execute");
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.output.as_deref(), Some("hi"));
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn bash_failure_reports_exit_code_and_stderr() {
        let outcome = shell()
            .execute(
                &DispatchRequest::new("bash", "echo oops >&2; exit 7", Duration::from_secs(5)),
                &CancelToken::new(),
            )
            .expect("execute");
        assert_eq!(outcome.status_code, 7);
        assert_eq!(outcome.error.as_deref(), Some("oops"));
    }

    #[test]
    fn timeout_maps_to_124() {
        let outcome = shell()
            .execute(
                &DispatchRequest::new("bash", "sleep 30", Duration::from_millis(200)),
                &CancelToken::new(),
            )
            .expect("execute");
        assert_eq!(outcome.status_code, status_code::TIMEOUT);
        assert!(outcome.error.expect("error").contains("timed out"));
    }

    #[test]
    fn unknown_tool_is_a_dispatch_error() {
        let err = shell()
            .execute(
                &DispatchRequest::new("ruby", "puts 1", Duration::from_secs(1)),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    struct FlakyDispatch {
        attempts: Cell<u32>,
        succeed_on: u32,
    }

    impl ToolDispatch for FlakyDispatch {
        fn execute(&self, _request: &DispatchRequest, _cancel: &CancelToken) -> Result<ToolOutcome> {
            let attempt = self.attempts.get() + 1;
            self.attempts.set(attempt);
            if attempt >= self.succeed_on {
                Ok(ToolOutcome {
                    status_code: 0,
                    output: Some("ok".to_string()),
                    error: None,
                })
            } else {
                Ok(ToolOutcome {
                    status_code: 1,
                    output: None,
                    error: Some("flake".to_string()),
                })
            }
        }

        fn should_retry(&self, _name: &str, _attempt: u32, outcome: &ToolOutcome) -> bool {
            !outcome.is_success()
        }
    }

    /// The retry budget caps attempts even when the dispatcher keeps
    /// asking for more.
    #[test]
    fn retry_stops_at_max_attempts() {
        let dispatcher = FlakyDispatch {
            attempts: Cell::new(0),
            succeed_on: 10,
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        };
        let (outcome, attempts) = dispatch_with_retry(
            &dispatcher,
            &DispatchRequest::new("fake", "x", Duration::from_secs(1)),
            &policy,
            &CancelToken::new(),
        )
        .expect("dispatch");
        assert_eq!(attempts, 3);
        assert_eq!(outcome.status_code, 1);
    }

    #[test]
    fn retry_recovers_within_budget() {
        let dispatcher = FlakyDispatch {
            attempts: Cell::new(0),
            succeed_on: 2,
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        };
        let (outcome, attempts) = dispatch_with_retry(
            &dispatcher,
            &DispatchRequest::new("fake", "x", Duration::from_secs(1)),
            &policy,
            &CancelToken::new(),
        )
        .expect("dispatch");
        assert_eq!(attempts, 2);
        assert!(outcome.is_success());
    }

    /// The default trait hook opts out of retrying entirely.
    #[test]
    fn default_should_retry_is_false() {
        struct AlwaysFails;
        impl ToolDispatch for AlwaysFails {
            fn execute(&self, _r: &DispatchRequest, _c: &CancelToken) -> Result<ToolOutcome> {
                Ok(ToolOutcome {
                    status_code: 1,
                    output: None,
                    error: None,
                })
            }
        }
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 0,
        };
        let (_, attempts) = dispatch_with_retry(
            &AlwaysFails,
            &DispatchRequest::new("fake", "x", Duration::from_secs(1)),
            &policy,
            &CancelToken::new(),
        )
        .expect("dispatch");
        assert_eq!(attempts, 1);
    }
}
