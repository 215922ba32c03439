//! Command DSL engine for agent-issued execution requests.
//!
//! An agent emits markup blocks (`<bash>`, `<python>`, `<task>`,
//! `<service>`, `<package>`) describing work and its dependencies. This
//! crate parses that markup, resolves execution order over an explicit
//! dependency graph, dispatches the work to named tools, and renders the
//! results back in the same markup. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (lexing, parsing, printing,
//!   graph construction, scheduling state). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (process execution, tool
//!   dispatch, config, round persistence). Isolated to enable scripted
//!   dispatchers in tests.
//!
//! [`round`] coordinates core logic with I/O to run one request round;
//! [`render`] formats the outcome.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod render;
pub mod round;
#[cfg(test)]
pub mod test_support;
