//! Side-effecting layers: process control, tool dispatch, config, and
//! round persistence.

pub mod config;
pub mod process;
pub mod round_log;
pub mod tools;
