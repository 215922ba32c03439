//! Deterministic, pure logic: lexing, parsing, printing, graph
//! construction, and scheduling state.
//!
//! Core modules must be free of I/O side effects. They operate on
//! in-memory data structures and return deterministic outputs suitable
//! for tests.

pub mod ast;
pub mod graph;
pub mod parser;
pub mod printer;
pub mod schedule;
pub mod token;
