//! Command DSL engine CLI.
//!
//! Reads a request document (file or stdin), then validates, formats, or
//! executes it. `run` prints the result document on stdout and reserves
//! stderr for diagnostics.

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use engine::core::graph::build_graph;
use engine::core::parser::parse_source;
use engine::core::printer::print_sequence;
use engine::core::schedule::CancelToken;
use engine::exit_codes;
use engine::io::config::load_config;
use engine::io::round_log::write_round_log;
use engine::io::tools::ShellTools;
use engine::round::run_round;

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Command DSL parser and task execution engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a request; print the execution plan.
    Check {
        /// Request file, or `-` for stdin.
        input: String,
    },
    /// Print a request in canonical form.
    Fmt {
        /// Request file, or `-` for stdin.
        input: String,
    },
    /// Execute a request and print the result document.
    Run {
        /// Request file, or `-` for stdin.
        input: String,
        /// Engine config TOML; defaults apply when the file is missing.
        #[arg(long, default_value = ".engine/config.toml")]
        config: PathBuf,
        /// Directory to persist the request, result, and records.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

fn main() {
    engine::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { input } => cmd_check(&input),
        Command::Fmt { input } => cmd_fmt(&input),
        Command::Run {
            input,
            config,
            log_dir,
        } => cmd_run(&input, &config, log_dir.as_deref()),
    }
}

fn cmd_check(input: &str) -> Result<i32> {
    let source = read_input(input)?;
    let sequence = parse_source(&source)?;
    let graph = build_graph(&sequence)?;

    for unit in &graph.units {
        if unit.deps.is_empty() {
            println!("{}", unit.label);
        } else {
            let deps: Vec<&str> = unit
                .deps
                .iter()
                .map(|dep| graph.units[*dep].label.as_str())
                .collect();
            println!("{}: depends on {}", unit.label, deps.join(", "));
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_fmt(input: &str) -> Result<i32> {
    let source = read_input(input)?;
    let sequence = parse_source(&source)?;
    print!("{}", print_sequence(&sequence));
    Ok(exit_codes::OK)
}

fn cmd_run(input: &str, config_path: &std::path::Path, log_dir: Option<&std::path::Path>) -> Result<i32> {
    let source = read_input(input)?;
    let config = load_config(config_path)?;
    let dispatcher = ShellTools {
        output_limit_bytes: config.output_limit_bytes,
    };

    let outcome = run_round(&source, &dispatcher, &config, &CancelToken::new())?;
    print!("{}", outcome.result_text);

    if let Some(dir) = log_dir {
        write_round_log(dir, &source, &outcome.result_text, &outcome.records)?;
    }

    if outcome.succeeded() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::EXECUTION_FAILED)
    }
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(input).with_context(|| format!("read {input}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_check() {
        let cli = Cli::parse_from(["engine", "check", "request.dsl"]);
        assert!(matches!(cli.command, Command::Check { input } if input == "request.dsl"));
    }

    #[test]
    fn parse_run_with_log_dir() {
        let cli = Cli::parse_from(["engine", "run", "-", "--log-dir", "rounds/1"]);
        let Command::Run { input, log_dir, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(input, "-");
        assert_eq!(log_dir, Some(PathBuf::from("rounds/1")));
    }

    #[test]
    fn parse_run_default_config_path() {
        let cli = Cli::parse_from(["engine", "run", "request.dsl"]);
        let Command::Run { config, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(config, PathBuf::from(".engine/config.toml"));
    }
}
