//! Optional persistence of one round's artifacts.
//!
//! When a log directory is configured, each round leaves behind the raw
//! request, the rendered result document, and the execution records as
//! pretty JSON. Nothing here is read back by the engine; the files
//! exist for humans and calling agents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::schedule::ExecutionRecord;

const REQUEST_FILE: &str = "request.dsl";
const RESULT_FILE: &str = "result.dsl";
const RECORDS_FILE: &str = "records.json";

/// Write one round's artifacts under `dir`, creating it if needed.
pub fn write_round_log(
    dir: &Path,
    source: &str,
    result_text: &str,
    records: &[ExecutionRecord],
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create round log dir {}", dir.display()))?;

    write_text(&dir.join(REQUEST_FILE), source)?;
    write_text(&dir.join(RESULT_FILE), result_text)?;

    let mut json = serde_json::to_string_pretty(records).context("serialize records")?;
    json.push('\n');
    write_text(&dir.join(RECORDS_FILE), &json)?;

    debug!(dir = %dir.display(), records = records.len(), "round log written");
    Ok(())
}

/// Path of the records file inside a round log directory.
pub fn records_path(dir: &Path) -> PathBuf {
    dir.join(RECORDS_FILE)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::{ExecutionRecord, NodeStatus};

    fn record(key: &str, status: NodeStatus) -> ExecutionRecord {
        ExecutionRecord {
            key: key.to_string(),
            status,
            output: Some("hi".to_string()),
            error: None,
            status_code: Some(0),
            started_at: Some(1),
            ended_at: Some(2),
            blocked_on: None,
        }
    }

    #[test]
    fn writes_all_three_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("round-1");
        let records = vec![record("a", NodeStatus::Completed)];

        write_round_log(&dir, "<bash>echo hi</bash>", "<result ...>", &records)
            .expect("write");

        let request = fs::read_to_string(dir.join("request.dsl")).expect("request");
        assert_eq!(request, "<bash>echo hi</bash>");
        assert!(dir.join("result.dsl").exists());

        let json = fs::read_to_string(records_path(&dir)).expect("records");
        let parsed: Vec<ExecutionRecord> = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "a");
        assert_eq!(parsed[0].status, NodeStatus::Completed);
    }
}
