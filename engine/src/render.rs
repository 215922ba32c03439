//! Result document formatter.
//!
//! One `<result>` block per top-level request, in document order
//! regardless of completion order. Payloads are escaped so the result
//! document lexes cleanly with the same tokenizer that reads requests.

use std::fmt::Write;

use crate::core::printer::escape;
use crate::core::schedule::{ExecutionRecord, NodeStatus, status_code};

/// Render execution records (already in document order) as a result
/// document.
pub fn render_results(records: &[ExecutionRecord]) -> String {
    let mut out = String::new();
    for (index, record) in records.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        render_record(record, &mut out);
    }
    out
}

fn render_record(record: &ExecutionRecord, out: &mut String) {
    let status = record.status_code.unwrap_or(match record.status {
        NodeStatus::Completed => status_code::SUCCESS,
        _ => status_code::FAILURE,
    });
    let _ = writeln!(
        out,
        "<result name=\"{}\" status=\"{status}\">",
        record.key
    );
    if let Some(output) = &record.output
        && !output.is_empty()
    {
        let _ = writeln!(out, "<output>{}</output>", escape(output));
    }
    if let Some(error) = &record.error
        && !error.is_empty()
    {
        let _ = writeln!(out, "<error>{}</error>", escape(error));
    }
    out.push_str("</result>\n");
}
