//! Batch CSV export of decisions.
//!
//! Enumerations are joined with `;`, spans and snippets with ` | `.
//! Fields are quoted per RFC 4180 and rows end with CRLF.

use std::io::Write;

use crate::types::Decision;

pub const CSV_HEADER: [&str; 8] = [
    "feature_id",
    "decision",
    "confidence",
    "reasoning_summary",
    "regulations",
    "control_type",
    "evidence_feature_spans",
    "evidence_reg_snippets",
];

const LIST_SEPARATOR: &str = ";";
const EVIDENCE_SEPARATOR: &str = " | ";

/// Quote a field if it contains a delimiter, quote or line break.
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn join_display<T: std::fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

/// The unescaped field values of one row.
pub fn csv_fields(decision: &Decision) -> [String; 8] {
    [
        decision.feature_id.clone(),
        decision.decision.to_string(),
        format!("{:.4}", decision.confidence),
        decision.reasoning_summary.clone(),
        join_display(&decision.regulations, LIST_SEPARATOR),
        join_display(&decision.control_type, LIST_SEPARATOR),
        decision.evidence.feature_spans.join(EVIDENCE_SEPARATOR),
        join_display(&decision.evidence.reg_snippets, EVIDENCE_SEPARATOR),
    ]
}

fn write_row<W: Write>(out: &mut W, fields: &[String]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\r\n")
}

/// Write a header and one row per decision, in the order given.
pub fn write_csv<'a, W: Write>(
    out: &mut W,
    decisions: impl IntoIterator<Item = &'a Decision>,
) -> std::io::Result<()> {
    let header: Vec<String> = CSV_HEADER.iter().map(|h| h.to_string()).collect();
    write_row(out, &header)?;
    for decision in decisions {
        write_row(out, &csv_fields(decision))?;
    }
    out.flush()
}
