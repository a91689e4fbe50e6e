//! Export renderings: `json` is a full-fidelity dump, `txt` and `md` are
//! deterministic human-readable renderings of the same content.

use chrono::DateTime;

use crate::error::Result;
use crate::model::{ExportFormat, Task};

pub fn render(task: &Task, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(task)?),
        ExportFormat::Txt => Ok(to_text(task)),
        ExportFormat::Md => Ok(to_markdown(task)),
    }
}

fn fmt_ts(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn fmt_time(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn to_text(task: &Task) -> String {
    let mut out = format!("TASK: {}\n", task.text);
    out.push_str(&format!("ID: {}\n", task.id));
    out.push_str(&format!("Status: {}\n", task.status));
    out.push_str(&format!("Created: {}\n", fmt_ts(task.created_at)));
    out.push_str(&format!("Updated: {}\n\n", fmt_ts(task.updated_at)));

    out.push_str("METRICS:\n");
    out.push_str(&format!("  Tokens In: {}\n", task.api_metrics.tokens_in));
    out.push_str(&format!("  Tokens Out: {}\n", task.api_metrics.tokens_out));
    out.push_str(&format!(
        "  Total Cost: ${:.4}\n\n",
        task.api_metrics.total_cost
    ));

    out.push_str("CONVERSATION:\n");
    for (i, msg) in task.messages.iter().enumerate() {
        out.push_str(&format!(
            "\n[{}] {} ({})\n",
            i + 1,
            msg.kind.as_str().to_uppercase(),
            fmt_time(msg.ts)
        ));
        if let Some(text) = &msg.text {
            out.push_str(text);
            out.push('\n');
        }
    }

    out
}

fn to_markdown(task: &Task) -> String {
    let mut md = format!("# {}\n\n", task.text);
    md.push_str(&format!("**ID:** {}  \n", task.id));
    md.push_str(&format!("**Status:** {}  \n", task.status));
    md.push_str(&format!("**Created:** {}  \n", fmt_ts(task.created_at)));
    md.push_str(&format!("**Updated:** {}  \n\n", fmt_ts(task.updated_at)));

    md.push_str("## Metrics\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("|--------|-------|\n");
    md.push_str(&format!("| Tokens In | {} |\n", task.api_metrics.tokens_in));
    md.push_str(&format!(
        "| Tokens Out | {} |\n",
        task.api_metrics.tokens_out
    ));
    md.push_str(&format!(
        "| Cache Reads | {} |\n",
        task.api_metrics.cache_reads
    ));
    md.push_str(&format!(
        "| Cache Writes | {} |\n",
        task.api_metrics.cache_writes
    ));
    md.push_str(&format!(
        "| Total Cost | ${:.4} |\n\n",
        task.api_metrics.total_cost
    ));

    md.push_str("## Conversation\n\n");
    for (i, msg) in task.messages.iter().enumerate() {
        md.push_str(&format!("### Message {} ({})\n", i + 1, msg.kind.as_str()));
        md.push_str(&format!("*{}*\n\n", fmt_ts(msg.ts)));
        if let Some(text) = &msg.text {
            md.push_str(text);
            md.push_str("\n\n");
        }
    }

    md
}
