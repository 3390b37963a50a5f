//! Result presentation for the console.

use std::str::FromStr;

use crate::models::CollectionResult;

/// Output format for collection results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One tab-separated line per record (default)
    #[default]
    Text,
    /// JSON array of records
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

const TEXT_HEADER: &str = "probe_id\ttimestamp\ttarget\thostname\taverage_latency_ms\ttotal_loss";

/// Render the result set in the given format.
pub fn render(
    result: &CollectionResult,
    format: OutputFormat,
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(result.records()),
        OutputFormat::Text => {
            if result.is_empty() {
                return Ok("no results".to_string());
            }
            let mut lines = vec![TEXT_HEADER.to_string()];
            for r in result {
                lines.push(format!(
                    "{}\t{}\t{}\t{}\t{:.3}\t{:.3}",
                    r.probe_id,
                    r.timestamp_string(),
                    r.target_name,
                    r.hostname,
                    r.average_latency,
                    r.total_loss
                ));
            }
            Ok(lines.join("\n"))
        }
    }
}

/// Print the result set to stdout.
pub fn print_results(
    result: &CollectionResult,
    format: OutputFormat,
) -> Result<(), serde_json::Error> {
    println!("{}", render(result, format)?);
    Ok(())
}
