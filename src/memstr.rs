//! Memory-size and timestamp string helpers.

use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Failure to interpret a memory request string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryParseError {
    #[error("empty memory string")]
    Empty,
    #[error(
        "invalid memory format: {0} (expected a number with optional G/g/M/m suffix, \
         e.g. 2, 2G, 200m)"
    )]
    Format(String),
    #[error("invalid number in memory string: {0}")]
    Number(String),
    #[error("unsupported memory unit: {0}")]
    Unit(String),
}

fn memory_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)([GgMm])?$").expect("memory regex"))
}

/// Parse a memory request into gigabytes.
///
/// Accepts `4`, `4G`, `4g`, `200M`, `200m`; a bare number means gigabytes and
/// megabytes convert at 1000 MB per GB.
pub fn parse_memory_gb(s: &str) -> Result<f64, MemoryParseError> {
    let trimmed: String = s.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if trimmed.is_empty() {
        return Err(MemoryParseError::Empty);
    }

    let caps = memory_pattern()
        .captures(&trimmed)
        .ok_or_else(|| MemoryParseError::Format(s.to_string()))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| MemoryParseError::Number(s.to_string()))?;

    match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        None => Ok(value),
        Some(unit) if unit == "G" => Ok(value),
        Some(unit) if unit == "M" => Ok(value / 1000.0),
        Some(unit) => Err(MemoryParseError::Unit(unit)),
    }
}

/// Render a gigabyte value the way the grid engine expects: `4G` for whole
/// numbers, `4.50G` otherwise.
pub fn format_memory_gb(mem: f64) -> String {
    if mem == mem.trunc() {
        format!("{}G", mem as i64)
    } else {
        format!("{mem:.2}G")
    }
}

/// Timestamp format used in both ledgers.
pub const LEDGER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current wall-clock time in ledger format.
pub fn ledger_now() -> String {
    chrono::Local::now().format(LEDGER_TIME_FORMAT).to_string()
}

/// Shorten a ledger timestamp to `MM-DD HH:MM` for table output.
pub fn format_time_short(time_str: &str) -> String {
    if time_str.is_empty() || time_str == "-" {
        return "-".to_string();
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(time_str, LEDGER_TIME_FORMAT) {
        return t.format("%m-%d %H:%M").to_string();
    }
    // Fall back to manual extraction for non-canonical inputs.
    let mut parts = time_str.split_whitespace();
    if let (Some(date), Some(time)) = (parts.next(), parts.next()) {
        let date_parts: Vec<&str> = date.split('-').collect();
        let time_parts: Vec<&str> = time.split(':').collect();
        if date_parts.len() >= 3 && time_parts.len() >= 2 {
            return format!(
                "{}-{} {}:{}",
                date_parts[1], date_parts[2], time_parts[0], time_parts[1]
            );
        }
    }
    time_str.to_string()
}
