/// Counter event extraction: match bulk-load NOTICE lines and decode them.
///
/// Recognized shape:
/// `ysqlsh:<anything> NOTICE:  [YYYY-MM-DD HH:MM:SS.ffffff+00s] counter: N`
/// The `+00s` zone marker is optional and the timestamp is taken as UTC.
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Fixed zone marker that may trail the embedded timestamp.
pub const ZONE_MARKER: &str = "+00s";

/// Timestamp layout after the zone marker is stripped.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// chrono accepts any fraction width (or none) for `%.f`, so the exact shape is
// checked separately.
static TIMESTAMP_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{6}$").unwrap());

static COUNTER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ysqlsh:.*?NOTICE:  \[(?P<timestamp>[^\]]*)\] counter: (?P<counter>\d+)").unwrap()
});

/// One decoded progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEvent {
    pub timestamp: DateTime<Utc>,
    pub counter: u64,
}

/// A line matched the counter pattern but its contents could not be decoded.
///
/// Both variants mean the log format is not the one this tool understands,
/// so callers treat them as fatal.
#[derive(Debug)]
pub enum ExtractError {
    Timestamp {
        raw: String,
        reason: String,
    },
    Counter {
        raw: String,
        source: std::num::ParseIntError,
    },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Timestamp { raw, reason } => write!(
                f,
                "log timestamp '{raw}' does not match YYYY-MM-DD HH:MM:SS.ffffff: {reason}"
            ),
            ExtractError::Counter { raw, source } => {
                write!(f, "counter value '{raw}' is not a valid u64: {source}")
            }
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Timestamp { .. } => None,
            ExtractError::Counter { source, .. } => Some(source),
        }
    }
}

/// Match a single log line.
///
/// Returns `Ok(None)` for lines that are not counter events.
pub fn extract(line: &str) -> Result<Option<CounterEvent>, ExtractError> {
    let Some(caps) = COUNTER_PATTERN.captures(line) else {
        return Ok(None);
    };

    let raw_counter = &caps["counter"];
    let counter = raw_counter
        .parse::<u64>()
        .map_err(|e| ExtractError::Counter {
            raw: raw_counter.to_string(),
            source: e,
        })?;
    let timestamp = parse_timestamp(&caps["timestamp"])?;

    Ok(Some(CounterEvent { timestamp, counter }))
}

/// Parse an embedded timestamp, stripping one trailing zone marker first.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ExtractError> {
    let stripped = raw.strip_suffix(ZONE_MARKER).unwrap_or(raw);
    if !TIMESTAMP_SHAPE.is_match(stripped) {
        return Err(ExtractError::Timestamp {
            raw: raw.to_string(),
            reason: "unexpected layout".to_string(),
        });
    }
    NaiveDateTime::parse_from_str(stripped, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| ExtractError::Timestamp {
            raw: raw.to_string(),
            reason: e.to_string(),
        })
}
