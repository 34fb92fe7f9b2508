//! Tracing setup and read-back of the JSON log file.
//!
//! Every event goes to stdout in the human format and, once the state
//! directory exists, is also appended to `logs.jsonl` as one JSON object per
//! line.  The admin console's Logs tab reads the tail of that file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Install the global subscriber.  `RUST_LOG` overrides the default `info`
/// filter.  Must be called at most once per process.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Read-back
// ---------------------------------------------------------------------------

/// One line of `logs.jsonl`, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    /// Remaining structured fields as `key=value` pairs.
    pub detail: String,
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl From<RawLine> for LogEntry {
    fn from(mut raw: RawLine) -> Self {
        let message = match raw.fields.remove("message") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let detail = raw
            .fields
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(" ");

        // "2026-01-02T03:04:05.123456Z" -> "2026-01-02 03:04:05"
        let timestamp = raw
            .timestamp
            .get(..19)
            .map(|t| t.replacen('T', " ", 1))
            .unwrap_or(raw.timestamp);

        Self {
            timestamp,
            level: raw.level,
            message,
            detail,
        }
    }
}

/// Bytes read per backwards step through the log file.
const TAIL_CHUNK: u64 = 64 * 1024;
/// Most bytes scanned from the end of the log file for one tail.
const TAIL_MAX_SCAN: u64 = 4 * 1024 * 1024;

/// The last `limit` parseable entries of the log at `path`, oldest first.
/// A missing file yields no entries; unparseable lines are skipped.  Only the
/// end of the file is read, so the cost does not grow with the log.
pub fn tail(path: &Path, limit: usize) -> Result<Vec<LogEntry>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open log file {}", path.display()))
        }
    };
    let bytes = read_last_lines(&mut file, limit, TAIL_MAX_SCAN)
        .with_context(|| format!("failed to read log file {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    let mut entries: Vec<LogEntry> = text
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<RawLine>(line).ok())
        .take(limit)
        .map(LogEntry::from)
        .collect();
    entries.reverse();
    Ok(entries)
}

/// Read whole lines from the end of `file` until more than `lines` newlines
/// are buffered, the start of the file is reached or `max_scan` bytes have
/// been read.  A leading partial line is dropped.
fn read_last_lines(file: &mut File, lines: usize, max_scan: u64) -> io::Result<Vec<u8>> {
    let len = file.metadata()?.len();
    let floor = len.saturating_sub(max_scan);
    let mut start = len;
    let mut buf = Vec::new();

    while start > floor {
        let next = start.saturating_sub(TAIL_CHUNK).max(floor);
        let mut chunk = vec![0u8; (start - next) as usize];
        file.seek(SeekFrom::Start(next))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        start = next;
        if buf.iter().filter(|&&b| b == b'\n').count() > lines {
            break;
        }
    }

    if start > 0 {
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => drop(buf.drain(..=i)),
            None => buf.clear(),
        }
    }
    Ok(buf)
}
