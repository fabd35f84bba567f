//! Append-only session-log reader.
//!
//! Session logs are owned by the host: one JSONL file per session, one record
//! per line.  Two record shapes are tolerated — a flat
//! `{"role", "text"|"content", "timestamp"}` record and the host-nested
//! `{"type", "message": {"role", "content"}, "timestamp"}` shape where
//! `content` may be a list of text blocks.
//!
//! The reader is lazy, finite, and restartable: each [`TranscriptReader::read`]
//! call opens a fresh pass over the file.  Records are never re-ordered;
//! `sequence_position` is assigned by read order, 1-based, so entry IDs are
//! reproducible across passes.  Malformed lines are skipped and counted, never
//! aborting the sequence.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::schema::{ConversationEntry, Role};

/// One parsed transcript record: the entry skeleton plus the working
/// directory the host recorded for the message, when present.
#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    pub skeleton: ConversationEntry,
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscriptReader {
    path: PathBuf,
    session_id: String,
}

impl TranscriptReader {
    /// Reader for `path`, with the session ID taken from the file stem.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown-session".to_string());
        Self { path, session_id }
    }

    pub fn with_session_id(path: impl AsRef<Path>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a fresh pass over the log.
    pub fn read(&self) -> std::io::Result<ReadPass> {
        let file = File::open(&self.path)?;
        Ok(ReadPass {
            lines: BufReader::new(file).lines(),
            session_id: self.session_id.clone(),
            path: self.path.clone(),
            next_position: 1,
            skipped: 0,
        })
    }
}

/// A single lazy pass over a session log.
pub struct ReadPass {
    lines: Lines<BufReader<File>>,
    session_id: String,
    path: PathBuf,
    next_position: u32,
    skipped: usize,
}

impl ReadPass {
    /// Lines skipped so far because they could not be parsed into a record.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for ReadPass {
    type Item = TranscriptRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "unreadable transcript line — skipping");
                    self.skipped += 1;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_line(&line, &self.session_id, self.next_position) {
                Some(record) => {
                    self.next_position += 1;
                    return Some(record);
                }
                None => {
                    self.skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        position = self.next_position,
                        "malformed transcript record — skipping"
                    );
                }
            }
        }
    }
}

fn parse_line(line: &str, session_id: &str, position: u32) -> Option<TranscriptRecord> {
    let value: Value = serde_json::from_str(line).ok()?;

    let role = extract_role(&value)?;
    let text = extract_text(&value)?;
    let timestamp = extract_timestamp(&value)?;

    let skeleton = ConversationEntry::skeleton(session_id, role, position, text, timestamp);
    let working_directory = value
        .get("cwd")
        .or_else(|| value.get("working_directory"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(TranscriptRecord {
        skeleton,
        working_directory,
    })
}

fn extract_role(value: &Value) -> Option<Role> {
    let raw = value
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| {
            value
                .get("message")
                .and_then(|m| m.get("role"))
                .and_then(Value::as_str)
        })
        .or_else(|| value.get("type").and_then(Value::as_str))?;
    Role::parse(raw)
}

fn extract_text(value: &Value) -> Option<String> {
    let content = value
        .get("text")
        .or_else(|| value.get("content"))
        .or_else(|| value.get("message").and_then(|m| m.get("content")))?;

    match content {
        Value::String(s) => Some(s.clone()),
        // Block lists: join the text blocks, ignore tool-use blocks.
        Value::Array(blocks) => {
            let joined = blocks
                .iter()
                .filter_map(|block| {
                    block
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|_| block.get("type").and_then(Value::as_str) != Some("tool_use"))
                })
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() { None } else { Some(joined) }
        }
        _ => None,
    }
}

fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.get("timestamp").or_else(|| value.get("ts"))?;
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                n.as_f64()
                    .and_then(|f| DateTime::from_timestamp(f as i64, 0))
            }
        }
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sess-reader.jsonl");
        let mut file = File::create(&path).expect("create log");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        (dir, path)
    }

    #[test]
    fn reads_flat_records_in_order() {
        let (_dir, path) = write_log(&[
            r#"{"role":"user","text":"how do I fix this?","timestamp":"2025-06-01T10:00:00Z"}"#,
            r#"{"role":"assistant","text":"try reinstalling","timestamp":"2025-06-01T10:00:05Z"}"#,
        ]);

        let reader = TranscriptReader::new(&path);
        let records: Vec<_> = reader.read().unwrap().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].skeleton.id, "sess-reader_user_1");
        assert_eq!(records[1].skeleton.id, "sess-reader_assistant_2");
        assert_eq!(records[1].skeleton.sequence_position, 2);
    }

    #[test]
    fn reads_nested_host_records_with_block_content() {
        let (_dir, path) = write_log(&[
            r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"deploy please"}]},"timestamp":"2025-06-01T10:00:00Z","cwd":"/home/dev/api"}"#,
        ]);

        let reader = TranscriptReader::new(&path);
        let records: Vec<_> = reader.read().unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].skeleton.text, "deploy please");
        assert_eq!(records[0].working_directory.as_deref(), Some("/home/dev/api"));
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let (_dir, path) = write_log(&[
            r#"{"role":"user","text":"first","timestamp":"2025-06-01T10:00:00Z"}"#,
            "not json at all",
            r#"{"role":"user","timestamp":"2025-06-01T10:00:01Z"}"#,
            r#"{"role":"assistant","text":"second","timestamp":"2025-06-01T10:00:02Z"}"#,
        ]);

        let reader = TranscriptReader::new(&path);
        let mut pass = reader.read().unwrap();
        let records: Vec<_> = pass.by_ref().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(pass.skipped(), 2);
        // Positions stay contiguous over *parsed* records.
        assert_eq!(records[0].skeleton.sequence_position, 1);
        assert_eq!(records[1].skeleton.sequence_position, 2);
    }

    #[test]
    fn two_passes_yield_identical_ids() {
        let (_dir, path) = write_log(&[
            r#"{"role":"user","text":"a","timestamp":"2025-06-01T10:00:00Z"}"#,
            "garbage",
            r#"{"role":"assistant","text":"b","timestamp":"2025-06-01T10:00:01Z"}"#,
        ]);

        let reader = TranscriptReader::new(&path);
        let first: Vec<String> = reader.read().unwrap().map(|r| r.skeleton.id).collect();
        let second: Vec<String> = reader.read().unwrap().map(|r| r.skeleton.id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn numeric_timestamps_are_accepted() {
        let (_dir, path) = write_log(&[r#"{"role":"user","text":"hi","timestamp":1748772000}"#]);
        let reader = TranscriptReader::new(&path);
        let records: Vec<_> = reader.read().unwrap().collect();
        assert_eq!(records[0].skeleton.timestamp_unix, 1_748_772_000);
    }
}
