//! Canonical conversation-entry record and its metadata codec.
//!
//! Entry IDs are deterministic — `{session_id}_{role}_{sequence_position}` —
//! and every cross-entry link uses them.  Downstream components never
//! re-derive an ID from message text; IDs read back from the store are the
//! ground truth for updates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Role / sentiment / category enums ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Partial,
    #[default]
    None,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Partial => "partial",
            Sentiment::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Sentiment> {
        match value {
            "positive" => Some(Sentiment::Positive),
            "negative" => Some(Sentiment::Negative),
            "partial" => Some(Sentiment::Partial),
            "none" => Some(Sentiment::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionCategory {
    CodeEdit,
    Command,
    Config,
    Explanation,
    Guidance,
}

impl SolutionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolutionCategory::CodeEdit => "code_edit",
            SolutionCategory::Command => "command",
            SolutionCategory::Config => "config",
            SolutionCategory::Explanation => "explanation",
            SolutionCategory::Guidance => "guidance",
        }
    }

    pub fn parse(value: &str) -> Option<SolutionCategory> {
        match value {
            "code_edit" => Some(SolutionCategory::CodeEdit),
            "command" => Some(SolutionCategory::Command),
            "config" => Some(SolutionCategory::Config),
            "explanation" => Some(SolutionCategory::Explanation),
            "guidance" => Some(SolutionCategory::Guidance),
            _ => None,
        }
    }
}

// ── Deterministic ID scheme ──────────────────────────────────────────────────

/// Stable entry ID: `{session_id}_{role}_{sequence_position}`.
pub fn entry_id(session_id: &str, role: Role, sequence_position: u32) -> String {
    format!("{session_id}_{}_{sequence_position}", role.as_str())
}

// ── Metadata values ──────────────────────────────────────────────────────────

/// Primitive scalar accepted by the vector store's metadata record.  List and
/// map fields are JSON-encoded into `Str` by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            MetaValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Float(f) => Some(*f),
            MetaValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

// ── ConversationEntry ────────────────────────────────────────────────────────

/// A single message in a session, fully annotated.
///
/// Created by the ingest path or the batch orchestrator; mutated only by the
/// chain back-fill, the selective re-processor, and the feedback learner.
/// Never deleted by the core (reindex is remove-by-session-then-reinsert).
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    // Identity
    pub id: String,
    pub session_id: String,
    pub sequence_position: u32,
    pub role: Role,

    // Content
    pub text: String,
    pub content_length: usize,
    pub has_code: bool,
    pub tools_used: Vec<String>,

    // Time
    pub timestamp_iso: String,
    pub timestamp_unix: i64,

    // Project
    pub project_name: String,
    pub project_path: String,

    // Topics
    pub detected_topics: BTreeMap<String, f32>,

    // Solution signals (assistant entries only)
    pub is_solution_attempt: bool,
    pub solution_category: Option<SolutionCategory>,
    pub solution_quality_score: f32,

    // Feedback signals (user entries only)
    pub is_feedback_to_solution: bool,
    pub user_feedback_sentiment: Sentiment,
    pub validation_strength: f32,

    // Relationships (populated by back-fill)
    pub previous_message_id: Option<String>,
    pub next_message_id: Option<String>,
    pub related_solution_id: Option<String>,
    pub feedback_message_id: Option<String>,

    // Processing markers
    pub backfill_processed: bool,
    pub field_reprocessing_timestamp: Option<String>,
    pub field_reprocessing_fields: Vec<String>,

    /// Unknown metadata fields read back from the store.  Preserved verbatim
    /// so an update never silently drops what another writer recorded.
    pub extra: Metadata,
}

impl ConversationEntry {
    /// Build an un-enriched skeleton.  `sequence_position` is 1-based and
    /// assigned by the transcript reader's read order.
    pub fn skeleton(
        session_id: impl Into<String>,
        role: Role,
        sequence_position: u32,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let session_id = session_id.into();
        let text = text.into();
        Self {
            id: entry_id(&session_id, role, sequence_position),
            session_id,
            sequence_position,
            role,
            content_length: text.len(),
            text,
            has_code: false,
            tools_used: Vec::new(),
            timestamp_iso: timestamp.to_rfc3339(),
            timestamp_unix: timestamp.timestamp(),
            project_name: String::new(),
            project_path: String::new(),
            detected_topics: BTreeMap::new(),
            is_solution_attempt: false,
            solution_category: None,
            solution_quality_score: 1.0,
            is_feedback_to_solution: false,
            user_feedback_sentiment: Sentiment::None,
            validation_strength: 0.0,
            previous_message_id: None,
            next_message_id: None,
            related_solution_id: None,
            feedback_message_id: None,
            backfill_processed: false,
            field_reprocessing_timestamp: None,
            field_reprocessing_fields: Vec::new(),
            extra: Metadata::new(),
        }
    }

    // ── Codec: entry → store metadata ────────────────────────────────────────

    pub fn to_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("session_id".into(), MetaValue::Str(self.session_id.clone()));
        meta.insert(
            "sequence_position".into(),
            MetaValue::Int(i64::from(self.sequence_position)),
        );
        meta.insert("type".into(), MetaValue::Str(self.role.as_str().to_string()));
        meta.insert(
            "content_length".into(),
            MetaValue::Int(self.content_length as i64),
        );
        meta.insert("has_code".into(), MetaValue::Bool(self.has_code));
        meta.insert(
            "tools_used".into(),
            MetaValue::Str(json_list(&self.tools_used)),
        );
        meta.insert(
            "timestamp_iso".into(),
            MetaValue::Str(self.timestamp_iso.clone()),
        );
        meta.insert("timestamp_unix".into(), MetaValue::Int(self.timestamp_unix));
        meta.insert(
            "project_name".into(),
            MetaValue::Str(self.project_name.clone()),
        );
        meta.insert(
            "project_path".into(),
            MetaValue::Str(self.project_path.clone()),
        );
        meta.insert(
            "detected_topics".into(),
            MetaValue::Str(
                serde_json::to_string(&self.detected_topics).unwrap_or_else(|_| "{}".into()),
            ),
        );
        meta.insert(
            "is_solution_attempt".into(),
            MetaValue::Bool(self.is_solution_attempt),
        );
        if let Some(category) = self.solution_category {
            meta.insert(
                "solution_category".into(),
                MetaValue::Str(category.as_str().to_string()),
            );
        }
        meta.insert(
            "solution_quality_score".into(),
            MetaValue::Float(f64::from(self.solution_quality_score)),
        );
        meta.insert(
            "is_feedback_to_solution".into(),
            MetaValue::Bool(self.is_feedback_to_solution),
        );
        meta.insert(
            "user_feedback_sentiment".into(),
            MetaValue::Str(self.user_feedback_sentiment.as_str().to_string()),
        );
        meta.insert(
            "validation_strength".into(),
            MetaValue::Float(f64::from(self.validation_strength)),
        );
        for (key, value) in [
            ("previous_message_id", &self.previous_message_id),
            ("next_message_id", &self.next_message_id),
            ("related_solution_id", &self.related_solution_id),
            ("feedback_message_id", &self.feedback_message_id),
        ] {
            if let Some(id) = value {
                meta.insert(key.into(), MetaValue::Str(id.clone()));
            }
        }
        meta.insert(
            "backfill_processed".into(),
            MetaValue::Bool(self.backfill_processed),
        );
        if let Some(ts) = &self.field_reprocessing_timestamp {
            meta.insert(
                "field_reprocessing_timestamp".into(),
                MetaValue::Str(ts.clone()),
            );
        }
        if !self.field_reprocessing_fields.is_empty() {
            meta.insert(
                "field_reprocessing_fields".into(),
                MetaValue::Str(json_list(&self.field_reprocessing_fields)),
            );
        }

        // Unknown fields ride along unchanged; known keys always win.
        for (key, value) in &self.extra {
            meta.entry(key.clone()).or_insert_with(|| value.clone());
        }
        meta
    }

    // ── Codec: store metadata → entry ────────────────────────────────────────

    /// Rebuild an entry from a stored row.  Unknown keys land in `extra` —
    /// silently dropping them on a later update is forbidden.
    pub fn from_metadata(id: &str, text: &str, meta: &Metadata) -> Self {
        let get_str = |key: &str| meta.get(key).and_then(MetaValue::as_str);
        let get_bool = |key: &str| meta.get(key).and_then(MetaValue::as_bool).unwrap_or(false);

        let session_id = get_str("session_id").unwrap_or_default().to_string();
        let role = get_str("type")
            .and_then(Role::parse)
            .unwrap_or(Role::Assistant);
        let sequence_position = meta
            .get("sequence_position")
            .and_then(MetaValue::as_i64)
            .unwrap_or(0) as u32;

        let known = [
            "session_id",
            "sequence_position",
            "type",
            "content_length",
            "has_code",
            "tools_used",
            "timestamp_iso",
            "timestamp_unix",
            "project_name",
            "project_path",
            "detected_topics",
            "is_solution_attempt",
            "solution_category",
            "solution_quality_score",
            "is_feedback_to_solution",
            "user_feedback_sentiment",
            "validation_strength",
            "previous_message_id",
            "next_message_id",
            "related_solution_id",
            "feedback_message_id",
            "backfill_processed",
            "field_reprocessing_timestamp",
            "field_reprocessing_fields",
        ];
        let extra: Metadata = meta
            .iter()
            .filter(|(key, _)| !known.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            id: id.to_string(),
            session_id,
            sequence_position,
            role,
            text: text.to_string(),
            content_length: meta
                .get("content_length")
                .and_then(MetaValue::as_i64)
                .unwrap_or(text.len() as i64) as usize,
            has_code: get_bool("has_code"),
            tools_used: get_str("tools_used").map(parse_json_list).unwrap_or_default(),
            timestamp_iso: get_str("timestamp_iso").unwrap_or_default().to_string(),
            timestamp_unix: meta
                .get("timestamp_unix")
                .and_then(MetaValue::as_i64)
                .unwrap_or(0),
            project_name: get_str("project_name").unwrap_or_default().to_string(),
            project_path: get_str("project_path").unwrap_or_default().to_string(),
            detected_topics: get_str("detected_topics")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            is_solution_attempt: get_bool("is_solution_attempt"),
            solution_category: get_str("solution_category").and_then(SolutionCategory::parse),
            solution_quality_score: meta
                .get("solution_quality_score")
                .and_then(MetaValue::as_f64)
                .unwrap_or(1.0) as f32,
            is_feedback_to_solution: get_bool("is_feedback_to_solution"),
            user_feedback_sentiment: get_str("user_feedback_sentiment")
                .and_then(Sentiment::parse)
                .unwrap_or_default(),
            validation_strength: meta
                .get("validation_strength")
                .and_then(MetaValue::as_f64)
                .unwrap_or(0.0) as f32,
            previous_message_id: get_str("previous_message_id").map(str::to_string),
            next_message_id: get_str("next_message_id").map(str::to_string),
            related_solution_id: get_str("related_solution_id").map(str::to_string),
            feedback_message_id: get_str("feedback_message_id").map(str::to_string),
            backfill_processed: get_bool("backfill_processed"),
            field_reprocessing_timestamp: get_str("field_reprocessing_timestamp")
                .map(str::to_string),
            field_reprocessing_fields: get_str("field_reprocessing_fields")
                .map(parse_json_list)
                .unwrap_or_default(),
            extra,
        }
    }

    /// Strongest detected topic, if any.
    pub fn top_topic(&self) -> Option<(&str, f32)> {
        self.detected_topics
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, score)| (name.as_str(), *score))
    }
}

fn json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Truncate for log/preview output, appending `…` when cut.
pub fn truncate_str(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> ConversationEntry {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut entry = ConversationEntry::skeleton("sess-42", Role::Assistant, 3, "run cargo test", ts);
        entry.has_code = true;
        entry.tools_used = vec!["Bash".to_string()];
        entry.project_name = "api-server".to_string();
        entry.project_path = "/home/dev/api".to_string();
        entry.detected_topics.insert("testing".to_string(), 0.8);
        entry.is_solution_attempt = true;
        entry.solution_category = Some(SolutionCategory::Command);
        entry.solution_quality_score = 1.4;
        entry.previous_message_id = Some("sess-42_user_2".to_string());
        entry
    }

    #[test]
    fn id_is_deterministic() {
        assert_eq!(entry_id("abc", Role::User, 1), "abc_user_1");
        assert_eq!(entry_id("abc", Role::Assistant, 12), "abc_assistant_12");
        assert_eq!(
            entry_id("abc", Role::User, 1),
            entry_id("abc", Role::User, 1)
        );
    }

    #[test]
    fn metadata_round_trip_preserves_all_fields() {
        let entry = sample();
        let meta = entry.to_metadata();
        let back = ConversationEntry::from_metadata(&entry.id, &entry.text, &meta);
        assert_eq!(back, entry);
    }

    #[test]
    fn unknown_metadata_fields_survive_round_trip() {
        let entry = sample();
        let mut meta = entry.to_metadata();
        meta.insert(
            "host_specific_marker".to_string(),
            MetaValue::Str("kept".to_string()),
        );

        let back = ConversationEntry::from_metadata(&entry.id, &entry.text, &meta);
        assert_eq!(
            back.extra.get("host_specific_marker").and_then(MetaValue::as_str),
            Some("kept")
        );

        let meta_again = back.to_metadata();
        assert_eq!(
            meta_again.get("host_specific_marker").and_then(MetaValue::as_str),
            Some("kept")
        );
    }

    #[test]
    fn absent_relationship_fields_are_omitted_from_metadata() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let entry = ConversationEntry::skeleton("s", Role::User, 1, "hi", ts);
        let meta = entry.to_metadata();
        assert!(!meta.contains_key("next_message_id"));
        assert!(!meta.contains_key("related_solution_id"));
        assert!(!meta.contains_key("solution_category"));
    }

    #[test]
    fn skeleton_captures_length_and_timestamps() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let entry = ConversationEntry::skeleton("s", Role::User, 1, "hello", ts);
        assert_eq!(entry.content_length, 5);
        assert_eq!(entry.timestamp_unix, ts.timestamp());
        assert!(entry.timestamp_iso.starts_with("2025-06-01T12:00:00"));
    }

    #[test]
    fn top_topic_picks_highest_confidence() {
        let mut entry = sample();
        entry.detected_topics.insert("debugging".to_string(), 0.9);
        assert_eq!(entry.top_topic(), Some(("debugging", 0.9)));
    }

    #[test]
    fn truncate_str_appends_ellipsis() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a longer string", 8), "a longer…");
    }
}
