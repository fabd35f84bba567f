//! Selective field re-processor: re-run specific enrichment stages against
//! stored text + predecessor, without touching anything else.
//!
//! This is the sanctioned alternative to destructive rebuilds.  Field sets
//! are dependency-closed (`solution_category` implies `is_solution_attempt`,
//! feedback fields imply `is_feedback_to_solution`), original values are
//! snapshotted to a backup file before any write, and entries whose
//! re-derived values are unchanged are not rewritten — a second pass with the
//! same logic is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use hindsight_config::AppConfig;

use crate::enrich::Enricher;
use crate::error::{EngineError, EngineResult};
use crate::schema::{ConversationEntry, MetaValue, Sentiment};
use crate::store::{Filter, VectorStore, with_retry};

const TEXT_FIELDS: &[&str] = &["has_code", "tools_used", "content_length"];
const TOPIC_FIELDS: &[&str] = &["detected_topics"];
const SOLUTION_FIELDS: &[&str] = &["is_solution_attempt", "solution_category"];
const FEEDBACK_FIELDS: &[&str] = &[
    "is_feedback_to_solution",
    "user_feedback_sentiment",
    "validation_strength",
];

#[derive(Debug, Clone)]
pub struct ReprocessOptions {
    pub fields: Vec<String>,
    pub session_id: Option<String>,
    pub max_sessions: Option<usize>,
    pub create_backup: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReprocessReport {
    pub fields: Vec<String>,
    pub sessions_processed: usize,
    pub entries_examined: usize,
    pub entries_updated: usize,
    pub backup_path: Option<PathBuf>,
    pub errors: Vec<String>,
}

pub struct FieldReprocessor {
    config: Arc<AppConfig>,
    store: Arc<dyn VectorStore>,
    enricher: Arc<Enricher>,
}

impl FieldReprocessor {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn VectorStore>,
        enricher: Arc<Enricher>,
    ) -> Self {
        Self {
            config,
            store,
            enricher,
        }
    }

    pub fn reprocessable_fields() -> Vec<&'static str> {
        TEXT_FIELDS
            .iter()
            .chain(TOPIC_FIELDS)
            .chain(SOLUTION_FIELDS)
            .chain(FEEDBACK_FIELDS)
            .copied()
            .collect()
    }

    /// Dependency-close a requested field set; unknown names are rejected
    /// with the accepted set enumerated.
    pub fn closure(fields: &[String]) -> EngineResult<BTreeSet<String>> {
        let known = Self::reprocessable_fields();
        let mut closed = BTreeSet::new();
        for field in fields {
            if !known.contains(&field.as_str()) {
                return Err(EngineError::validation(format!(
                    "unknown field '{field}', accepted: {known:?}"
                )));
            }
            closed.insert(field.clone());
        }

        if closed.contains("solution_category") {
            closed.insert("is_solution_attempt".to_string());
        }
        if closed.contains("user_feedback_sentiment") || closed.contains("validation_strength") {
            closed.insert("is_feedback_to_solution".to_string());
        }
        // Sentiment and strength always travel together.
        if closed.contains("is_feedback_to_solution") {
            closed.insert("user_feedback_sentiment".to_string());
            closed.insert("validation_strength".to_string());
        }
        if closed.is_empty() {
            return Err(EngineError::validation("no fields requested"));
        }
        Ok(closed)
    }

    pub async fn run(&self, options: &ReprocessOptions) -> EngineResult<ReprocessReport> {
        let fields = Self::closure(&options.fields)?;
        let mut report = ReprocessReport {
            fields: fields.iter().cloned().collect(),
            ..ReprocessReport::default()
        };

        let sessions = match &options.session_id {
            Some(session) => vec![session.clone()],
            None => self.session_ids().await?,
        };
        let sessions: Vec<String> = sessions
            .into_iter()
            .take(options.max_sessions.unwrap_or(usize::MAX))
            .collect();

        // Collect every planned change first so the backup covers the whole
        // run, then write.
        let mut updates: Vec<(String, crate::schema::Metadata)> = Vec::new();
        let mut backup_entries = serde_json::Map::new();

        for session_id in &sessions {
            match self
                .reprocess_session(session_id, &fields, &mut backup_entries, &mut updates)
                .await
            {
                Ok(examined) => {
                    report.sessions_processed += 1;
                    report.entries_examined += examined;
                }
                Err(err) => report.errors.push(format!("{session_id}: {err}")),
            }
        }

        if options.create_backup && !updates.is_empty() {
            report.backup_path = Some(self.write_backup(&fields, backup_entries)?);
        }

        for chunk in updates.chunks(self.config.store.update_batch_limit.max(1)) {
            let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
            let metas: Vec<_> = chunk.iter().map(|(_, meta)| meta.clone()).collect();
            with_retry("reprocess update", 3, || self.store.update(&ids, &metas)).await?;
            report.entries_updated += ids.len();
        }

        info!(
            sessions = report.sessions_processed,
            examined = report.entries_examined,
            updated = report.entries_updated,
            backup = ?report.backup_path,
            "field re-processing complete"
        );
        Ok(report)
    }

    async fn session_ids(&self) -> EngineResult<Vec<String>> {
        let rows = self
            .store
            .get_where(&Filter::new(), Some(&["session_id"]))
            .await?;
        let unique: BTreeSet<String> = rows
            .into_iter()
            .filter_map(|row| {
                row.metadata
                    .get("session_id")
                    .and_then(|v| v.as_str().map(str::to_string))
            })
            .collect();
        Ok(unique.into_iter().collect())
    }

    async fn reprocess_session(
        &self,
        session_id: &str,
        fields: &BTreeSet<String>,
        backup_entries: &mut serde_json::Map<String, serde_json::Value>,
        updates: &mut Vec<(String, crate::schema::Metadata)>,
    ) -> EngineResult<usize> {
        let rows = self
            .store
            .get_where(&Filter::new().eq("session_id", session_id), None)
            .await?;
        if rows.is_empty() {
            return Err(EngineError::not_found(format!(
                "no entries stored for session {session_id}"
            )));
        }

        let mut entries: Vec<ConversationEntry> = rows
            .iter()
            .map(|row| ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata))
            .collect();
        entries.sort_by(|a, b| {
            a.timestamp_unix
                .cmp(&b.timestamp_unix)
                .then(a.sequence_position.cmp(&b.sequence_position))
        });

        let mut predecessor: Option<ConversationEntry> = None;
        let examined = entries.len();
        for original in entries {
            let reworked = self
                .rederive(original.clone(), predecessor.as_ref(), fields)
                .await;

            if reworked != original {
                let mut stamped = reworked.clone();
                stamped.field_reprocessing_timestamp = Some(Utc::now().to_rfc3339());
                stamped.field_reprocessing_fields = fields.iter().cloned().collect();

                backup_entries.insert(
                    original.id.clone(),
                    snapshot_fields(&original, fields),
                );
                updates.push((stamped.id.clone(), stamped.to_metadata()));
                debug!(id = %original.id, "entry re-derived with changed fields");
                predecessor = Some(reworked);
            } else {
                predecessor = Some(original);
            }
        }
        Ok(examined)
    }

    /// Re-run only the stages that produce the requested fields, then graft
    /// the requested fields back onto the original so nothing else moves.
    async fn rederive(
        &self,
        original: ConversationEntry,
        predecessor: Option<&ConversationEntry>,
        fields: &BTreeSet<String>,
    ) -> ConversationEntry {
        let mut scratch = original.clone();

        if fields.iter().any(|f| TEXT_FIELDS.contains(&f.as_str())) {
            self.enricher.apply_text_features(&mut scratch);
        }
        if fields.iter().any(|f| TOPIC_FIELDS.contains(&f.as_str())) {
            self.enricher.apply_topics(&mut scratch);
        }
        if fields.iter().any(|f| SOLUTION_FIELDS.contains(&f.as_str())) {
            scratch.is_solution_attempt = false;
            scratch.solution_category = None;
            self.enricher.apply_solution(&mut scratch);
        }
        if fields.iter().any(|f| FEEDBACK_FIELDS.contains(&f.as_str())) {
            scratch.is_feedback_to_solution = false;
            scratch.user_feedback_sentiment = Sentiment::None;
            scratch.validation_strength = 0.0;
            self.enricher.apply_feedback(&mut scratch, predecessor).await;
        }

        let mut result = original;
        for field in fields {
            match field.as_str() {
                "has_code" => result.has_code = scratch.has_code,
                "tools_used" => result.tools_used = scratch.tools_used.clone(),
                "content_length" => result.content_length = scratch.content_length,
                "detected_topics" => result.detected_topics = scratch.detected_topics.clone(),
                "is_solution_attempt" => result.is_solution_attempt = scratch.is_solution_attempt,
                "solution_category" => result.solution_category = scratch.solution_category,
                "is_feedback_to_solution" => {
                    result.is_feedback_to_solution = scratch.is_feedback_to_solution
                }
                "user_feedback_sentiment" => {
                    result.user_feedback_sentiment = scratch.user_feedback_sentiment
                }
                "validation_strength" => result.validation_strength = scratch.validation_strength,
                _ => {}
            }
        }
        result
    }

    fn write_backup(
        &self,
        fields: &BTreeSet<String>,
        entries: serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<PathBuf> {
        let dir = Path::new(&self.config.store.path).join("backups");
        std::fs::create_dir_all(&dir)
            .map_err(|err| EngineError::internal(format!("creating backup dir: {err}")))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let path = dir.join(format!("reprocess-backup-{stamp}.json"));
        let document = json!({
            "created_at": Utc::now().to_rfc3339(),
            "fields": fields.iter().collect::<Vec<_>>(),
            "entries": entries,
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&document).unwrap_or_default())
            .map_err(|err| EngineError::internal(format!("writing backup: {err}")))?;
        Ok(path)
    }
}

fn snapshot_fields(entry: &ConversationEntry, fields: &BTreeSet<String>) -> serde_json::Value {
    let metadata = entry.to_metadata();
    let snapshot: BTreeMap<&String, serde_json::Value> = fields
        .iter()
        .map(|field| {
            let value = metadata
                .get(field)
                .map(|v| match v {
                    MetaValue::Bool(b) => json!(b),
                    MetaValue::Int(i) => json!(i),
                    MetaValue::Float(f) => json!(f),
                    MetaValue::Str(s) => json!(s),
                })
                .unwrap_or(serde_json::Value::Null);
            (field, value)
        })
        .collect();
    json!(snapshot)
}

// ── Tests ────────────────────────────────────────────────────────────────────
