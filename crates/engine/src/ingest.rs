//! Real-time ingest path, invoked per message by the host's hook scripts.
//!
//! The hook hands over the role, the message text, the working directory, and
//! the path to the session's append-only log.  The full log is re-parsed to
//! locate the message and its predecessor — sequence positions (and therefore
//! IDs) only exist relative to the log's read order.
//!
//! Relationship fields this path cannot populate, by construction:
//! `next_message_id` of any entry, `feedback_message_id` of a solution, and
//! `related_solution_id` of feedback whose partner is not yet indexed.  The
//! chain back-fill owns those.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use hindsight_config::AppConfig;

use crate::enrich::Enricher;
use crate::error::{EngineError, EngineResult};
use crate::reader::TranscriptReader;
use crate::schema::Role;
use crate::store::{VectorStore, with_retry};

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub entry_id: String,
    pub session_id: String,
    pub sequence_position: u32,
    pub project_name: String,
    pub skipped_lines: usize,
    pub duration_ms: u64,
}

pub struct IngestPipeline {
    config: Arc<AppConfig>,
    store: Arc<dyn VectorStore>,
    enricher: Arc<Enricher>,
}

impl IngestPipeline {
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

    /// Index one message from the live session log.
    ///
    /// When `text` is given, the *last* log record with that role and text is
    /// the target (the host appends before invoking the hook); otherwise the
    /// last record with the role is taken.
    pub async fn index_message(
        &self,
        role: Role,
        text: Option<&str>,
        working_directory: &str,
        session_log: &Path,
        session_id: Option<&str>,
    ) -> EngineResult<IngestOutcome> {
        let started = Instant::now();

        let reader = match session_id {
            Some(id) => TranscriptReader::with_session_id(session_log, id),
            None => TranscriptReader::new(session_log),
        };
        let mut pass = reader
            .read()
            .map_err(|err| EngineError::validation(format!(
                "cannot open session log {}: {err}",
                session_log.display()
            )))?;
        let records: Vec<_> = pass.by_ref().collect();
        let skipped_lines = pass.skipped();

        if records.is_empty() {
            return Err(EngineError::not_found(format!(
                "session log {} has no parseable records",
                session_log.display()
            )));
        }

        let target_index = records
            .iter()
            .rposition(|record| {
                record.skeleton.role == role
                    && text.is_none_or(|t| record.skeleton.text == t)
            })
            .or_else(|| {
                // Host text can drift from the log (trimming, block joins);
                // fall back to the newest record with the right role.
                records.iter().rposition(|record| record.skeleton.role == role)
            })
            .ok_or_else(|| {
                EngineError::not_found(format!(
                    "no {} record found in {}",
                    role.as_str(),
                    session_log.display()
                ))
            })?;

        let mut entry = records[target_index].skeleton.clone();
        let (project_name, project_path) = self.config.resolve_project(working_directory);
        entry.project_name = project_name.clone();
        entry.project_path = project_path;

        // The predecessor must carry its own solution classification before
        // the feedback stage can consult it.
        let predecessor = match target_index.checked_sub(1) {
            Some(i) => {
                let mut prior = records[i].skeleton.clone();
                self.enricher.apply_text_features(&mut prior);
                self.enricher.apply_solution(&mut prior);
                Some(prior)
            }
            None => None,
        };

        // The backward link is known at hook time; the forward link and any
        // solution/feedback pairing wait for the back-fill.
        entry.previous_message_id = predecessor.as_ref().map(|p| p.id.clone());

        let entry = self.enricher.enrich(entry, predecessor.as_ref()).await;

        let ids = vec![entry.id.clone()];
        let texts = vec![entry.text.clone()];
        let metadatas = vec![entry.to_metadata()];
        with_retry("ingest upsert", 3, || {
            self.store.upsert(&ids, &texts, &metadatas)
        })
        .await?;

        let outcome = IngestOutcome {
            entry_id: entry.id.clone(),
            session_id: entry.session_id.clone(),
            sequence_position: entry.sequence_position,
            project_name,
            skipped_lines,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if skipped_lines > 0 {
            warn!(
                session = %outcome.session_id,
                skipped = skipped_lines,
                "session log contained malformed records"
            );
        }
        info!(
            id = %outcome.entry_id,
            session = %outcome.session_id,
            position = outcome.sequence_position,
            project = %outcome.project_name,
            duration_ms = outcome.duration_ms,
            "message indexed"
        );
        Ok(outcome)
    }
}

/// Project detection for the tool surface: mapped directories are
/// high-confidence, basename fallbacks are not.
pub fn detect_project(config: &AppConfig, working_directory: &str) -> (String, String, f32) {
    let mapped = config
        .projects
        .mapping
        .keys()
        .any(|prefix| working_directory.starts_with(prefix.as_str()));
    let (name, path) = config.resolve_project(working_directory);
    let confidence = if mapped { 0.9 } else { 0.5 };
    (name, path, confidence)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::schema::{ConversationEntry, MetaValue, Sentiment};
    use crate::store::Filter;
    use crate::store::memory::MemoryStore;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    async fn pipeline() -> (IngestPipeline, Arc<MemoryStore>) {
        let config = Arc::new(AppConfig::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let store = Arc::new(MemoryStore::new(embedder.clone()));
        let enricher = Arc::new(
            Enricher::build(&config.enrichment, embedder)
                .await
                .unwrap(),
        );
        (
            IngestPipeline::new(config, store.clone(), enricher),
            store,
        )
    }

    fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[tokio::test]
    async fn indexes_latest_message_with_predecessor_context() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "sess-a.jsonl",
            &[
                r#"{"role":"user","text":"the deploy fails","timestamp":"2025-06-01T10:00:00Z"}"#,
                r#"{"role":"assistant","text":"Run this:\n```\nsudo systemctl restart nginx\n```","timestamp":"2025-06-01T10:00:10Z"}"#,
                r#"{"role":"user","text":"that worked, thanks","timestamp":"2025-06-01T10:00:30Z"}"#,
            ],
        );

        let (pipeline, store) = pipeline().await;
        let outcome = pipeline
            .index_message(Role::User, Some("that worked, thanks"), "/home/dev/api", &log, None)
            .await
            .unwrap();

        assert_eq!(outcome.entry_id, "sess-a_user_3");
        assert_eq!(outcome.sequence_position, 3);

        let rows = store.get(&[outcome.entry_id.clone()]).await.unwrap();
        let entry =
            ConversationEntry::from_metadata(&rows[0].id, &rows[0].text, &rows[0].metadata);
        assert!(entry.is_feedback_to_solution);
        assert_eq!(entry.user_feedback_sentiment, Sentiment::Positive);
        // Relationship fields stay unset at hook time.
        assert!(entry.related_solution_id.is_none());
        assert!(entry.next_message_id.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_last_record_of_role_when_text_drifts() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "sess-b.jsonl",
            &[
                r#"{"role":"user","text":"original question","timestamp":"2025-06-01T10:00:00Z"}"#,
                r#"{"role":"assistant","text":"an answer","timestamp":"2025-06-01T10:00:05Z"}"#,
            ],
        );

        let (pipeline, _) = pipeline().await;
        let outcome = pipeline
            .index_message(Role::Assistant, Some("an answer (rendered)"), "/tmp/x", &log, None)
            .await
            .unwrap();
        assert_eq!(outcome.entry_id, "sess-b_assistant_2");
    }

    #[tokio::test]
    async fn missing_log_is_a_validation_error() {
        let (pipeline, _) = pipeline().await;
        let err = pipeline
            .index_message(Role::User, None, "/tmp", Path::new("/nonexistent/log.jsonl"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn reingesting_same_message_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "sess-c.jsonl",
            &[r#"{"role":"user","text":"hello","timestamp":"2025-06-01T10:00:00Z"}"#],
        );

        let (pipeline, store) = pipeline().await;
        pipeline
            .index_message(Role::User, Some("hello"), "/tmp", &log, None)
            .await
            .unwrap();
        pipeline
            .index_message(Role::User, Some("hello"), "/tmp", &log, None)
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let rows = store
            .get_where(&Filter::new().eq("session_id", "sess-c"), None)
            .await
            .unwrap();
        assert_eq!(
            rows[0].metadata.get("sequence_position"),
            Some(&MetaValue::Int(1))
        );
    }

    #[test]
    fn detect_project_reports_confidence() {
        let mut config = AppConfig::default();
        config
            .projects
            .mapping
            .insert("/home/dev/api".to_string(), "api-server".to_string());

        let (name, _, confidence) = detect_project(&config, "/home/dev/api/src");
        assert_eq!(name, "api-server");
        assert!(confidence > 0.8);

        let (_, _, fallback) = detect_project(&config, "/somewhere/else");
        assert!(fallback < 0.8);
    }
}
