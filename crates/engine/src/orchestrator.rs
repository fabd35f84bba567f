//! Batch orchestrator: rebuilds or back-fills the store from raw session
//! logs.
//!
//! Each log is probed before any work happens: fully indexed sessions are
//! skipped, sessions missing enriched metadata are re-enriched in place, and
//! missing or partial sessions are wiped (by session filter) and re-read end
//! to end.  Enrichment runs on a bounded worker pool; upserts are chunked to
//! the store's batch limit, so an interrupted run resumes cleanly — upsert by
//! deterministic ID is idempotent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use hindsight_config::AppConfig;

use crate::backfill::{BackfillReport, ChainBackfill};
use crate::enrich::Enricher;
use crate::error::{EngineError, EngineResult};
use crate::reader::TranscriptReader;
use crate::schema::ConversationEntry;
use crate::store::{Filter, VectorStore, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    FullyIndexed,
    NeedsMetadataEnhancement,
    NeedsReindex,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::FullyIndexed => "fully_indexed",
            SessionState::NeedsMetadataEnhancement => "needs_metadata_enhancement",
            SessionState::NeedsReindex => "needs_reindex",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSyncStats {
    pub session_id: String,
    pub state: SessionState,
    pub entries_processed: usize,
    pub enrichment_errors: usize,
    pub skipped_lines: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub sessions_scanned: usize,
    pub sessions_reindexed: usize,
    pub sessions_enhanced: usize,
    pub sessions_skipped: usize,
    pub entries_indexed: usize,
    pub per_session: Vec<SessionSyncStats>,
    pub backfill: BackfillReport,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    /// Overall success means at least one session made it through (or there
    /// was nothing to do).
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() || self.sessions_scanned > self.errors.len()
    }
}

pub struct BatchOrchestrator {
    config: Arc<AppConfig>,
    store: Arc<dyn VectorStore>,
    enricher: Arc<Enricher>,
}

impl BatchOrchestrator {
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

    /// All session logs under the configured root, sorted for reproducible
    /// run order.
    pub fn discover_logs(&self) -> Vec<PathBuf> {
        let root = Path::new(&self.config.projects.session_log_root);
        let mut logs: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .map(|e| e.into_path())
            .collect();
        logs.sort();
        logs
    }

    /// Probe a session's state without mutating anything: check the first and
    /// last expected entry IDs for presence plus the enrichment markers.
    pub async fn probe_session(&self, log: &Path) -> EngineResult<SessionState> {
        let reader = TranscriptReader::new(log);
        let mut pass = reader.read().map_err(|err| {
            EngineError::validation(format!("cannot open {}: {err}", log.display()))
        })?;

        let mut first_id: Option<String> = None;
        let mut last_id: Option<String> = None;
        let mut count = 0usize;
        for record in pass.by_ref() {
            if first_id.is_none() {
                first_id = Some(record.skeleton.id.clone());
            }
            last_id = Some(record.skeleton.id);
            count += 1;
        }

        let (Some(first_id), Some(last_id)) = (first_id, last_id) else {
            // An empty log has nothing to index.
            return Ok(SessionState::FullyIndexed);
        };

        let probe_ids = if first_id == last_id {
            vec![first_id.clone()]
        } else {
            vec![first_id.clone(), last_id.clone()]
        };
        let rows = self.store.get(&probe_ids).await?;
        if rows.len() != probe_ids.len() {
            return Ok(SessionState::NeedsReindex);
        }

        let enriched = rows.iter().all(|row| {
            row.metadata.contains_key("detected_topics")
                && row.metadata.contains_key("solution_quality_score")
        });
        if !enriched {
            return Ok(SessionState::NeedsMetadataEnhancement);
        }

        // The last entry of a multi-message session gets its predecessor link
        // from the back-fill; its absence means that pass hasn't run.
        if count > 1 {
            let last_row = rows.iter().find(|row| row.id == last_id);
            if last_row.is_some_and(|row| !row.metadata.contains_key("previous_message_id")) {
                return Ok(SessionState::NeedsMetadataEnhancement);
            }
        }

        Ok(SessionState::FullyIndexed)
    }

    /// Re-read and re-enrich one session log, upserting in chunks.
    pub async fn sync_session(
        &self,
        log: &Path,
        state: SessionState,
    ) -> EngineResult<SessionSyncStats> {
        let started = Instant::now();
        let reader = TranscriptReader::new(log);
        let session_id = reader.session_id().to_string();

        if state == SessionState::NeedsReindex {
            // Reindex = remove-by-session-then-reinsert.
            let filter = Filter::new().eq("session_id", session_id.clone());
            with_retry("reindex delete", 3, || self.store.delete_where(&filter)).await?;
        }

        let mut pass = reader.read().map_err(|err| {
            EngineError::validation(format!("cannot open {}: {err}", log.display()))
        })?;
        let records: Vec<_> = pass.by_ref().collect();
        let skipped_lines = pass.skipped();

        // Pair each skeleton with a solution-classified predecessor so the
        // feedback stage sees the same context the hook path does.  Each pair
        // is then independent, which is what lets the pool run them together.
        let mut jobs: Vec<(ConversationEntry, Option<ConversationEntry>)> =
            Vec::with_capacity(records.len());
        let mut previous: Option<&crate::reader::TranscriptRecord> = None;
        for record in &records {
            let mut skeleton = record.skeleton.clone();
            let cwd = record
                .working_directory
                .clone()
                .or_else(|| previous.and_then(|p| p.working_directory.clone()))
                .unwrap_or_else(|| self.config.projects.session_log_root.clone());
            let (project_name, project_path) = self.config.resolve_project(&cwd);
            skeleton.project_name = project_name;
            skeleton.project_path = project_path;

            let predecessor = previous.map(|p| {
                let mut prior = p.skeleton.clone();
                self.enricher.apply_text_features(&mut prior);
                self.enricher.apply_solution(&mut prior);
                prior
            });
            skeleton.previous_message_id = predecessor.as_ref().map(|p| p.id.clone());
            jobs.push((skeleton, predecessor));
            previous = Some(record);
        }

        let pool = self.config.runtime.worker_pool.max(1);
        let enricher = self.enricher.clone();
        let enriched: Vec<(ConversationEntry, usize)> = futures::stream::iter(jobs)
            .map(|(entry, predecessor)| {
                let enricher = enricher.clone();
                async move { enricher.enrich_counted(entry, predecessor.as_ref()).await }
            })
            .buffered(pool)
            .collect()
            .await;

        let enrichment_errors: usize = enriched.iter().map(|(_, errs)| errs).sum();
        let entries: Vec<ConversationEntry> =
            enriched.into_iter().map(|(entry, _)| entry).collect();

        for chunk in entries.chunks(self.config.store.upsert_batch_limit.max(1)) {
            let ids: Vec<String> = chunk.iter().map(|e| e.id.clone()).collect();
            let texts: Vec<String> = chunk.iter().map(|e| e.text.clone()).collect();
            let metas: Vec<_> = chunk.iter().map(|e| e.to_metadata()).collect();
            with_retry("batch upsert", 3, || self.store.upsert(&ids, &texts, &metas)).await?;
        }

        let stats = SessionSyncStats {
            session_id: session_id.clone(),
            state,
            entries_processed: entries.len(),
            enrichment_errors,
            skipped_lines,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            session = %session_id,
            state = state.as_str(),
            entries = stats.entries_processed,
            skipped = skipped_lines,
            "session synced"
        );
        Ok(stats)
    }

    /// Full sync: probe every discovered log, rebuild what needs it, then run
    /// the chain back-fill over all sessions.
    pub async fn sync_all(&self, max_sessions: Option<usize>) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::default();

        let logs = self.discover_logs();
        for log in logs.into_iter().take(max_sessions.unwrap_or(usize::MAX)) {
            report.sessions_scanned += 1;
            let state = match self.probe_session(&log).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(log = %log.display(), error = %err, "probe failed");
                    report.errors.push(format!("{}: {err}", log.display()));
                    continue;
                }
            };

            match state {
                SessionState::FullyIndexed => {
                    report.sessions_skipped += 1;
                }
                SessionState::NeedsMetadataEnhancement | SessionState::NeedsReindex => {
                    match self.sync_session(&log, state).await {
                        Ok(stats) => {
                            if state == SessionState::NeedsReindex {
                                report.sessions_reindexed += 1;
                            } else {
                                report.sessions_enhanced += 1;
                            }
                            report.entries_indexed += stats.entries_processed;
                            report.per_session.push(stats);
                        }
                        Err(err) => {
                            warn!(log = %log.display(), error = %err, "session sync failed");
                            report.errors.push(format!("{}: {err}", log.display()));
                        }
                    }
                }
            }
        }

        // Relationships are repaired store-wide after ingestion settles.
        let backfill = ChainBackfill::new(
            self.store.clone(),
            self.enricher.clone(),
            self.config.store.update_batch_limit,
        );
        match backfill.run_all(None).await {
            Ok(backfill_report) => report.backfill = backfill_report,
            Err(err) => report.errors.push(format!("backfill: {err}")),
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            scanned = report.sessions_scanned,
            reindexed = report.sessions_reindexed,
            enhanced = report.sessions_enhanced,
            skipped = report.sessions_skipped,
            entries = report.entries_indexed,
            errors = report.errors.len(),
            "sync complete"
        );
        report
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::schema::{MetaValue, Role, entry_id};
    use crate::store::memory::MemoryStore;
    use std::fs::File;
    use std::io::Write;

    async fn harness(root: &Path) -> (BatchOrchestrator, Arc<MemoryStore>) {
        let mut config = AppConfig::default();
        config.projects.session_log_root = root.to_string_lossy().to_string();
        config.runtime.worker_pool = 2;
        let config = Arc::new(config);

        let embedder = Arc::new(HashEmbedder::new(64));
        let store = Arc::new(MemoryStore::new(embedder.clone()));
        let enricher = Arc::new(
            Enricher::build(&config.enrichment, embedder)
                .await
                .unwrap(),
        );
        (
            BatchOrchestrator::new(config, store.clone(), enricher),
            store,
        )
    }

    fn write_session(root: &Path, name: &str, turns: &[(&str, &str)]) -> PathBuf {
        let path = root.join(format!("{name}.jsonl"));
        let mut file = File::create(&path).unwrap();
        for (i, (role, text)) in turns.iter().enumerate() {
            writeln!(
                file,
                r#"{{"role":"{role}","text":"{text}","timestamp":"2025-06-01T10:{:02}:00Z"}}"#,
                i
            )
            .unwrap();
        }
        path
    }

    #[tokio::test]
    async fn fresh_logs_are_reindexed_and_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            "alpha",
            &[
                ("user", "nginx deploy keeps failing"),
                ("assistant", "Try `sudo nginx -t`, this fixes config errors"),
                ("user", "that worked, thanks"),
            ],
        );
        write_session(dir.path(), "beta", &[("user", "hello"), ("assistant", "hi there")]);

        let (orchestrator, store) = harness(dir.path()).await;
        let report = orchestrator.sync_all(None).await;

        assert_eq!(report.sessions_scanned, 2);
        assert_eq!(report.sessions_reindexed, 2);
        assert_eq!(report.entries_indexed, 5);
        assert!(report.errors.is_empty());
        assert!(report.is_success());
        assert_eq!(store.count().await.unwrap(), 5);

        // Back-fill ran: the alpha chain is linked.
        let rows = store.get(&[entry_id("alpha", Role::User, 3)]).await.unwrap();
        assert_eq!(
            rows[0].metadata.get("previous_message_id"),
            Some(&MetaValue::Str(entry_id("alpha", Role::Assistant, 2)))
        );
        assert_eq!(report.backfill.pairs_created, 1);
    }

    #[tokio::test]
    async fn second_sync_skips_fully_indexed_sessions() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            "gamma",
            &[("user", "question"), ("assistant", "answer text here")],
        );

        let (orchestrator, _) = harness(dir.path()).await;
        let first = orchestrator.sync_all(None).await;
        assert_eq!(first.sessions_reindexed, 1);

        let second = orchestrator.sync_all(None).await;
        assert_eq!(second.sessions_skipped, 1);
        assert_eq!(second.sessions_reindexed, 0);
        assert_eq!(second.entries_indexed, 0);
    }

    #[tokio::test]
    async fn probe_reports_reindex_for_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_session(dir.path(), "delta", &[("user", "anyone there")]);

        let (orchestrator, _) = harness(dir.path()).await;
        let state = orchestrator.probe_session(&log).await.unwrap();
        assert_eq!(state, SessionState::NeedsReindex);
    }

    #[tokio::test]
    async fn probe_detects_unenriched_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_session(dir.path(), "epsilon", &[("user", "bare entry")]);
        let (orchestrator, store) = harness(dir.path()).await;

        // Seed a row missing the enrichment markers.
        let id = entry_id("epsilon", Role::User, 1);
        let mut meta = crate::schema::Metadata::new();
        meta.insert("session_id".into(), MetaValue::Str("epsilon".into()));
        meta.insert("sequence_position".into(), MetaValue::Int(1));
        store
            .upsert(&[id], &["bare entry".into()], &[meta])
            .await
            .unwrap();

        let state = orchestrator.probe_session(&log).await.unwrap();
        assert_eq!(state, SessionState::NeedsMetadataEnhancement);
    }

    #[tokio::test]
    async fn sync_tolerates_a_corrupt_log_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeta.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"role":"user","text":"ok","timestamp":"2025-06-01T10:00:00Z"}}"#)
            .unwrap();
        writeln!(file, "{{corrupt").unwrap();
        writeln!(
            file,
            r#"{{"role":"assistant","text":"fine","timestamp":"2025-06-01T10:01:00Z"}}"#
        )
        .unwrap();
        drop(file);

        let (orchestrator, store) = harness(dir.path()).await;
        let report = orchestrator.sync_all(None).await;
        assert!(report.errors.is_empty());
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(report.per_session[0].skipped_lines, 1);
    }

    #[tokio::test]
    async fn max_sessions_caps_the_run() {
        let dir = tempfile::tempdir().unwrap();
        write_session(dir.path(), "one", &[("user", "a")]);
        write_session(dir.path(), "two", &[("user", "b")]);

        let (orchestrator, _) = harness(dir.path()).await;
        let report = orchestrator.sync_all(Some(1)).await;
        assert_eq!(report.sessions_scanned, 1);
    }
}
