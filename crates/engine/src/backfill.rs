//! Conversation-chain back-fill: populates the relationship fields the
//! real-time ingest path cannot know.
//!
//! Entries are loaded **from the store**, never from the raw log — IDs
//! re-derived by re-parsing can diverge from stored IDs whenever a record was
//! skipped at original ingest, and every update here targets IDs the store
//! itself returned.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::enrich::Enricher;
use crate::error::{EngineError, EngineResult};
use crate::schema::{ConversationEntry, Role, Sentiment};
use crate::store::{Filter, VectorStore, with_retry};

/// A solution/feedback pairing created by this run, for the feedback learner.
#[derive(Debug, Clone)]
pub struct PairingEvent {
    pub solution_id: String,
    pub feedback_id: String,
    pub sentiment: Sentiment,
    pub validation_strength: f32,
    pub project_name: String,
    pub top_topic: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionBackfillStats {
    pub session_id: String,
    pub entries: usize,
    pub links_set: usize,
    pub pairs_created: usize,
    pub updates_applied: usize,
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub sessions_processed: usize,
    pub links_set: usize,
    pub pairs_created: usize,
    pub updates_applied: usize,
    pub new_pairings: Vec<PairingEvent>,
    pub errors: Vec<String>,
}

pub struct ChainBackfill {
    store: Arc<dyn VectorStore>,
    enricher: Arc<Enricher>,
    update_batch_limit: usize,
}

impl ChainBackfill {
    pub fn new(
        store: Arc<dyn VectorStore>,
        enricher: Arc<Enricher>,
        update_batch_limit: usize,
    ) -> Self {
        Self {
            store,
            enricher,
            update_batch_limit: update_batch_limit.max(1),
        }
    }

    /// Back-fill every session present in the store, optionally capped.
    pub async fn run_all(&self, limit: Option<usize>) -> EngineResult<BackfillReport> {
        let sessions = self.session_ids().await?;
        let mut report = BackfillReport::default();

        for session_id in sessions.into_iter().take(limit.unwrap_or(usize::MAX)) {
            match self.run_session(&session_id).await {
                Ok((stats, pairings)) => {
                    report.sessions_processed += 1;
                    report.links_set += stats.links_set;
                    report.pairs_created += stats.pairs_created;
                    report.updates_applied += stats.updates_applied;
                    report.new_pairings.extend(pairings);
                }
                Err(err) => {
                    warn!(session = %session_id, error = %err, "session back-fill failed");
                    report.errors.push(format!("{session_id}: {err}"));
                }
            }
        }

        info!(
            sessions = report.sessions_processed,
            links = report.links_set,
            pairs = report.pairs_created,
            errors = report.errors.len(),
            "chain back-fill complete"
        );
        Ok(report)
    }

    pub async fn session_ids(&self) -> EngineResult<Vec<String>> {
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

    /// Back-fill one session.  Idempotent: a second run finds every
    /// relationship already set and writes nothing.
    pub async fn run_session(
        &self,
        session_id: &str,
    ) -> EngineResult<(SessionBackfillStats, Vec<PairingEvent>)> {
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

        let originals: Vec<ConversationEntry> = entries.clone();
        let mut stats = SessionBackfillStats {
            session_id: session_id.to_string(),
            entries: entries.len(),
            ..Default::default()
        };

        // Doubly-linked chain in sorted order.
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        for (i, entry) in entries.iter_mut().enumerate() {
            let previous = (i > 0).then(|| ids[i - 1].clone());
            let next = (i + 1 < ids.len()).then(|| ids[i + 1].clone());
            if entry.previous_message_id != previous {
                entry.previous_message_id = previous;
                stats.links_set += 1;
            }
            if entry.next_message_id != next {
                entry.next_message_id = next;
                stats.links_set += 1;
            }
            entry.backfill_processed = true;
        }

        // Solution → feedback pairing over consecutive pairs.  First feedback
        // wins: a solution that already carries a pairing is never rewritten.
        let mut pairings = Vec::new();
        for i in 0..entries.len().saturating_sub(1) {
            let (head, tail) = entries.split_at_mut(i + 1);
            let solution = &mut head[i];
            let candidate = &mut tail[0];

            if solution.role != Role::Assistant
                || !solution.is_solution_attempt
                || candidate.role != Role::User
            {
                continue;
            }
            if solution.feedback_message_id.is_some() || candidate.related_solution_id.is_some() {
                continue;
            }

            let Some(outcome) = self
                .enricher
                .classify_feedback_pair(solution, candidate)
                .await
            else {
                continue;
            };

            solution.feedback_message_id = Some(candidate.id.clone());
            candidate.related_solution_id = Some(solution.id.clone());
            candidate.is_feedback_to_solution = true;
            if candidate.user_feedback_sentiment == Sentiment::None {
                candidate.user_feedback_sentiment = outcome.sentiment;
                candidate.validation_strength = outcome.strength;
            }
            stats.pairs_created += 1;
            pairings.push(PairingEvent {
                solution_id: solution.id.clone(),
                feedback_id: candidate.id.clone(),
                sentiment: candidate.user_feedback_sentiment,
                validation_strength: candidate.validation_strength,
                project_name: solution.project_name.clone(),
                top_topic: solution.top_topic().map(|(name, _)| name.to_string()),
            });
        }

        // Write only what changed, in store-bounded batches.
        let mut changed_ids = Vec::new();
        let mut changed_metas = Vec::new();
        for (entry, original) in entries.iter().zip(originals.iter()) {
            if entry != original {
                changed_ids.push(entry.id.clone());
                changed_metas.push(entry.to_metadata());
            }
        }

        for (id_chunk, meta_chunk) in changed_ids
            .chunks(self.update_batch_limit)
            .zip(changed_metas.chunks(self.update_batch_limit))
        {
            let ids = id_chunk.to_vec();
            let metas = meta_chunk.to_vec();
            with_retry("backfill update", 3, || self.store.update(&ids, &metas)).await?;
            stats.updates_applied += ids.len();
        }

        debug!(
            session = session_id,
            entries = stats.entries,
            links = stats.links_set,
            pairs = stats.pairs_created,
            updates = stats.updates_applied,
            "session back-filled"
        );
        Ok((stats, pairings))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::schema::{Role, entry_id};
    use crate::store::memory::MemoryStore;
    use chrono::{TimeZone, Utc};
    use hindsight_config::EnrichmentConfig;

    async fn harness() -> (ChainBackfill, Arc<MemoryStore>, Arc<Enricher>) {
        let embedder = Arc::new(HashEmbedder::new(64));
        let store = Arc::new(MemoryStore::new(embedder.clone()));
        let enricher = Arc::new(
            Enricher::build(&EnrichmentConfig::default(), embedder)
                .await
                .unwrap(),
        );
        (
            ChainBackfill::new(store.clone(), enricher.clone(), 100),
            store,
            enricher,
        )
    }

    async fn seed_session(
        store: &MemoryStore,
        enricher: &Enricher,
        session: &str,
        messages: &[(Role, &str)],
    ) {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let mut predecessor: Option<ConversationEntry> = None;
        for (i, (role, text)) in messages.iter().enumerate() {
            let ts = base + chrono::Duration::seconds(i as i64 * 30);
            let skeleton =
                ConversationEntry::skeleton(session, *role, (i + 1) as u32, *text, ts);
            let entry = enricher.enrich(skeleton, predecessor.as_ref()).await;
            store
                .upsert(
                    &[entry.id.clone()],
                    &[entry.text.clone()],
                    &[entry.to_metadata()],
                )
                .await
                .unwrap();
            predecessor = Some(entry);
        }
    }

    async fn load(store: &MemoryStore, session: &str, role: Role, pos: u32) -> ConversationEntry {
        let id = entry_id(session, role, pos);
        let rows = store.get(&[id]).await.unwrap();
        ConversationEntry::from_metadata(&rows[0].id, &rows[0].text, &rows[0].metadata)
    }

    #[tokio::test]
    async fn links_and_pairs_a_full_session() {
        let (backfill, store, enricher) = harness().await;
        seed_session(
            &store,
            &enricher,
            "s1",
            &[
                (Role::User, "nginx deploy is failing"),
                (Role::Assistant, "Run this:\n```\nsudo nginx -t && sudo systemctl reload nginx\n```"),
                (Role::User, "that worked, thanks!"),
                (Role::Assistant, "Glad to hear it."),
            ],
        )
        .await;

        let (stats, pairings) = backfill.run_session("s1").await.unwrap();
        assert_eq!(stats.entries, 4);
        assert_eq!(stats.pairs_created, 1);
        assert_eq!(pairings.len(), 1);
        assert_eq!(pairings[0].sentiment, Sentiment::Positive);

        let solution = load(&store, "s1", Role::Assistant, 2).await;
        let feedback = load(&store, "s1", Role::User, 3).await;
        assert_eq!(solution.feedback_message_id.as_deref(), Some("s1_user_3"));
        assert_eq!(feedback.related_solution_id.as_deref(), Some("s1_assistant_2"));
        assert_eq!(solution.next_message_id.as_deref(), Some("s1_user_3"));
        assert_eq!(feedback.previous_message_id.as_deref(), Some("s1_assistant_2"));
        assert!(solution.backfill_processed);

        // Chain endpoints.
        let first = load(&store, "s1", Role::User, 1).await;
        let last = load(&store, "s1", Role::Assistant, 4).await;
        assert!(first.previous_message_id.is_none());
        assert!(last.next_message_id.is_none());
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let (backfill, store, enricher) = harness().await;
        seed_session(
            &store,
            &enricher,
            "s2",
            &[
                (Role::User, "tests are flaky"),
                (Role::Assistant, "Try this, it fixes the race:\n```\ncargo test -- --test-threads=1\n```"),
                (Role::User, "still failing"),
            ],
        )
        .await;

        let (first, _) = backfill.run_session("s2").await.unwrap();
        assert!(first.updates_applied > 0);

        let (second, pairings) = backfill.run_session("s2").await.unwrap();
        assert_eq!(second.updates_applied, 0);
        assert_eq!(second.pairs_created, 0);
        assert!(pairings.is_empty());
    }

    #[tokio::test]
    async fn later_user_messages_do_not_steal_the_pairing() {
        let (backfill, store, enricher) = harness().await;
        seed_session(
            &store,
            &enricher,
            "s3",
            &[
                (Role::Assistant, "You can try restarting, this fixes the stale state."),
                (Role::User, "that worked"),
                (Role::User, "thanks again, perfect"),
            ],
        )
        .await;

        backfill.run_session("s3").await.unwrap();
        let solution = load(&store, "s3", Role::Assistant, 1).await;
        assert_eq!(solution.feedback_message_id.as_deref(), Some("s3_user_2"));

        let second_user = load(&store, "s3", Role::User, 3).await;
        assert!(second_user.related_solution_id.is_none());
    }

    #[tokio::test]
    async fn chain_order_follows_timestamps() {
        let (backfill, store, enricher) = harness().await;
        seed_session(
            &store,
            &enricher,
            "s4",
            &[
                (Role::User, "one"),
                (Role::Assistant, "two"),
                (Role::User, "three"),
            ],
        )
        .await;

        backfill.run_session("s4").await.unwrap();
        // Walk the chain forward and compare with timestamp order.
        let mut walked = Vec::new();
        let mut cursor = Some("s4_user_1".to_string());
        while let Some(id) = cursor {
            let rows = store.get(&[id.clone()]).await.unwrap();
            let entry =
                ConversationEntry::from_metadata(&rows[0].id, &rows[0].text, &rows[0].metadata);
            walked.push(id);
            cursor = entry.next_message_id;
        }
        assert_eq!(walked, vec!["s4_user_1", "s4_assistant_2", "s4_user_3"]);
    }

    #[tokio::test]
    async fn run_all_covers_every_session() {
        let (backfill, store, enricher) = harness().await;
        seed_session(&store, &enricher, "a", &[(Role::User, "x"), (Role::Assistant, "y")]).await;
        seed_session(&store, &enricher, "b", &[(Role::User, "p"), (Role::Assistant, "q")]).await;

        let report = backfill.run_all(None).await.unwrap();
        assert_eq!(report.sessions_processed, 2);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let (backfill, _, _) = harness().await;
        let err = backfill.run_session("ghost").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
