//! Feedback learner: turns observed solution/feedback pairings into quality
//! adjustments and per-project / per-topic aggregates that lift or depress
//! future ranking.
//!
//! Quality updates are serialized per entry behind one mutex — the host fires
//! hooks sequentially per session, so contention here is cross-session only
//! and short.  Aggregates live behind a `RwLock`; the search path consumes a
//! snapshot rather than holding the lock while scoring.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use hindsight_config::LearnerConfig;

use crate::backfill::PairingEvent;
use crate::error::{EngineError, EngineResult};
use crate::schema::{ConversationEntry, Sentiment};
use crate::store::{Filter, VectorStore, with_retry};

// ── Aggregates ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub observations: u64,
    pub positive: u64,
    pub negative: u64,
    pub partial: u64,
    pub strength_sum: f32,
}

impl AggregateStats {
    fn record(&mut self, sentiment: Sentiment, strength: f32) {
        self.observations += 1;
        self.strength_sum += strength;
        match sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Negative => self.negative += 1,
            Sentiment::Partial => self.partial += 1,
            Sentiment::None => {}
        }
    }

    pub fn success_rate(&self) -> f32 {
        if self.observations == 0 {
            return 0.0;
        }
        (self.positive as f32 + 0.5 * self.partial as f32) / self.observations as f32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationRecord {
    pub solution_id: String,
    pub feedback_id: String,
    pub sentiment: Sentiment,
    pub validation_strength: f32,
    pub project_name: String,
    pub topic: Option<String>,
    pub observed_unix: i64,
}

const RECENT_OBSERVATIONS: usize = 200;

#[derive(Debug, Default)]
struct LearnerState {
    by_project: BTreeMap<String, AggregateStats>,
    by_topic: BTreeMap<String, AggregateStats>,
    recent: VecDeque<ObservationRecord>,
}

/// Read-only copy of the aggregates, cheap enough to take per search.
#[derive(Debug, Clone, Default)]
pub struct LearnerSnapshot {
    by_project: BTreeMap<String, AggregateStats>,
    by_topic: BTreeMap<String, AggregateStats>,
}

impl LearnerSnapshot {
    /// Multiplicative ranking factor for an unseen candidate that shares
    /// project/topic with previously validated solutions.  Neutral (1.0)
    /// until at least two observations exist for a dimension.
    pub fn boost_for(&self, project: &str, topic: Option<&str>) -> f32 {
        let mut boost = 1.0_f32;
        if let Some(stats) = self.by_project.get(project) {
            if stats.observations >= 2 {
                boost *= 0.9 + 0.4 * stats.success_rate();
            }
        }
        if let Some(stats) = topic.and_then(|t| self.by_topic.get(t)) {
            if stats.observations >= 2 {
                boost *= 0.9 + 0.4 * stats.success_rate();
            }
        }
        boost.clamp(0.7, 1.4)
    }
}

// ── Update report ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LearnerUpdate {
    pub solution_id: String,
    pub sentiment: Sentiment,
    pub validation_strength: f32,
    pub old_quality: f32,
    pub new_quality: f32,
}

// ── Learner ──────────────────────────────────────────────────────────────────

pub struct FeedbackLearner {
    config: LearnerConfig,
    store: Arc<dyn VectorStore>,
    state: RwLock<LearnerState>,
    /// Serializes read-modify-write of solution quality scores.
    write_guard: Mutex<()>,
}

impl FeedbackLearner {
    pub fn new(config: LearnerConfig, store: Arc<dyn VectorStore>) -> Self {
        Self {
            config,
            store,
            state: RwLock::new(LearnerState::default()),
            write_guard: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> LearnerSnapshot {
        let state = self.state.read().await;
        LearnerSnapshot {
            by_project: state.by_project.clone(),
            by_topic: state.by_topic.clone(),
        }
    }

    fn adjusted_quality(&self, old: f32, sentiment: Sentiment, strength: f32) -> f32 {
        let new = match sentiment {
            Sentiment::Positive => old + self.config.positive_step * strength,
            Sentiment::Negative => old - self.config.negative_step * strength,
            Sentiment::Partial => old + self.config.partial_step,
            Sentiment::None => old,
        };
        new.clamp(self.config.quality_floor, self.config.quality_ceiling)
    }

    /// Apply one completed pairing: adjust the solution's quality score in
    /// the store and fold the observation into the aggregates.
    pub async fn observe_pairing(&self, pairing: &PairingEvent) -> EngineResult<LearnerUpdate> {
        if pairing.sentiment == Sentiment::None {
            return Err(EngineError::validation(
                "pairing carries no sentiment to learn from",
            ));
        }

        let _serialized = self.write_guard.lock().await;

        let rows = self.store.get(std::slice::from_ref(&pairing.solution_id)).await?;
        let row = rows.first().ok_or_else(|| {
            EngineError::not_found(format!("solution {} not in store", pairing.solution_id))
        })?;
        let mut entry = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);

        let old_quality = entry.solution_quality_score;
        let new_quality =
            self.adjusted_quality(old_quality, pairing.sentiment, pairing.validation_strength);
        entry.solution_quality_score = new_quality;

        let ids = vec![entry.id.clone()];
        let metas = vec![entry.to_metadata()];
        with_retry("quality update", 3, || self.store.update(&ids, &metas)).await?;

        let observed_unix = chrono::Utc::now().timestamp();
        {
            let mut state = self.state.write().await;
            state
                .by_project
                .entry(pairing.project_name.clone())
                .or_default()
                .record(pairing.sentiment, pairing.validation_strength);
            if let Some(topic) = &pairing.top_topic {
                state
                    .by_topic
                    .entry(topic.clone())
                    .or_default()
                    .record(pairing.sentiment, pairing.validation_strength);
            }
            state.recent.push_back(ObservationRecord {
                solution_id: pairing.solution_id.clone(),
                feedback_id: pairing.feedback_id.clone(),
                sentiment: pairing.sentiment,
                validation_strength: pairing.validation_strength,
                project_name: pairing.project_name.clone(),
                topic: pairing.top_topic.clone(),
                observed_unix,
            });
            while state.recent.len() > RECENT_OBSERVATIONS {
                state.recent.pop_front();
            }
        }

        debug!(
            solution = %pairing.solution_id,
            sentiment = pairing.sentiment.as_str(),
            old_quality,
            new_quality,
            "quality adjusted"
        );
        Ok(LearnerUpdate {
            solution_id: pairing.solution_id.clone(),
            sentiment: pairing.sentiment,
            validation_strength: pairing.validation_strength,
            old_quality,
            new_quality,
        })
    }

    /// Batch entry point used after a back-fill pass.
    pub async fn observe_all(&self, pairings: &[PairingEvent]) -> (usize, Vec<String>) {
        let mut applied = 0;
        let mut errors = Vec::new();
        for pairing in pairings {
            match self.observe_pairing(pairing).await {
                Ok(_) => applied += 1,
                Err(err) => errors.push(format!("{}: {err}", pairing.solution_id)),
            }
        }
        (applied, errors)
    }

    /// Rebuild aggregates from stored pairings.  Run at startup so earlier
    /// sessions' validations keep influencing ranking across restarts.
    pub async fn rebuild_from_store(&self) -> EngineResult<usize> {
        let feedback_rows = self
            .store
            .get_where(&Filter::new().eq("is_feedback_to_solution", true), None)
            .await?;

        let mut state = LearnerState::default();
        let mut restored = 0usize;
        for row in &feedback_rows {
            let feedback = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);
            let Some(solution_id) = feedback.related_solution_id.clone() else {
                continue;
            };
            if feedback.user_feedback_sentiment == Sentiment::None {
                continue;
            }

            let solution_rows = self.store.get(std::slice::from_ref(&solution_id)).await?;
            let topic = solution_rows.first().map(|r| {
                ConversationEntry::from_metadata(&r.id, &r.text, &r.metadata)
                    .top_topic()
                    .map(|(name, _)| name.to_string())
            });

            state
                .by_project
                .entry(feedback.project_name.clone())
                .or_default()
                .record(feedback.user_feedback_sentiment, feedback.validation_strength);
            if let Some(Some(topic)) = &topic {
                state
                    .by_topic
                    .entry(topic.clone())
                    .or_default()
                    .record(feedback.user_feedback_sentiment, feedback.validation_strength);
            }
            restored += 1;
        }

        *self.state.write().await = state;
        info!(observations = restored, "learner aggregates rebuilt from store");
        Ok(restored)
    }

    // ── Insights ─────────────────────────────────────────────────────────────

    pub fn insight_types() -> &'static [&'static str] {
        &["success_rates", "topic_effectiveness", "project_breakdown", "recent_trends"]
    }

    pub async fn insights(
        &self,
        insight_type: &str,
        since_unix: Option<i64>,
    ) -> EngineResult<serde_json::Value> {
        let state = self.state.read().await;
        let value = match insight_type {
            "success_rates" => {
                let overall: AggregateStats = state.by_project.values().fold(
                    AggregateStats::default(),
                    |mut acc, s| {
                        acc.observations += s.observations;
                        acc.positive += s.positive;
                        acc.negative += s.negative;
                        acc.partial += s.partial;
                        acc.strength_sum += s.strength_sum;
                        acc
                    },
                );
                serde_json::json!({
                    "observations": overall.observations,
                    "positive": overall.positive,
                    "negative": overall.negative,
                    "partial": overall.partial,
                    "success_rate": overall.success_rate(),
                })
            }
            "topic_effectiveness" => serde_json::json!(
                state
                    .by_topic
                    .iter()
                    .map(|(topic, stats)| {
                        serde_json::json!({
                            "topic": topic,
                            "observations": stats.observations,
                            "success_rate": stats.success_rate(),
                        })
                    })
                    .collect::<Vec<_>>()
            ),
            "project_breakdown" => serde_json::json!(
                state
                    .by_project
                    .iter()
                    .map(|(project, stats)| {
                        serde_json::json!({
                            "project": project,
                            "observations": stats.observations,
                            "positive": stats.positive,
                            "negative": stats.negative,
                            "success_rate": stats.success_rate(),
                        })
                    })
                    .collect::<Vec<_>>()
            ),
            "recent_trends" => {
                let cutoff = since_unix.unwrap_or(0);
                let recent: Vec<&ObservationRecord> = state
                    .recent
                    .iter()
                    .filter(|o| o.observed_unix >= cutoff)
                    .collect();
                let positive = recent
                    .iter()
                    .filter(|o| o.sentiment == Sentiment::Positive)
                    .count();
                serde_json::json!({
                    "window_observations": recent.len(),
                    "positive": positive,
                    "negative": recent.iter().filter(|o| o.sentiment == Sentiment::Negative).count(),
                    "observations": recent,
                })
            }
            other => {
                return Err(EngineError::validation(format!(
                    "unknown insight_type '{other}', accepted: {:?}",
                    Self::insight_types()
                )));
            }
        };
        Ok(value)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
