//! Mode-routed, multi-factor ranked retrieval.
//!
//! ```text
//! score = base_similarity
//!       × project_boost     (caller's project context)
//!       × topic_boost       (strongest matching focused topic)
//!       × quality_boost     (monotone in solution_quality_score)
//!       × validation_boost  (learner aggregates; optional)
//!       × recency_boost     (off unless prefer_recent)
//! ```
//!
//! All boosts are ≥ 0 with 1.0 neutral; ties break on higher
//! `timestamp_unix`.  Context-chain expansion happens after ranking and never
//! perturbs it.  Store failures surface as a degraded result with an empty
//! hit list — never as an error thrown past the tool boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};

use hindsight_config::AppConfig;

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::learner::{FeedbackLearner, LearnerSnapshot};
use crate::schema::{ConversationEntry, Role, Sentiment, truncate_str};
use crate::store::{Filter, QueryHit, VectorStore};
use crate::timewin::{self, TimeWindow};

// ── Modes & preferences ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    ValidatedOnly,
    FailedOnly,
    RecentOnly,
    ByTopic,
    Time,
}

impl SearchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "semantic" => Some(SearchMode::Semantic),
            "validated_only" => Some(SearchMode::ValidatedOnly),
            "failed_only" => Some(SearchMode::FailedOnly),
            "recent_only" => Some(SearchMode::RecentOnly),
            "by_topic" => Some(SearchMode::ByTopic),
            "time" => Some(SearchMode::Time),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::ValidatedOnly => "validated_only",
            SearchMode::FailedOnly => "failed_only",
            SearchMode::RecentOnly => "recent_only",
            SearchMode::ByTopic => "by_topic",
            SearchMode::Time => "time",
        }
    }

    pub fn accepted() -> &'static [&'static str] {
        &["semantic", "validated_only", "failed_only", "recent_only", "by_topic", "time"]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationPreference {
    ValidatedOnly,
    IncludeFailures,
    #[default]
    Neutral,
}

impl ValidationPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validated_only" => Some(ValidationPreference::ValidatedOnly),
            "include_failures" => Some(ValidationPreference::IncludeFailures),
            "neutral" => Some(ValidationPreference::Neutral),
            _ => None,
        }
    }

    pub fn accepted() -> &'static [&'static str] {
        &["validated_only", "include_failures", "neutral"]
    }
}

// ── Request / result records ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub limit: usize,
    pub project_context: Option<String>,
    pub topic_focus: Option<String>,
    pub validation_preference: ValidationPreference,
    /// Absolute `[start, end)` UTC-seconds range.
    pub date_range: Option<(i64, i64)>,
    /// Symbolic recency name (see [`timewin::symbolic_window_names`]).
    pub recency: Option<String>,
    pub include_code_only: bool,
    pub role: Option<Role>,
    pub include_context_chains: bool,
    pub chain_length: usize,
    pub min_validation_strength: Option<f32>,
    pub use_validation_boost: bool,
    pub prefer_recent: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            query: query.into(),
            mode,
            limit: 10,
            project_context: None,
            topic_focus: None,
            validation_preference: ValidationPreference::Neutral,
            date_range: None,
            recency: None,
            include_code_only: false,
            role: None,
            include_context_chains: false,
            chain_length: 2,
            min_validation_strength: None,
            use_validation_boost: true,
            prefer_recent: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedBoosts {
    pub project: f32,
    pub topic: f32,
    pub quality: f32,
    pub validation: f32,
    pub recency: f32,
}

impl Default for AppliedBoosts {
    fn default() -> Self {
        Self {
            project: 1.0,
            topic: 1.0,
            quality: 1.0,
            validation: 1.0,
            recency: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainItem {
    pub id: String,
    pub role: Role,
    /// Position relative to the anchor: -1 is the previous message.
    pub offset: i32,
    pub preview: String,
    pub timestamp_unix: i64,
    pub is_solution_attempt: bool,
    pub is_feedback_to_solution: bool,
    pub sentiment: Sentiment,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: ConversationEntry,
    pub similarity: f32,
    pub score: f32,
    pub boosts: AppliedBoosts,
    pub chain: Vec<ChainItem>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchMeta {
    pub mode: String,
    pub total_candidates: usize,
    pub returned: usize,
    pub filtered_out: usize,
    pub window: Option<String>,
    pub degraded: Option<String>,
    pub explanation: String,
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub meta: SearchMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextChain {
    pub anchor: ChainItem,
    pub items: Vec<ChainItem>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SearchEngine {
    config: Arc<AppConfig>,
    store: Arc<dyn VectorStore>,
    learner: Option<Arc<FeedbackLearner>>,
}

impl SearchEngine {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn VectorStore>,
        learner: Option<Arc<FeedbackLearner>>,
    ) -> Self {
        Self {
            config,
            store,
            learner,
        }
    }

    fn timezone(&self) -> Tz {
        self.config
            .runtime
            .timezone
            .parse()
            .unwrap_or(chrono_tz::UTC)
    }

    /// Unified entry point.  Returns `Err` only for invalid requests; store
    /// trouble degrades to an empty result with the error kind attached.
    pub async fn search(&self, request: &SearchRequest) -> EngineResult<SearchOutcome> {
        self.validate(request)?;
        let limit = if request.limit == 0 {
            self.config.search.default_limit
        } else {
            request.limit
        };

        match self.search_inner(request, limit).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.kind == ErrorKind::ValidationFailed || err.kind == ErrorKind::NotFound => {
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "search degraded by dependency failure");
                Ok(SearchOutcome {
                    hits: Vec::new(),
                    meta: SearchMeta {
                        mode: request.mode.as_str().to_string(),
                        degraded: Some(err.kind.code().to_string()),
                        explanation: format!("degraded: {err}"),
                        ..SearchMeta::default()
                    },
                })
            }
        }
    }

    fn validate(&self, request: &SearchRequest) -> EngineResult<()> {
        if request.mode == SearchMode::ByTopic && request.topic_focus.is_none() {
            return Err(EngineError::validation(
                "search_mode 'by_topic' requires topic_focus",
            ));
        }
        if let Some(strength) = request.min_validation_strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(EngineError::validation(
                    "min_validation_strength must be within [0, 1]",
                ));
            }
        }
        if let Some((start, end)) = request.date_range {
            if end <= start {
                return Err(EngineError::validation("date_range end must be after start"));
            }
        }
        if let Some(name) = &request.recency {
            if !timewin::symbolic_window_names().contains(&name.as_str()) {
                return Err(EngineError::validation(format!(
                    "unknown recency '{name}', accepted: {:?}",
                    timewin::symbolic_window_names()
                )));
            }
        }
        Ok(())
    }

    async fn search_inner(
        &self,
        request: &SearchRequest,
        limit: usize,
    ) -> EngineResult<SearchOutcome> {
        let now = Utc::now();
        let tz = self.timezone();

        // Resolve the effective time window and the effective text query.
        let mut window: Option<TimeWindow> = None;
        let mut query_text = request.query.trim().to_string();
        if let Some((start, end)) = request.date_range {
            window = Some(TimeWindow {
                start_unix: start,
                end_unix: end,
                label: "date_range".to_string(),
            });
        } else if let Some(name) = &request.recency {
            window = timewin::symbolic_window(name, now, tz);
        }
        if request.mode == SearchMode::Time && window.is_none() {
            if let Some((parsed, rest)) = timewin::extract_window(&query_text, now, tz) {
                window = Some(parsed);
                query_text = rest;
            }
        }

        let wildcard = is_wildcard(&query_text);
        let store_filter = self.store_filter(request);

        // Pure timestamp ordering for recent_only and windowed wildcards.
        if request.mode == SearchMode::RecentOnly
            || (request.mode == SearchMode::Time && wildcard)
        {
            return self
                .recent_scan(request, limit, store_filter, window)
                .await;
        }

        let oversample = (limit * 4).max(50);
        let candidates = if wildcard {
            self.store
                .get_where(&store_filter, None)
                .await?
                .into_iter()
                .map(|row| QueryHit {
                    id: row.id,
                    text: row.text,
                    metadata: row.metadata,
                    similarity: 1.0,
                })
                .collect()
        } else {
            self.store
                .query(&query_text, oversample, Some(&store_filter))
                .await?
        };
        let total_candidates = candidates.len();

        let mut entries: Vec<(ConversationEntry, f32)> = candidates
            .into_iter()
            .map(|hit| {
                let entry = ConversationEntry::from_metadata(&hit.id, &hit.text, &hit.metadata);
                (entry, hit.similarity)
            })
            .collect();

        // Window filter.
        if let Some(window) = &window {
            entries.retain(|(entry, _)| window.contains(entry.timestamp_unix));
        }

        // Validation filtering consults the partner feedback entries.
        let needs_feedback = matches!(
            request.mode,
            SearchMode::ValidatedOnly | SearchMode::FailedOnly
        ) || request.validation_preference == ValidationPreference::ValidatedOnly;
        let feedback_map = if needs_feedback {
            self.feedback_map(&entries).await?
        } else {
            BTreeMap::new()
        };
        let min_strength = request
            .min_validation_strength
            .unwrap_or(self.config.search.validation_threshold);

        entries.retain(|(entry, _)| match request.mode {
            SearchMode::ValidatedOnly => {
                is_validated(entry, &feedback_map, min_strength)
            }
            SearchMode::FailedOnly => is_refuted(entry, &feedback_map),
            SearchMode::ByTopic => request
                .topic_focus
                .as_ref()
                .is_some_and(|topic| entry.detected_topics.contains_key(topic)),
            _ => true,
        });
        if request.validation_preference == ValidationPreference::ValidatedOnly
            && request.mode != SearchMode::ValidatedOnly
        {
            entries.retain(|(entry, _)| is_validated(entry, &feedback_map, min_strength));
        }

        let filtered_out = total_candidates - entries.len();

        // Score.
        let snapshot = match (&self.learner, request.use_validation_boost) {
            (Some(learner), true) => Some(learner.snapshot().await),
            _ => None,
        };
        let mut scored: Vec<SearchHit> = entries
            .into_iter()
            .map(|(entry, similarity)| self.score(request, entry, similarity, snapshot.as_ref(), now.timestamp()))
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.entry.timestamp_unix.cmp(&a.entry.timestamp_unix))
                .then(a.entry.id.cmp(&b.entry.id))
        });
        scored.truncate(limit);

        if request.include_context_chains {
            let chain_length = request
                .chain_length
                .min(self.config.search.max_chain_length);
            for hit in &mut scored {
                hit.chain = self.walk_chain(&hit.entry, chain_length).await;
            }
        }

        let explanation = if scored.is_empty() {
            empty_explanation(request, total_candidates, &window)
        } else {
            format!("{} of {total_candidates} candidates ranked", scored.len())
        };

        debug!(
            mode = request.mode.as_str(),
            candidates = total_candidates,
            returned = scored.len(),
            "search complete"
        );
        Ok(SearchOutcome {
            meta: SearchMeta {
                mode: request.mode.as_str().to_string(),
                total_candidates,
                returned: scored.len(),
                filtered_out,
                window: window.map(|w| w.label),
                degraded: None,
                explanation,
            },
            hits: scored,
        })
    }

    fn store_filter(&self, request: &SearchRequest) -> Filter {
        let mut filter = Filter::new();
        if let Some(role) = request.role {
            filter = filter.eq("type", role.as_str());
        }
        if request.include_code_only {
            filter = filter.eq("has_code", true);
        }
        filter
    }

    async fn recent_scan(
        &self,
        request: &SearchRequest,
        limit: usize,
        filter: Filter,
        window: Option<TimeWindow>,
    ) -> EngineResult<SearchOutcome> {
        let rows = self.store.get_where(&filter, None).await?;
        let total_candidates = rows.len();

        let mut entries: Vec<ConversationEntry> = rows
            .into_iter()
            .map(|row| ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata))
            .collect();
        if let Some(window) = &window {
            entries.retain(|entry| window.contains(entry.timestamp_unix));
        }

        entries.sort_by(|a, b| {
            b.timestamp_unix
                .cmp(&a.timestamp_unix)
                .then(b.sequence_position.cmp(&a.sequence_position))
                .then(a.id.cmp(&b.id))
        });
        entries.truncate(limit);

        let chain_length = request
            .chain_length
            .min(self.config.search.max_chain_length);
        let mut hits = Vec::with_capacity(entries.len());
        for entry in entries {
            let chain = if request.include_context_chains {
                self.walk_chain(&entry, chain_length).await
            } else {
                Vec::new()
            };
            hits.push(SearchHit {
                similarity: 0.0,
                score: 0.0,
                boosts: AppliedBoosts::default(),
                chain,
                entry,
            });
        }

        let explanation = if hits.is_empty() {
            empty_explanation(request, total_candidates, &window)
        } else {
            format!("{} most recent of {total_candidates} entries", hits.len())
        };
        Ok(SearchOutcome {
            meta: SearchMeta {
                mode: request.mode.as_str().to_string(),
                total_candidates,
                returned: hits.len(),
                filtered_out: total_candidates - hits.len(),
                window: window.map(|w| w.label),
                degraded: None,
                explanation,
            },
            hits,
        })
    }

    fn score(
        &self,
        request: &SearchRequest,
        entry: ConversationEntry,
        similarity: f32,
        snapshot: Option<&LearnerSnapshot>,
        now_unix: i64,
    ) -> SearchHit {
        let weights = &self.config.search;
        let base = similarity.max(0.0) + 1e-6;

        let mut boosts = AppliedBoosts::default();
        if let Some(context) = &request.project_context {
            if !context.is_empty() && entry.project_name == *context {
                boosts.project = weights.project_boost;
            }
        }
        if let Some(topic) = &request.topic_focus {
            if let Some(confidence) = entry.detected_topics.get(topic) {
                boosts.topic = 1.0 + (weights.topic_boost - 1.0) * confidence;
            }
        }
        boosts.quality =
            (1.0 + weights.quality_weight * (entry.solution_quality_score - 1.0)).max(0.0);
        if let Some(snapshot) = snapshot {
            boosts.validation = snapshot.boost_for(
                &entry.project_name,
                entry.top_topic().map(|(name, _)| name),
            );
        }
        if request.prefer_recent {
            let age_hours = ((now_unix - entry.timestamp_unix).max(0) as f32) / 3600.0;
            let half_lives = age_hours / self.config.search.recency_half_life_hours.max(1.0);
            boosts.recency = 1.0 + 0.5 * 0.5_f32.powf(half_lives);
        }

        let score = base
            * boosts.project
            * boosts.topic
            * boosts.quality
            * boosts.validation
            * boosts.recency;

        SearchHit {
            similarity,
            score,
            boosts,
            chain: Vec::new(),
            entry,
        }
    }

    async fn feedback_map(
        &self,
        entries: &[(ConversationEntry, f32)],
    ) -> EngineResult<BTreeMap<String, (Sentiment, f32)>> {
        let wanted: Vec<(String, String)> = entries
            .iter()
            .filter_map(|(entry, _)| {
                entry
                    .feedback_message_id
                    .clone()
                    .map(|fid| (entry.id.clone(), fid))
            })
            .collect();
        if wanted.is_empty() {
            return Ok(BTreeMap::new());
        }

        let feedback_ids: Vec<String> = wanted.iter().map(|(_, fid)| fid.clone()).collect();
        let rows = self.store.get(&feedback_ids).await?;
        let by_id: BTreeMap<String, (Sentiment, f32)> = rows
            .iter()
            .map(|row| {
                let feedback = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);
                (
                    row.id.clone(),
                    (feedback.user_feedback_sentiment, feedback.validation_strength),
                )
            })
            .collect();

        Ok(wanted
            .into_iter()
            .filter_map(|(solution_id, feedback_id)| {
                by_id.get(&feedback_id).map(|v| (solution_id, *v))
            })
            .collect())
    }

    async fn walk_chain(&self, anchor: &ConversationEntry, chain_length: usize) -> Vec<ChainItem> {
        let mut items = Vec::new();

        // Backwards.
        let mut cursor = anchor.previous_message_id.clone();
        let mut offset = -1;
        let mut backwards = Vec::new();
        while let Some(id) = cursor {
            if backwards.len() >= chain_length {
                break;
            }
            match self.fetch_chain_item(&id, offset).await {
                Some((item, previous)) => {
                    backwards.push(item);
                    cursor = previous;
                    offset -= 1;
                }
                None => break,
            }
        }
        backwards.reverse();
        items.extend(backwards);

        items.push(chain_item(anchor, 0));

        // Forwards.
        let mut cursor = anchor.next_message_id.clone();
        let mut offset = 1;
        while let Some(id) = cursor {
            if offset as usize > chain_length {
                break;
            }
            match self.fetch_chain_item_forward(&id, offset).await {
                Some((item, next)) => {
                    items.push(item);
                    cursor = next;
                    offset += 1;
                }
                None => break,
            }
        }

        items
    }

    async fn fetch_chain_item(&self, id: &str, offset: i32) -> Option<(ChainItem, Option<String>)> {
        let rows = self.store.get(std::slice::from_ref(&id.to_string())).await.ok()?;
        let row = rows.first()?;
        let entry = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);
        let previous = entry.previous_message_id.clone();
        Some((chain_item(&entry, offset), previous))
    }

    async fn fetch_chain_item_forward(
        &self,
        id: &str,
        offset: i32,
    ) -> Option<(ChainItem, Option<String>)> {
        let rows = self.store.get(std::slice::from_ref(&id.to_string())).await.ok()?;
        let row = rows.first()?;
        let entry = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);
        let next = entry.next_message_id.clone();
        Some((chain_item(&entry, offset), next))
    }

    /// Standalone chain lookup for the `get_conversation_context_chain` tool.
    pub async fn context_chain(
        &self,
        message_id: &str,
        chain_length: usize,
    ) -> EngineResult<ContextChain> {
        let rows = self
            .store
            .get(std::slice::from_ref(&message_id.to_string()))
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| EngineError::not_found(format!("no entry with id {message_id}")))?;
        let anchor = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);

        let chain_length = chain_length.min(self.config.search.max_chain_length);
        let items = self.walk_chain(&anchor, chain_length).await;
        Ok(ContextChain {
            anchor: chain_item(&anchor, 0),
            items,
        })
    }
}

fn chain_item(entry: &ConversationEntry, offset: i32) -> ChainItem {
    ChainItem {
        id: entry.id.clone(),
        role: entry.role,
        offset,
        preview: truncate_str(&entry.text, 160),
        timestamp_unix: entry.timestamp_unix,
        is_solution_attempt: entry.is_solution_attempt,
        is_feedback_to_solution: entry.is_feedback_to_solution,
        sentiment: entry.user_feedback_sentiment,
    }
}

fn is_wildcard(query: &str) -> bool {
    let trimmed = query.trim();
    trimmed.is_empty() || trimmed == "*"
}

fn is_validated(
    entry: &ConversationEntry,
    feedback: &BTreeMap<String, (Sentiment, f32)>,
    min_strength: f32,
) -> bool {
    entry.is_solution_attempt
        && feedback
            .get(&entry.id)
            .is_some_and(|(sentiment, strength)| {
                *sentiment == Sentiment::Positive && *strength >= min_strength
            })
}

fn is_refuted(entry: &ConversationEntry, feedback: &BTreeMap<String, (Sentiment, f32)>) -> bool {
    entry.is_solution_attempt
        && feedback
            .get(&entry.id)
            .is_some_and(|(sentiment, _)| *sentiment == Sentiment::Negative)
}

fn empty_explanation(
    request: &SearchRequest,
    total_candidates: usize,
    window: &Option<TimeWindow>,
) -> String {
    let mut reasons = Vec::new();
    if total_candidates == 0 {
        reasons.push("no candidates matched the store filters".to_string());
    } else {
        reasons.push(format!(
            "{total_candidates} candidates were all filtered out"
        ));
    }
    if let Some(window) = window {
        reasons.push(format!("time window '{}' applied", window.label));
    }
    if matches!(
        request.mode,
        SearchMode::ValidatedOnly | SearchMode::FailedOnly
    ) {
        reasons.push(format!("mode '{}' requires observed feedback", request.mode.as_str()));
    }
    reasons.join("; ")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::ChainBackfill;
    use crate::embed::HashEmbedder;
    use crate::enrich::Enricher;
    use crate::learner::FeedbackLearner;
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    struct World {
        engine: SearchEngine,
        store: Arc<MemoryStore>,
        enricher: Arc<Enricher>,
        learner: Arc<FeedbackLearner>,
    }

    async fn world() -> World {
        let config = Arc::new(AppConfig::default());
        let embedder = Arc::new(HashEmbedder::new(128));
        let store = Arc::new(MemoryStore::new(embedder.clone()));
        let enricher = Arc::new(
            Enricher::build(&config.enrichment, embedder)
                .await
                .unwrap(),
        );
        let learner = Arc::new(FeedbackLearner::new(
            config.learner.clone(),
            store.clone(),
        ));
        World {
            engine: SearchEngine::new(config, store.clone(), Some(learner.clone())),
            store,
            enricher,
            learner,
        }
    }

    async fn seed(world: &World, session: &str, minute_base: u32, messages: &[(Role, &str)]) {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
            + Duration::minutes(i64::from(minute_base));
        let mut predecessor = None;
        for (i, (role, text)) in messages.iter().enumerate() {
            let ts = base + Duration::seconds(i as i64 * 20);
            let skeleton = ConversationEntry::skeleton(session, *role, (i + 1) as u32, *text, ts);
            let mut entry = world.enricher.enrich(skeleton, predecessor.as_ref()).await;
            entry.project_name = "api-server".to_string();
            world
                .store
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

    async fn backfill_and_learn(world: &World) {
        let backfill = ChainBackfill::new(world.store.clone(), world.enricher.clone(), 100);
        let report = backfill.run_all(None).await.unwrap();
        world.learner.observe_all(&report.new_pairings).await;
    }

    #[tokio::test]
    async fn validated_only_returns_just_the_validated_solution() {
        let world = world().await;
        seed(
            &world,
            "v1",
            0,
            &[
                (Role::User, "how do I deploy nginx"),
                (Role::Assistant, "Run this:\n```\nsudo systemctl restart nginx\n```"),
                (Role::User, "that worked, thanks"),
            ],
        )
        .await;
        seed(
            &world,
            "v2",
            10,
            &[(Role::Assistant, "Try `nginx -s reload`, this fixes most config reloads")],
        )
        .await;
        seed(
            &world,
            "v3",
            20,
            &[(Role::Assistant, "You can deploy nginx with docker, I recommend the alpine image")],
        )
        .await;
        seed(
            &world,
            "v4",
            30,
            &[(Role::Assistant, "I've updated the deploy script:\n```\n./deploy.sh nginx\n```")],
        )
        .await;
        backfill_and_learn(&world).await;

        let request = SearchRequest {
            limit: 3,
            ..SearchRequest::new("deploy nginx", SearchMode::ValidatedOnly)
        };
        let outcome = world.engine.search(&request).await.unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].entry.id, "v1_assistant_2");
    }

    #[tokio::test]
    async fn failed_only_returns_refuted_attempts() {
        let world = world().await;
        seed(
            &world,
            "f1",
            0,
            &[
                (Role::Assistant, "Try `rm -rf target`, this fixes stale builds"),
                (Role::User, "nope, still failing with the same error"),
            ],
        )
        .await;
        seed(
            &world,
            "f2",
            10,
            &[
                (Role::Assistant, "Run this:\n```\ncargo clean\n```"),
                (Role::User, "that worked, thanks"),
            ],
        )
        .await;
        backfill_and_learn(&world).await;

        let outcome = world
            .engine
            .search(&SearchRequest::new("stale builds", SearchMode::FailedOnly))
            .await
            .unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].entry.id, "f1_assistant_1");
    }

    #[tokio::test]
    async fn recent_only_returns_newest_matching_role() {
        let world = world().await;
        seed(&world, "r1", 0, &[(Role::User, "first question"), (Role::Assistant, "answer one")]).await;
        seed(&world, "r2", 30, &[(Role::User, "newest question"), (Role::Assistant, "answer two")]).await;

        let request = SearchRequest {
            limit: 1,
            role: Some(Role::User),
            ..SearchRequest::new("", SearchMode::RecentOnly)
        };
        let outcome = world.engine.search(&request).await.unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].entry.id, "r2_user_1");
    }

    #[tokio::test]
    async fn by_topic_requires_focus_and_filters_on_it() {
        let world = world().await;
        seed(
            &world,
            "t1",
            0,
            &[
                (Role::Assistant, "Try `docker compose up`, this fixes the deploy pipeline"),
                (Role::Assistant, "You can bump the css padding, I recommend 8px"),
            ],
        )
        .await;

        let err = world
            .engine
            .search(&SearchRequest::new("x", SearchMode::ByTopic))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);

        let request = SearchRequest {
            topic_focus: Some("deployment".to_string()),
            ..SearchRequest::new("deploy", SearchMode::ByTopic)
        };
        let outcome = world.engine.search(&request).await.unwrap();
        assert!(!outcome.hits.is_empty());
        assert!(
            outcome
                .hits
                .iter()
                .all(|hit| hit.entry.detected_topics.contains_key("deployment"))
        );
    }

    #[tokio::test]
    async fn project_boost_lifts_matching_project() {
        let world = world().await;
        seed(&world, "p1", 0, &[(Role::Assistant, "Try `cargo fix`, this fixes the build warnings")]).await;

        // Same text in another project.
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();
        let skeleton = ConversationEntry::skeleton("p2", Role::Assistant, 1, "Try `cargo fix`, this fixes the build warnings", ts);
        let mut other = world.enricher.enrich(skeleton, None).await;
        other.project_name = "frontend".to_string();
        world
            .store
            .upsert(&[other.id.clone()], &[other.text.clone()], &[other.to_metadata()])
            .await
            .unwrap();

        let request = SearchRequest {
            project_context: Some("frontend".to_string()),
            ..SearchRequest::new("cargo fix build warnings", SearchMode::Semantic)
        };
        let outcome = world.engine.search(&request).await.unwrap();
        assert_eq!(outcome.hits[0].entry.id, "p2_assistant_1");
        assert!(outcome.hits[0].boosts.project > 1.0);
    }

    #[tokio::test]
    async fn context_chains_do_not_change_ranking() {
        let world = world().await;
        seed(
            &world,
            "c1",
            0,
            &[
                (Role::User, "the deploy fails"),
                (Role::Assistant, "Run this:\n```\nsudo nginx -t\n```"),
                (Role::User, "that worked, thanks"),
            ],
        )
        .await;
        backfill_and_learn(&world).await;

        let bare = world
            .engine
            .search(&SearchRequest::new("deploy fails", SearchMode::Semantic))
            .await
            .unwrap();
        let chained = world
            .engine
            .search(&SearchRequest {
                include_context_chains: true,
                chain_length: 2,
                ..SearchRequest::new("deploy fails", SearchMode::Semantic)
            })
            .await
            .unwrap();

        let bare_ids: Vec<_> = bare.hits.iter().map(|h| h.entry.id.clone()).collect();
        let chained_ids: Vec<_> = chained.hits.iter().map(|h| h.entry.id.clone()).collect();
        assert_eq!(bare_ids, chained_ids);
        assert!(chained.hits[0].chain.len() > 1);
    }

    #[tokio::test]
    async fn context_chain_tool_walks_both_directions() {
        let world = world().await;
        seed(
            &world,
            "c2",
            0,
            &[
                (Role::User, "u one"),
                (Role::Assistant, "a one"),
                (Role::Assistant, "Run this:\n```\ncargo build\n```"),
                (Role::User, "that worked, thanks"),
                (Role::Assistant, "a final"),
            ],
        )
        .await;
        backfill_and_learn(&world).await;

        let chain = world
            .engine
            .context_chain("c2_assistant_3", 2)
            .await
            .unwrap();
        let ids: Vec<_> = chain.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["c2_user_1", "c2_assistant_2", "c2_assistant_3", "c2_user_4", "c2_assistant_5"]
        );
        let anchor = chain.items.iter().find(|i| i.offset == 0).unwrap();
        assert!(anchor.is_solution_attempt);
        let feedback = chain.items.iter().find(|i| i.id == "c2_user_4").unwrap();
        assert!(feedback.is_feedback_to_solution);
    }

    #[tokio::test]
    async fn missing_chain_anchor_is_not_found() {
        let world = world().await;
        let err = world.engine.context_chain("ghost_user_1", 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn empty_results_carry_an_explanation() {
        let world = world().await;
        let outcome = world
            .engine
            .search(&SearchRequest::new("anything", SearchMode::ValidatedOnly))
            .await
            .unwrap();
        assert!(outcome.hits.is_empty());
        assert!(!outcome.meta.explanation.is_empty());
        assert!(outcome.meta.degraded.is_none());
    }

    #[tokio::test]
    async fn search_is_deterministic() {
        let world = world().await;
        seed(
            &world,
            "d1",
            0,
            &[
                (Role::Assistant, "Try `cargo tree`, this fixes dependency confusion"),
                (Role::Assistant, "You can run `cargo update`, I recommend pinning"),
            ],
        )
        .await;

        let request = SearchRequest::new("cargo dependency", SearchMode::Semantic);
        let first: Vec<_> = world
            .engine
            .search(&request)
            .await
            .unwrap()
            .hits
            .iter()
            .map(|h| h.entry.id.clone())
            .collect();
        let second: Vec<_> = world
            .engine
            .search(&request)
            .await
            .unwrap()
            .hits
            .iter()
            .map(|h| h.entry.id.clone())
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected_precisely() {
        let world = world().await;
        let err = world
            .engine
            .search(&SearchRequest {
                min_validation_strength: Some(1.5),
                ..SearchRequest::new("x", SearchMode::Semantic)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);

        let err = world
            .engine
            .search(&SearchRequest {
                recency: Some("fortnight".to_string()),
                ..SearchRequest::new("x", SearchMode::Semantic)
            })
            .await
            .unwrap_err();
        assert!(err.message.contains("fortnight"));
    }

    #[tokio::test]
    async fn time_mode_parses_window_from_query() {
        let world = world().await;
        seed(&world, "w1", 0, &[(Role::User, "old nginx question")]).await;

        // Entry timestamps are 2025-06-01; "today" (real now) excludes them.
        let request = SearchRequest::new("nginx today", SearchMode::Time);
        let outcome = world.engine.search(&request).await.unwrap();
        assert!(outcome.hits.is_empty());
        assert_eq!(outcome.meta.window.as_deref(), Some("today"));
    }

    #[tokio::test]
    async fn mode_parsing_round_trips() {
        for name in SearchMode::accepted() {
            assert_eq!(SearchMode::parse(name).unwrap().as_str(), *name);
        }
        assert!(SearchMode::parse("psychic").is_none());
    }
}
