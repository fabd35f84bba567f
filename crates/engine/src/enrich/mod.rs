//! Enrichment pipeline: skeleton + optional predecessor → fully annotated
//! entry.
//!
//! With fixed lexicons and pattern sets this is a pure function of
//! `(entry, predecessor)` — the hook path and the batch orchestrator run the
//! exact same code, and any divergence between them is a bug.  Stages are
//! independent and fail soft: a failing stage logs, leaves its fields unset,
//! and never aborts the entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use hindsight_config::EnrichmentConfig;

use crate::embed::Embedder;
use crate::error::EngineResult;
use crate::schema::{ConversationEntry, Role, Sentiment};

pub mod feedback;
pub mod solution;
pub mod text;
pub mod topics;

pub use feedback::{FeedbackAnalyzer, SentimentOutcome};
pub use solution::SolutionClassifier;

pub struct Enricher {
    topic_lexicon: BTreeMap<String, Vec<String>>,
    topic_threshold: f32,
    tool_names: Vec<String>,
    solution: SolutionClassifier,
    feedback: FeedbackAnalyzer,
}

impl Enricher {
    pub async fn build(
        config: &EnrichmentConfig,
        embedder: Arc<dyn Embedder>,
    ) -> EngineResult<Self> {
        let mut topic_lexicon = topics::builtin_lexicon();
        for (topic, keywords) in &config.extra_topics {
            topic_lexicon
                .entry(topic.clone())
                .or_default()
                .extend(keywords.iter().cloned());
        }

        Ok(Self {
            topic_lexicon,
            topic_threshold: config.topic_threshold,
            tool_names: config.tool_names.clone(),
            solution: SolutionClassifier::new(),
            feedback: FeedbackAnalyzer::build(embedder).await?,
        })
    }

    // ── Stage 1: text features ───────────────────────────────────────────────

    pub fn apply_text_features(&self, entry: &mut ConversationEntry) {
        entry.content_length = entry.text.len();
        entry.has_code = text::has_code(&entry.text);
        entry.tools_used = text::tools_used(&entry.text, &self.tool_names);
    }

    // ── Stage 2: topic detection ─────────────────────────────────────────────

    pub fn apply_topics(&self, entry: &mut ConversationEntry) {
        entry.detected_topics =
            topics::score_topics(&entry.text, &self.topic_lexicon, self.topic_threshold);
    }

    // ── Stage 3: solution classification (assistant only) ────────────────────

    pub fn apply_solution(&self, entry: &mut ConversationEntry) {
        if entry.role != Role::Assistant {
            return;
        }
        entry.is_solution_attempt = self.solution.is_solution_attempt(&entry.text);
        entry.solution_category = entry
            .is_solution_attempt
            .then(|| self.solution.categorize(&entry.text));
        // Fresh solutions start neutral; the feedback learner adjusts later.
        if entry.is_solution_attempt && entry.solution_quality_score < 1.0 {
            entry.solution_quality_score = 1.0;
        }
    }

    // ── Stage 4: feedback classification (user only) ─────────────────────────

    /// Classify `entry` as feedback iff its immediate prior entry in the same
    /// session is an assistant solution attempt.  Returns `false` when the
    /// sentiment stage failed (the entry is still usable — fail-soft).
    pub async fn apply_feedback(
        &self,
        entry: &mut ConversationEntry,
        predecessor: Option<&ConversationEntry>,
    ) -> bool {
        if entry.role != Role::User {
            return true;
        }
        let Some(prior) = predecessor else { return true };
        if prior.session_id != entry.session_id
            || prior.role != Role::Assistant
            || !prior.is_solution_attempt
        {
            return true;
        }

        entry.is_feedback_to_solution = true;
        match self.feedback.analyze(&entry.text).await {
            Ok(outcome) => {
                entry.user_feedback_sentiment = outcome.sentiment;
                entry.validation_strength = outcome.strength;
                true
            }
            Err(err) => {
                // Fail-soft: the feedback flag stands, sentiment stays unset.
                warn!(id = %entry.id, error = %err, "feedback sentiment stage failed");
                false
            }
        }
    }

    // ── Full pipeline ────────────────────────────────────────────────────────

    pub async fn enrich(
        &self,
        entry: ConversationEntry,
        predecessor: Option<&ConversationEntry>,
    ) -> ConversationEntry {
        self.enrich_counted(entry, predecessor).await.0
    }

    /// Like [`Enricher::enrich`], also reporting how many stages failed soft.
    pub async fn enrich_counted(
        &self,
        mut entry: ConversationEntry,
        predecessor: Option<&ConversationEntry>,
    ) -> (ConversationEntry, usize) {
        self.apply_text_features(&mut entry);
        self.apply_topics(&mut entry);
        self.apply_solution(&mut entry);
        let stage_errors = usize::from(!self.apply_feedback(&mut entry, predecessor).await);
        (entry, stage_errors)
    }

    // ── Direct classification hooks (back-fill, feedback tool) ───────────────

    /// Full multi-modal sentiment classification of raw feedback text.
    pub async fn classify_feedback_text(&self, feedback_text: &str) -> EngineResult<SentimentOutcome> {
        self.feedback.analyze(feedback_text).await
    }

    /// Lexicon-only classification, for callers that ask for the cheap mode.
    pub fn classify_feedback_lexicon(&self, feedback_text: &str) -> SentimentOutcome {
        self.feedback
            .lexicon_pass(feedback_text)
            .unwrap_or_else(SentimentOutcome::none)
    }

    /// Whether `candidate` is feedback to `solution`, and with what sentiment.
    /// Reused by the chain back-fill so the decision matches real-time
    /// enrichment exactly.
    pub async fn classify_feedback_pair(
        &self,
        solution: &ConversationEntry,
        candidate: &ConversationEntry,
    ) -> Option<SentimentOutcome> {
        if candidate.role != Role::User
            || solution.role != Role::Assistant
            || !solution.is_solution_attempt
            || candidate.session_id != solution.session_id
        {
            return None;
        }
        match self.feedback.analyze(&candidate.text).await {
            Ok(outcome) if outcome.sentiment != Sentiment::None => Some(outcome),
            Ok(_) => None,
            Err(err) => {
                warn!(id = %candidate.id, error = %err, "pair classification failed");
                None
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use chrono::{TimeZone, Utc};

    async fn enricher() -> Enricher {
        Enricher::build(
            &EnrichmentConfig::default(),
            Arc::new(HashEmbedder::new(128)),
        )
        .await
        .unwrap()
    }

    fn skeleton(role: Role, position: u32, text: &str) -> ConversationEntry {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        ConversationEntry::skeleton("sess", role, position, text, ts)
    }

    #[tokio::test]
    async fn assistant_code_answer_becomes_solution() {
        let e = enricher().await;
        let entry = e
            .enrich(
                skeleton(
                    Role::Assistant,
                    2,
                    "Here's the fix:\n```rust\nfn main() { println!(\"ok\"); }\n```",
                ),
                None,
            )
            .await;

        assert!(entry.has_code);
        assert!(entry.is_solution_attempt);
        assert!(entry.solution_category.is_some());
        assert_eq!(entry.solution_quality_score, 1.0);
    }

    #[tokio::test]
    async fn user_entry_never_gets_solution_fields() {
        let e = enricher().await;
        let entry = e
            .enrich(
                skeleton(Role::User, 1, "```python\nprint('why does this fail?')\n```"),
                None,
            )
            .await;
        assert!(entry.has_code);
        assert!(!entry.is_solution_attempt);
        assert!(entry.solution_category.is_none());
    }

    #[tokio::test]
    async fn feedback_after_solution_is_classified() {
        let e = enricher().await;
        let solution = e
            .enrich(
                skeleton(Role::Assistant, 1, "Run this:\n```\ncargo clean && cargo build\n```"),
                None,
            )
            .await;

        let feedback = e
            .enrich(
                skeleton(Role::User, 2, "that worked, thanks!"),
                Some(&solution),
            )
            .await;

        assert!(feedback.is_feedback_to_solution);
        assert_eq!(feedback.user_feedback_sentiment, Sentiment::Positive);
        assert!(feedback.validation_strength > 0.0);
    }

    #[tokio::test]
    async fn user_message_after_non_solution_is_not_feedback() {
        let e = enricher().await;
        let question = e
            .enrich(skeleton(Role::Assistant, 1, "Which database are you using?"), None)
            .await;
        assert!(!question.is_solution_attempt);

        let reply = e
            .enrich(skeleton(Role::User, 2, "postgres, thanks for asking"), Some(&question))
            .await;
        assert!(!reply.is_feedback_to_solution);
        assert_eq!(reply.user_feedback_sentiment, Sentiment::None);
    }

    #[tokio::test]
    async fn enrichment_is_pure() {
        let e = enricher().await;
        let solution = e
            .enrich(skeleton(Role::Assistant, 1, "try `cargo update`, this fixes the lockfile"), None)
            .await;
        let first = e
            .enrich(skeleton(Role::User, 2, "still broken"), Some(&solution))
            .await;
        let second = e
            .enrich(skeleton(Role::User, 2, "still broken"), Some(&solution))
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn topics_and_tools_are_extracted() {
        let e = enricher().await;
        let entry = e
            .enrich(
                skeleton(
                    Role::Assistant,
                    1,
                    "I ran Grep over the deploy pipeline config to find the docker error",
                ),
                None,
            )
            .await;
        assert!(entry.tools_used.contains(&"Grep".to_string()));
        assert!(entry.detected_topics.contains_key("deployment"));
    }
}
