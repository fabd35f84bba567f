//! Feedback-sentiment classification for user entries that answer a solution
//! attempt.
//!
//! Three modalities feed a confidence-weighted fusion:
//! 1. a lexicon/pattern analyzer with a negation lookback window,
//! 2. cosine similarity against pre-computed embedding centroids for
//!    positive / negative / partial feedback,
//! 3. a technical-domain analyzer biased on build/test/runtime/deploy cues.
//!
//! Agreement across modalities raises confidence.  Centroids are computed
//! once at construction from fixed exemplar phrases, so classification stays
//! a pure function of the input text for a fixed embedder.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::embed::{Embedder, cosine_similarity};
use crate::error::EngineResult;
use crate::schema::Sentiment;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentOutcome {
    pub sentiment: Sentiment,
    /// Validation strength in [0, 1].
    pub strength: f32,
    /// Analyzer confidence in [0, 1].
    pub confidence: f32,
}

impl SentimentOutcome {
    pub fn none() -> Self {
        Self {
            sentiment: Sentiment::None,
            strength: 0.0,
            confidence: 0.0,
        }
    }
}

// ── Lexicons ─────────────────────────────────────────────────────────────────

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "worked", "works", "perfect", "great", "awesome",
    "solved", "fixed", "nice", "excellent", "yes", "correct", "exactly",
];

const NEGATIVE_WORDS: &[&str] = &[
    "error", "broken", "failed", "failing", "fails", "wrong", "nope",
    "crash", "worse", "stuck", "unchanged", "incorrect",
];

const PARTIAL_MARKERS: &[&str] = &[
    "partially", "almost", "closer", "better but", "nearly", "halfway",
    "some of it", "mostly",
];

const POSITIVE_PHRASES: &[&str] = &[
    "that worked", "it worked", "works now", "that did it", "problem solved",
    "all good now", "looks good",
];

const NEGATIVE_PHRASES: &[&str] = &[
    "didn't work", "doesn't work", "did not work", "does not work",
    "still broken", "still failing", "same error", "no luck", "not working",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "didn't", "doesn't", "isn't"];

const POSITIVE_EXEMPLARS: &[&str] = &[
    "that worked perfectly, thanks",
    "great, the fix solved the problem",
    "works now, thank you",
    "perfect, the tests pass now",
    "that did it, everything builds",
];

const NEGATIVE_EXEMPLARS: &[&str] = &[
    "that didn't work at all",
    "still getting the same error",
    "no, it's still broken",
    "the build still fails",
    "that made it worse",
];

const PARTIAL_EXEMPLARS: &[&str] = &[
    "closer, but still one failure",
    "partially working now",
    "better, but the warning remains",
    "almost there, one test still fails",
    "some of it works now",
];

// ── Analyzer ─────────────────────────────────────────────────────────────────

pub struct FeedbackAnalyzer {
    embedder: Arc<dyn Embedder>,
    centroids: Vec<(Sentiment, Vec<f32>)>,
    technical: Vec<(Sentiment, Regex)>,
}

impl FeedbackAnalyzer {
    pub async fn build(embedder: Arc<dyn Embedder>) -> EngineResult<Self> {
        let mut centroids = Vec::with_capacity(3);
        for (sentiment, exemplars) in [
            (Sentiment::Positive, POSITIVE_EXEMPLARS),
            (Sentiment::Negative, NEGATIVE_EXEMPLARS),
            (Sentiment::Partial, PARTIAL_EXEMPLARS),
        ] {
            let texts: Vec<String> = exemplars.iter().map(|s| s.to_string()).collect();
            let vectors = embedder.embed_batch(&texts).await?;
            centroids.push((sentiment, mean_vector(&vectors)));
        }

        let technical = [
            (Sentiment::Positive, r"(?i)\b(build (passes|succeeds|works)|tests? (pass|passing)|compiles (now|fine|cleanly)|deploy(ed)? (succeeded|worked)|no more errors|error is gone)\b"),
            (Sentiment::Negative, r"(?i)\b(build fail(s|ed)|tests? fail(s|ed|ing)?|compilation error|segfault|stack trace|exception|crash(es|ed)?|deploy failed|still throws)\b"),
            (Sentiment::Partial, r"(?i)\b(fewer errors|one test still fail(s|ing)?|most tests pass|compiles but)\b"),
        ]
        .iter()
        .map(|(s, p)| (*s, Regex::new(p).expect("static pattern")))
        .collect();

        Ok(Self {
            embedder,
            centroids,
            technical,
        })
    }

    // ── Modality 1: lexicon/pattern ──────────────────────────────────────────

    pub fn lexicon_pass(&self, text: &str) -> Option<SentimentOutcome> {
        let lower = text.to_lowercase();

        let mut score = 0.0_f32;
        let mut pos_hits = 0usize;
        let mut neg_hits = 0usize;

        for phrase in POSITIVE_PHRASES {
            if lower.contains(phrase) {
                score += 0.4;
                pos_hits += 1;
            }
        }
        for phrase in NEGATIVE_PHRASES {
            if lower.contains(phrase) {
                score -= 0.4;
                neg_hits += 1;
            }
        }

        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();
        for (i, word) in words.iter().enumerate() {
            // 2-word lookback so "not working" and "no errors" both land right.
            let negated = (i > 0 && NEGATIONS.contains(&words[i - 1]))
                || (i > 1 && NEGATIONS.contains(&words[i - 2]));

            if POSITIVE_WORDS.contains(word) {
                score += if negated { -0.15 } else { 0.2 };
                if negated {
                    neg_hits += 1;
                } else {
                    pos_hits += 1;
                }
            } else if NEGATIVE_WORDS.contains(word) {
                score += if negated { 0.1 } else { -0.2 };
                if negated {
                    pos_hits += 1;
                } else {
                    neg_hits += 1;
                }
            }
        }

        let partial_marker = PARTIAL_MARKERS.iter().any(|m| lower.contains(m));
        if pos_hits == 0 && neg_hits == 0 && !partial_marker {
            return None;
        }

        let sentiment = if partial_marker || (pos_hits > 0 && neg_hits > 0) {
            Sentiment::Partial
        } else if score > 0.0 {
            Sentiment::Positive
        } else {
            Sentiment::Negative
        };

        let strength = score.abs().clamp(0.1, 1.0);
        let confidence = (0.35 + score.abs() * 0.5).min(1.0);
        Some(SentimentOutcome {
            sentiment,
            strength,
            confidence,
        })
    }

    // ── Modality 2: embedding centroids ──────────────────────────────────────

    pub async fn centroid_pass(&self, text: &str) -> EngineResult<Option<SentimentOutcome>> {
        let vector = self.embedder.embed(text).await?;

        let mut scored: Vec<(Sentiment, f32)> = self
            .centroids
            .iter()
            .map(|(sentiment, centroid)| (*sentiment, cosine_similarity(&vector, centroid)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (best_sentiment, best) = scored[0];
        let margin = best - scored.get(1).map(|s| s.1).unwrap_or(0.0);
        if best < 0.15 {
            return Ok(None);
        }

        Ok(Some(SentimentOutcome {
            sentiment: best_sentiment,
            strength: best.clamp(0.0, 1.0),
            confidence: (best * 0.5 + margin * 2.0).clamp(0.0, 1.0),
        }))
    }

    // ── Modality 3: technical domain ─────────────────────────────────────────

    pub fn technical_pass(&self, text: &str) -> Option<SentimentOutcome> {
        let mut hit: Option<Sentiment> = None;
        for (sentiment, re) in &self.technical {
            if re.is_match(text) {
                hit = Some(match (hit, sentiment) {
                    // Partial cues outrank a bare positive or negative.
                    (Some(_), Sentiment::Partial) => Sentiment::Partial,
                    (Some(prev), _) if prev != *sentiment => Sentiment::Partial,
                    (_, s) => *s,
                });
            }
        }

        hit.map(|sentiment| SentimentOutcome {
            sentiment,
            strength: 0.7,
            confidence: 0.6,
        })
    }

    // ── Fusion ───────────────────────────────────────────────────────────────

    /// Confidence-weighted fusion of the three modalities.  Agreement across
    /// modalities raises both confidence and strength.
    pub async fn analyze(&self, text: &str) -> EngineResult<SentimentOutcome> {
        let lexicon = self.lexicon_pass(text);
        let centroid = self.centroid_pass(text).await?;
        let technical = self.technical_pass(text);

        let weighted: Vec<(f32, SentimentOutcome)> = [
            (0.45, lexicon),
            (0.35, centroid),
            (0.20, technical),
        ]
        .into_iter()
        .filter_map(|(w, outcome)| outcome.map(|o| (w, o)))
        .collect();

        if weighted.is_empty() {
            return Ok(SentimentOutcome::none());
        }

        let mut votes: Vec<(Sentiment, f32)> = Vec::new();
        for (weight, outcome) in &weighted {
            match votes.iter_mut().find(|(s, _)| s == &outcome.sentiment) {
                Some((_, v)) => *v += weight * outcome.confidence,
                None => votes.push((outcome.sentiment, weight * outcome.confidence)),
            }
        }
        votes.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (winner, vote) = votes[0];

        if vote < 0.08 {
            return Ok(SentimentOutcome::none());
        }

        let agreeing: Vec<&(f32, SentimentOutcome)> = weighted
            .iter()
            .filter(|(_, o)| o.sentiment == winner)
            .collect();
        let weight_sum: f32 = agreeing.iter().map(|(w, _)| w).sum();
        let strength: f32 = agreeing
            .iter()
            .map(|(w, o)| w * o.strength)
            .sum::<f32>()
            / weight_sum.max(f32::EPSILON);
        let mut confidence: f32 = agreeing
            .iter()
            .map(|(w, o)| w * o.confidence)
            .sum::<f32>()
            / weight_sum.max(f32::EPSILON);

        let boost = if agreeing.len() >= 2 { 1.2 } else { 1.0 };
        confidence = (confidence * boost).min(1.0);
        let strength = (strength * if agreeing.len() >= 2 { 1.1 } else { 1.0 }).clamp(0.0, 1.0);

        debug!(
            sentiment = winner.as_str(),
            strength,
            confidence,
            modalities = weighted.len(),
            agreeing = agreeing.len(),
            "feedback sentiment fused"
        );

        Ok(SentimentOutcome {
            sentiment: winner,
            strength,
            confidence,
        })
    }
}

fn mean_vector(vectors: &[Vec<f32>]) -> Vec<f32> {
    if vectors.is_empty() {
        return Vec::new();
    }
    let dim = vectors[0].len();
    let mut mean = vec![0.0_f32; dim];
    for vector in vectors {
        for (m, v) in mean.iter_mut().zip(vector.iter()) {
            *m += v;
        }
    }
    let n = vectors.len() as f32;
    for m in &mut mean {
        *m /= n;
    }
    mean
}

// ── Tests ────────────────────────────────────────────────────────────────────
