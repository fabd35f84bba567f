//! Pluggable text→vector encoders.
//!
//! Two backends ship: a deterministic hash-projection embedder that needs no
//! network (the default, and what the test suite runs on), and an HTTP client
//! for a local Ollama embeddings endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::warn;

use hindsight_config::EmbeddingConfig;

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Build the configured embedder.  Unknown providers fall back to `hash` with
/// a warning rather than failing startup.
pub fn embedder_from_config(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.provider.as_str() {
        "ollama" => Arc::new(OllamaEmbedder::new(
            &config.ollama_base_url,
            &config.model,
            config.dimension,
        )),
        "hash" => Arc::new(HashEmbedder::new(config.dimension)),
        other => {
            warn!(provider = other, "unknown embedding provider — using hash");
            Arc::new(HashEmbedder::new(config.dimension))
        }
    }
}

// ── Deterministic hash projection ────────────────────────────────────────────

/// Offline embedder: each token is hashed into a signed bucket and the
/// accumulated vector is L2-normalised.  Pure function of the input text, so
/// enrichment and search stay reproducible without a model server.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest ≥ 8 bytes"));
            let bucket = (seed % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        Ok(self.project(text))
    }
}

// ── Ollama HTTP backend ──────────────────────────────────────────────────────

pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|err| EngineError::embedding(format!("ollama request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(EngineError::embedding(format!(
                "ollama returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| EngineError::embedding(format!("ollama response unreadable: {err}")))?;

        let vector: Vec<f32> = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| EngineError::embedding("ollama response missing embedding"))?;

        if vector.len() != self.dimension {
            warn!(
                got = vector.len(),
                expected = self.dimension,
                "unexpected embedding dimension"
            );
            return Err(EngineError::embedding(format!(
                "dimension mismatch: got {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(vector)
    }
}

// ── Similarity helper shared by store backends and enrichment ────────────────

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

// ── Tests ────────────────────────────────────────────────────────────────────
