//! Vector store adapter.
//!
//! The underlying collection is pluggable behind [`VectorStore`].  Two
//! backends ship: [`local::RedbStore`], a single-file persistent collection,
//! and [`memory::MemoryStore`], which backs the test suite.
//!
//! Correctness rule for all callers: IDs returned by `get_where` are the
//! ground truth for subsequent `update` calls.  Re-deriving an ID from
//! message text is forbidden — it breaks whenever a record was skipped at
//! original ingest.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::schema::{MetaValue, Metadata};

pub mod local;
pub mod memory;

// ── Filter ───────────────────────────────────────────────────────────────────

/// Conjunctive equality filter over metadata fields.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, MetaValue)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Value of the first clause on `key`, if any.
    pub fn value_of(&self, key: &str) -> Option<&MetaValue> {
        self.clauses
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.clauses
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

// ── Row records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub similarity: f32,
}

// ── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace whole rows.  Text is embedded by the configured
    /// encoder; an existing row's embedding is recomputed.  Row-atomic.
    async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        metadatas: &[Metadata],
    ) -> EngineResult<()>;

    /// Fetch rows by ID.  Missing IDs are omitted, not errors.
    async fn get(&self, ids: &[String]) -> EngineResult<Vec<StoredRow>>;

    /// All rows matching `filter`, optionally projected to `fields`.
    /// Ordered by ID for reproducibility; the caller iterates.
    async fn get_where(
        &self,
        filter: &Filter,
        fields: Option<&[&str]>,
    ) -> EngineResult<Vec<StoredRow>>;

    /// K nearest rows by cosine similarity to the embedded query text.
    async fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<&Filter>,
    ) -> EngineResult<Vec<QueryHit>>;

    /// Metadata-only replacement; embeddings are untouched.  Every ID must
    /// exist — unknown IDs fail the batch with `not_found` before any write.
    async fn update(&self, ids: &[String], metadatas: &[Metadata]) -> EngineResult<()>;

    async fn count(&self) -> EngineResult<usize>;

    /// Remove matching rows.  Used only by reindex
    /// (remove-by-session-then-reinsert); the core never deletes otherwise.
    async fn delete_where(&self, filter: &Filter) -> EngineResult<usize>;
}

pub(crate) fn project_fields(metadata: &Metadata, fields: Option<&[&str]>) -> Metadata {
    match fields {
        None => metadata.clone(),
        Some(wanted) => metadata
            .iter()
            .filter(|(key, _)| wanted.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

// ── Bounded retry with jittered backoff ──────────────────────────────────────

/// Retry `op` up to `attempts` times with exponential backoff plus jitter.
/// Validation and not-found failures are not retried — only transient kinds.
pub async fn with_retry<T, F, Fut>(label: &str, attempts: usize, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut delay = Duration::from_millis(50);
    let mut last: Option<EngineError> = None;

    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let transient = matches!(
                    err.kind,
                    crate::error::ErrorKind::StoreUnavailable
                        | crate::error::ErrorKind::EmbeddingFailed
                        | crate::error::ErrorKind::Timeout
                        | crate::error::ErrorKind::Internal
                );
                if !transient || attempt == attempts {
                    return Err(err);
                }
                warn!(label, attempt, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay + jitter()).await;
                delay = delay.saturating_mul(2);
                last = Some(err);
            }
        }
    }

    Err(last.unwrap_or_else(|| EngineError::internal(format!("{label}: retry exhausted"))))
}

fn jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % 40))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn filter_matches_conjunctively() {
        let mut meta = Metadata::new();
        meta.insert("session_id".into(), MetaValue::Str("s1".into()));
        meta.insert("has_code".into(), MetaValue::Bool(true));

        assert!(Filter::new().eq("session_id", "s1").matches(&meta));
        assert!(
            Filter::new()
                .eq("session_id", "s1")
                .eq("has_code", true)
                .matches(&meta)
        );
        assert!(
            !Filter::new()
                .eq("session_id", "s1")
                .eq("has_code", false)
                .matches(&meta)
        );
        assert!(!Filter::new().eq("absent", "x").matches(&meta));
    }

    #[test]
    fn project_fields_keeps_only_requested() {
        let mut meta = Metadata::new();
        meta.insert("a".into(), MetaValue::Int(1));
        meta.insert("b".into(), MetaValue::Int(2));

        let projected = project_fields(&meta, Some(&["a"]));
        assert!(projected.contains_key("a"));
        assert!(!projected.contains_key("b"));
        assert_eq!(project_fields(&meta, None).len(), 2);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::store("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_validation_errors() {
        let calls = AtomicUsize::new(0);
        let result: EngineResult<()> = with_retry("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::validation("bad input")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
