//! Owned engine context.
//!
//! Everything the tool surface needs — store, embedder, enricher, learner —
//! is constructed once here and passed into handlers explicitly.  No
//! process-wide mutable globals: a second caller sees the same store because
//! it holds the same `Engine`, not because it re-opened a connection behind
//! the first one's back.

use std::sync::Arc;

use tracing::info;

use hindsight_config::AppConfig;

use crate::backfill::ChainBackfill;
use crate::embed::{Embedder, embedder_from_config};
use crate::enrich::Enricher;
use crate::error::EngineResult;
use crate::ingest::IngestPipeline;
use crate::learner::FeedbackLearner;
use crate::orchestrator::BatchOrchestrator;
use crate::reprocess::FieldReprocessor;
use crate::search::SearchEngine;
use crate::store::VectorStore;
use crate::store::local::RedbStore;

#[derive(Clone)]
pub struct Engine {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub enricher: Arc<Enricher>,
    pub learner: Arc<FeedbackLearner>,
}

impl Engine {
    /// Open the configured persistent store and wire up all components.
    pub async fn open(config: AppConfig) -> EngineResult<Self> {
        let embedder = embedder_from_config(&config.embedding);
        let store: Arc<dyn VectorStore> = Arc::new(RedbStore::open(
            &config.store.path,
            &config.store.collection,
            embedder.clone(),
        )?);
        Self::with_store(config, store, embedder).await
    }

    /// Wire components around an externally provided store (tests, or an
    /// alternative backend).
    pub async fn with_store(
        config: AppConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> EngineResult<Self> {
        let config = Arc::new(config);
        let enricher = Arc::new(Enricher::build(&config.enrichment, embedder.clone()).await?);
        let learner = Arc::new(FeedbackLearner::new(config.learner.clone(), store.clone()));
        info!(
            store_rows = store.count().await.unwrap_or(0),
            provider = %config.embedding.provider,
            "engine ready"
        );
        Ok(Self {
            config,
            store,
            embedder,
            enricher,
            learner,
        })
    }

    pub fn ingest(&self) -> IngestPipeline {
        IngestPipeline::new(self.config.clone(), self.store.clone(), self.enricher.clone())
    }

    pub fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(self.config.clone(), self.store.clone(), self.enricher.clone())
    }

    pub fn backfill(&self) -> ChainBackfill {
        ChainBackfill::new(
            self.store.clone(),
            self.enricher.clone(),
            self.config.store.update_batch_limit,
        )
    }

    pub fn search_engine(&self) -> SearchEngine {
        SearchEngine::new(
            self.config.clone(),
            self.store.clone(),
            Some(self.learner.clone()),
        )
    }

    pub fn reprocessor(&self) -> FieldReprocessor {
        FieldReprocessor::new(self.config.clone(), self.store.clone(), self.enricher.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn engine_wires_components_around_one_store() {
        let embedder = Arc::new(HashEmbedder::new(32));
        let store = Arc::new(MemoryStore::new(embedder.clone()));
        let engine = Engine::with_store(AppConfig::default(), store, embedder)
            .await
            .unwrap();

        assert_eq!(engine.store.count().await.unwrap(), 0);
        // All factories hand out components bound to the same store.
        let _ = engine.ingest();
        let _ = engine.orchestrator();
        let _ = engine.backfill();
        let _ = engine.search_engine();
        let _ = engine.reprocessor();
    }

    #[tokio::test]
    async fn open_creates_the_persistent_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store.path = dir.path().join("store").to_string_lossy().to_string();

        let engine = Engine::open(config).await.unwrap();
        assert_eq!(engine.store.count().await.unwrap(), 0);
        assert!(dir.path().join("store").join("conversations.redb").exists());
    }
}
