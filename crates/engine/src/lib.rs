//! Conversation indexing, enrichment, and retrieval engine.
//!
//! The host appends one JSONL record per message to a session log and fires a
//! hook; the ingest path enriches and upserts one entry per hook.  The batch
//! orchestrator rebuilds or back-fills whole sessions, the chain back-fill
//! repairs cross-message relationships real-time ingest cannot know, and the
//! unified search serves mode-routed, multi-factor ranked retrieval with
//! feedback-learned boosts.

pub mod backfill;
pub mod context;
pub mod embed;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod learner;
pub mod orchestrator;
pub mod reader;
pub mod reprocess;
pub mod schema;
pub mod search;
pub mod store;
pub mod timewin;

pub use backfill::{BackfillReport, ChainBackfill, PairingEvent};
pub use context::Engine;
pub use embed::{Embedder, HashEmbedder, OllamaEmbedder, embedder_from_config};
pub use enrich::{Enricher, SentimentOutcome};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use ingest::{IngestOutcome, IngestPipeline, detect_project};
pub use learner::{FeedbackLearner, LearnerSnapshot, LearnerUpdate};
pub use orchestrator::{BatchOrchestrator, SessionState, SyncReport};
pub use reader::{TranscriptReader, TranscriptRecord};
pub use reprocess::{FieldReprocessor, ReprocessOptions, ReprocessReport};
pub use schema::{
    ConversationEntry, MetaValue, Metadata, Role, Sentiment, SolutionCategory, entry_id,
    truncate_str,
};
pub use search::{
    ChainItem, ContextChain, SearchEngine, SearchHit, SearchMeta, SearchMode, SearchOutcome,
    SearchRequest, ValidationPreference,
};
pub use store::{Filter, QueryHit, StoredRow, VectorStore};
pub use timewin::{TimeWindow, extract_window, symbolic_window};
