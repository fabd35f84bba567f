//! The fixed tool surface.
//!
//! Thirteen operations, validated parameters, per-call deadlines, cache, and
//! telemetry.  Handlers receive the owned [`Engine`] context — no ambient
//! globals — and read-class results are cached until the next write-class
//! call invalidates them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument};

use hindsight_engine::{
    BackfillReport, ConversationEntry, Engine, EngineError, EngineResult, ErrorKind,
    PairingEvent, Filter, ReprocessOptions, Role, SearchEngine, SearchHit, SearchMode,
    SearchRequest, Sentiment, ValidationPreference, detect_project, timewin,
};

use crate::cache::ResultCache;
use crate::monitor::PerfMonitor;
use crate::{ToolResult, ToolSpec};

pub const OPERATIONS: &[&str] = &[
    "search_conversations_unified",
    "get_conversation_context_chain",
    "force_conversation_sync",
    "backfill_conversation_chains",
    "run_unified_enhancement",
    "smart_metadata_sync_status",
    "process_feedback_unified",
    "get_learning_insights",
    "get_system_status",
    "get_performance_analytics_dashboard",
    "detect_current_project",
    "get_project_context_summary",
    "force_database_connection_refresh",
];

/// Operations that can change what any read returns.
const WRITE_OPERATIONS: &[&str] = &[
    "force_conversation_sync",
    "backfill_conversation_chains",
    "run_unified_enhancement",
    "process_feedback_unified",
    "force_database_connection_refresh",
];

/// Read operations whose results are worth caching.
const CACHEABLE: &[&str] = &[
    "search_conversations_unified",
    "get_conversation_context_chain",
    "get_learning_insights",
    "smart_metadata_sync_status",
    "get_project_context_summary",
];

pub struct ToolSurface {
    engine: Engine,
    search: SearchEngine,
    cache: Mutex<ResultCache>,
    monitor: Mutex<PerfMonitor>,
    /// Admission control so a burst of tool calls cannot stampede the
    /// embedding backend.
    admission: tokio::sync::Semaphore,
}

impl ToolSurface {
    pub fn new(engine: Engine) -> Self {
        let cache = ResultCache::new(
            engine.config.cache.capacity,
            Duration::from_secs(engine.config.cache.ttl_secs),
        );
        let monitor = PerfMonitor::new(
            engine.config.monitor.latency_window,
            engine.config.monitor.slow_call_ms,
        );
        let admission =
            tokio::sync::Semaphore::new(engine.config.runtime.tool_concurrency.max(1));
        let search = engine.search_engine();
        Self {
            engine,
            search,
            cache: Mutex::new(cache),
            monitor: Mutex::new(monitor),
            admission,
        }
    }

    /// Drop every cached result.  Called internally after write-class
    /// operations, and by embedding hosts after an out-of-band ingest.
    pub fn invalidate_cache(&self) {
        self.cache.lock().expect("cache mutex poisoned").clear();
    }

    pub fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new(
                "search_conversations_unified",
                "Mode-routed ranked search over indexed conversations",
                &[
                    ("query", "text query; empty or '*' means wildcard", false),
                    ("search_mode", "semantic|validated_only|failed_only|recent_only|by_topic|time", false),
                    ("limit", "maximum results", false),
                    ("project_context", "project name boosting matching entries", false),
                    ("topic_focus", "topic filter/boost (required for by_topic)", false),
                    ("validation_preference", "validated_only|include_failures|neutral", false),
                    ("date_range", "{start, end} UTC seconds", false),
                    ("recency", "today|yesterday|last_week|last_month|recent", false),
                    ("include_code_only", "only entries containing code", false),
                    ("type", "user|assistant", false),
                    ("include_context_chains", "attach surrounding messages", false),
                    ("chain_length", "messages per side in context chains", false),
                    ("min_validation_strength", "validation strength floor [0,1]", false),
                    ("use_validation_boost", "consult learner boosts (default true)", false),
                    ("prefer_recent", "apply the recency boost", false),
                ],
            ),
            ToolSpec::new(
                "get_conversation_context_chain",
                "Anchor entry plus ordered chain of surrounding messages",
                &[
                    ("message_id", "entry ID to anchor on", true),
                    ("chain_length", "messages per side", false),
                    ("show_relationships", "include relationship IDs", false),
                ],
            ),
            ToolSpec::new(
                "force_conversation_sync",
                "Full rebuild/back-fill sweep over all session logs",
                &[],
            ),
            ToolSpec::new(
                "backfill_conversation_chains",
                "Populate prev/next/solution/feedback links from stored entries",
                &[
                    ("session_id", "restrict to one session", false),
                    ("limit", "maximum sessions", false),
                ],
            ),
            ToolSpec::new(
                "run_unified_enhancement",
                "Back-fill chains and optionally re-derive specific fields",
                &[
                    ("session_id", "restrict to one session", false),
                    ("max_sessions", "cap processed sessions", false),
                    ("force_reprocess_fields", "field names to re-derive", false),
                    ("create_backup", "snapshot prior values first (default true)", false),
                ],
            ),
            ToolSpec::new(
                "smart_metadata_sync_status",
                "Enriched-coverage percentage and store counts",
                &[],
            ),
            ToolSpec::new(
                "process_feedback_unified",
                "Apply explicit user feedback to a stored solution",
                &[
                    ("feedback_text", "the user's feedback", true),
                    ("solution_context", "solution entry ID or descriptive query", true),
                    ("processing_mode", "multi_modal|lexicon_only", false),
                ],
            ),
            ToolSpec::new(
                "get_learning_insights",
                "Aggregates from the feedback learner",
                &[
                    ("insight_type", "success_rates|topic_effectiveness|project_breakdown|recent_trends", false),
                    ("time_range", "today|yesterday|last_week|last_month|recent", false),
                ],
            ),
            ToolSpec::new(
                "get_system_status",
                "Health, cache, and monitor metrics",
                &[
                    ("status_type", "full|store|cache|monitor", false),
                    ("format", "json|summary", false),
                ],
            ),
            ToolSpec::new(
                "get_performance_analytics_dashboard",
                "Latency, cache hit rate, and error rate",
                &[],
            ),
            ToolSpec::new(
                "detect_current_project",
                "Resolve the current project from the working directory",
                &[("working_directory", "override the detected directory", false)],
            ),
            ToolSpec::new(
                "get_project_context_summary",
                "Per-project aggregates over a recent window",
                &[
                    ("project_name", "project to summarize (default: all)", false),
                    ("days_back", "window size in days (default 30)", false),
                ],
            ),
            ToolSpec::new(
                "force_database_connection_refresh",
                "Revalidate the store and drop cached results",
                &[],
            ),
        ]
    }

    /// Execute one tool call.  Always returns a record; never panics or
    /// propagates an error past this boundary.
    #[instrument(skip(self, params))]
    pub async fn call(&self, operation: &str, params: Value) -> ToolResult {
        let started = Instant::now();

        if !OPERATIONS.contains(&operation) {
            let result = ToolResult::failure(
                operation,
                ErrorKind::ValidationFailed.code(),
                format!("unknown operation '{operation}', accepted: {OPERATIONS:?}"),
                elapsed_ms(started),
            );
            self.record(operation, &result);
            return result;
        }
        if !params.is_object() && !params.is_null() {
            let result = ToolResult::failure(
                operation,
                ErrorKind::ValidationFailed.code(),
                "params must be a JSON object",
                elapsed_ms(started),
            );
            self.record(operation, &result);
            return result;
        }
        let params = if params.is_null() { json!({}) } else { params };

        // Cache lookup for read operations.
        let cache_key = ResultCache::key(operation, &params);
        if CACHEABLE.contains(&operation) {
            let cached = self
                .cache
                .lock()
                .expect("cache mutex poisoned")
                .get(&cache_key);
            if let Some(value) = cached {
                let result = ToolResult::success(operation, value, true, elapsed_ms(started));
                self.record(operation, &result);
                return result;
            }
        }

        let deadline = Duration::from_millis(self.engine.config.runtime.tool_deadline_ms.max(1));
        let outcome = match tokio::time::timeout(deadline, async {
            let _permit = self
                .admission
                .acquire()
                .await
                .map_err(|_| EngineError::internal("tool surface shut down"))?;
            self.dispatch(operation, &params).await
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::timeout(format!(
                "operation '{operation}' exceeded {}ms deadline",
                deadline.as_millis()
            ))),
        };

        let result = match outcome {
            Ok(data) => {
                if WRITE_OPERATIONS.contains(&operation) {
                    self.invalidate_cache();
                } else if CACHEABLE.contains(&operation) && !is_degraded(&data) {
                    self.cache
                        .lock()
                        .expect("cache mutex poisoned")
                        .put(cache_key, data.clone());
                }
                ToolResult::success(operation, data, false, elapsed_ms(started))
            }
            Err(err) => {
                ToolResult::failure(operation, err.kind.code(), err.message, elapsed_ms(started))
            }
        };
        self.record(operation, &result);
        result
    }

    fn record(&self, operation: &str, result: &ToolResult) {
        self.monitor
            .lock()
            .expect("monitor mutex poisoned")
            .record(operation, result.duration_ms, result.ok, result.cache_hit);
    }

    async fn dispatch(&self, operation: &str, params: &Value) -> EngineResult<Value> {
        match operation {
            "search_conversations_unified" => self.op_search(params).await,
            "get_conversation_context_chain" => self.op_context_chain(params).await,
            "force_conversation_sync" => self.op_sync().await,
            "backfill_conversation_chains" => self.op_backfill(params).await,
            "run_unified_enhancement" => self.op_enhancement(params).await,
            "smart_metadata_sync_status" => self.op_sync_status().await,
            "process_feedback_unified" => self.op_process_feedback(params).await,
            "get_learning_insights" => self.op_insights(params).await,
            "get_system_status" => self.op_system_status(params).await,
            "get_performance_analytics_dashboard" => self.op_dashboard(),
            "detect_current_project" => self.op_detect_project(params),
            "get_project_context_summary" => self.op_project_summary(params).await,
            "force_database_connection_refresh" => self.op_refresh().await,
            _ => Err(EngineError::internal("unreachable operation")),
        }
    }

    // ── search_conversations_unified ─────────────────────────────────────────

    async fn op_search(&self, params: &Value) -> EngineResult<Value> {
        let mode_name = str_param(params, "search_mode")?.unwrap_or_else(|| "semantic".into());
        let mode = SearchMode::parse(&mode_name).ok_or_else(|| {
            EngineError::validation(format!(
                "unknown search_mode '{mode_name}', accepted: {:?}",
                SearchMode::accepted()
            ))
        })?;

        let preference = match str_param(params, "validation_preference")? {
            Some(raw) => ValidationPreference::parse(&raw).ok_or_else(|| {
                EngineError::validation(format!(
                    "unknown validation_preference '{raw}', accepted: {:?}",
                    ValidationPreference::accepted()
                ))
            })?,
            None => ValidationPreference::Neutral,
        };

        let role = match str_param(params, "type")? {
            Some(raw) => Some(Role::parse(&raw).ok_or_else(|| {
                EngineError::validation(format!(
                    "unknown type '{raw}', accepted: [\"user\", \"assistant\"]"
                ))
            })?),
            None => None,
        };

        let date_range = match params.get("date_range") {
            None | Some(Value::Null) => None,
            Some(Value::Object(range)) => {
                let start = range.get("start").and_then(Value::as_i64).ok_or_else(|| {
                    EngineError::validation("date_range.start must be an integer")
                })?;
                let end = range.get("end").and_then(Value::as_i64).ok_or_else(|| {
                    EngineError::validation("date_range.end must be an integer")
                })?;
                Some((start, end))
            }
            Some(_) => {
                return Err(EngineError::validation(
                    "date_range must be an object with start and end",
                ));
            }
        };

        let request = SearchRequest {
            query: str_param(params, "query")?.unwrap_or_default(),
            limit: usize_param(params, "limit")?.unwrap_or(0),
            project_context: str_param(params, "project_context")?,
            topic_focus: str_param(params, "topic_focus")?,
            validation_preference: preference,
            date_range,
            recency: str_param(params, "recency")?,
            include_code_only: bool_param(params, "include_code_only")?.unwrap_or(false),
            role,
            include_context_chains: bool_param(params, "include_context_chains")?.unwrap_or(false),
            chain_length: usize_param(params, "chain_length")?.unwrap_or(2),
            min_validation_strength: f32_param(params, "min_validation_strength")?,
            use_validation_boost: bool_param(params, "use_validation_boost")?.unwrap_or(true),
            prefer_recent: bool_param(params, "prefer_recent")?.unwrap_or(false),
            ..SearchRequest::new("", mode)
        };

        let outcome = self.search.search(&request).await?;
        Ok(json!({
            "results": outcome.hits.iter().map(hit_json).collect::<Vec<_>>(),
            "meta": outcome.meta,
        }))
    }

    // ── get_conversation_context_chain ───────────────────────────────────────

    async fn op_context_chain(&self, params: &Value) -> EngineResult<Value> {
        let message_id = required_str(params, "message_id")?;
        let chain_length = usize_param(params, "chain_length")?.unwrap_or(2);
        let show_relationships = bool_param(params, "show_relationships")?.unwrap_or(true);

        let chain = self.search.context_chain(&message_id, chain_length).await?;
        let mut data = json!({
            "anchor": chain.anchor,
            "chain": chain.items,
        });

        if show_relationships {
            let rows = self.engine.store.get(&[message_id.clone()]).await?;
            if let Some(row) = rows.first() {
                let entry = ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata);
                data["relationships"] = json!({
                    "previous_message_id": entry.previous_message_id,
                    "next_message_id": entry.next_message_id,
                    "related_solution_id": entry.related_solution_id,
                    "feedback_message_id": entry.feedback_message_id,
                });
            }
        }
        Ok(data)
    }

    // ── force_conversation_sync ──────────────────────────────────────────────

    async fn op_sync(&self) -> EngineResult<Value> {
        let report = self.engine.orchestrator().sync_all(None).await;
        let (learned, learn_errors) = self
            .engine
            .learner
            .observe_all(&report.backfill.new_pairings)
            .await;

        info!(
            sessions = report.sessions_scanned,
            entries = report.entries_indexed,
            learned,
            "forced sync complete"
        );
        Ok(json!({
            "success": report.is_success(),
            "sessions_scanned": report.sessions_scanned,
            "sessions_reindexed": report.sessions_reindexed,
            "sessions_enhanced": report.sessions_enhanced,
            "sessions_skipped": report.sessions_skipped,
            "entries_indexed": report.entries_indexed,
            "relationships": {
                "sessions_processed": report.backfill.sessions_processed,
                "links_set": report.backfill.links_set,
                "pairs_created": report.backfill.pairs_created,
                "updates_applied": report.backfill.updates_applied,
            },
            "learner_updates_applied": learned,
            "learner_errors": learn_errors,
            "errors": report.errors,
            "duration_ms": report.duration_ms,
        }))
    }

    // ── backfill_conversation_chains ─────────────────────────────────────────

    async fn op_backfill(&self, params: &Value) -> EngineResult<Value> {
        let backfill = self.engine.backfill();
        let report = match str_param(params, "session_id")? {
            Some(session_id) => {
                let (stats, pairings) = backfill.run_session(&session_id).await?;
                BackfillReport {
                    sessions_processed: 1,
                    links_set: stats.links_set,
                    pairs_created: stats.pairs_created,
                    updates_applied: stats.updates_applied,
                    new_pairings: pairings,
                    errors: Vec::new(),
                }
            }
            None => {
                let limit = usize_param(params, "limit")?;
                backfill.run_all(limit).await?
            }
        };

        let (learned, learn_errors) = self
            .engine
            .learner
            .observe_all(&report.new_pairings)
            .await;
        Ok(json!({
            "sessions_processed": report.sessions_processed,
            "links_set": report.links_set,
            "pairs_created": report.pairs_created,
            "updates_applied": report.updates_applied,
            "learner_updates_applied": learned,
            "learner_errors": learn_errors,
            "errors": report.errors,
        }))
    }

    // ── run_unified_enhancement ──────────────────────────────────────────────

    async fn op_enhancement(&self, params: &Value) -> EngineResult<Value> {
        let session_id = str_param(params, "session_id")?;
        let max_sessions = usize_param(params, "max_sessions")?;
        let create_backup = bool_param(params, "create_backup")?.unwrap_or(true);
        let fields: Vec<String> = match params.get("force_reprocess_fields") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        EngineError::validation(
                            "force_reprocess_fields must be an array of strings",
                        )
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?,
            Some(_) => {
                return Err(EngineError::validation(
                    "force_reprocess_fields must be an array of strings",
                ));
            }
        };

        let backfill = self.engine.backfill();
        let backfill_report = match &session_id {
            Some(session) => {
                let (stats, pairings) = backfill.run_session(session).await?;
                let (learned, _) = self.engine.learner.observe_all(&pairings).await;
                json!({
                    "sessions_processed": 1,
                    "links_set": stats.links_set,
                    "pairs_created": stats.pairs_created,
                    "updates_applied": stats.updates_applied,
                    "learner_updates_applied": learned,
                })
            }
            None => {
                let report = backfill.run_all(max_sessions).await?;
                let (learned, _) = self.engine.learner.observe_all(&report.new_pairings).await;
                json!({
                    "sessions_processed": report.sessions_processed,
                    "links_set": report.links_set,
                    "pairs_created": report.pairs_created,
                    "updates_applied": report.updates_applied,
                    "learner_updates_applied": learned,
                    "errors": report.errors,
                })
            }
        };

        let reprocess_report = if fields.is_empty() {
            Value::Null
        } else {
            let report = self
                .engine
                .reprocessor()
                .run(&ReprocessOptions {
                    fields,
                    session_id,
                    max_sessions,
                    create_backup,
                })
                .await?;
            json!({
                "fields": report.fields,
                "sessions_processed": report.sessions_processed,
                "entries_examined": report.entries_examined,
                "entries_updated": report.entries_updated,
                "backup_path": report.backup_path.map(|p| p.display().to_string()),
                "errors": report.errors,
            })
        };

        Ok(json!({
            "backfill": backfill_report,
            "reprocessing": reprocess_report,
        }))
    }

    // ── smart_metadata_sync_status ───────────────────────────────────────────

    async fn op_sync_status(&self) -> EngineResult<Value> {
        let store = &self.engine.store;
        let total = store.count().await?;
        let backfilled = store
            .get_where(
                &Filter::new().eq("backfill_processed", true),
                Some(&["session_id"]),
            )
            .await?
            .len();
        let solutions = store
            .get_where(
                &Filter::new().eq("is_solution_attempt", true),
                Some(&["session_id"]),
            )
            .await?
            .len();
        let feedback = store
            .get_where(
                &Filter::new().eq("is_feedback_to_solution", true),
                Some(&["session_id"]),
            )
            .await?
            .len();

        let coverage_pct = if total == 0 {
            100.0
        } else {
            (backfilled as f32 / total as f32) * 100.0
        };
        Ok(json!({
            "total_entries": total,
            "backfill_processed": backfilled,
            "solution_attempts": solutions,
            "feedback_entries": feedback,
            "enriched_coverage_pct": coverage_pct,
        }))
    }

    // ── process_feedback_unified ─────────────────────────────────────────────

    async fn op_process_feedback(&self, params: &Value) -> EngineResult<Value> {
        let feedback_text = required_str(params, "feedback_text")?;
        let solution_context = required_str(params, "solution_context")?;
        let mode = str_param(params, "processing_mode")?.unwrap_or_else(|| "multi_modal".into());
        if !["multi_modal", "lexicon_only"].contains(&mode.as_str()) {
            return Err(EngineError::validation(format!(
                "unknown processing_mode '{mode}', accepted: [\"multi_modal\", \"lexicon_only\"]"
            )));
        }

        let outcome = if mode == "lexicon_only" {
            self.engine.enricher.classify_feedback_lexicon(&feedback_text)
        } else {
            self.engine
                .enricher
                .classify_feedback_text(&feedback_text)
                .await?
        };

        if outcome.sentiment == Sentiment::None {
            return Ok(json!({
                "sentiment": "none",
                "applied": false,
                "note": "no sentiment detected in feedback_text; nothing learned",
            }));
        }

        let solution = self.resolve_solution(&solution_context).await?;
        let pairing = PairingEvent {
            solution_id: solution.id.clone(),
            feedback_id: format!("explicit_{}", Utc::now().timestamp()),
            sentiment: outcome.sentiment,
            validation_strength: outcome.strength,
            project_name: solution.project_name.clone(),
            top_topic: solution.top_topic().map(|(name, _)| name.to_string()),
        };
        let update = self.engine.learner.observe_pairing(&pairing).await?;

        Ok(json!({
            "sentiment": outcome.sentiment.as_str(),
            "validation_strength": outcome.strength,
            "confidence": outcome.confidence,
            "processing_mode": mode,
            "applied": true,
            "update": update,
        }))
    }

    async fn resolve_solution(&self, context: &str) -> EngineResult<ConversationEntry> {
        // Exact entry ID first; descriptive text falls back to similarity.
        let rows = self.engine.store.get(&[context.to_string()]).await?;
        if let Some(row) = rows.first() {
            return Ok(ConversationEntry::from_metadata(
                &row.id,
                &row.text,
                &row.metadata,
            ));
        }

        let filter = Filter::new()
            .eq("type", "assistant")
            .eq("is_solution_attempt", true);
        let hits = self.engine.store.query(context, 1, Some(&filter)).await?;
        let hit = hits.into_iter().next().ok_or_else(|| {
            EngineError::not_found(format!(
                "no stored solution matches context '{context}'"
            ))
        })?;
        Ok(ConversationEntry::from_metadata(
            &hit.id,
            &hit.text,
            &hit.metadata,
        ))
    }

    // ── get_learning_insights ────────────────────────────────────────────────

    async fn op_insights(&self, params: &Value) -> EngineResult<Value> {
        let insight_type =
            str_param(params, "insight_type")?.unwrap_or_else(|| "success_rates".into());
        let since_unix = match str_param(params, "time_range")? {
            Some(name) => {
                let tz: chrono_tz::Tz = self
                    .engine
                    .config
                    .runtime
                    .timezone
                    .parse()
                    .unwrap_or(chrono_tz::UTC);
                let window = timewin::symbolic_window(&name, Utc::now(), tz).ok_or_else(|| {
                    EngineError::validation(format!(
                        "unknown time_range '{name}', accepted: {:?}",
                        timewin::symbolic_window_names()
                    ))
                })?;
                Some(window.start_unix)
            }
            None => None,
        };

        let insights = self.engine.learner.insights(&insight_type, since_unix).await?;
        Ok(json!({
            "insight_type": insight_type,
            "insights": insights,
        }))
    }

    // ── get_system_status ────────────────────────────────────────────────────

    async fn op_system_status(&self, params: &Value) -> EngineResult<Value> {
        let status_type = str_param(params, "status_type")?.unwrap_or_else(|| "full".into());
        let format = str_param(params, "format")?.unwrap_or_else(|| "json".into());
        if !["full", "store", "cache", "monitor"].contains(&status_type.as_str()) {
            return Err(EngineError::validation(format!(
                "unknown status_type '{status_type}', accepted: [\"full\", \"store\", \"cache\", \"monitor\"]"
            )));
        }
        if !["json", "summary"].contains(&format.as_str()) {
            return Err(EngineError::validation(format!(
                "unknown format '{format}', accepted: [\"json\", \"summary\"]"
            )));
        }

        let mut data = json!({ "status_type": status_type });
        if ["full", "store"].contains(&status_type.as_str()) {
            data["store"] = json!({
                "entries": self.engine.store.count().await?,
                "collection": self.engine.config.store.collection,
                "path": self.engine.config.store.path,
            });
        }
        if ["full", "cache"].contains(&status_type.as_str()) {
            let stats = self.cache.lock().expect("cache mutex poisoned").stats();
            data["cache"] = json!({
                "capacity": stats.capacity,
                "len": stats.len,
                "hits": stats.hits,
                "misses": stats.misses,
                "hit_rate_pct": stats.hit_rate_pct,
                "invalidations": stats.invalidations,
            });
        }
        if ["full", "monitor"].contains(&status_type.as_str()) {
            let snapshot = self.monitor.lock().expect("monitor mutex poisoned").snapshot();
            data["monitor"] = serde_json::to_value(&snapshot)
                .map_err(|err| EngineError::internal(err.to_string()))?;
        }

        if format == "summary" {
            let entries = data["store"]["entries"].as_u64().unwrap_or(0);
            let hit_rate = data["cache"]["hit_rate_pct"].as_f64().unwrap_or(0.0);
            data["summary"] = json!(format!(
                "{entries} entries indexed; cache hit rate {hit_rate:.1}%"
            ));
        }
        Ok(data)
    }

    // ── get_performance_analytics_dashboard ──────────────────────────────────

    fn op_dashboard(&self) -> EngineResult<Value> {
        let monitor = self.monitor.lock().expect("monitor mutex poisoned").snapshot();
        let cache = self.cache.lock().expect("cache mutex poisoned").stats();
        Ok(json!({
            "latency": {
                "rolling_mean_ms": monitor.rolling_mean_ms,
                "slow_calls": monitor.slow_calls,
            },
            "errors": {
                "total": monitor.total_errors,
                "rate_pct": monitor.error_rate_pct,
            },
            "cache": {
                "hit_rate_pct": cache.hit_rate_pct,
                "hits": cache.hits,
                "misses": cache.misses,
            },
            "calls": monitor.total_calls,
            "per_tool": monitor.per_tool,
        }))
    }

    // ── detect_current_project ───────────────────────────────────────────────

    fn op_detect_project(&self, params: &Value) -> EngineResult<Value> {
        let cwd = match str_param(params, "working_directory")? {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|err| EngineError::internal(format!("cwd unavailable: {err}")))?
                .to_string_lossy()
                .to_string(),
        };
        let (name, path, confidence) = detect_project(&self.engine.config, &cwd);
        Ok(json!({
            "project_name": name,
            "project_path": path,
            "confidence": confidence,
        }))
    }

    // ── get_project_context_summary ──────────────────────────────────────────

    async fn op_project_summary(&self, params: &Value) -> EngineResult<Value> {
        let project_name = str_param(params, "project_name")?;
        let days_back = usize_param(params, "days_back")?.unwrap_or(30);
        if days_back == 0 {
            return Err(EngineError::validation("days_back must be ≥ 1"));
        }

        let filter = match &project_name {
            Some(name) => Filter::new().eq("project_name", name.clone()),
            None => Filter::new(),
        };
        let rows = self.engine.store.get_where(&filter, None).await?;
        let cutoff = Utc::now().timestamp() - (days_back as i64) * 86_400;

        let entries: Vec<ConversationEntry> = rows
            .iter()
            .map(|row| ConversationEntry::from_metadata(&row.id, &row.text, &row.metadata))
            .filter(|entry| entry.timestamp_unix >= cutoff)
            .collect();

        let solutions: Vec<&ConversationEntry> =
            entries.iter().filter(|e| e.is_solution_attempt).collect();
        let validated = entries
            .iter()
            .filter(|e| {
                e.is_feedback_to_solution && e.user_feedback_sentiment == Sentiment::Positive
            })
            .count();
        let refuted = entries
            .iter()
            .filter(|e| {
                e.is_feedback_to_solution && e.user_feedback_sentiment == Sentiment::Negative
            })
            .count();

        let mut topic_counts: std::collections::BTreeMap<&str, usize> = Default::default();
        for entry in &entries {
            for topic in entry.detected_topics.keys() {
                *topic_counts.entry(topic.as_str()).or_default() += 1;
            }
        }
        let mut top_topics: Vec<(&str, usize)> = topic_counts.into_iter().collect();
        top_topics.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        top_topics.truncate(5);

        let sessions: std::collections::BTreeSet<&str> =
            entries.iter().map(|e| e.session_id.as_str()).collect();

        Ok(json!({
            "project_name": project_name,
            "days_back": days_back,
            "entries": entries.len(),
            "sessions": sessions.len(),
            "solution_attempts": solutions.len(),
            "validated_solutions": validated,
            "refuted_attempts": refuted,
            "top_topics": top_topics
                .into_iter()
                .map(|(topic, count)| json!({"topic": topic, "count": count}))
                .collect::<Vec<_>>(),
        }))
    }

    // ── force_database_connection_refresh ────────────────────────────────────

    async fn op_refresh(&self) -> EngineResult<Value> {
        // The engine owns a single store handle, so there is no stale global
        // connection to replace; a refresh revalidates the store and drops
        // every cached result.
        let entries = self.engine.store.count().await?;
        self.cache.lock().expect("cache mutex poisoned").clear();
        Ok(json!({
            "refreshed": true,
            "entries": entries,
        }))
    }
}

// ── Param helpers ────────────────────────────────────────────────────────────

fn str_param(params: &Value, name: &str) -> EngineResult<Option<String>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(EngineError::validation(format!(
            "parameter '{name}' must be a string"
        ))),
    }
}

fn required_str(params: &Value, name: &str) -> EngineResult<String> {
    str_param(params, name)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EngineError::validation(format!("parameter '{name}' is required")))
}

fn usize_param(params: &Value, name: &str) -> EngineResult<Option<usize>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "parameter '{name}' must be a non-negative integer"
                ))
            }),
    }
}

fn f32_param(params: &Value, name: &str) -> EngineResult<Option<f32>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(|v| Some(v as f32))
            .ok_or_else(|| {
                EngineError::validation(format!("parameter '{name}' must be a number"))
            }),
    }
}

fn bool_param(params: &Value, name: &str) -> EngineResult<Option<bool>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(EngineError::validation(format!(
            "parameter '{name}' must be a boolean"
        ))),
    }
}

fn entry_meta_json(entry: &ConversationEntry) -> Value {
    json!({
        "session_id": entry.session_id,
        "sequence_position": entry.sequence_position,
        "type": entry.role.as_str(),
        "timestamp_iso": entry.timestamp_iso,
        "timestamp_unix": entry.timestamp_unix,
        "project_name": entry.project_name,
        "has_code": entry.has_code,
        "tools_used": entry.tools_used,
        "detected_topics": entry.detected_topics,
        "is_solution_attempt": entry.is_solution_attempt,
        "solution_category": entry.solution_category.map(|c| c.as_str()),
        "solution_quality_score": entry.solution_quality_score,
        "is_feedback_to_solution": entry.is_feedback_to_solution,
        "user_feedback_sentiment": entry.user_feedback_sentiment.as_str(),
        "validation_strength": entry.validation_strength,
        "previous_message_id": entry.previous_message_id,
        "next_message_id": entry.next_message_id,
        "related_solution_id": entry.related_solution_id,
        "feedback_message_id": entry.feedback_message_id,
        "backfill_processed": entry.backfill_processed,
    })
}

fn hit_json(hit: &SearchHit) -> Value {
    json!({
        "id": hit.entry.id,
        "text": hit.entry.text,
        "similarity": hit.similarity,
        "score": hit.score,
        "boosts": hit.boosts,
        "metadata": entry_meta_json(&hit.entry),
        "context_chain": hit.chain,
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Degraded read results (store trouble behind an empty list) must not be
/// served from cache once the dependency recovers.
fn is_degraded(data: &Value) -> bool {
    data.get("meta")
        .and_then(|meta| meta.get("degraded"))
        .is_some_and(|v| !v.is_null())
}

// ── Tests ────────────────────────────────────────────────────────────────────
