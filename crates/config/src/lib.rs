use std::env;
use std::fs;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the persistent collection file(s). Relative paths
    /// are resolved against the working directory at startup.
    pub path: String,
    pub collection: String,
    /// Maximum rows per metadata-only update batch.
    pub update_batch_limit: usize,
    /// Maximum rows per upsert batch (each row is embedded before insert).
    pub upsert_batch_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: ".hindsight/store".to_string(),
            collection: "conversations".to_string(),
            update_batch_limit: 100,
            upsert_batch_limit: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash` (offline, deterministic) or `ollama`.
    pub provider: String,
    pub model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: "nomic-embed-text".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectsConfig {
    /// Root directory scanned for session logs (`*.jsonl`, one per session).
    pub session_log_root: String,
    /// Working-directory prefix → project name.  Longest matching prefix
    /// wins; unmatched directories fall back to their basename.
    pub mapping: BTreeMap<String, String>,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            session_log_root: ".hindsight/sessions".to_string(),
            mapping: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Minimum lexicon score for a topic to appear in `detected_topics`.
    pub topic_threshold: f32,
    /// Tool names recognised by the `tools_used` extractor.
    pub tool_names: Vec<String>,
    /// Extra topic → keyword lists merged over the built-in lexicon.
    pub extra_topics: BTreeMap<String, Vec<String>>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            topic_threshold: 0.15,
            tool_names: [
                "Read", "Write", "Edit", "Bash", "Grep", "Glob", "WebSearch",
                "WebFetch", "Task", "TodoWrite", "NotebookEdit",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extra_topics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Minimum validation strength for `validated_only` mode.
    pub validation_threshold: f32,
    /// Multiplier applied when a hit's project matches the caller context.
    pub project_boost: f32,
    /// Multiplier scaled by the strongest matching topic confidence.
    pub topic_boost: f32,
    /// Weight of `solution_quality_score` in the quality boost:
    /// `boost = 1 + weight * (score - 1)`.
    pub quality_weight: f32,
    /// Half-life in hours for the optional recency boost.
    pub recency_half_life_hours: f32,
    /// Hard cap on `chain_length` for context-chain expansion.
    pub max_chain_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            validation_threshold: 0.3,
            project_boost: 1.2,
            topic_boost: 1.15,
            quality_weight: 0.3,
            recency_half_life_hours: 168.0,
            max_chain_length: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Quality delta per unit validation strength on positive feedback.
    pub positive_step: f32,
    /// Quality delta per unit validation strength on negative feedback.
    pub negative_step: f32,
    /// Flat bump applied on partial feedback.
    pub partial_step: f32,
    pub quality_floor: f32,
    pub quality_ceiling: f32,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            positive_step: 0.2,
            negative_step: 0.3,
            partial_step: 0.05,
            quality_floor: 0.2,
            quality_ceiling: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Rolling window size for the latency mean.
    pub latency_window: usize,
    /// Calls slower than this are logged at warn level.
    pub slow_call_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency_window: 50,
            slow_call_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker-pool bound for batch enrichment.
    pub worker_pool: usize,
    /// Per-tool-call deadline.
    pub tool_deadline_ms: u64,
    /// Concurrent tool calls admitted at once (protects the embedder).
    pub tool_concurrency: usize,
    /// IANA timezone used to resolve user-facing relative time ranges.
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_pool: 4,
            tool_deadline_ms: 30_000,
            tool_concurrency: 4,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub projects: ProjectsConfig,
    pub enrichment: EnrichmentConfig,
    pub search: SearchConfig,
    pub learner: LearnerConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.embedding.provider = "ollama".to_string();
                config.embedding.ollama_base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve a working directory to `(project_name, project_path)`.
    ///
    /// The longest configured prefix wins; otherwise the directory's basename
    /// is used as the project name.
    pub fn resolve_project(&self, working_directory: &str) -> (String, String) {
        let mut best: Option<(&str, &str)> = None;
        for (prefix, name) in &self.projects.mapping {
            if working_directory.starts_with(prefix.as_str()) {
                match best {
                    Some((p, _)) if p.len() >= prefix.len() => {}
                    _ => best = Some((prefix.as_str(), name.as_str())),
                }
            }
        }

        if let Some((_, name)) = best {
            return (name.to_string(), working_directory.to_string());
        }

        let basename = Path::new(working_directory)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        (basename, working_directory.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() -> Result<()> {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config)?;
        let parsed: AppConfig = toml::from_str(&rendered)?;
        assert_eq!(parsed.store.collection, config.store.collection);
        assert_eq!(parsed.search.default_limit, config.search.default_limit);
        assert_eq!(parsed.runtime.timezone, "UTC");
        Ok(())
    }

    #[test]
    fn partial_file_fills_missing_sections_with_defaults() -> Result<()> {
        let raw = r#"
            [search]
            default_limit = 25
        "#;
        let parsed: AppConfig = toml::from_str(raw)?;
        assert_eq!(parsed.search.default_limit, 25);
        assert_eq!(parsed.store.update_batch_limit, 100);
        assert_eq!(parsed.learner.partial_step, 0.05);
        Ok(())
    }

    #[test]
    fn load_from_missing_file_yields_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig::load_from(dir.path().join("absent.toml"))?;
        assert_eq!(config.cache.capacity, 128);
        Ok(())
    }

    #[test]
    fn save_then_load_preserves_custom_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hindsight.toml");

        let mut config = AppConfig::default();
        config.store.collection = "workbench".to_string();
        config.runtime.timezone = "America/Los_Angeles".to_string();
        config.save_to(&path)?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.store.collection, "workbench");
        assert_eq!(loaded.runtime.timezone, "America/Los_Angeles");
        Ok(())
    }

    #[test]
    fn resolve_project_prefers_longest_prefix() {
        let mut config = AppConfig::default();
        config
            .projects
            .mapping
            .insert("/home/dev".to_string(), "general".to_string());
        config
            .projects
            .mapping
            .insert("/home/dev/api".to_string(), "api-server".to_string());

        let (name, path) = config.resolve_project("/home/dev/api/src");
        assert_eq!(name, "api-server");
        assert_eq!(path, "/home/dev/api/src");
    }

    #[test]
    fn resolve_project_falls_back_to_basename() {
        let config = AppConfig::default();
        let (name, _) = config.resolve_project("/tmp/scratchpad");
        assert_eq!(name, "scratchpad");
    }
}
