//! Hook entry point shared by the `on-user-prompt` and
//! `on-assistant-response` executables and the `hindsight hook` subcommand.
//!
//! The host passes the working directory and the path to the current
//! session's append-only log, either as flags or as a JSON object on stdin.
//! Failures are logged and surfaced as a non-zero exit code — the host is
//! never blocked.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{error, info};

use hindsight_engine::{Engine, Role};

#[derive(Debug, Clone, Default)]
pub struct HookArgs {
    pub session_log: Option<PathBuf>,
    pub working_directory: Option<String>,
    pub session_id: Option<String>,
    pub text: Option<String>,
    /// Read the host's JSON payload from stdin instead of flags.
    pub stdin_json: bool,
}

impl HookArgs {
    /// Merge stdin JSON (when requested) over the flag values.  Recognised
    /// keys: `session_log`/`transcript_path`, `cwd`/`working_directory`,
    /// `session_id`, `text`/`prompt`.
    fn resolve(mut self) -> Result<Self> {
        if !self.stdin_json {
            return Ok(self);
        }

        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading hook payload from stdin")?;
        let payload: Value =
            serde_json::from_str(raw.trim()).context("hook payload is not valid JSON")?;

        let get = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| payload.get(k).and_then(Value::as_str))
                .map(str::to_string)
        };
        if self.session_log.is_none() {
            self.session_log = get(&["session_log", "transcript_path"]).map(PathBuf::from);
        }
        if self.working_directory.is_none() {
            self.working_directory = get(&["cwd", "working_directory"]);
        }
        if self.session_id.is_none() {
            self.session_id = get(&["session_id"]);
        }
        if self.text.is_none() {
            self.text = get(&["text", "prompt"]);
        }
        Ok(self)
    }
}

/// Run one hook invocation.  Returns the process exit code.
pub async fn run(role: Role, args: HookArgs) -> i32 {
    match run_inner(role, args).await {
        Ok(entry_id) => {
            info!(id = %entry_id, role = role.as_str(), "hook indexed message");
            0
        }
        Err(err) => {
            error!(role = role.as_str(), error = %err, "hook failed");
            eprintln!("hindsight hook failed: {err:#}");
            1
        }
    }
}

async fn run_inner(role: Role, args: HookArgs) -> Result<String> {
    let args = args.resolve()?;
    let Some(session_log) = args.session_log else {
        bail!("missing session log path (flag --session-log or stdin key session_log)");
    };
    let working_directory = args
        .working_directory
        .or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|d| d.to_string_lossy().to_string())
        })
        .unwrap_or_default();

    let config = crate::load_config()?;
    let engine = Engine::open(config).await.context("opening engine")?;
    let outcome = engine
        .ingest()
        .index_message(
            role,
            args.text.as_deref(),
            &working_directory,
            &session_log,
            args.session_id.as_deref(),
        )
        .await
        .context("indexing message")?;
    Ok(outcome.entry_id)
}
