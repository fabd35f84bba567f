use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use hindsight_cli::hook::{self, HookArgs};
use hindsight_engine::Role;
use hindsight_tools::ToolSurface;

#[derive(Debug, Parser)]
#[command(
    name = "hindsight",
    version,
    about = "Conversation history indexing and retrieval for AI-assistant sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Host-invoked per-message indexing hooks.
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },
    /// Probe, rebuild, and back-fill every session log.
    Sync {
        #[arg(long)]
        max_sessions: Option<usize>,
    },
    /// Repair conversation-chain relationships from stored entries.
    Backfill {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Re-derive specific enrichment fields on stored entries.
    Reprocess {
        /// Comma-separated field names.
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        max_sessions: Option<usize>,
        /// Skip the backup snapshot.
        #[arg(long)]
        no_backup: bool,
    },
    /// Search the index.
    Search {
        query: String,
        #[arg(long, default_value = "semantic")]
        mode: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        topic: Option<String>,
        /// Attach surrounding messages to each result.
        #[arg(long)]
        chains: bool,
    },
    /// Store, cache, and monitor health.
    Status {
        #[arg(long, default_value = "full")]
        status_type: String,
    },
    /// Coverage and learner insight overview.
    Doctor,
    /// Invoke a tool operation directly with raw JSON params.
    Call {
        operation: String,
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// List the tool surface.
    Tools,
}

#[derive(Debug, Subcommand)]
enum HookCommands {
    /// Index the latest user prompt.
    UserPrompt(HookFlags),
    /// Index the latest assistant response.
    AssistantResponse(HookFlags),
}

#[derive(Debug, clap::Args)]
struct HookFlags {
    #[arg(long)]
    session_log: Option<PathBuf>,
    #[arg(long)]
    cwd: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    text: Option<String>,
    /// Read the host payload from stdin as JSON.
    #[arg(long)]
    stdin_json: bool,
}

impl From<HookFlags> for HookArgs {
    fn from(flags: HookFlags) -> Self {
        HookArgs {
            session_log: flags.session_log,
            working_directory: flags.cwd,
            session_id: flags.session_id,
            text: flags.text,
            stdin_json: flags.stdin_json,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Hooks log to a file; everything else logs to stderr.
    let _hook_guard = match &cli.command {
        Commands::Hook { .. } => match hindsight_cli::load_config() {
            Ok(config) => Some(hindsight_cli::init_hook_logging(&config)),
            Err(_) => {
                hindsight_cli::init_logging();
                None
            }
        },
        _ => {
            hindsight_cli::init_logging();
            None
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Hook { command } => {
            let code = match command {
                HookCommands::UserPrompt(flags) => hook::run(Role::User, flags.into()).await,
                HookCommands::AssistantResponse(flags) => {
                    hook::run(Role::Assistant, flags.into()).await
                }
            };
            Ok(if code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Sync { max_sessions } => {
            let engine = hindsight_cli::build_engine().await?;
            let report = engine.orchestrator().sync_all(max_sessions).await;
            let (learned, _) = engine.learner.observe_all(&report.backfill.new_pairings).await;
            println!(
                "scanned {} sessions: {} reindexed, {} enhanced, {} already indexed",
                report.sessions_scanned,
                report.sessions_reindexed,
                report.sessions_enhanced,
                report.sessions_skipped
            );
            println!(
                "{} entries indexed, {} links set, {} pairings, {} learner updates",
                report.entries_indexed,
                report.backfill.links_set,
                report.backfill.pairs_created,
                learned
            );
            for error in &report.errors {
                eprintln!("warning: {error}");
            }
            Ok(exit_for(report.is_success()))
        }
        Commands::Backfill { session_id, limit } => {
            let surface = hindsight_cli::build_surface().await?;
            let result = surface
                .call(
                    "backfill_conversation_chains",
                    json!({"session_id": session_id, "limit": limit}),
                )
                .await;
            print_result(&result);
            Ok(exit_for(result.ok))
        }
        Commands::Reprocess {
            fields,
            session_id,
            max_sessions,
            no_backup,
        } => {
            let surface = hindsight_cli::build_surface().await?;
            let result = surface
                .call(
                    "run_unified_enhancement",
                    json!({
                        "session_id": session_id,
                        "max_sessions": max_sessions,
                        "force_reprocess_fields": fields,
                        "create_backup": !no_backup,
                    }),
                )
                .await;
            print_result(&result);
            Ok(exit_for(result.ok))
        }
        Commands::Search {
            query,
            mode,
            limit,
            project,
            topic,
            chains,
        } => {
            let surface = hindsight_cli::build_surface().await?;
            let result = surface
                .call(
                    "search_conversations_unified",
                    json!({
                        "query": query,
                        "search_mode": mode,
                        "limit": limit,
                        "project_context": project,
                        "topic_focus": topic,
                        "include_context_chains": chains,
                    }),
                )
                .await;
            print_result(&result);
            Ok(exit_for(result.ok))
        }
        Commands::Status { status_type } => {
            let surface = hindsight_cli::build_surface().await?;
            let result = surface
                .call(
                    "get_system_status",
                    json!({"status_type": status_type, "format": "json"}),
                )
                .await;
            print_result(&result);
            Ok(exit_for(result.ok))
        }
        Commands::Doctor => {
            let surface = hindsight_cli::build_surface().await?;
            let coverage = surface.call("smart_metadata_sync_status", json!({})).await;
            print_result(&coverage);
            let insights = surface
                .call("get_learning_insights", json!({"insight_type": "success_rates"}))
                .await;
            print_result(&insights);
            Ok(exit_for(coverage.ok && insights.ok))
        }
        Commands::Call { operation, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).map_err(|err| anyhow::anyhow!("--params: {err}"))?;
            let surface = hindsight_cli::build_surface().await?;
            let result = surface.call(&operation, params).await;
            print_result(&result);
            Ok(exit_for(result.ok))
        }
        Commands::Tools => {
            for spec in ToolSurface::specs() {
                println!("{}\n  {}", spec.name, spec.description);
                for param in &spec.params {
                    let marker = if param.required { "required" } else { "optional" };
                    println!("    --{} ({marker}): {}", param.name, param.description);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_result(result: &hindsight_tools::ToolResult) {
    match serde_json::to_string_pretty(result) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{result:?}"),
    }
}

fn exit_for(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
