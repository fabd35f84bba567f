//! Host hook: invoked after every user prompt with the session-log path and
//! working directory on stdin.  Exit 0 on success; failures never block the
//! host.

use std::process::ExitCode;

use hindsight_cli::hook::{self, HookArgs};
use hindsight_engine::Role;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _guard = hindsight_cli::load_config()
        .ok()
        .map(|config| hindsight_cli::init_hook_logging(&config));

    let args = HookArgs {
        stdin_json: true,
        ..HookArgs::default()
    };
    if hook::run(Role::User, args).await == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
