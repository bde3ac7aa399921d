use clap::Parser;
use serde_json::json;

use moodle_core::config::MoodleConfig;

#[derive(Parser)]
#[command(
    name = "moodle-mcp",
    version,
    about = "Moodle MCP server — JSON-RPC tool gateway over stdio"
)]
struct Cli {
    /// Skip the startup connectivity check against the Moodle site
    #[arg(long, env = "MOODLE_SKIP_CONNECTION_CHECK")]
    skip_connection_check: bool,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match MoodleConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "event": "moodle_mcp_config_error",
                    "error": err.to_string(),
                }))
                .unwrap_or_default()
            );
            std::process::exit(1);
        }
    };

    let code = moodle_mcp_runtime::run(config, cli.skip_connection_check).await;
    std::process::exit(code);
}
