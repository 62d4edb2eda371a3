use anyhow::Result;

use analog_quant::cli::{execute, parse_args, Command, USAGE};
use analog_quant::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set AQ_CONFIG_PATH or create config/default.toml");
            std::process::exit(1);
        }
    };

    // stdout carries the JSON report, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            }),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .json()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(Command::Help) => {
            println!("{}", USAGE);
            return Ok(());
        }
        Ok(c) => c,
        Err(e) => {
            eprintln!("{:#}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    tracing::info!(
        db = %config.storage.db_path.display(),
        command = ?command,
        "Starting analog-quant"
    );

    match execute(command, &config).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "command failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
