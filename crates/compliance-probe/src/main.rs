use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use compliance_probe::{run_probe, CliOverrides, ProbeConfig, ScenarioKind};

#[derive(Parser)]
#[command(name = "compliance-probe")]
#[command(about = "Run one consent retrieval against a simulated page")]
struct Args {
    /// Configuration file path (falls back to COMPLIANCE_PROBE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CMP carried by the simulated page
    #[arg(long, value_enum)]
    scenario: Option<ScenarioKind>,

    /// Delay before the simulated CMP answers
    #[arg(long)]
    respond_after_ms: Option<u64>,

    /// CMP answer as JSON
    #[arg(long)]
    payload: Option<String>,

    /// Compliance timeout; 0 resolves without waiting
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Applies flag used until a CMP answers
    #[arg(long)]
    applies_default: Option<bool>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the report
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("compliance_probe={0},compliance_core={0}", args.log_level)));
    if args.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let overrides = CliOverrides {
        scenario: args.scenario,
        respond_after_ms: args.respond_after_ms,
        payload: args.payload.clone(),
        timeout_ms: args.timeout_ms,
        applies_default: args.applies_default,
    };
    let config = ProbeConfig::load(args.config.as_deref())?.with_overrides(&overrides)?;

    info!(scenario = ?config.scenario.kind, timeout_ms = config.compliance.timeout, "Starting compliance probe");
    let report = run_probe(&config).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
