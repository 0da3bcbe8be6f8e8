//! A small operator CLI for this agent core.
//!
//! Currently offers one subcommand, `probe`, which performs a single
//! `preconnect`/`connect` handshake against a configured collector host and
//! prints the resulting `AgentRun` (or the classified fatal error) without
//! booting a full host application.

use apm_agent_core::collector::ConfigBuilder;
use apm_agent_core::processor::Connector;
use apm_agent_core::time_provider::production_time_provider;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "apm-agent-cli", about = "Operator tooling for the APM agent core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Perform a single preconnect/connect handshake and print the result.
    Probe {
        /// Collector host to connect to, e.g. `collector.newrelic.com`.
        #[arg(long, env = "NEW_RELIC_HOST")]
        host: Option<String>,
        /// License key to authenticate with.
        #[arg(long, env = "NEW_RELIC_LICENSE_KEY")]
        license_key: String,
        /// Application name to report as.
        #[arg(long, env = "NEW_RELIC_APP_NAME")]
        app_name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Probe {
            host,
            license_key,
            app_name,
        } => probe(host, license_key, app_name).await,
    }
}

async fn probe(host: Option<String>, license_key: String, app_name: String) -> anyhow::Result<()> {
    let mut builder = ConfigBuilder::new().license_key(license_key).app_name(app_name);
    if let Some(host) = host {
        builder = builder.host(host);
    }
    let config = builder.build()?;

    let connector = Connector::new(config, production_time_provider());
    match connector.probe(std::process::id()).await {
        Ok(run) => {
            println!("connected: run_id={}", run.run_id);
            println!("  collector_host: {}", run.collector_host);
            println!("  apdex_t: {}", run.apdex_threshold_seconds.into_inner());
            println!("  sampling_target: {}/{}s", run.sampling_target, run.sampling_target_period_seconds);
        }
        Err(err) => {
            eprintln!("connect failed: {err}");
            std::process::exit(1);
        }
    }
    Ok(())
}
