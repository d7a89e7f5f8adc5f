//! Command-line entry point.
//!
//! `runbridge serve` runs the server side; `runbridge run <testcase.json>`
//! executes a test case against a server and prints lifecycle events.

// Rust guideline compliant 2026-02

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use log::info;
use serde_json::Value;
use tokio::sync::mpsc;

use runbridge::agent::{AgentEvent, RunAgent, RunOutcome};
use runbridge::client::{RunClient, RunListener};
use runbridge::config::Config;
use runbridge::server::RunServer;

#[derive(Parser)]
#[command(name = "runbridge", version, about = "Transport for remote browser-test runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server: router, run registry, and socket handling.
    Serve {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
        /// Observer service URL for run authorization.
        #[arg(long)]
        observer_url: Option<String>,
        /// Tunnel sockets approved per run.
        #[arg(long)]
        sockets_per_run: Option<usize>,
    },
    /// Execute a test case against a server and print its events.
    Run {
        /// Path to the test-case JSON file.
        testcase: PathBuf,
        /// Server URL.
        #[arg(long, default_value = "ws://localhost:4444")]
        server_url: String,
        /// Local origin to tunnel the hosted browser's traffic to
        /// (e.g. http://localhost:3000). Enables tunneling when set.
        #[arg(long)]
        local_origin: Option<String>,
        /// API key for authorization.
        #[arg(long, env = "RUNBRIDGE_API_KEY")]
        api_key: Option<String>,
        /// Test-case identifier for authorization.
        #[arg(long)]
        test_case_id: Option<String>,
    },
}

/// Stand-in agent for standalone deployments: confirms the transport path
/// by emitting a start and a passing outcome. Real deployments embed the
/// library and supply their own [`RunAgent`].
struct SmokeAgent;

#[async_trait]
impl RunAgent for SmokeAgent {
    async fn run(
        &self,
        run_id: &str,
        _test_case: Value,
        start_url: Option<String>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        info!("[Agent] Smoke run {run_id} (start_url: {start_url:?})");
        events.send(AgentEvent::Start {
            run_metadata: serde_json::json!({}),
        })?;
        events.send(AgentEvent::Done {
            result: RunOutcome::new(true),
        })?;
        Ok(())
    }
}

/// Prints lifecycle events to stdout.
struct PrintListener;

impl RunListener for PrintListener {
    fn on_start(&self, run_metadata: &Value) {
        println!("started: {run_metadata}");
    }
    fn on_action_taken(&self, action: &Value) {
        println!("action: {action}");
    }
    fn on_step_completed(&self) {
        println!("step completed");
    }
    fn on_check_completed(&self) {
        println!("check completed");
    }
    fn on_fail(&self, failure: &Value) {
        println!("failed: {failure}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            observer_url,
            sockets_per_run,
        } => {
            let mut config = Config::load()?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(url) = observer_url {
                config.observer_url = Some(url);
            }
            if let Some(sockets) = sockets_per_run {
                config.sockets_per_run = sockets;
            }
            RunServer::new(config, Arc::new(SmokeAgent)).serve().await
        }
        Command::Run {
            testcase,
            server_url,
            local_origin,
            api_key,
            test_case_id,
        } => {
            let content = std::fs::read_to_string(&testcase)
                .with_context(|| format!("Failed to read {}", testcase.display()))?;
            let test_case: Value = serde_json::from_str(&content)
                .with_context(|| format!("{} is not valid JSON", testcase.display()))?;

            let mut client = RunClient::new(server_url);
            if let Some(origin) = local_origin {
                client = client.with_local_origin(origin);
            }
            if let Some(key) = api_key {
                client = client.with_api_key(key);
            }
            client.add_listener(Arc::new(PrintListener));

            let outcome = client.run(test_case, test_case_id).await?;
            println!(
                "outcome: {}",
                serde_json::to_string_pretty(&outcome)?
            );
            if !outcome.passed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
