use std::fs;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use buildstream_kernel::adapters::acl::StaticAcl;
use buildstream_kernel::auth::CallerIdentity;
use buildstream_kernel::config::StreamConfig;
use buildstream_kernel::frame::ErrorFrame;
use buildstream_kernel::log::BuildId;
use buildstream_kernel::simulate::{simulate_stream, verify_capture, PipelineScript, SimulationResult};
use buildstream_kernel::stream::StreamRequest;

/// Build event streaming CLI
#[derive(Parser, Debug)]
#[command(name = "buildstream")]
#[command(about = "Ordered, resumable build event streams (in-memory)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted pipeline and print the SSE frames one client receives
    Simulate {
        /// Path to pipeline script JSON ({"history": [...], "live": [...]})
        #[arg(long)]
        events: String,

        /// Path to access-control JSON
        #[arg(long)]
        acl: String,

        /// Verified subject of the connecting client
        #[arg(long)]
        caller: String,

        /// Build to stream
        #[arg(long)]
        build: Uuid,

        /// Resume checkpoint, as a reconnecting client would send it
        #[arg(long)]
        last_event_id: Option<String>,

        /// Path to stream config JSON
        #[arg(long)]
        config: Option<String>,

        /// Close an unfinished stream after this much silence
        #[arg(long, default_value_t = 500)]
        idle_ms: u64,
    },

    /// Check an SSE capture and print the checkpoint to resume from
    Verify {
        /// Path to captured SSE text
        #[arg(long)]
        frames: String,
    },
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct VerifyOutput {
    events: usize,
    heartbeats: usize,
    first_seq: Option<u64>,
    last_event_id: Option<u64>,
    terminal: Option<String>,
    error: Option<ErrorFrame>,
}

/// `RUST_LOG` when it parses, `info` otherwise.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            events,
            acl,
            caller,
            build,
            last_event_id,
            config,
            idle_ms,
        } => {
            // ----------------------------
            // Load inputs
            // ----------------------------
            let script = PipelineScript::from_json_str(&fs::read_to_string(&events)?)?;
            let acl = StaticAcl::from_json_str(&fs::read_to_string(&acl)?)?;
            let config = match config {
                Some(path) => StreamConfig::load(path)?,
                None => StreamConfig::default(),
            };
            info!(
                history = script.history.len(),
                live = script.live.len(),
                acl_records = acl.len(),
                "simulation inputs loaded"
            );

            let mut request = StreamRequest::new(BuildId(build), CallerIdentity::verified(caller));
            if let Some(id) = last_event_id {
                request = request.resuming_after(id);
            }

            // ----------------------------
            // Run simulation
            // ----------------------------
            let SimulationResult { outcome, capture, .. } =
                simulate_stream(&script, acl, request, config, Duration::from_millis(idle_ms)).await?;

            print!("{capture}");

            match outcome {
                Ok(outcome) => info!(?outcome, "stream finished"),
                Err(e) => bail!("stream failed: {e}"),
            }
        }

        Commands::Verify { frames } => {
            let capture = fs::read_to_string(&frames)?;
            let report = verify_capture(&capture)?;

            let output = VerifyOutput {
                events: report.events,
                heartbeats: report.heartbeats,
                first_seq: report.first_seq,
                last_event_id: report.resume_from,
                terminal: report.terminal.map(|kind| kind.to_string()),
                error: report.error,
            };

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
