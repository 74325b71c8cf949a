//! CLI surface: run a gate node from a terminal.
//!
//! `gatemesh run` starts the engine, submits codes typed on stdin as scans,
//! logs a periodic health line, and shuts down cleanly on SIGINT/SIGTERM.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser, Subcommand};
use crossbeam::channel::RecvTimeoutError;

use crate::config::{self, Config};
use crate::engine::{Engine, EngineError};

#[derive(Parser, Debug)]
#[command(
    name = "gatemesh",
    version,
    about = "Peer-to-peer replication for scan gates",
    arg_required_else_help = true
)]
pub struct Cli {
    /// More logging (-v info, -vv debug).
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Config file (default: the XDG config dir).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Start a node. Codes typed on stdin are submitted as scans.
    Run {
        /// Override the UDP port.
        #[arg(long)]
        port: Option<u16>,
        /// Seconds between health log lines (0 disables).
        #[arg(long, default_value_t = 30)]
        health_every: u64,
    },
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> crate::Result<()> {
    let mut config = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load_or_init(),
    };
    match cli.command {
        CliCommand::Run { port, health_every } => {
            if let Some(port) = port {
                config.net.port = port;
            }
            run_node(config, cli.verbose, health_every)
        }
    }
}

fn run_node(config: Config, verbosity: u8, health_every: u64) -> crate::Result<()> {
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(crate::paths::data_dir);
    let _telemetry = crate::telemetry::init(&config.logging, verbosity.max(1), &data_dir);

    let engine = Engine::init(&config)?;
    tracing::info!("gate node running; type codes on stdin to scan, ctrl-c to stop");

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());

    // Stdin on its own thread so the main loop can watch signals.
    let (line_tx, line_rx) = crossbeam::channel::unbounded();
    std::thread::Builder::new()
        .name("gatemesh-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .map_err(|source| EngineError::Spawn { source })?;

    let mut last_health = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        match line_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(line) => {
                let code = line.trim();
                if code.is_empty() {
                    continue;
                }
                match engine.submit_scan(code) {
                    Ok(outcome) if outcome.allowed => {
                        println!("ALLOW {code} (today: {})", outcome.today_count);
                    }
                    Ok(outcome) => {
                        let reason = outcome
                            .reason
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "denied".into());
                        println!("DENY  {code} ({reason})");
                    }
                    Err(e) => eprintln!("scan failed: {e}"),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // Stdin closed; keep gossiping until a signal arrives.
                std::thread::sleep(Duration::from_millis(250));
            }
        }

        if health_every > 0 && last_health.elapsed() >= Duration::from_secs(health_every) {
            last_health = Instant::now();
            if let Ok(health) = engine.query_health() {
                tracing::info!(
                    peers = health.peers_connected,
                    pending_acks = health.pending_acks,
                    pending_broadcasts = health.pending_broadcasts,
                    since_sync_s = health.time_since_last_sync_s,
                    "health"
                );
            }
        }
    }

    tracing::info!("shutting down");
    engine.shutdown()
}
