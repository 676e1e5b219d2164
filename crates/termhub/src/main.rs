//! Termhub
//!
//! Session backend orchestrator for local PTY and remote SSH terminal
//! sessions. `serve` speaks the wire contract over stdio: one JSON command
//! per stdin line, one JSON event envelope per stdout line. Logs go to
//! stderr so the event stream stays clean.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use termhub::config::Config;
use termhub::orchestrator::Orchestrator;
use termhub_protocol::{Command, Event, EventEnvelope, EventKind, SessionId};

/// Termhub - session backend orchestrator for terminal UIs.
#[derive(Parser, Debug)]
#[command(name = "termhub")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the orchestrator, speaking newline-delimited JSON on stdio
    Serve,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.apply_env_overrides();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve => serve(Orchestrator::new(config)).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Capacity of the stdout event queue.
const OUTPUT_QUEUE_CAPACITY: usize = 256;

/// Reads commands from stdin and streams events to stdout until EOF.
async fn serve(orchestrator: Orchestrator) -> anyhow::Result<()> {
    tracing::info!("termhub serving on stdio");

    let orchestrator = Arc::new(orchestrator);
    let (out_tx, mut out_rx) = mpsc::channel::<EventEnvelope>(OUTPUT_QUEUE_CAPACITY);

    // A single writer task keeps event lines whole.
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = out_rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(mut line) => {
                    line.push('\n');
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode event"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed command");
                continue;
            }
        };

        match command {
            Command::CreateLocal { cols, rows } => {
                match orchestrator.create_local(cols, rows).await {
                    Ok(id) => {
                        attach(&orchestrator, &id, &out_tx);
                        let _ = out_tx
                            .send(EventEnvelope {
                                id: id.clone(),
                                event: Event::Created { id },
                            })
                            .await;
                    }
                    Err(e) => tracing::error!(error = %e, "Local session creation failed"),
                }
            }
            other => {
                // New remote identifiers get their event forwarders before
                // the state machine starts producing anything.
                if matches!(other, Command::RemoteConnect { .. }) {
                    if let Some(id) = other.session_id() {
                        attach(&orchestrator, id, &out_tx);
                    }
                }
                orchestrator.handle(other).await;
            }
        }
    }

    tracing::info!("stdin closed, shutting down");
    for id in orchestrator.registry().ids() {
        if let Some(backend) = orchestrator.registry().remove(&id) {
            backend.teardown().await;
        }
    }
    Ok(())
}

/// Forwards every event channel of a session into the stdout queue.
fn attach(
    orchestrator: &Arc<Orchestrator>,
    id: &SessionId,
    out_tx: &mpsc::Sender<EventEnvelope>,
) {
    for kind in EventKind::ALL {
        let mut rx = orchestrator.subscribe(id, kind);
        let out_tx = out_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out_tx
                    .send(EventEnvelope {
                        id: id.clone(),
                        event,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}
