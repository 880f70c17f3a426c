//! Gatekeeper CLI
//!
//! Command-line entrypoint for one gate's gatekeeper process. The camera and
//! on-screen UI are out of scope for this core (see spec.md §1); `run` reads
//! scanned ticket strings as newline-delimited stdin instead, so an external
//! scanner process can be piped straight into this binary.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use gatekeeper_core::config::LoggingConfig;
use gatekeeper_core::{Gate, GatewayConfig};
use gatekeeper_maintenance::CleanupWorker;
use gatekeeper_store::TicketStore;
use gatekeeper_supervisor::Supervisor;
use gatekeeper_sync::{FetchWorker, PushWorker};
use gatekeeper_validator::Validator;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(about = "Offline-capable ticket validation gateway for one attraction gate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file. Written with defaults on first run.
    #[arg(short, long, global = true, default_value = "gatekeeper.toml")]
    config: PathBuf,

    /// Directory holding this host's per-gate database files and backups.
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and its fetch/push/cleanup workers for one gate,
    /// validating scans read from stdin until a termination signal arrives.
    Run {
        /// Gate this process serves: A, B, C (or a configured alias).
        #[arg(short, long)]
        gate: String,
    },
    /// Validate one ticket string against a gate's local store and exit.
    Scan {
        #[arg(short, long)]
        gate: String,
        #[arg(short, long)]
        ticket: String,
    },
    /// Initialize (or re-open) a gate's local database file without starting any workers.
    Migrate {
        #[arg(short, long)]
        gate: String,
    },
}

fn parse_gate(raw: &str) -> Result<Gate> {
    Gate::parse(raw).ok_or_else(|| {
        anyhow!("unrecognized gate {raw:?}; expected A, B, or C (or a configured alias)")
    })
}

fn db_path(data_dir: &Path, gate: Gate) -> PathBuf {
    data_dir.join(format!("{}.db", gate.db_stem()))
}

async fn open_store(data_dir: &Path, gate: Gate) -> Result<TicketStore> {
    Ok(TicketStore::open(db_path(data_dir, gate)).await?)
}

/// A `Write` sink shared between the log writer and whatever else might hold
/// the file open; `tracing_subscriber` wants a fresh writer per log line, so
/// the `MakeWriter` closure below hands out cheap clones of this handle.
struct SharedFile(Arc<Mutex<std::fs::File>>);

impl std::io::Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow!("failed to open log file {path}: {e}"))?;
            let file = Arc::new(Mutex::new(file));
            builder
                .with_writer(move || SharedFile(file.clone()))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Reads newline-delimited ticket strings from stdin and validates each one
/// against `gate`, printing the resulting decision, until stdin closes or
/// `shutdown` fires.
async fn run_scan_loop(validator: Arc<Validator>, shutdown: CancellationToken) {
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        let ticket_string = raw.trim();
                        if ticket_string.is_empty() {
                            continue;
                        }
                        let today = Local::now().date_naive();
                        match validator.validate(ticket_string, today).await {
                            Ok(decision) => println!("{decision}"),
                            Err(err) => tracing::error!(error = %err, "validation failed"),
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to read scan input, stopping scan loop");
                        break;
                    }
                }
            }
            () = shutdown.cancelled() => break,
        }
    }
}

async fn cmd_run(gate: Gate, config: GatewayConfig, data_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir)?;

    let validator_store = open_store(&data_dir, gate).await?;
    if config.services.add_dummy_tickets {
        let yesterday = Local::now()
            .date_naive()
            .pred_opt()
            .unwrap_or_else(|| Local::now().date_naive());
        validator_store.seed_dummy_tickets(yesterday).await?;
    }
    let validator = Arc::new(Validator::new(
        validator_store,
        gate,
        config.secret_key().as_bytes().to_vec(),
        config.gate_mapping.clone(),
    ));

    // Every co-located gate store on this host, so the push worker can merge
    // each ticket's counters across all of them before reporting to central.
    let mut worker_stores = Vec::with_capacity(Gate::ALL.len());
    let mut own_worker_store = None;
    for candidate in Gate::ALL {
        let store = Arc::new(open_store(&data_dir, candidate).await?);
        if candidate == gate {
            own_worker_store = Some(store.clone());
        }
        worker_stores.push(store);
    }
    let own_worker_store = own_worker_store.expect("gate is always a member of Gate::ALL");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()?;

    let mut supervisor = Supervisor::new();

    if config.services.fetch_enabled {
        let worker = Arc::new(FetchWorker::new(
            client.clone(),
            own_worker_store.clone(),
            config.clone(),
        ));
        supervisor.register("fetch", move |token| {
            let worker = worker.clone();
            async move { worker.run(token).await }
        });
    }

    if config.services.sync_enabled {
        let worker = Arc::new(PushWorker::new(client.clone(), worker_stores, config.clone()));
        supervisor.register("push", move |token| {
            let worker = worker.clone();
            async move { worker.run(token).await }
        });
    }

    if config.services.cleanup_enabled {
        let worker = Arc::new(CleanupWorker::new(
            own_worker_store,
            gate,
            data_dir.join("backups"),
            config.clone(),
        ));
        supervisor.register("cleanup", move |token| {
            let worker = worker.clone();
            async move { worker.run(token).await }
        });
    }

    let shutdown = supervisor.shutdown_token();
    let scan_loop = tokio::spawn(run_scan_loop(validator, shutdown.clone()));

    supervisor.run().await;
    shutdown.cancel();
    let _ = scan_loop.await;
    Ok(())
}

/// Validates one ticket string and returns whether it was admitted.
async fn cmd_scan(gate: Gate, ticket: String, config: GatewayConfig, data_dir: PathBuf) -> Result<bool> {
    std::fs::create_dir_all(&data_dir)?;
    let store = open_store(&data_dir, gate).await?;
    let validator = Validator::new(
        store,
        gate,
        config.secret_key().as_bytes().to_vec(),
        config.gate_mapping.clone(),
    );

    let today = Local::now().date_naive();
    let decision = validator.validate(&ticket, today).await?;
    println!("{decision}");
    Ok(decision.is_success())
}

async fn cmd_migrate(gate: Gate, data_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir)?;
    let path = db_path(&data_dir, gate);
    let _store = TicketStore::open(&path).await?;
    println!("initialized {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config)?;
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Run { gate } => {
            let gate = parse_gate(&gate)?;
            cmd_run(gate, config, cli.data_dir).await
        }
        Commands::Scan { gate, ticket } => {
            let gate = parse_gate(&gate)?;
            let admitted = cmd_scan(gate, ticket, config, cli.data_dir).await?;
            if !admitted {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Migrate { gate } => {
            let gate = parse_gate(&gate)?;
            cmd_migrate(gate, cli.data_dir).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_subcommand_with_gate() {
        let cli = Cli::try_parse_from(["gatekeeper", "run", "--gate", "A"]).unwrap();
        match cli.command {
            Commands::Run { gate } => assert_eq!(gate, "A"),
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn parses_scan_subcommand_with_ticket() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "scan",
            "--gate",
            "B",
            "--ticket",
            "20251015-000001-0201-ABCDEF012345",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan { gate, ticket } => {
                assert_eq!(gate, "B");
                assert_eq!(ticket, "20251015-000001-0201-ABCDEF012345");
            }
            _ => panic!("expected Scan"),
        }
    }

    #[test]
    fn rejects_unknown_gate_name() {
        assert!(parse_gate("Q").is_err());
        assert!(parse_gate("A").is_ok());
    }

    #[tokio::test]
    async fn migrate_creates_the_gate_database_file() {
        let dir = tempfile::tempdir().unwrap();
        cmd_migrate(Gate::A, dir.path().to_path_buf()).await.unwrap();
        assert!(dir.path().join("AttractionA.db").exists());
    }

    #[tokio::test]
    async fn scan_admits_a_fresh_ticket_via_offline_birth() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::default();
        let blob = "20251015-000099-010702080309";
        let tag = gatekeeper_codec::encode(config.secret_key().as_bytes(), blob);
        let ticket = format!("{blob}-{tag}");

        // `validate` compares the leading date against *today*, so this
        // assertion is a structural smoke test rather than a `Valid` check;
        // the exhaustive date/offline-birth behaviors are covered in
        // `gatekeeper-validator`'s own test suite.
        let admitted = cmd_scan(Gate::A, ticket, config, dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(!admitted, "ticket dated 2025-10-15 is not today, so it must be rejected");
    }
}
