use clap::Parser;
use miette::{IntoDiagnostic, Result};
use roomflow::application::engine::OrchestrationEngine;
use roomflow::application::recovery::RecoveryWorker;
use roomflow::application::transfer::TransferOrchestration;
use roomflow::config::EngineConfig;
use roomflow::domain::entity::{EntityId, EntityOperation};
use roomflow::domain::orchestration::StatusReport;
use roomflow::domain::ports::{EntityStateStoreRef, HistoryStoreRef, LockStoreRef};
use roomflow::infrastructure::in_memory::{
    InMemoryEntityStore, InMemoryHistoryStore, InMemoryLockStore,
};
#[cfg(feature = "storage-rocksdb")]
use roomflow::infrastructure::rocksdb::RocksDBStore;
use roomflow::interfaces::csv::report_writer::StatusReportWriter;
use roomflow::interfaces::csv::request_reader::TransferRequestReader;
use roomflow::interfaces::intake::TransferIntake;
use roomflow::logging::init_logging;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input CSV file with `from_room,to_room` rows
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Room to mark as booked before processing requests (repeatable)
    #[arg(long = "booked", value_name = "ROOM")]
    booked: Vec<String>,

    /// How long to wait for each instance to settle
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// JSON engine configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Size of the runtime worker pool
    #[arg(long)]
    workers: Option<usize>,

    /// Lock lease in milliseconds
    #[arg(long)]
    lease_ms: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path).into_diagnostic()?,
            None => EngineConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(lease_ms) = self.lease_ms {
            config.lease_ms = lease_ms;
        }
        Ok(config)
    }
}

type Stores = (HistoryStoreRef, EntityStateStoreRef, LockStoreRef);

fn in_memory_stores() -> Stores {
    (
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(InMemoryEntityStore::new()),
        Arc::new(InMemoryLockStore::new()),
    )
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    match db_path {
        Some(path) => {
            let store = RocksDBStore::open(&path).into_diagnostic()?;
            info!(path = %path.display(), "Using RocksDB storage");
            Ok((
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
            ))
        }
        None => Ok(in_memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        tracing::warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let config = cli.engine_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: EngineConfig) -> Result<()> {
    let (history, entity_states, lock_records) = open_stores(cli.db_path.clone())?;
    let engine = Arc::new(OrchestrationEngine::new(
        history,
        entity_states,
        lock_records,
        Arc::new(TransferOrchestration),
        config,
    ));

    for room in &cli.booked {
        engine
            .entities()
            .apply(&EntityId::room(room.as_str()), EntityOperation::book())
            .await
            .into_diagnostic()?;
    }

    // First scan resumes whatever a previous run left unfinished.
    let worker = RecoveryWorker::with_defaults(Arc::clone(&engine));
    let report = worker.scan_and_recover().await.into_diagnostic()?;
    if report.resumed_instances > 0 {
        info!(resumed = report.resumed_instances, "Resumed unfinished instances");
    }
    tokio::spawn(async move {
        worker.run().await;
    });

    let intake = TransferIntake::new(Arc::clone(&engine));
    let timeout = Duration::from_millis(cli.timeout_ms);
    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = TransferRequestReader::new(file);

    let mut pending = Vec::new();
    for request in reader.requests() {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Error reading transfer request");
                continue;
            }
        };
        let intake = intake.clone();
        pending.push(tokio::spawn(async move {
            let handle = intake.submit(request).await?;
            handle.wait(timeout).await
        }));
    }

    // Duplicate requests share an instance; report it once.
    let mut seen = HashSet::new();
    let mut reports: Vec<StatusReport> = Vec::with_capacity(pending.len());
    for task in pending {
        match task.await.into_diagnostic()? {
            Ok(report) => {
                if seen.insert(report.instance_id.clone()) {
                    reports.push(report);
                }
            }
            Err(e) => error!(error = %e, "Error submitting transfer request"),
        }
    }

    let stdout = io::stdout();
    let mut writer = StatusReportWriter::new(stdout.lock());
    writer.write_reports(reports).into_diagnostic()?;

    Ok(())
}
