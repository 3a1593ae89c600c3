//! Binary entry point for the coordinator workload simulator.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use idb_coordinator::{
    config::default_config_path, logging::init_logging, ClientEvent, ClientId, ClientLink,
    ConnectionId, CoordinatorConfig, CounterMetrics, DatabaseHandle, DatabaseIdentifier,
    DatabaseManager, DbError, IndexKeys, Key, KeyRange, MetricsSnapshot, ObjectStoreId,
    ObjectStoreInfo, OpenOutcome, OverwriteMode, RequestId, TransactionId, TransactionMode, Value,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

const RECORDS: ObjectStoreId = ObjectStoreId(1);
const ORIGIN: &str = "https://sim.test";
const SETUP_CLIENT: ClientId = ClientId(0);
const KEY_SPACE: u64 = 64;

#[derive(Parser, Debug)]
#[command(
    name = "idb-sim",
    version,
    about = "Drives the IndexedDB transaction coordinator with a simulated workload",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "IDB_SIM_CONFIG",
        value_name = "FILE",
        help = "Config file (defaults to the platform config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a randomized workload against in-memory databases
    Simulate(SimulateArgs),
    /// Inspect or write the configuration file
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value_t = 7, help = "Seed for the workload generator")]
    seed: u64,

    #[arg(
        long,
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Number of databases"
    )]
    databases: u64,

    #[arg(
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Clients connected to each database"
    )]
    clients: u64,

    #[arg(long, default_value_t = 25, help = "Transactions run by each client")]
    transactions: u64,

    #[arg(long, value_enum, help = "Start from a preset instead of the config file")]
    preset: Option<Preset>,

    #[arg(long, value_name = "BYTES", help = "Override the per-origin quota")]
    limit_bytes: Option<u64>,

    #[arg(long, value_name = "FILTER", help = "Override the log filter")]
    log: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the effective configuration
    Show,
    /// Write a configuration file
    Init {
        #[arg(long, value_enum, help = "Preset to write instead of the defaults")]
        preset: Option<Preset>,

        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Preset {
    Ephemeral,
    Durable,
}

impl From<Preset> for CoordinatorConfig {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Ephemeral => CoordinatorConfig::ephemeral(),
            Preset::Durable => CoordinatorConfig::durable(),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate(args) => {
            let mut config = match args.preset {
                Some(preset) => CoordinatorConfig::from(preset),
                None => CoordinatorConfig::load(cli.config.clone())?,
            };
            if let Some(limit) = args.limit_bytes {
                config.quota.origin_limit_bytes = Some(limit);
            }
            let filter = args.log.clone().unwrap_or_else(|| config.logging.filter.clone());
            init_logging(&filter)?;
            let report = simulate(&args, &config).await?;
            emit(cli.format, &report, || print_report_text(&report))?;
        }
        Command::Config(ConfigCmd::Show) => {
            let config = CoordinatorConfig::load(cli.config.clone())?;
            emit(cli.format, &config, || match toml::to_string_pretty(&config) {
                Ok(text) => print!("{text}"),
                Err(err) => eprintln!("error: {err}"),
            })?;
        }
        Command::Config(ConfigCmd::Init { preset, force }) => {
            let config = preset.map(CoordinatorConfig::from).unwrap_or_default();
            let target = cli.config.clone().or_else(default_config_path);
            if let Some(path) = target.as_ref().filter(|path| path.exists() && !force) {
                return Err(format!(
                    "{} already exists; pass --force to overwrite it",
                    path.display()
                )
                .into());
            }
            let written = config.persist(target)?;
            println!("Wrote config to {}", written.display());
        }
    }

    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct SimulationReport {
    seed: u64,
    databases: u64,
    clients_per_database: u64,
    elapsed_ms: u64,
    committed: u64,
    aborted: u64,
    writes: u64,
    reads: u64,
    failed_operations: u64,
    errors: BTreeMap<String, u64>,
    records: BTreeMap<String, u64>,
    metrics: MetricsSnapshot,
}

/// Outcomes counted by one simulated client.
#[derive(Debug, Default)]
struct Tally {
    committed: u64,
    aborted: u64,
    writes: u64,
    reads: u64,
    failed_operations: u64,
    errors: BTreeMap<String, u64>,
}

impl Tally {
    fn failed(&mut self, error: &DbError) {
        debug!(kind = error.kind(), %error, "simulated operation failed");
        *self.errors.entry(error.kind().to_string()).or_default() += 1;
    }

    fn merge_into(self, report: &mut SimulationReport) {
        report.committed += self.committed;
        report.aborted += self.aborted;
        report.writes += self.writes;
        report.reads += self.reads;
        report.failed_operations += self.failed_operations;
        for (kind, count) in self.errors {
            *report.errors.entry(kind).or_default() += count;
        }
    }
}

async fn simulate(
    args: &SimulateArgs,
    config: &CoordinatorConfig,
) -> Result<SimulationReport, Box<dyn Error>> {
    let metrics = CounterMetrics::shared();
    let manager = DatabaseManager::from_config(config).with_metrics(metrics.clone());
    let started = Instant::now();

    let mut handles = Vec::new();
    let mut clients = Vec::new();
    for index in 0..args.databases {
        let identifier = DatabaseIdentifier::new(format!("sim-{index}"), ORIGIN);
        let handle = manager.database(&identifier);
        prepare(&handle).await?;
        for client in 1..=args.clients {
            let seed = args.seed ^ (index << 32) ^ client;
            clients.push(tokio::spawn(run_client(
                handle.clone(),
                ClientId(client),
                seed,
                args.transactions,
            )));
        }
        handles.push(handle);
    }

    let mut report = SimulationReport {
        seed: args.seed,
        databases: args.databases,
        clients_per_database: args.clients,
        ..SimulationReport::default()
    };
    for client in clients {
        client.await??.merge_into(&mut report);
    }
    for handle in &handles {
        let count = count_records(handle).await?;
        report.records.insert(handle.identifier().name.clone(), count);
    }
    manager.shutdown().await;

    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    report.metrics = metrics.snapshot();
    info!(
        committed = report.committed,
        aborted = report.aborted,
        elapsed_ms = report.elapsed_ms,
        "simulation finished"
    );
    Ok(report)
}

/// Creates the `records` store in a version-one upgrade.
async fn prepare(handle: &DatabaseHandle) -> Result<(), DbError> {
    let (link, _events) = ClientLink::new(SETUP_CLIENT);
    let outcome = handle.open(link, RequestId(1), Some(1)).await?;
    if let OpenOutcome::UpgradeNeeded { transaction, .. } = outcome {
        handle
            .create_object_store(
                transaction,
                ObjectStoreInfo::new(RECORDS, "records", None, true),
            )
            .await?;
        handle.commit(transaction, 1).await?;
    }
    handle.close_connection(outcome.connection()).await
}

async fn count_records(handle: &DatabaseHandle) -> Result<u64, DbError> {
    let (link, mut events) = ClientLink::new(SETUP_CLIENT);
    let connection = handle.open(link, RequestId(2), None).await?.connection();
    let txn = start(handle, &mut events, connection, TransactionMode::ReadOnly).await?;
    let count = handle.get_count(txn, RECORDS, KeyRange::all()).await?;
    handle.commit(txn, 1).await?;
    handle.close_connection(connection).await?;
    Ok(count)
}

/// Creates a transaction and waits until the coordinator activates it.
async fn start(
    handle: &DatabaseHandle,
    events: &mut UnboundedReceiver<ClientEvent>,
    connection: ConnectionId,
    mode: TransactionMode,
) -> Result<TransactionId, DbError> {
    let txn = handle
        .create_transaction(connection, vec![RECORDS], mode)
        .await?;
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::TransactionStarted { transaction, error } if transaction == txn => {
                return match error {
                    None => Ok(txn),
                    Some(error) => {
                        handle.abort(txn).await?;
                        Err(error)
                    }
                };
            }
            other => debug!(?other, "ignoring client event"),
        }
    }
    Err(DbError::InvalidState("client event channel closed".into()))
}

async fn run_client(
    handle: DatabaseHandle,
    client: ClientId,
    seed: u64,
    transactions: u64,
) -> Result<Tally, DbError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut tally = Tally::default();
    let (link, mut events) = ClientLink::new(client);
    let connection = handle
        .open(link, RequestId(100 + client.0), None)
        .await?
        .connection();

    for _ in 0..transactions {
        let mode = if rng.gen_bool(0.4) {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        };
        let txn = match start(&handle, &mut events, connection, mode).await {
            Ok(txn) => txn,
            Err(error) => {
                tally.failed(&error);
                tally.aborted += 1;
                continue;
            }
        };

        let operations = rng.gen_range(1..=4);
        for _ in 0..operations {
            let result = if mode.is_read_only() {
                tally.reads += 1;
                read(&handle, txn, &mut rng).await
            } else {
                tally.writes += 1;
                write(&handle, txn, &mut rng).await
            };
            if let Err(error) = result {
                tally.failed_operations += 1;
                tally.failed(&error);
            }
        }

        if rng.gen_bool(0.1) {
            handle.abort(txn).await?;
            tally.aborted += 1;
            continue;
        }
        match handle.commit(txn, operations).await {
            Ok(()) => tally.committed += 1,
            Err(error) => {
                tally.failed(&error);
                tally.aborted += 1;
            }
        }
    }

    handle.close_connection(connection).await?;
    Ok(tally)
}

fn random_key(rng: &mut ChaCha8Rng) -> Key {
    Key::from(rng.gen_range(1..=KEY_SPACE) as f64)
}

async fn write(
    handle: &DatabaseHandle,
    txn: TransactionId,
    rng: &mut ChaCha8Rng,
) -> Result<(), DbError> {
    match rng.gen_range(0..10) {
        0..=5 => {
            let len = rng.gen_range(8..256);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let (key, mode) = if rng.gen_bool(0.5) {
                (Key::Invalid, OverwriteMode::Add)
            } else {
                (random_key(rng), OverwriteMode::Overwrite)
            };
            handle
                .put_or_add(
                    txn,
                    RECORDS,
                    key,
                    Value::from_bytes(payload),
                    IndexKeys::new(),
                    mode,
                )
                .await
                .map(|_| ())
        }
        6..=7 => {
            let key = random_key(rng);
            handle
                .put_or_add(
                    txn,
                    RECORDS,
                    key,
                    Value::from_bytes(b"add".to_vec()),
                    IndexKeys::new(),
                    OverwriteMode::Add,
                )
                .await
                .map(|_| ())
        }
        _ => {
            let key = random_key(rng);
            handle
                .delete_record(txn, RECORDS, KeyRange::only(key))
                .await
        }
    }
}

async fn read(
    handle: &DatabaseHandle,
    txn: TransactionId,
    rng: &mut ChaCha8Rng,
) -> Result<(), DbError> {
    if rng.gen_bool(0.5) {
        handle.get_count(txn, RECORDS, KeyRange::all()).await.map(|_| ())
    } else {
        let key = random_key(rng);
        handle
            .get_record(txn, RECORDS, KeyRange::only(key))
            .await
            .map(|_| ())
    }
}

fn print_report_text(report: &SimulationReport) {
    println!(
        "Simulated {} database(s) x {} client(s) with seed {} in {} ms",
        report.databases, report.clients_per_database, report.seed, report.elapsed_ms
    );
    println!(
        "Transactions: committed={} aborted={}",
        report.committed, report.aborted
    );
    println!(
        "Operations: writes={} reads={} failed={}",
        report.writes, report.reads, report.failed_operations
    );
    if !report.errors.is_empty() {
        println!("Errors:");
        for (kind, count) in &report.errors {
            println!("  {kind}={count}");
        }
    }
    println!("Records:");
    for (name, count) in &report.records {
        println!("  {name}={count}");
    }
    let m = &report.metrics;
    println!("Coordinator:");
    println!(
        "  requests_admitted={} requests_blocked={} quota_denials={}",
        m.requests_admitted, m.requests_blocked, m.quota_denials
    );
    println!(
        "  transactions_started={} deferred={} committed={} aborted={}",
        m.transactions_started,
        m.transactions_deferred,
        m.transactions_committed,
        m.transactions_aborted
    );
}
