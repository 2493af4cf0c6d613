use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use respectabullz_db::db::table_exists;
use respectabullz_db::importer::target_is_empty;
use respectabullz_db::{
    Database, FileSnapshotStorage, InitOptions, Initializer, LegacyImporter, MigrationRunner,
    SnapshotReader, StoreConfig,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rbz")]
#[command(about = "Respectabullz store maintenance CLI")]
struct Cli {
    /// Database file; defaults to the platform data directory.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory holding the legacy snapshot.
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    #[arg(long)]
    snapshot_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or migrate the schema and import legacy data if due.
    Init,
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Legacy {
        #[command(subcommand)]
        command: LegacyCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LegacyCommand {
    Status,
    Import,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Store layout from the flags; `--db` places storage and backups beside the file.
fn resolve_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.db {
        Some(db) => {
            let dir = db
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            StoreConfig::in_dir(dir).with_db_path(db)
        }
        None => StoreConfig::platform_default()
            .ok_or_else(|| anyhow!("no platform data directory; pass --db"))?,
    };
    if let Some(storage_dir) = &cli.storage_dir {
        config = config.with_storage_dir(storage_dir);
    }
    if let Some(key) = &cli.snapshot_key {
        config = config.with_snapshot_key(key);
    }
    Ok(config)
}

fn open_database(config: &StoreConfig) -> Result<Database> {
    Database::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))
}

fn log_progress(stage: &str, done: usize, total: usize) {
    tracing::debug!("{} {}/{}", stage, done, total);
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let storage = FileSnapshotStorage::new(&config.storage_dir);

    match cli.command {
        Command::Init => run_init(&config, &storage),
        Command::Db { command } => {
            let mut db = open_database(&config)?;
            run_db(command, &mut db)
        }
        Command::Legacy { command } => {
            let mut db = open_database(&config)?;
            run_legacy(command, &config, &storage, &mut db)
        }
    }
}

fn run_init(config: &StoreConfig, storage: &FileSnapshotStorage) -> Result<()> {
    let mut db = open_database(config)?;
    let report =
        Initializer::new(&mut db, storage, InitOptions::from(config)).initialize(&mut log_progress);
    let success = report.success;
    emit_json(serde_json::to_value(&report).context("failed to serialize init report")?)?;
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn run_db(command: DbCommand, db: &mut Database) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(db),
        DbCommand::Migrate(args) => run_db_migrate(&args, db),
        DbCommand::IntegrityCheck => run_db_integrity_check(db),
        DbCommand::Backup(args) => run_db_backup(&args, db),
    }
}

fn run_db_schema_version(db: &Database) -> Result<()> {
    let status = MigrationRunner::status_of(db.conn())?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, db: &mut Database) -> Result<()> {
    let before = MigrationRunner::status_of(db.conn())?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    let outcome = MigrationRunner::new(db.conn_mut()).run(&mut log_progress)?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": outcome.from_version,
        "applied_versions": outcome.applied,
        "after_version": outcome.to_version,
        "target_version": before.target_version,
        "up_to_date": outcome.to_version >= before.target_version
    }))
}

fn run_db_integrity_check(db: &Database) -> Result<()> {
    let report = db.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_backup(args: &DbBackupArgs, db: &Database) -> Result<()> {
    db.backup_to(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_legacy(
    command: LegacyCommand,
    config: &StoreConfig,
    storage: &FileSnapshotStorage,
    db: &mut Database,
) -> Result<()> {
    match command {
        LegacyCommand::Status => run_legacy_status(config, storage, db),
        LegacyCommand::Import => run_legacy_import(config, storage, db),
    }
}

fn run_legacy_status(
    config: &StoreConfig,
    storage: &FileSnapshotStorage,
    db: &Database,
) -> Result<()> {
    let summary = SnapshotReader::new(storage, config.snapshot_key.clone()).summary();
    let target_empty = target_is_empty(db.conn())?;
    emit_json(serde_json::json!({
        "snapshot_path": storage.path_for(&config.snapshot_key)?,
        "target_empty": target_empty,
        "would_import": target_empty && summary.has_legacy_data,
        "snapshot": summary
    }))
}

fn run_legacy_import(
    config: &StoreConfig,
    storage: &FileSnapshotStorage,
    db: &mut Database,
) -> Result<()> {
    let status = MigrationRunner::status_of(db.conn())?;
    if !table_exists(db.conn(), "dogs")? || !status.pending_versions.is_empty() {
        bail!(
            "store at {} is not at schema v{}; run `rbz init` first",
            config.db_path.display(),
            status.target_version
        );
    }

    let result = LegacyImporter::new(db.conn_mut(), storage, config.snapshot_key.clone())
        .import_legacy_data(&mut log_progress);
    let success = result.success;
    emit_json(serde_json::to_value(&result).context("failed to serialize import result")?)?;
    if !success {
        std::process::exit(1);
    }
    Ok(())
}
