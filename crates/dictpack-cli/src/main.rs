use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dictpack_api::{
    CatalogConfig, CatalogService, ClientRegistration, DownloadOutcome, MarkRequest,
    PayloadHandle, DEFAULT_CLIENT_ID,
};
use dictpack_core::{ClientWordListFields, RemoteWordList, WordListKey};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dictpack")]
#[command(about = "Dictionary word-list catalog CLI")]
struct Cli {
    #[arg(long, default_value = "./dictpack-data")]
    data_dir: PathBuf,
    #[arg(long)]
    payload_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    strict: bool,
    #[arg(long, default_value_t = false)]
    auto_download_updates: bool,
    /// Client namespace to operate on. Empty selects the default namespace.
    #[arg(long, global = true, default_value = DEFAULT_CLIENT_ID)]
    client: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Sync(SyncArgs),
    Mark(MarkArgs),
    Downloads {
        #[command(subcommand)]
        command: DownloadsCommand,
    },
    Client {
        #[command(subcommand)]
        command: ClientCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
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

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    List,
    Resolve {
        #[arg(long)]
        locale: String,
    },
    Open {
        #[arg(long)]
        id: String,
    },
    Insert(CatalogInsertArgs),
}

#[derive(Debug, Args)]
struct CatalogInsertArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    locale: String,
    #[arg(long)]
    version: Option<u32>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    local_filename: Option<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// JSON file holding the remote metadata feed.
    #[arg(long)]
    metadata: PathBuf,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct MarkArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    version: u32,
    #[arg(long)]
    request: MarkArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MarkArg {
    Used,
    Unused,
    Deleting,
    Deleted,
}

#[derive(Debug, Subcommand)]
enum DownloadsCommand {
    Pending,
    Finished(DownloadFinishedArgs),
    Corrupt {
        #[arg(long)]
        id: String,
        #[arg(long)]
        version: u32,
    },
}

#[derive(Debug, Args)]
struct DownloadFinishedArgs {
    #[arg(long)]
    job_id: i64,
    #[arg(long, conflicts_with = "failed")]
    local_filename: Option<String>,
    /// Failure reason. Discards the download instead of installing it.
    #[arg(long)]
    failed: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    Register {
        #[arg(long, default_value = "")]
        metadata_uri: String,
        #[arg(long, default_value = "")]
        additional_id: String,
    },
    Remove,
    List,
}

impl From<MarkArg> for MarkRequest {
    fn from(value: MarkArg) -> Self {
        match value {
            MarkArg::Used => Self::Used,
            MarkArg::Unused => Self::Unused,
            MarkArg::Deleting => Self::Deleting,
            MarkArg::Deleted => Self::Deleted,
        }
    }
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

fn emit<T: serde::Serialize>(value: &T, what: &str) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = CatalogConfig::new(cli.data_dir)
        .with_payload_dir(cli.payload_dir)
        .with_strict(cli.strict)
        .with_auto_download_updates(cli.auto_download_updates);
    let service = CatalogService::open(config)?;
    debug!(client_id = %cli.client, "dictpack cli started");

    match cli.command {
        Command::Db { command } => run_db(command, &service, &cli.client),
        Command::Catalog { command } => run_catalog(command, &service, &cli.client),
        Command::Sync(args) => run_sync(&args, &service, &cli.client),
        Command::Mark(args) => {
            let key = WordListKey::new(args.id, args.version);
            let report = service.mark(&cli.client, &key, args.request.into())?;
            emit(&report, "batch report")
        }
        Command::Downloads { command } => run_downloads(command, &service, &cli.client),
        Command::Client { command } => run_client(command, &service, &cli.client),
    }
}

fn run_db(command: DbCommand, service: &CatalogService, client_id: &str) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = service.schema_status(client_id)?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            emit(&service.migrate(client_id, args.dry_run)?, "migration result")
        }
        DbCommand::Backup(args) => {
            service.backup(client_id, &args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            service.restore(client_id, &args.input)?;
            let status = service.schema_status(client_id)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            emit(&service.integrity_check(client_id)?, "integrity report")
        }
    }
}

fn run_catalog(command: CatalogCommand, service: &CatalogService, client_id: &str) -> Result<()> {
    match command {
        CatalogCommand::List => emit_json(serde_json::json!({
            "client_id": client_id,
            "word_lists": service.list_public(client_id)
        })),
        CatalogCommand::Resolve { locale } => emit_json(serde_json::json!({
            "client_id": client_id,
            "locale": locale,
            "word_lists": service.resolve_for_locale(client_id, &locale)
        })),
        CatalogCommand::Open { id } => {
            let handle = service.open_payload(client_id, &id)?;
            let (kind, path) = match handle {
                PayloadHandle::Empty => ("empty", None),
                PayloadHandle::File(path) => ("file", Some(path)),
            };
            emit_json(serde_json::json!({
                "id": id,
                "payload": kind,
                "path": path
            }))
        }
        CatalogCommand::Insert(args) => {
            let fields = ClientWordListFields {
                id: Some(args.id),
                locale: Some(args.locale),
                version: args.version,
                description: args.description,
                local_filename: args.local_filename,
                ..ClientWordListFields::default()
            };
            emit(&service.insert_from_client(client_id, fields)?, "batch report")
        }
    }
}

fn run_sync(args: &SyncArgs, service: &CatalogService, client_id: &str) -> Result<()> {
    let body = fs::read_to_string(&args.metadata)
        .with_context(|| format!("failed to read metadata feed {}", args.metadata.display()))?;
    let remote: Vec<RemoteWordList> = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse metadata feed {}", args.metadata.display()))?;
    let outcome = service.reconcile(client_id, remote, args.dry_run)?;
    emit(&outcome, "reconcile outcome")
}

fn run_downloads(command: DownloadsCommand, service: &CatalogService, client_id: &str) -> Result<()> {
    match command {
        DownloadsCommand::Pending => emit_json(serde_json::json!({
            "client_id": client_id,
            "downloads": service.pending_downloads(client_id)?
        })),
        DownloadsCommand::Finished(args) => {
            let outcome = match (args.local_filename, args.failed) {
                (Some(local_filename), None) => DownloadOutcome::Succeeded { local_filename },
                (None, Some(reason)) => DownloadOutcome::Failed { reason },
                _ => return Err(anyhow!("exactly one of --local-filename or --failed is required")),
            };
            emit(&service.download_finished(client_id, args.job_id, outcome)?, "batch report")
        }
        DownloadsCommand::Corrupt { id, version } => {
            let key = WordListKey::new(id, version);
            emit(&service.report_corrupt_payload(client_id, &key)?, "batch report")
        }
    }
}

fn run_client(command: ClientCommand, service: &CatalogService, client_id: &str) -> Result<()> {
    match command {
        ClientCommand::Register { metadata_uri, additional_id } => {
            service.register_client(client_id, &ClientRegistration { metadata_uri, additional_id })?;
            emit_json(serde_json::json!({
                "client": service.get_client(client_id)?,
                "last_sync": service.last_sync_for_client(client_id)?
            }))
        }
        ClientCommand::Remove => {
            let existed = service.delete_metadata_namespace(client_id)?;
            emit_json(serde_json::json!({
                "client_id": client_id,
                "existed": existed
            }))
        }
        ClientCommand::List => emit_json(serde_json::json!({
            "clients": service.list_clients()?,
            "oldest_sync": service.oldest_sync_time()?
        })),
    }
}
