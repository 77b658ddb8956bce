use std::fs;
use std::path::{Path, PathBuf};

use activity_jobs_core::{
    EntityKind, JobConfig, JobName, JobRunner, LearnerActionSpec, SearchIndexName,
};
use activity_jobs_store_sqlite::{SqliteStore, StoredJobReport};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use ulid::Ulid;

mod logging;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "aj")]
#[command(about = "Activity one-off jobs CLI")]
struct Cli {
    #[arg(long, default_value = "./activity_jobs.sqlite3")]
    db: PathBuf,

    /// YAML file with job settings; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Job {
        #[command(subcommand)]
        command: Box<JobCommand>,
    },
    Entity {
        #[command(subcommand)]
        command: Box<EntityCommand>,
    },
    Search {
        #[command(subcommand)]
        command: Box<SearchCommand>,
    },
    ActionSpec {
        #[command(subcommand)]
        command: Box<ActionSpecCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Subcommand)]
enum JobCommand {
    List,
    Run(JobRunArgs),
    Show(JobShowArgs),
    History,
}

#[derive(Debug, Args)]
struct JobRunArgs {
    #[arg(value_parser = parse_job_name)]
    job: JobName,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long)]
    system_committer_id: Option<String>,
    #[arg(long)]
    max_map_attempts: Option<u32>,
    #[arg(long)]
    max_write_attempts: Option<u32>,
}

#[derive(Debug, Args)]
struct JobShowArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    /// Load records from an NDJSON file, one serialized record per line.
    Load(EntityLoadArgs),
    List(EntityListArgs),
}

#[derive(Debug, Args)]
struct EntityLoadArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct EntityListArgs {
    #[arg(long, value_parser = parse_entity_kind)]
    kind: EntityKind,
}

#[derive(Debug, Subcommand)]
enum SearchCommand {
    List(SearchListArgs),
}

#[derive(Debug, Args)]
struct SearchListArgs {
    #[arg(long, value_parser = parse_index_name)]
    index: Option<SearchIndexName>,
}

#[derive(Debug, Subcommand)]
enum ActionSpecCommand {
    Show,
}

fn parse_job_name(value: &str) -> Result<JobName, String> {
    JobName::parse(value).ok_or_else(|| {
        let known: Vec<&str> = JobName::ALL.iter().map(|name| name.as_str()).collect();
        format!("unknown job `{value}`; expected one of: {}", known.join(", "))
    })
}

fn parse_entity_kind(value: &str) -> Result<EntityKind, String> {
    EntityKind::parse(value).ok_or_else(|| format!("unknown entity kind `{value}`"))
}

fn parse_index_name(value: &str) -> Result<SearchIndexName, String> {
    SearchIndexName::parse(value).ok_or_else(|| {
        format!("unknown search index `{value}`; expected explorations or collections")
    })
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

fn load_job_config(path: Option<&Path>) -> Result<JobConfig> {
    let Some(path) = path else {
        return Ok(JobConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Job { command } => run_job(*command, &cli.db, cli.config.as_deref()),
        Command::Entity { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_entity(*command, &mut store)
        }
        Command::Search { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_search(*command, &mut store)
        }
        Command::ActionSpec { command } => run_action_spec(&command),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_job(command: JobCommand, db: &Path, config_path: Option<&Path>) -> Result<()> {
    match command {
        JobCommand::List => run_job_list(),
        JobCommand::Run(args) => {
            let config = job_config_for(&args, config_path)?;
            run_job_run(&args, db, config)
        }
        JobCommand::Show(args) => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let Some(stored) = store.get_job_report(&args.run_id)? else {
                return Err(anyhow!("job run not found: {}", args.run_id));
            };
            emit_json(serde_json::to_value(&stored).context("failed to serialize job report")?)
        }
        JobCommand::History => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let runs = store.list_job_reports()?;
            emit_json(serde_json::json!({ "runs": runs }))
        }
    }
}

fn run_job_list() -> Result<()> {
    let jobs: Vec<Value> = JobName::ALL
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name.as_str(),
                "description": name.description(),
                "entity_classes": name
                    .entity_classes_to_map_over()
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    emit_json(serde_json::json!({ "jobs": jobs }))
}

fn job_config_for(args: &JobRunArgs, config_path: Option<&Path>) -> Result<JobConfig> {
    let mut config = load_job_config(config_path)?;
    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(id) = &args.system_committer_id {
        config.system_committer_id.clone_from(id);
    }
    if let Some(attempts) = args.max_map_attempts {
        config.max_map_attempts = attempts;
    }
    if let Some(attempts) = args.max_write_attempts {
        config.max_write_attempts = attempts;
    }
    Ok(config)
}

fn run_job_run(args: &JobRunArgs, db: &Path, config: JobConfig) -> Result<()> {
    let mut store = SqliteStore::open(db)?;
    store.migrate()?;
    let mut index = SqliteStore::open(db)?;

    let report = JobRunner::new(&mut store, &mut index, config)?.run_named(args.job)?;
    let run_id = Ulid::new().to_string();
    store.save_job_report(&run_id, &report)?;
    info!(%run_id, job = %args.job, "saved job report");

    let stored = StoredJobReport { run_id, report };
    emit_json(serde_json::to_value(&stored).context("failed to serialize job report")?)
}

fn run_entity(command: EntityCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        EntityCommand::Load(args) => {
            let summary = store.import_entities(&args.file, args.skip_existing)?;
            emit_json(serde_json::json!({
                "file": args.file,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        EntityCommand::List(args) => {
            store.migrate()?;
            let entities = store.list_entities(args.kind)?;
            emit_json(serde_json::json!({
                "kind": args.kind,
                "count": entities.len(),
                "entities": entities
            }))
        }
    }
}

fn run_search(command: SearchCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        SearchCommand::List(args) => {
            let documents = store.list_search_documents(args.index)?;
            emit_json(serde_json::json!({
                "index": args.index,
                "count": documents.len(),
                "documents": documents
            }))
        }
    }
}

fn run_action_spec(command: &ActionSpecCommand) -> Result<()> {
    match command {
        ActionSpecCommand::Show => {
            let spec = LearnerActionSpec::exploration_start();
            emit_json(serde_json::json!({
                "action_type": spec.action_type,
                "description": spec.description,
                "customization_arg_specs": spec.to_declaration(),
                "default_customization_args": spec.default_customization_args()
            }))
        }
    }
}
