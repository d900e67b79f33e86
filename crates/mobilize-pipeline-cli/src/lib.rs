//! `mobilize` command surface over the pipeline store.
//!
//! Host processes embed this through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct [`Command`] execution against an open store.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mobilize_pipeline_core::{
    parse_rfc3339_utc, ContactType, PipelineError, PipelineType, StageAssignmentInput,
    TypeCompatibility,
};
use mobilize_pipeline_store_sqlite::SqlitePipelineStore;

const DEFAULT_ASSIGN_RETRIES: u32 = 3;

#[derive(Debug, Parser)]
#[command(name = "mobilize")]
#[command(about = "Mobilize CRM pipeline CLI")]
pub struct Cli {
    #[arg(long, default_value = "./mobilize_crm.sqlite3")]
    db: PathBuf,

    /// JSON file mapping contact types to pipeline types; defaults to the
    /// built-in person->people, church->church table.
    #[arg(long)]
    compatibility: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Pipeline {
        #[command(subcommand)]
        command: Box<PipelineCommand>,
    },
    Stage {
        #[command(subcommand)]
        command: Box<StageCommand>,
    },
    Contact {
        #[command(subcommand)]
        command: Box<ContactCommand>,
    },
    Assign(AssignArgs),
    Enter(EnterArgs),
    Counts(CountsArgs),
    History(HistoryArgs),
    Schema {
        #[command(subcommand)]
        command: Box<SchemaCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PipelineCommand {
    Create(PipelineCreateArgs),
    List,
    Main(PipelineMainArgs),
}

#[derive(Debug, Args)]
pub struct PipelineCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    pipeline_type: PipelineTypeArg,
    #[arg(long)]
    main: bool,
}

#[derive(Debug, Args)]
pub struct PipelineMainArgs {
    #[arg(long)]
    contact_type: ContactTypeArg,
}

#[derive(Debug, Subcommand)]
pub enum StageCommand {
    Add(StageAddArgs),
    List(StageListArgs),
}

#[derive(Debug, Args)]
pub struct StageAddArgs {
    #[arg(long)]
    pipeline_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    ordinal: i64,
}

#[derive(Debug, Args)]
pub struct StageListArgs {
    #[arg(long)]
    pipeline_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum ContactCommand {
    Add(ContactAddArgs),
}

#[derive(Debug, Args)]
pub struct ContactAddArgs {
    #[arg(long)]
    contact_type: ContactTypeArg,
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
pub struct AssignArgs {
    #[arg(long)]
    contact_id: i64,
    #[arg(long)]
    pipeline_id: i64,
    #[arg(long)]
    stage_id: i64,
    #[arg(long)]
    moved_by: String,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    moved_at: Option<String>,
    #[arg(long, default_value_t = DEFAULT_ASSIGN_RETRIES)]
    retries: u32,
}

#[derive(Debug, Args)]
pub struct EnterArgs {
    #[arg(long)]
    contact_id: i64,
    #[arg(long)]
    pipeline_id: i64,
    #[arg(long)]
    moved_by: String,
}

#[derive(Debug, Args)]
pub struct CountsArgs {
    #[arg(long)]
    pipeline_id: i64,
    #[arg(long)]
    by_stage: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    contact_id: i64,
    #[arg(long)]
    pipeline_id: i64,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Check(SchemaCheckArgs),
    Ensure(SchemaEnsureArgs),
}

#[derive(Debug, Args)]
pub struct SchemaCheckArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    column: String,
}

#[derive(Debug, Args)]
pub struct SchemaEnsureArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    column: String,
    #[arg(long)]
    definition: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ContactTypeArg {
    Person,
    Church,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PipelineTypeArg {
    People,
    Church,
}

fn map_contact_type(value: ContactTypeArg) -> ContactType {
    match value {
        ContactTypeArg::Person => ContactType::Person,
        ContactTypeArg::Church => ContactType::Church,
    }
}

fn map_pipeline_type(value: PipelineTypeArg) -> PipelineType {
    match value {
        PipelineTypeArg::People => PipelineType::People,
        PipelineTypeArg::Church => PipelineType::Church,
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or the
/// requested command fails. Core failures also print a structured error
/// envelope with a stable kind tag.
pub fn run_cli(cli: Cli) -> Result<()> {
    let compatibility = load_compatibility(cli.compatibility.as_deref())?;
    let mut store = SqlitePipelineStore::open(&cli.db, compatibility)?;
    store.migrate()?;

    let result = run_command(cli.command, &mut store);
    if let Err(err) = &result {
        if let Some(core_err) = err.downcast_ref::<PipelineError>() {
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&error_envelope(core_err))?
            );
        }
    }
    result
}

/// Structured error object for end users: stable kind tag plus message,
/// never raw storage-layer text.
#[must_use]
pub fn error_envelope(err: &PipelineError) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
        }
    })
}

fn load_compatibility(path: Option<&std::path::Path>) -> Result<TypeCompatibility> {
    let Some(path) = path else {
        return Ok(TypeCompatibility::standard());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read compatibility file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse compatibility file {}", path.display()))?;
    Ok(TypeCompatibility::from_json(&value)?)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_command(command: Command, store: &mut SqlitePipelineStore) -> Result<()> {
    match command {
        Command::Pipeline { command } => run_pipeline(*command, store),
        Command::Stage { command } => run_stage(*command, store),
        Command::Contact { command } => run_contact(*command, store),
        Command::Assign(args) => {
            let input = StageAssignmentInput {
                contact_id: args.contact_id,
                pipeline_id: args.pipeline_id,
                target_stage_id: args.stage_id,
                moved_by: args.moved_by,
                notes: args.notes,
                moved_at: parse_optional_utc(args.moved_at.as_deref())?,
            };

            let assignment = store.assign_stage_with_retry(&input, args.retries)?;
            println!("{}", serde_json::to_string_pretty(&assignment)?);
            Ok(())
        }
        Command::Enter(args) => {
            let assignment =
                store.enter_pipeline(args.contact_id, args.pipeline_id, &args.moved_by)?;
            println!("{}", serde_json::to_string_pretty(&assignment)?);
            Ok(())
        }
        Command::Counts(args) => {
            if args.by_stage {
                let report = store.stage_count_report(args.pipeline_id)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let total = store.count_total(args.pipeline_id)?;
                let payload = serde_json::json!({
                    "pipeline_id": args.pipeline_id,
                    "total": total,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            Ok(())
        }
        Command::History(args) => {
            let history = store.history_for(args.contact_id, args.pipeline_id, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        Command::Schema { command } => run_schema(*command, store),
    }
}

fn run_pipeline(command: PipelineCommand, store: &SqlitePipelineStore) -> Result<()> {
    match command {
        PipelineCommand::Create(args) => {
            let pipeline = store.create_pipeline(
                &args.name,
                args.description.as_deref(),
                map_pipeline_type(args.pipeline_type),
                args.main,
            )?;
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
            Ok(())
        }
        PipelineCommand::List => {
            let pipelines = store.list_pipelines()?;
            println!("{}", serde_json::to_string_pretty(&pipelines)?);
            Ok(())
        }
        PipelineCommand::Main(args) => {
            let contact_type = map_contact_type(args.contact_type);
            let Some(pipeline) = store.resolve_main_pipeline(contact_type)? else {
                return Err(anyhow!(
                    "no main pipeline is configured for contact type '{}'",
                    contact_type
                ));
            };
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
            Ok(())
        }
    }
}

fn run_stage(command: StageCommand, store: &SqlitePipelineStore) -> Result<()> {
    match command {
        StageCommand::Add(args) => {
            let stage = store.add_stage(args.pipeline_id, &args.name, args.ordinal)?;
            println!("{}", serde_json::to_string_pretty(&stage)?);
            Ok(())
        }
        StageCommand::List(args) => {
            let stages = store.stages_of(args.pipeline_id)?;
            println!("{}", serde_json::to_string_pretty(&stages)?);
            Ok(())
        }
    }
}

fn run_contact(command: ContactCommand, store: &SqlitePipelineStore) -> Result<()> {
    match command {
        ContactCommand::Add(args) => {
            let contact =
                store.register_contact(map_contact_type(args.contact_type), &args.owner)?;
            println!("{}", serde_json::to_string_pretty(&contact)?);
            Ok(())
        }
    }
}

fn run_schema(command: SchemaCommand, store: &SqlitePipelineStore) -> Result<()> {
    match command {
        SchemaCommand::Check(args) => {
            let present = store.has_column(&args.table, &args.column)?;
            let payload = serde_json::json!({
                "table": args.table,
                "column": args.column,
                "present": present,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        SchemaCommand::Ensure(args) => {
            // Failed is data, not an error: the operator decides whether the
            // column was required.
            let outcome = store.ensure_column(&args.table, &args.column, &args.definition);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<time::OffsetDateTime>> {
    match raw {
        Some(value) => {
            let parsed =
                parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid --moved-at: {err}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
