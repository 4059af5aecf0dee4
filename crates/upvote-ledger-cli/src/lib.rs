//! Operator command surface for the upvote ledger.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteUpvoteStore`].
//!
//! Every command prints a single pretty JSON document on stdout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use upvote_ledger_core::{showcase, ProjectCatalog, ProjectName, UserId};
use upvote_ledger_store_sqlite::SqliteUpvoteStore;

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Upvote ledger operator CLI")]
pub struct Cli {
    #[arg(long, env = "UPVOTE_LEDGER_DB", default_value = "./upvote_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Upvote {
        #[command(subcommand)]
        command: UpvoteCommand,
    },
    Projects {
        #[command(subcommand)]
        command: ProjectsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    SchemaVersion,
}

#[derive(Debug, Subcommand)]
pub enum UpvoteCommand {
    /// Adds the user's upvote, or removes it when present.
    Toggle(ToggleArgs),
    Count(CountArgs),
    Tally(TallyArgs),
    List(ListArgs),
    /// Deletes every upvote. Irreversible.
    Reset(ResetArgs),
}

#[derive(Debug, Subcommand)]
pub enum ProjectsCommand {
    /// Showcase ordering: podium first, then by upvotes.
    List(ProjectsListArgs),
}

#[derive(Debug, Args)]
pub struct ToggleArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
pub struct CountArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
pub struct TallyArgs {
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    project: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    #[arg(long)]
    confirm: bool,
}

#[derive(Debug, Args)]
pub struct ProjectsListArgs {
    #[arg(long, env = "UPVOTE_LEDGER_CATALOG")]
    catalog: Option<PathBuf>,
    #[arg(long)]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CountReport {
    project_name: String,
    count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_upvoted: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ResetReport {
    success: bool,
    message: &'static str,
    removed: u64,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a command against the `SQLite` DB at `db_path`.
///
/// `db schema-version` reports the on-disk state as found; every other
/// command migrates first.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteUpvoteStore::open(db_path)?;
    if !matches!(command, Command::Db { command: DbCommand::SchemaVersion }) {
        store.migrate()?;
    }
    run_command(command, &mut store)
}

/// Executes a command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation or a store operation fails.
pub fn run_command(command: Command, store: &mut SqliteUpvoteStore) -> Result<()> {
    match command {
        Command::Db { command } => match command {
            DbCommand::Migrate => {
                store.migrate()?;
                print_json(&store.schema_status()?)
            }
            DbCommand::SchemaVersion => print_json(&store.schema_status()?),
        },
        Command::Upvote { command } => run_upvote(command, store),
        Command::Projects { command } => match command {
            ProjectsCommand::List(args) => {
                let catalog = load_catalog(args.catalog.as_deref())?;
                let user = args.user.map(parse_user_id).transpose()?;
                let tally = store.tally(user.as_ref())?;
                print_json(&showcase(&catalog, &tally))
            }
        },
    }
}

fn run_upvote(command: UpvoteCommand, store: &mut SqliteUpvoteStore) -> Result<()> {
    match command {
        UpvoteCommand::Toggle(args) => {
            let project = parse_project_name(args.project)?;
            let user = parse_user_id(args.user)?;
            print_json(&store.toggle_upvote(&project, &user)?)
        }
        UpvoteCommand::Count(args) => {
            let project = parse_project_name(args.project)?;
            let user = args.user.map(parse_user_id).transpose()?;
            let user_upvoted = match &user {
                Some(user) => Some(store.has_upvoted(&project, user)?),
                None => None,
            };
            print_json(&CountReport {
                count: store.upvote_count(&project)?,
                project_name: project.as_str().to_string(),
                user_upvoted,
            })
        }
        UpvoteCommand::Tally(args) => {
            let user = args.user.map(parse_user_id).transpose()?;
            print_json(&store.tally(user.as_ref())?)
        }
        UpvoteCommand::List(args) => {
            let project = args.project.map(parse_project_name).transpose()?;
            print_json(&store.list_upvotes(project.as_ref())?)
        }
        UpvoteCommand::Reset(args) => {
            if !args.confirm {
                bail!("refusing to delete every upvote without --confirm");
            }
            let removed = store.reset_all()?;
            print_json(&ResetReport {
                success: true,
                message: "All upvotes have been reset",
                removed,
            })
        }
    }
}

fn parse_project_name(value: String) -> Result<ProjectName> {
    ProjectName::parse(value).context("invalid --project")
}

fn parse_user_id(value: String) -> Result<UserId> {
    UserId::parse(value).context("invalid --user")
}

fn load_catalog(path: Option<&Path>) -> Result<ProjectCatalog> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read project catalog {}", path.display()))?;
            ProjectCatalog::from_json(&raw)
                .with_context(|| format!("invalid project catalog {}", path.display()))
        }
        None => ProjectCatalog::builtin().context("invalid built-in project catalog"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
