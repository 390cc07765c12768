//! `ddmctl`
//!
//! Operator tool over a file-backed store: manage declarations and
//! memberships, inspect derived documents and status projections.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ddm_store::{DdmStore, FileKv, Page, StoreConfig, StoreError, StoreOutcome};

#[derive(Parser, Debug)]
#[command(name = "ddmctl", version, about = "Declarative device management store tool")]
struct Args {
    /// Directory holding the store's data
    #[arg(long, default_value = "./ddm-data")]
    data: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a declaration from a JSON file
    Put { file: PathBuf },
    /// Print a stored declaration
    Get { id: String },
    /// Delete a declaration and its group edges
    Delete { id: String },
    /// List declaration identifiers
    List,
    /// Add a declaration to a group
    Link { group: String, declaration: String },
    /// Remove a declaration from a group
    Unlink { group: String, declaration: String },
    /// List groups, or the declarations of one group
    Sets { group: Option<String> },
    /// Subscribe an enrollment to a group
    Enroll { enrollment: String, group: String },
    /// Unsubscribe an enrollment from a group, or from all groups
    Unenroll {
        enrollment: String,
        group: Option<String>,
    },
    /// Print an enrollment's manifest
    Manifest { enrollment: String },
    /// Print an enrollment's token document
    Tokens { enrollment: String },
    /// Rebuild an enrollment's derived documents
    Recompute { enrollment: String },
    /// Rebuild the documents of every enrollment reaching a declaration
    RecomputeDeclaration { id: String },
    /// Rebuild the documents of every enrollment in a group
    RecomputeGroup { group: String },
    /// Ingest a status report from a JSON file
    Status { enrollment: String, file: PathBuf },
    /// Print accumulated status values
    Values {
        enrollment: String,
        /// Path pattern, with `%` as the wildcard marker
        #[arg(long)]
        path: Option<String>,
    },
    /// Print logged status errors, newest first
    Errors {
        enrollment: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print declaration statuses
    DeclarationStatus { enrollment: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let kv = FileKv::open(&args.data)
        .await
        .with_context(|| format!("opening store at {}", args.data.display()))?;
    let store = DdmStore::new(Arc::new(kv), config)?;

    run(&store, args.command).await
}

async fn run(store: &DdmStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { file } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let outcome =
                report_cascade(store.store_declaration(&raw).await, StoreOutcome::Changed)?;
            println!("{:?}", outcome);
        }
        Command::Get { id } => {
            let declaration = store.retrieve_declaration(&id).await?;
            println!("{}", String::from_utf8_lossy(&declaration.raw));
        }
        Command::Delete { id } => report_cascade(store.delete_declaration(&id).await, ())?,
        Command::List => print_lines(store.retrieve_declarations().await?),
        Command::Link { group, declaration } => {
            let changed =
                report_cascade(store.store_set_declaration(&group, &declaration).await, true)?;
            println!("{}", changed);
        }
        Command::Unlink { group, declaration } => {
            let changed =
                report_cascade(store.remove_set_declaration(&group, &declaration).await, true)?;
            println!("{}", changed);
        }
        Command::Sets { group: None } => print_lines(store.retrieve_sets().await?),
        Command::Sets { group: Some(group) } => {
            print_lines(store.retrieve_set_declarations(&group).await?)
        }
        Command::Enroll { enrollment, group } => {
            let changed =
                report_cascade(store.store_enrollment_set(&enrollment, &group).await, true)?;
            println!("{}", changed);
        }
        Command::Unenroll { enrollment, group } => {
            let result = match group {
                Some(group) => store.remove_enrollment_set(&enrollment, &group).await,
                None => store.remove_all_enrollment_sets(&enrollment).await,
            };
            println!("{}", report_cascade(result, true)?);
        }
        Command::Manifest { enrollment } => {
            print_json(&store.retrieve_declaration_items_json(&enrollment).await?)?
        }
        Command::Tokens { enrollment } => {
            print_json(&store.retrieve_tokens_json(&enrollment).await?)?
        }
        Command::Recompute { enrollment } => {
            let documents = store.recompute_enrollment(&enrollment).await?;
            print_json(&documents.tokens)?;
        }
        Command::RecomputeDeclaration { id } => {
            print_lines(report_cascade(store.recompute_declaration(&id).await, Vec::new())?)
        }
        Command::RecomputeGroup { group } => {
            print_lines(report_cascade(store.recompute_group(&group).await, Vec::new())?)
        }
        Command::Status { enrollment, file } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let summary = store.store_status(&enrollment, &raw).await?;
            println!("{:?}", summary);
        }
        Command::Values { enrollment, path } => {
            let values = store
                .retrieve_status_values(&[enrollment.as_str()], path.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        Command::Errors {
            enrollment,
            offset,
            limit,
        } => {
            let errors = store
                .retrieve_status_errors(&[enrollment.as_str()], Page { offset, limit })
                .await?;
            println!("{}", serde_json::to_string_pretty(&errors)?);
        }
        Command::DeclarationStatus { enrollment } => {
            let statuses = store.retrieve_declaration_status(&[enrollment.as_str()]).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
    }
    Ok(())
}

/// A cascade failure still means the mutation itself went through, so
/// report it with the command that retries it and carry on with
/// `committed` as the result.
fn report_cascade<T>(result: Result<T, StoreError>, committed: T) -> anyhow::Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(StoreError::Cascade(failure)) => {
            log::warn!("{}", failure);
            for id in failure.failed_enrollments() {
                eprintln!("recompute failed for {}; retry with `ddmctl recompute {}`", id, id);
            }
            Ok(committed)
        }
        Err(StoreError::Unpropagated { kind, id, source }) => {
            log::warn!("{} {} committed without recompute: {}", kind, id, source);
            eprintln!(
                "documents not recomputed; retry with `ddmctl recompute-{} {}`",
                kind, id
            );
            Ok(committed)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

fn print_json(raw: &[u8]) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
