//! Binary entry point for the dataslot service and its local CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dataslot::codec::Cell;
use dataslot::config::{ServiceConfig, CONFIG_ENV};
use dataslot::query::{OpsRequest, QueryService, ResultGrid, SqlRequest};
use dataslot::registry::{DatasetStore, DatasetSummary, StoredDataset, Workspace, WorkspaceUpload};
use dataslot::server::{self, install_tracing_subscriber};
use dataslot::storage::{Chunk, ChunkRequest};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "dataslot",
    version,
    about = "Multi-dataset workspace with chunked browsing and bounded queries",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = CONFIG_ENV,
        value_name = "FILE",
        help = "TOML configuration file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "DATASLOT_DATA_DIR",
        value_name = "DIR",
        help = "Override the data directory"
    )]
    data_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Serve the HTTP API")]
    Serve(ServeCmd),

    #[command(about = "Upload a CSV or Parquet file into the workspace")]
    Upload {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, help = "Store in the single-dataset store instead of a workspace slot")]
        store: bool,
    },

    #[command(about = "List the datasets currently loaded in the workspace")]
    Current,

    #[command(about = "Evict a dataset from the workspace")]
    Remove {
        #[arg(value_name = "DATASET_ID", required_unless_present = "all")]
        dataset_id: Option<String>,

        #[arg(long, conflicts_with = "dataset_id", help = "Evict every dataset")]
        all: bool,
    },

    #[command(about = "Print a page of a workspace dataset")]
    Chunk(ChunkCmd),

    #[command(about = "Run a read-only SQL query over t1..t3")]
    Sql {
        #[arg(value_name = "QUERY")]
        query: String,

        #[command(flatten)]
        budget: BudgetArgs,
    },

    #[command(about = "Run a JSON pipeline (inline, or @FILE)")]
    Ops {
        #[arg(value_name = "STEPS")]
        steps: String,

        #[command(flatten)]
        budget: BudgetArgs,
    },
}

#[derive(Args, Debug)]
struct ServeCmd {
    #[arg(long, value_name = "ADDR", help = "Bind address")]
    host: Option<IpAddr>,

    #[arg(long, value_name = "PORT", help = "Bind port")]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct ChunkCmd {
    #[arg(value_name = "DATASET_ID")]
    dataset_id: String,

    #[arg(long, default_value_t = 0)]
    row_start: i64,

    #[arg(long, default_value_t = 0)]
    col_start: i64,

    #[arg(long, default_value_t = 20)]
    n_rows: i64,

    #[arg(long, default_value_t = 20)]
    n_cols: i64,
}

#[derive(Args, Debug)]
struct BudgetArgs {
    #[arg(long, help = "Cell budget for the result grid")]
    max_cells: Option<i64>,

    #[arg(long, help = "Row limit for the result grid")]
    max_rows: Option<i64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
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
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    install_tracing_subscriber();

    match cli.command {
        Command::Serve(cmd) => {
            if let Some(host) = cmd.host {
                config.server.host = host;
            }
            if let Some(port) = cmd.port {
                config.server.port = port;
            }
            if let Err(err) = server::serve(config).await {
                eprintln!("server terminated: {err}");
                return Err(Box::new(err));
            }
        }
        Command::Upload { path, store } => {
            let bytes = fs::read(&path)?;
            let name = file_name(&path);
            if store {
                let stored = DatasetStore::open(&config)?.upload(&name, &bytes)?;
                emit(cli.format, &stored, || print_stored(&stored))?;
            } else {
                let upload = Workspace::open(&config)?.register_or_reuse(&name, &bytes)?;
                emit(cli.format, &upload, || print_upload(&upload))?;
            }
        }
        Command::Current => {
            let datasets = Workspace::open(&config)?.current()?;
            emit(cli.format, &datasets, || print_summaries(&datasets))?;
        }
        Command::Remove { dataset_id, all } => {
            let workspace = Workspace::open(&config)?;
            let slot_count = match dataset_id {
                Some(id) if !all => workspace.remove(&id)?,
                _ => {
                    workspace.remove_all()?;
                    0
                }
            };
            let report = serde_json::json!({ "ok": true, "slot_count": slot_count });
            emit(cli.format, &report, || println!("slots in use: {slot_count}"))?;
        }
        Command::Chunk(cmd) => {
            let request = ChunkRequest {
                row_start: cmd.row_start,
                col_start: cmd.col_start,
                n_rows: cmd.n_rows,
                n_cols: cmd.n_cols,
            };
            let chunk = Workspace::open(&config)?.chunk(&cmd.dataset_id, request)?;
            emit(cli.format, &chunk, || print_chunk(&chunk))?;
        }
        Command::Sql { query, budget } => {
            let service = query_service(&config)?;
            let grid = service
                .sql(SqlRequest {
                    query,
                    max_cells: budget.max_cells,
                    max_rows: budget.max_rows,
                })
                .await?;
            emit(cli.format, &grid, || print_grid(&grid))?;
        }
        Command::Ops { steps, budget } => {
            let text = match steps.strip_prefix('@') {
                Some(path) => fs::read_to_string(path)?,
                None => steps,
            };
            let service = query_service(&config)?;
            let grid = service
                .ops(OpsRequest {
                    steps: serde_json::from_str(&text)?,
                    max_cells: budget.max_cells,
                    max_rows: budget.max_rows,
                })
                .await?;
            emit(cli.format, &grid, || print_grid(&grid))?;
        }
    }

    Ok(())
}

fn query_service(config: &ServiceConfig) -> Result<QueryService, Box<dyn Error>> {
    let workspace = Arc::new(Workspace::open(config)?);
    Ok(QueryService::new(workspace, &config.query))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
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

fn print_upload(upload: &WorkspaceUpload) {
    let state = if upload.already_present {
        "already loaded"
    } else {
        "loaded"
    };
    println!(
        "{} {} ({} rows x {} cols), {state}; slots in use: {}",
        upload.dataset.dataset_id,
        upload.dataset.display_name,
        upload.dataset.n_rows,
        upload.dataset.n_cols,
        upload.slot_count
    );
}

fn print_stored(stored: &StoredDataset) {
    println!(
        "{} {} ({} rows x {} cols)",
        stored.dataset_id, stored.display_name, stored.n_rows, stored.n_cols
    );
    println!("columns: {}", stored.columns.join(", "));
}

fn print_summaries(datasets: &[DatasetSummary]) {
    if datasets.is_empty() {
        println!("no datasets loaded");
        return;
    }
    for (idx, dataset) in datasets.iter().enumerate() {
        println!(
            "t{}  {}  {}  {} rows x {} cols  {}",
            idx + 1,
            dataset.dataset_id,
            dataset.display_name,
            dataset.n_rows,
            dataset.n_cols,
            dataset.uploaded_at.as_deref().unwrap_or("-")
        );
    }
}

fn print_chunk(chunk: &Chunk) {
    println!(
        "rows {}..{} of {}, cols {}..{} of {}",
        chunk.row_start,
        chunk.row_start + chunk.n_rows,
        chunk.total_rows,
        chunk.col_start,
        chunk.col_start + chunk.n_cols,
        chunk.total_cols
    );
    print_table(&chunk.columns, &chunk.rows);
}

fn print_grid(grid: &ResultGrid) {
    print_table(&grid.columns, &grid.rows);
    if let Some(note) = &grid.note {
        println!("({note})");
    }
}

fn print_table(columns: &[String], rows: &[Vec<Cell>]) {
    println!("{}", columns.join("\t"));
    for row in rows {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        println!("{}", cells.join("\t"));
    }
}

fn cell_text(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Bool(v) => v.to_string(),
        Cell::Int(v) => v.to_string(),
        Cell::UInt(v) => v.to_string(),
        Cell::Float(v) => v.to_string(),
        Cell::Text(v) => v.clone(),
    }
}
