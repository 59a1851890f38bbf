use std::path::PathBuf;
use std::process::ExitCode;

use backfill_runner::RunnerConfig;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "backfill")]
#[command(about = "Idempotent field backfills for the marketplace document store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Documents fetched per page (defaults to BACKFILL_PAGE_SIZE or 200).
    #[arg(long, global = true)]
    page_size: Option<usize>,

    /// Plan and log patches without writing them.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Run against a JSON snapshot in memory instead of Firestore.
    #[arg(long, global = true, value_name = "JSON")]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy owner name and location from users into products.
    Products,
    /// Derive chat participants from buyerId and farmerId.
    Chats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = backfill_cli::init_tracing("info") {
        eprintln!("{err:#}");
    }

    let mut config = RunnerConfig::from_env();
    if let Some(page_size) = cli.page_size {
        config.page_size = page_size;
    }
    config.dry_run |= cli.dry_run;

    let job = match cli.command {
        Commands::Products => "products",
        Commands::Chats => "chats",
    };
    backfill_cli::exit_with(backfill_cli::execute(job, config, cli.fixture.as_deref()).await)
}
