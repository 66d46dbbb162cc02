//! `ptctl`: a thin operational CLI. Initializes logging, then
//! dispatches to one-shot subcommands using `clap`'s derive API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use persistit_core::config::Config;
use persistit_core::database::Database;
use persistit_core::diagnostics;

#[derive(Parser)]
#[command(name = "ptctl", about = "Operate a persistit-core volume")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Opens a volume (creating it if absent) and prints its state.
    Open {
        volume: PathBuf,
        #[arg(long, default_value_t = 16384)]
        page_size: usize,
    },
    /// Forces a checkpoint and reports its timestamp.
    Checkpoint { journal_dir: PathBuf },
    /// Replays a journal directory's recovery plan and reports a summary.
    Recover { journal_dir: PathBuf },
}

fn main() {
    init_log();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Open { volume, page_size } => run_open(&volume, page_size),
        Command::Checkpoint { journal_dir } => run_checkpoint(&journal_dir),
        Command::Recover { journal_dir } => run_recover(&journal_dir),
    };

    if let Err(e) = result {
        eprintln!("ptctl: {}", e);
        std::process::exit(1);
    }
}

fn run_open(volume: &PathBuf, page_size: usize) -> persistit_core::PtResult<()> {
    let journal_dir = volume.with_extension("journal");
    let db = Database::open(Config::default(), &journal_dir)?;
    let opened = db.open_volume(volume, page_size)?;
    println!("opened volume id={} at {:?}", opened.volume_id, volume);
    println!("{}", diagnostics::describe_database(&db));
    Ok(())
}

fn run_checkpoint(journal_dir: &PathBuf) -> persistit_core::PtResult<()> {
    let db = Database::open(Config::default(), journal_dir)?;
    let ts = db.journal.checkpoint(1, Vec::new())?;
    println!("checkpoint written at journal offset {}", ts);
    Ok(())
}

fn run_recover(journal_dir: &PathBuf) -> persistit_core::PtResult<()> {
    let db = Database::open(Config::default(), journal_dir)?;
    let plan = persistit_core::journal::recovery::build_recovery_plan(&db.journal)?;
    println!("recovery plan:");
    println!("  committed transactions: {}", plan.committed.len());
    println!("  uncommitted (rolled back): {}", plan.uncommitted_starts.len());
    println!("  highest timestamp observed: {}", plan.highest_timestamp);
    Ok(())
}

fn init_log() {
    use env_logger::Builder;
    use std::io::Write;

    let mut builder = Builder::from_default_env();
    builder
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(buf, "[{} - {}] {}", record.level(), record.target(), record.args())
        })
        .try_init()
        .ok();
}
