//! Command-line tools for LiTL trace files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

mod merge;
mod split;

#[derive(Parser)]
#[command(name = "litl-cli", version, about = "Merge, split, and inspect LiTL trace files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Concatenate trace files into a single archive
    Merge {
        /// Archive file to create
        #[arg(short, long)]
        output: PathBuf,
        /// Trace files to merge, in order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Extract every trace embedded in an archive
    Split {
        /// Directory receiving the extracted traces
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Archive produced by `merge`
        archive: PathBuf,
    },
    /// Print a trace file's header and per-thread event counts
    Info {
        trace: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Merge { output, inputs } => merge::merge(&output, &inputs),
        Command::Split { output_dir, archive } => split::split(&archive, &output_dir),
        Command::Info { trace } => info(&trace),
    }
}

fn info(path: &Path) -> Result<()> {
    let mut reader = litl::TraceReader::open(path)?;
    println!("trace:       {}", path.display());
    println!("version:     {}", reader.version());
    println!("system:      {}", reader.sysinfo());
    println!("buffer size: {} bytes", reader.buffer_size());
    println!("threads:     {}", reader.nb_threads());

    let mut counts: BTreeMap<litl::Tid, u64> = BTreeMap::new();
    while let Some(event) = reader.next_event()? {
        *counts.entry(event.tid).or_default() += 1;
    }
    for (tid, count) in &counts {
        println!("  tid {tid}: {count} events");
    }
    Ok(())
}
