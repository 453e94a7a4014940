//! atlaslog-inspect
//!
//! Offline inspection of commit log segment files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use atlas_commitlog::wal::{list_segments, ApplyError, RecoveryEngine, ReplayTarget, SegmentDescriptor, DEFAULT_PREFIX};
use atlas_commitlog::{ReplayPosition, Result};

/// Commit log inspection tool
#[derive(Parser, Debug)]
#[command(name = "atlaslog-inspect")]
#[command(about = "Inspect commit log segment files")]
#[command(version)]
struct Args {
    /// Segment file name prefix
    #[arg(short, long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List segment files in a directory, oldest first
    List {
        /// Log directory
        dir: PathBuf,
    },

    /// Print every record of the given segment files
    Dump {
        /// Segment files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Replay a directory without applying anything and report
    Verify {
        /// Log directory
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let outcome = match &args.command {
        Command::List { dir } => list(dir, &args.prefix),
        Command::Dump { files } => dump(files, &args.prefix),
        Command::Verify { dir } => verify(dir, &args.prefix),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn list(dir: &Path, prefix: &str) -> Result<()> {
    let segments = list_segments(dir, prefix)?;
    if segments.is_empty() {
        println!("no segments in {}", dir.display());
        return Ok(());
    }

    println!("{:<24} {:>8} {:>12}  file", "id", "version", "bytes");
    for (descriptor, path) in segments {
        let len = std::fs::metadata(&path)?.len();
        println!(
            "{:<24} {:>8} {:>12}  {}",
            descriptor.id,
            descriptor.version,
            len,
            path.display()
        );
    }
    Ok(())
}

/// Prints records as they are replayed
struct Printer;

impl ReplayTarget for Printer {
    fn apply(&mut self, position: ReplayPosition, payload: Bytes) -> std::result::Result<(), ApplyError> {
        let preview: String = payload.iter().take(16).map(|b| format!("{:02x}", b)).collect();
        println!("  {:>10}  {:>8} bytes  {}", position.offset, payload.len(), preview);
        Ok(())
    }
}

fn dump(files: &[PathBuf], prefix: &str) -> Result<()> {
    let engine = RecoveryEngine::new(prefix);
    let mut last = None;

    for path in files {
        let descriptor = SegmentDescriptor::from_path(prefix, path)?;
        println!("{} (id {}, version {})", path.display(), descriptor.id, descriptor.version);
        let file = engine.recover_file(descriptor, path, &mut Printer, &mut last)?;
        println!(
            "  {} records, stopped at offset {} ({:?})",
            file.records_replayed, file.end_offset, file.tail
        );
    }
    Ok(())
}

/// Counts records without keeping them
#[derive(Default)]
struct Counter {
    bytes: u64,
}

impl ReplayTarget for Counter {
    fn apply(&mut self, _position: ReplayPosition, payload: Bytes) -> std::result::Result<(), ApplyError> {
        self.bytes += payload.len() as u64;
        Ok(())
    }
}

fn verify(dir: &Path, prefix: &str) -> Result<()> {
    let files: Vec<PathBuf> = list_segments(dir, prefix)?.into_iter().map(|(_, path)| path).collect();

    let mut counter = Counter::default();
    let result = RecoveryEngine::new(prefix).recover(&files, &mut counter)?;

    println!("segments:          {}", result.files_recovered);
    println!("records:           {}", result.records_replayed);
    println!("payload bytes:     {}", counter.bytes);
    println!("incomplete tails:  {}", result.incomplete_files);
    for file in result.files.iter().filter(|f| f.tail.is_incomplete()) {
        println!("  {} at offset {} ({:?})", file.path.display(), file.end_offset, file.tail);
    }
    match result.last_position {
        Some(position) => println!("last position:     {}", position),
        None => println!("last position:     none"),
    }
    Ok(())
}
