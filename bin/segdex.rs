use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use segdex::index::{list_commits, SegmentInfos};
use segdex::{
    Directory, DirectoryReader, FsDirectory, IndexWriter, MergeSchedulerConfig, OpenMode,
    WriterConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "segdex")]
#[command(about = "Inspect and maintain segment indexes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every commit point, oldest first
    Commits {
        /// Index directory
        dir: PathBuf,
    },
    /// Verify that the newest commit and all its segments load cleanly
    Check {
        dir: PathBuf,
    },
    /// Merge the index down to at most N segments and commit
    ForceMerge {
        dir: PathBuf,

        #[arg(long, default_value = "1")]
        max_segments: usize,
    },
    /// Print the newest commit point
    Stats {
        dir: PathBuf,

        /// Emit the full commit point as JSON
        #[arg(long)]
        json: bool,
    },
}

fn open_dir(path: &PathBuf) -> Result<Arc<dyn Directory>> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let dir = FsDirectory::open(path)
        .with_context(|| format!("opening index directory {}", path.display()))?;
    Ok(Arc::new(dir))
}

fn commits(dir: Arc<dyn Directory>) -> Result<()> {
    let commits = list_commits(dir.as_ref())?;
    if commits.is_empty() {
        bail!("no commit points found");
    }
    println!("{:>10}  {:<16} {:>8} {:>12}  user data", "generation", "file", "segments", "docs");
    for commit in &commits {
        let infos = SegmentInfos::read(dir.as_ref(), commit.segments_file_name())?;
        println!(
            "{:>10}  {:<16} {:>8} {:>12}  {:?}",
            commit.generation(),
            commit.segments_file_name(),
            commit.segment_count(),
            infos.total_live_docs(),
            commit.user_data()
        );
    }
    Ok(())
}

fn check(dir: Arc<dyn Directory>) -> Result<()> {
    let infos = SegmentInfos::read_latest(dir.as_ref())?;
    let mut missing = Vec::new();
    for file in infos.files(true) {
        if !dir.file_exists(&file) {
            missing.push(file);
        }
    }
    if !missing.is_empty() {
        bail!("commit {} references missing files: {:?}", infos.generation, missing);
    }

    let reader = DirectoryReader::open(dir)?;
    for leaf in reader.leaves() {
        println!(
            "  {:<8} docs={:<10} deleted={:<10} size={}",
            leaf.name(),
            leaf.max_doc(),
            leaf.num_deleted_docs(),
            leaf.info().size_in_bytes
        );
    }
    println!(
        "OK generation {}: {} segments, {} live of {} docs",
        reader.generation(),
        reader.leaves().len(),
        reader.num_docs(),
        reader.max_doc()
    );
    reader.close()?;
    Ok(())
}

fn force_merge(dir: Arc<dyn Directory>, max_segments: usize) -> Result<()> {
    let config = WriterConfig::new()
        .with_open_mode(OpenMode::Append)
        .with_merge_scheduler(MergeSchedulerConfig::Serial);
    let writer = IndexWriter::open(dir, config)?;
    let before = writer.segment_count();
    if let Err(e) = writer.force_merge(max_segments) {
        warn!(error = %e, "force merge failed; rolling back");
        writer.rollback()?;
        return Err(e.into());
    }
    writer.commit()?;
    info!(before, after = writer.segment_count(), "force merge committed");
    println!("{} -> {} segments", before, writer.segment_count());
    writer.close()?;
    Ok(())
}

fn stats(dir: Arc<dyn Directory>, json: bool) -> Result<()> {
    let infos = SegmentInfos::read_latest(dir.as_ref())?;
    if json {
        println!("{}", infos.to_json()?);
        return Ok(());
    }
    println!("generation:   {}", infos.generation);
    println!("version:      {}", infos.version);
    println!("segments:     {}", infos.len());
    println!("max docs:     {}", infos.total_max_doc());
    println!("live docs:    {}", infos.total_live_docs());
    println!("size (bytes): {}", infos.total_size_bytes());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Commits { dir } => commits(open_dir(&dir)?),
        Command::Check { dir } => check(open_dir(&dir)?),
        Command::ForceMerge { dir, max_segments } => force_merge(open_dir(&dir)?, max_segments),
        Command::Stats { dir, json } => stats(open_dir(&dir)?, json),
    }
}
