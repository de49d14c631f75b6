//! `repack` command: gather inputs and drive the repack pipeline

use clap::Args;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use abcd_storage::{repack, RepackInput, RepackOptions};

#[derive(Args)]
pub struct RepackArgs {
    /// Directory tree to pack; keys are paths relative to it
    #[arg(long)]
    pub in_dir: Option<PathBuf>,

    /// Explicit input list: one `archive_key` or `archive_key=local_path`
    /// per line. Bare keys resolve against --in-dir.
    #[arg(long)]
    pub file_list: Option<PathBuf>,

    #[arg(long)]
    pub out_idx: PathBuf,

    #[arg(long)]
    pub out_dat: PathBuf,

    /// Compression level 1-9
    #[arg(long, default_value_t = 6)]
    pub compress_level: u32,

    /// Worker threads; defaults to the logical CPU count
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Benchmark a sample at several worker counts and keep the fastest
    #[arg(long)]
    pub auto_tune_jobs: bool,

    /// Compress largest files first
    #[arg(long)]
    pub size_schedule: bool,

    /// Re-open the finished archive and compare every entry
    #[arg(long)]
    pub verify: bool,
}

/// Pre-order walk with siblings in case-sensitive byte order.
fn walk_inputs(root: &Path) -> Result<Vec<RepackInput>, Box<dyn Error>> {
    let mut inputs = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root)?;
        let key = rel
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "\\");
        inputs.push(RepackInput {
            key,
            local: entry.path().to_path_buf(),
        });
    }
    Ok(inputs)
}

fn list_inputs(list: &Path, in_dir: Option<&Path>) -> Result<Vec<RepackInput>, Box<dyn Error>> {
    let mut inputs = Vec::new();
    for line in fs::read_to_string(list)?.lines() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let (key, local) = match line.split_once('=') {
            Some((key, local)) => (key.to_string(), PathBuf::from(local)),
            None => {
                let rel: PathBuf = line.split('\\').collect();
                let local = match in_dir {
                    Some(dir) => dir.join(rel),
                    None => rel,
                };
                (line.to_string(), local)
            }
        };
        inputs.push(RepackInput { key, local });
    }
    Ok(inputs)
}

pub fn handle(args: RepackArgs) -> Result<(), Box<dyn Error>> {
    if !(1..=9).contains(&args.compress_level) {
        return Err("compress level must be between 1 and 9".into());
    }

    let inputs = match (&args.file_list, &args.in_dir) {
        (Some(list), in_dir) => list_inputs(list, in_dir.as_deref())?,
        (None, Some(dir)) => walk_inputs(dir)?,
        (None, None) => return Err("either --in-dir or --file-list is required".into()),
    };
    info!("{} input files", inputs.len());

    let options = RepackOptions {
        level: args.compress_level,
        jobs: args.jobs,
        auto_tune: args.auto_tune_jobs,
        size_schedule: args.size_schedule,
        verify: args.verify,
    };
    let summary = repack(&inputs, &args.out_idx, &args.out_dat, &options)?;

    println!(
        "packed {} entries: {} raw bytes -> {} compressed",
        summary.entries, summary.raw_bytes, summary.compressed_bytes
    );
    if !summary.duplicates_skipped.is_empty() {
        println!("{} duplicate keys skipped", summary.duplicates_skipped.len());
    }
    if !summary.verify_failures.is_empty() {
        return Err(format!(
            "verification failed for {} entries",
            summary.verify_failures.len()
        )
        .into());
    }
    Ok(())
}
