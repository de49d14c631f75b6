//! `patch` command: map archive keys to replacement files and apply

use clap::Args;
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use abcd_storage::{patch, PatchOptions, PatchRequest};

#[derive(Args)]
pub struct PatchArgs {
    #[arg(long)]
    pub idx: PathBuf,

    #[arg(long)]
    pub dat: PathBuf,

    /// Replacement as `archive_key=local_path`; repeatable
    #[arg(long = "file", value_name = "KEY=PATH")]
    pub files: Vec<String>,

    /// Patch every file under this directory using its relative path as key
    #[arg(long)]
    pub patch_dir: Option<PathBuf>,

    /// Compression level 1-9
    #[arg(long, default_value_t = 6)]
    pub compress_level: u32,

    /// Worker threads; defaults to the logical CPU count
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Resolve and print the plan without writing
    #[arg(long)]
    pub dry_run: bool,
}

fn dir_requests(dir: &Path) -> Result<Vec<PatchRequest>, Box<dyn Error>> {
    let mut requests = Vec::new();
    for entry in WalkDir::new(dir)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir)?;
        requests.push(PatchRequest {
            key: rel
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "\\"),
            local: entry.path().to_path_buf(),
        });
    }
    Ok(requests)
}

pub fn handle(args: PatchArgs) -> Result<(), Box<dyn Error>> {
    if !(1..=9).contains(&args.compress_level) {
        return Err("compress level must be between 1 and 9".into());
    }

    let mut requests = Vec::new();
    for mapping in &args.files {
        let Some((key, local)) = mapping.split_once('=') else {
            return Err(format!("--file expects KEY=PATH, got {mapping:?}").into());
        };
        requests.push(PatchRequest {
            key: key.to_string(),
            local: PathBuf::from(local),
        });
    }
    if let Some(dir) = &args.patch_dir {
        requests.extend(dir_requests(dir)?);
    }
    if requests.is_empty() {
        return Err("nothing to patch: pass --file or --patch-dir".into());
    }

    let options = PatchOptions {
        level: args.compress_level,
        jobs: args.jobs,
        dry_run: args.dry_run,
    };
    let summary = patch(&args.idx, &args.dat, &requests, &options)?;

    if summary.dry_run {
        info!("dry run, no files were modified");
        return Ok(());
    }
    println!(
        "patched {} entries ({} unresolved, {} duplicates skipped)",
        summary.patched.len(),
        summary.skipped_unresolved.len(),
        summary.skipped_duplicates.len()
    );
    Ok(())
}
