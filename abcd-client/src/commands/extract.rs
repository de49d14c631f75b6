//! `extract` subcommands: traversals and payload extraction

use clap::Subcommand;
use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use abcd_storage::{normalize_key, Archive};

use crate::report::TsvReport;

#[derive(Subcommand)]
pub enum ExtractCommands {
    /// Print archive geometry and entry counts
    Info {
        #[arg(long)]
        idx: PathBuf,
        /// Data file; enables payload totals when present
        #[arg(long)]
        dat: Option<PathBuf>,
    },

    /// List every directory-trie entry
    ListDt {
        #[arg(long)]
        idx: PathBuf,
        /// Keep only entries with a stored payload
        #[arg(long)]
        only_files: bool,
    },

    /// List string records no trie node references
    ListOrphans {
        #[arg(long)]
        idx: PathBuf,
    },

    /// Compare the archive contents against a known-complete path list
    Compare {
        #[arg(long)]
        idx: PathBuf,
        /// One archive path per line
        #[arg(long)]
        full_list: PathBuf,
        /// Write the per-path statuses as TSV
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Extract every file entry into a directory
    ExtractAll {
        #[arg(long)]
        idx: PathBuf,
        #[arg(long)]
        dat: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Tally per-file failures instead of stopping at the first
        #[arg(long)]
        keep_going: bool,
        /// Leave already-extracted files alone
        #[arg(long)]
        skip_existing: bool,
    },

    /// Extract the entries named in a list file
    ExtractList {
        #[arg(long)]
        idx: PathBuf,
        #[arg(long)]
        dat: PathBuf,
        /// One archive path per line
        #[arg(long)]
        full_list: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        keep_going: bool,
        #[arg(long)]
        skip_existing: bool,
        /// Write per-path outcomes as TSV
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

pub fn handle(cmd: ExtractCommands) -> Result<(), Box<dyn Error>> {
    match cmd {
        ExtractCommands::Info { idx, dat } => info_cmd(&idx, dat.as_deref()),
        ExtractCommands::ListDt { idx, only_files } => list_dt(&idx, only_files),
        ExtractCommands::ListOrphans { idx } => list_orphans(&idx),
        ExtractCommands::Compare {
            idx,
            full_list,
            report,
        } => compare(&idx, &full_list, report.as_deref()),
        ExtractCommands::ExtractAll {
            idx,
            dat,
            out,
            keep_going,
            skip_existing,
        } => extract_all(&idx, &dat, &out, keep_going, skip_existing),
        ExtractCommands::ExtractList {
            idx,
            dat,
            full_list,
            out,
            keep_going,
            skip_existing,
            report,
        } => extract_list(
            &idx,
            &dat,
            &full_list,
            &out,
            keep_going,
            skip_existing,
            report.as_deref(),
        ),
    }
}

/// A trie entry that addresses a stored payload
struct FileEntry {
    meta_index: u32,
    path: String,
}

fn file_entries(archive: &mut Archive) -> Result<Vec<FileEntry>, Box<dyn Error>> {
    let meta_count = archive.meta_count();
    let mut out = Vec::new();
    for entry in archive.entries()? {
        if entry.meta_index >= meta_count {
            continue;
        }
        let has_payload = archive
            .meta_record(entry.meta_index)
            .is_some_and(|meta| meta.has_payload());
        if has_payload {
            out.push(FileEntry {
                meta_index: entry.meta_index,
                path: String::from_utf8_lossy(&entry.path).into_owned(),
            });
        }
    }
    Ok(out)
}

/// Chain heads of allocated string records no node points at.
fn orphan_strings(archive: &mut Archive) -> Result<Vec<(u32, String)>, Box<dyn Error>> {
    let mut referenced = HashSet::new();
    for node_index in 0..archive.trie().len() as u32 {
        let name_index = match archive.node(node_index) {
            Some(node) => node.name_index(),
            None => continue,
        };
        archive.strings_mut().mark_chain(name_index, &mut referenced)?;
    }

    let mut orphans = Vec::new();
    let record_count = archive.strings_mut().record_count();
    for record in 0..record_count {
        if referenced.contains(&record) || !archive.strings_mut().is_allocated(record)? {
            continue;
        }
        let decoded = archive.strings_mut().lookup(record)?;
        orphans.push((record, String::from_utf8_lossy(&decoded).into_owned()));
        // Swallow the chain so its tail records are not re-listed as heads
        archive.strings_mut().mark_chain(record, &mut referenced)?;
    }
    Ok(orphans)
}

fn info_cmd(idx: &Path, dat: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let mut archive = Archive::open(idx, dat)?;
    let layout = archive.layout().clone();

    println!("Index file:       {}", idx.display());
    println!("Page size:        {}", layout.page_size());
    println!("Stripes:          {}", layout.stripes());
    for (c, label) in ["trie", "strings", "meta", "fat"].iter().enumerate() {
        let channel = layout.channel(c);
        println!(
            "Channel {c} ({label:7}): {} bytes, {} pages/stripe",
            channel.size_bytes, channel.pages_per_stripe
        );
    }

    println!("Trie nodes:       {}", archive.trie().len());
    println!("Meta records:     {}", archive.meta_count());
    println!("FAT entries:      {}", archive.fat().len());

    let files = file_entries(&mut archive)?;
    let wrapped_total: u64 = files
        .iter()
        .filter_map(|f| archive.meta_record(f.meta_index))
        .map(|meta| meta.size as u64)
        .sum();
    println!("File entries:     {}", files.len());
    println!("Wrapped bytes:    {wrapped_total}");

    if dat.is_some() {
        let mut raw_total = 0u64;
        for file in &files {
            raw_total += archive.read_file_bytes(file.meta_index)?.len() as u64;
        }
        println!("Raw bytes:        {raw_total}");
    }
    Ok(())
}

fn list_dt(idx: &Path, only_files: bool) -> Result<(), Box<dyn Error>> {
    let mut archive = Archive::open(idx, None)?;
    if only_files {
        for entry in file_entries(&mut archive)? {
            println!("{}", entry.path);
        }
    } else {
        for entry in archive.entries()? {
            println!("{}", String::from_utf8_lossy(&entry.path));
        }
    }
    Ok(())
}

fn list_orphans(idx: &Path) -> Result<(), Box<dyn Error>> {
    let mut archive = Archive::open(idx, None)?;
    let orphans = orphan_strings(&mut archive)?;
    for (record, path) in &orphans {
        println!("{record}\t{path}");
    }
    info!("{} orphan string chains", orphans.len());
    Ok(())
}

fn read_list(path: &Path) -> Result<Vec<String>, Box<dyn Error>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

fn compare(idx: &Path, full_list: &Path, report: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let mut archive = Archive::open(idx, None)?;

    let listed = read_list(full_list)?;
    let listed_norm: Vec<(String, String)> = listed
        .iter()
        .map(|raw| (raw.clone(), normalize_key(raw)))
        .collect();
    let listed_set: HashSet<&str> = listed_norm.iter().map(|(_, n)| n.as_str()).collect();

    let files = file_entries(&mut archive)?;
    let file_set: HashSet<String> = files.iter().map(|f| normalize_key(&f.path)).collect();
    let orphan_set: HashSet<String> = orphan_strings(&mut archive)?
        .into_iter()
        .map(|(_, s)| normalize_key(&s))
        .collect();

    let mut rows: Vec<(&str, String)> = Vec::new();
    for (raw, norm) in &listed_norm {
        let status = if file_set.contains(norm.as_str()) {
            "ok"
        } else if orphan_set.contains(norm.as_str()) {
            "orphan"
        } else {
            "absent"
        };
        rows.push((status, raw.clone()));
    }
    for file in &files {
        if !listed_set.contains(normalize_key(&file.path).as_str()) {
            rows.push(("dt_only", file.path.clone()));
        }
    }

    for (status, path) in &rows {
        println!("{status}\t{path}");
    }
    if let Some(report_path) = report {
        let mut tsv = TsvReport::create(report_path)?;
        for (status, path) in &rows {
            tsv.row(status, path)?;
        }
        tsv.finish()?;
        info!("wrote report: {}", report_path.display());
    }
    Ok(())
}

/// Turn an archive key into a filesystem path under `out`, dropping
/// empty, current and parent components.
fn out_path(out: &Path, key: &str) -> PathBuf {
    let mut path = out.to_path_buf();
    for component in key.split('\\').flat_map(|part| part.split('/')) {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }
        path.push(component);
    }
    path
}

enum ExtractOutcome {
    Written,
    Skipped,
}

fn extract_one(
    archive: &mut Archive,
    meta_index: u32,
    target: &Path,
    skip_existing: bool,
) -> Result<ExtractOutcome, Box<dyn Error>> {
    if skip_existing && target.exists() {
        return Ok(ExtractOutcome::Skipped);
    }
    let raw = archive.read_file_bytes(meta_index)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, raw)?;
    Ok(ExtractOutcome::Written)
}

fn extract_all(
    idx: &Path,
    dat: &Path,
    out: &Path,
    keep_going: bool,
    skip_existing: bool,
) -> Result<(), Box<dyn Error>> {
    let mut archive = Archive::open(idx, Some(dat))?;
    let files = file_entries(&mut archive)?;

    let mut written = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for file in &files {
        let target = out_path(out, &file.path);
        match extract_one(&mut archive, file.meta_index, &target, skip_existing) {
            Ok(ExtractOutcome::Written) => written += 1,
            Ok(ExtractOutcome::Skipped) => skipped += 1,
            Err(e) if keep_going => {
                warn!("failed to extract {}: {}", file.path, e);
                failed += 1;
            }
            Err(e) => return Err(format!("{}: {e}", file.path).into()),
        }
    }

    info!("extracted {written} files, {skipped} skipped, {failed} failed");
    if failed > 0 {
        return Err(format!("{failed} of {} files failed to extract", files.len()).into());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn extract_list(
    idx: &Path,
    dat: &Path,
    full_list: &Path,
    out: &Path,
    keep_going: bool,
    skip_existing: bool,
    report: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let mut archive = Archive::open(idx, Some(dat))?;
    let listed = read_list(full_list)?;

    let mut tsv = match report {
        Some(path) => Some(TsvReport::create(path)?),
        None => None,
    };

    let mut written = 0usize;
    let mut skipped = 0usize;
    let mut missing = 0usize;
    let mut failed = 0usize;

    for raw in &listed {
        let key = normalize_key(raw);
        let resolved = archive.find_meta(key.as_bytes())?;
        let meta_index = resolved
            .filter(|r| {
                archive
                    .meta_record(r.meta_index)
                    .is_some_and(|meta| meta.has_payload())
            })
            .map(|r| r.meta_index);

        let Some(meta_index) = meta_index else {
            warn!("not in archive: {raw}");
            missing += 1;
            if let Some(tsv) = tsv.as_mut() {
                tsv.row("missing", raw)?;
            }
            continue;
        };

        let target = out_path(out, &key);
        match extract_one(&mut archive, meta_index, &target, skip_existing) {
            Ok(outcome) => {
                match outcome {
                    ExtractOutcome::Written => written += 1,
                    ExtractOutcome::Skipped => skipped += 1,
                }
                if let Some(tsv) = tsv.as_mut() {
                    tsv.row("ok", raw)?;
                }
            }
            Err(e) => {
                if let Some(tsv) = tsv.as_mut() {
                    tsv.row(&format!("failed\t{e}"), raw)?;
                }
                if !keep_going {
                    return Err(format!("{raw}: {e}").into());
                }
                warn!("failed to extract {raw}: {e}");
                failed += 1;
            }
        }
    }

    if let Some(tsv) = tsv {
        tsv.finish()?;
    }
    info!("extracted {written}, {skipped} skipped, {missing} missing, {failed} failed");
    if failed > 0 || missing > 0 {
        return Err(format!("{missing} missing and {failed} failed entries").into());
    }
    Ok(())
}
