//! Repack pipeline
//!
//! Builds a fresh idx/dat pair from a list of (archive key, local file)
//! inputs. The build is deterministic for a given input order: keys are
//! normalized and deduplicated first, the string table and trie are built
//! in acceptance order, payloads are compressed in parallel and appended
//! to the data file as results arrive, and the index file is emitted last.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::datfat::DatWriter;
use crate::error::Result;
use crate::layout::{IndexLayout, CHANNEL_FAT, CHANNEL_META, CHANNEL_STRINGS, CHANNEL_TRIE};
use crate::meta::{MetaRecord, META_FLAG_COMPRESSED};
use crate::strings::StringTableBuilder;
use crate::trie::TrieBuilder;
use crate::workers::{compress_files, default_worker_count, CompressJob};

/// Inputs below this count skip worker auto-tuning.
const AUTO_TUNE_MIN_INPUTS: usize = 256;

/// Files sampled per auto-tune candidate.
const AUTO_TUNE_SAMPLE: usize = 128;

/// One file to pack
#[derive(Debug, Clone)]
pub struct RepackInput {
    /// Archive key as supplied; normalized during phase 1
    pub key: String,
    pub local: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RepackOptions {
    /// Compression level 1-9
    pub level: u32,
    /// Worker count; defaults to the logical CPU count
    pub jobs: Option<usize>,
    pub auto_tune: bool,
    /// Dispatch largest files first
    pub size_schedule: bool,
    /// Re-open the finished archive and compare every entry
    pub verify: bool,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            level: 6,
            jobs: None,
            auto_tune: false,
            size_schedule: false,
            verify: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RepackSummary {
    pub entries: usize,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
    /// Normalized keys dropped as duplicates, in input order
    pub duplicates_skipped: Vec<String>,
    /// Keys whose verify read-back mismatched
    pub verify_failures: Vec<String>,
}

/// Canonical archive-key form: backslash separators, lowercase.
pub fn normalize_key(key: &str) -> String {
    key.replace('/', "\\").to_lowercase()
}

/// Build a fresh archive at `out_idx`/`out_dat`.
pub fn repack(
    inputs: &[RepackInput],
    out_idx: &Path,
    out_dat: &Path,
    options: &RepackOptions,
) -> Result<RepackSummary> {
    let mut summary = RepackSummary::default();

    // Phase 1: normalize, dedupe, intern strings
    let mut seen = HashSet::new();
    let mut accepted: Vec<(String, PathBuf)> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let key = normalize_key(&input.key);
        if !seen.insert(key.clone()) {
            warn!("duplicate key after normalization, skipping: {}", key);
            summary.duplicates_skipped.push(key);
            continue;
        }
        accepted.push((key, input.local.clone()));
    }
    summary.entries = accepted.len();
    info!(
        "repacking {} entries ({} duplicates skipped)",
        accepted.len(),
        summary.duplicates_skipped.len()
    );

    let mut strings = StringTableBuilder::new();
    let name_indices: Vec<u32> = accepted
        .iter()
        .map(|(key, _)| strings.insert(key.as_bytes()))
        .collect();

    // Phase 2: trie in acceptance order
    let mut trie = TrieBuilder::new();
    for (meta_index, (key, _)) in accepted.iter().enumerate() {
        trie.insert(key.as_bytes(), name_indices[meta_index], meta_index as u32)?;
    }

    // Phase 3: parallel compression, streamed into the data file
    let workers = resolve_workers(&accepted, options)?;

    let mut jobs: Vec<CompressJob> = accepted
        .iter()
        .enumerate()
        .map(|(index, (_, local))| CompressJob {
            index,
            path: local.clone(),
        })
        .collect();
    if options.size_schedule {
        let sizes: Vec<u64> = jobs
            .iter()
            .map(|job| std::fs::metadata(&job.path).map(|m| m.len()))
            .collect::<std::io::Result<_>>()?;
        jobs.sort_by_key(|job| (std::cmp::Reverse(sizes[job.index]), job.index));
        debug!("size schedule enabled, largest of {} files first", jobs.len());
    }

    let mut writer = DatWriter::create(out_dat)?;
    let mut start_blocks = vec![0u32; accepted.len()];
    let mut wrapped_sizes = vec![0u32; accepted.len()];

    compress_files(jobs, options.level, workers, false, |done| {
        let (start_block, _) = writer.append(&done.wrapped)?;
        start_blocks[done.index] = start_block;
        wrapped_sizes[done.index] = done.wrapped.len() as u32;
        summary.raw_bytes += done.raw_size;
        summary.compressed_bytes += done.wrapped.len() as u64;
        Ok(())
    })?;
    let fat_entries = writer.finish()?;

    // Phase 4: meta and FAT buffers in original key order
    let mut meta_buf = Vec::with_capacity(accepted.len() * 16);
    for i in 0..accepted.len() {
        meta_buf.extend_from_slice(
            &MetaRecord {
                flags: META_FLAG_COMPRESSED,
                size: wrapped_sizes[i],
                start_block: start_blocks[i],
                extra: 0,
            }
            .to_bytes(),
        );
    }
    let mut fat_buf = Vec::with_capacity(fat_entries.len() * 4);
    for word in &fat_entries {
        fat_buf.extend_from_slice(&word.to_le_bytes());
    }

    // Phase 5: striped index emission
    let trie_buf = trie.into_bytes();
    let string_buf = strings.into_bytes();
    let layout = IndexLayout::for_build([
        trie_buf.len() as u32,
        string_buf.len() as u32,
        meta_buf.len() as u32,
        fat_buf.len() as u32,
    ]);

    {
        let mut idx = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(out_idx)?;
        idx.set_len(layout.file_len())?;
        idx.seek(SeekFrom::Start(0))?;
        idx.write_all(&layout.header_bytes())?;

        for (channel, buf) in [
            (CHANNEL_TRIE, &trie_buf),
            (CHANNEL_STRINGS, &string_buf),
            (CHANNEL_META, &meta_buf),
            (CHANNEL_FAT, &fat_buf),
        ] {
            layout.write_channel_bytes(&mut idx, channel, 0, buf)?;
        }
        idx.sync_all()?;
    }

    info!(
        "wrote {} ({} bytes) and {} ({} raw -> {} compressed)",
        out_idx.display(),
        layout.file_len(),
        out_dat.display(),
        summary.raw_bytes,
        summary.compressed_bytes
    );

    // Phase 6: optional verify; the archive stays committed either way
    if options.verify {
        verify_archive(out_idx, out_dat, &accepted, &mut summary)?;
    }

    Ok(summary)
}

fn verify_archive(
    out_idx: &Path,
    out_dat: &Path,
    accepted: &[(String, PathBuf)],
    summary: &mut RepackSummary,
) -> Result<()> {
    let mut archive = Archive::open(out_idx, Some(out_dat))?;
    for (key, local) in accepted {
        let ok = match archive.find_meta(key.as_bytes())? {
            Some(resolved) => match archive.read_file_bytes(resolved.meta_index) {
                Ok(stored) => stored == std::fs::read(local)?,
                Err(e) => {
                    warn!("verify read-back failed for {}: {}", key, e);
                    false
                }
            },
            None => false,
        };
        if !ok {
            warn!("verify mismatch: {}", key);
            summary.verify_failures.push(key.clone());
        }
    }
    if summary.verify_failures.is_empty() {
        info!("verify passed for {} entries", accepted.len());
    }
    Ok(())
}

fn resolve_workers(accepted: &[(String, PathBuf)], options: &RepackOptions) -> Result<usize> {
    let requested = options.jobs.unwrap_or_else(default_worker_count).max(1);
    if !options.auto_tune || accepted.len() < AUTO_TUNE_MIN_INPUTS {
        return Ok(requested);
    }

    let cores = default_worker_count();
    let mut candidates = vec![1, (cores / 2).max(1), cores, cores * 2, requested];
    candidates.sort_unstable();
    candidates.dedup();

    let mut best = (requested, f64::MAX);
    for &candidate in &candidates {
        let jobs: Vec<CompressJob> = accepted
            .iter()
            .take(AUTO_TUNE_SAMPLE)
            .enumerate()
            .map(|(index, (_, local))| CompressJob {
                index,
                path: local.clone(),
            })
            .collect();
        let started = Instant::now();
        compress_files(jobs, options.level, candidate, false, |_| Ok(()))?;
        let elapsed = started.elapsed().as_secs_f64();
        debug!("auto-tune: {} workers -> {:.3}s", candidate, elapsed);
        if elapsed < best.1 {
            best = (candidate, elapsed);
        }
    }

    info!("auto-tune selected {} workers", best.0);
    Ok(best.0)
}
