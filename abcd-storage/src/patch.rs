//! In-place patch pipeline
//!
//! Replaces the payloads of selected entries in an existing archive. The
//! data file only ever grows: new payloads are appended as fresh block
//! chains, the FAT tail and the touched meta slots are rewritten, and the
//! old chains are left behind as dead blocks. Any failure after the first
//! write unwinds to the pre-patch state.

use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::archive::Archive;
use crate::datfat::{BLOCK_SIZE, FAT_END_OF_CHAIN, FLUSH_THRESHOLD};
use crate::error::{Error, Result};
use crate::layout::{IndexLayout, CHANNEL_FAT, CHANNEL_META};
use crate::meta::{MetaRecord, META_FLAG_COMPRESSED, META_RECORD_SIZE};
use crate::workers::{compress_files, default_worker_count, CompressJob};

/// One requested replacement
#[derive(Debug, Clone)]
pub struct PatchRequest {
    /// Archive key; slashes are normalized, case is resolved against the trie
    pub key: String,
    pub local: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub level: u32,
    pub jobs: Option<usize>,
    /// Resolve and report only; no writes
    pub dry_run: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            level: 6,
            jobs: None,
            dry_run: false,
        }
    }
}

/// Progress of a patch run. Transitions are strictly forward; the last
/// three states unwind to `RolledBack` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PatchState {
    Resolved,
    Prepared,
    DatAppended,
    IdxUpdated,
    Verified,
}

#[derive(Debug, Default)]
pub struct PatchSummary {
    /// Keys patched and verified
    pub patched: Vec<String>,
    /// Keys that resolved to no entry
    pub skipped_unresolved: Vec<String>,
    /// Keys dropped because an earlier request hit the same meta record
    pub skipped_duplicates: Vec<String>,
    pub dry_run: bool,
}

struct PatchTarget {
    key: String,
    local: PathBuf,
    meta_index: u32,
    old_meta: MetaRecord,
}

struct PreparedPayload {
    wrapped: Vec<u8>,
    raw_size: u64,
    raw_sha1: [u8; 20],
    start_block: u32,
}

/// Apply `requests` to the archive at `idx_path`/`dat_path`.
pub fn patch(
    idx_path: &Path,
    dat_path: &Path,
    requests: &[PatchRequest],
    options: &PatchOptions,
) -> Result<PatchSummary> {
    run_patch(idx_path, dat_path, requests, options, None)
}

fn run_patch(
    idx_path: &Path,
    dat_path: &Path,
    requests: &[PatchRequest],
    options: &PatchOptions,
    tamper_before_verify: Option<&dyn Fn()>,
) -> Result<PatchSummary> {
    let mut summary = PatchSummary {
        dry_run: options.dry_run,
        ..Default::default()
    };

    // Phase 1: resolve keys against the trie
    let mut archive = Archive::open(idx_path, Some(dat_path))?;
    let mut claimed = HashSet::new();
    let mut targets: Vec<PatchTarget> = Vec::with_capacity(requests.len());

    for request in requests {
        let key = request.key.replace('/', "\\");
        let resolved = archive.find_meta(key.as_bytes())?;
        let Some(resolved) = resolved else {
            warn!("no archive entry for {}, skipping", key);
            summary.skipped_unresolved.push(key);
            continue;
        };
        let Some(old_meta) = archive.meta_record(resolved.meta_index).copied() else {
            warn!(
                "node for {} points at meta record {} beyond the table, skipping",
                key, resolved.meta_index
            );
            summary.skipped_unresolved.push(key);
            continue;
        };
        if !claimed.insert(resolved.meta_index) {
            warn!(
                "{} resolves to already-claimed meta record {}, skipping",
                key, resolved.meta_index
            );
            summary.skipped_duplicates.push(key);
            continue;
        }
        targets.push(PatchTarget {
            key,
            local: request.local.clone(),
            meta_index: resolved.meta_index,
            old_meta,
        });
    }

    let mut state = PatchState::Resolved;
    debug!("{:?}: {} targets", state, targets.len());

    if options.dry_run {
        for target in &targets {
            info!(
                "would patch {} (meta {}) from {}",
                target.key,
                target.meta_index,
                target.local.display()
            );
        }
        return Ok(summary);
    }
    if targets.is_empty() {
        info!("nothing to patch");
        return Ok(summary);
    }

    // Preflight: the DAT, FAT and index header must agree before any write
    let original_dat_len = std::fs::metadata(dat_path)?.len();
    let fat_count = archive.fat().len() as u64;
    if original_dat_len % BLOCK_SIZE as u64 != 0 {
        return Err(Error::InconsistentArchive(format!(
            "data file length {original_dat_len} is not a block multiple"
        )));
    }
    if original_dat_len / BLOCK_SIZE as u64 != fat_count {
        return Err(Error::InconsistentArchive(format!(
            "data file holds {} blocks but the FAT has {} entries",
            original_dat_len / BLOCK_SIZE as u64,
            fat_count
        )));
    }
    let layout = archive.layout().clone();
    if layout.channel(CHANNEL_FAT).size_bytes as u64 != fat_count * 4 {
        return Err(Error::InconsistentArchive(format!(
            "FAT channel declares {} bytes for {} entries",
            layout.channel(CHANNEL_FAT).size_bytes,
            fat_count
        )));
    }
    let original_fat_size = fat_count * 4;

    // Phase 2: compress, digest, and lay out the new block ranges
    let workers = options.jobs.unwrap_or_else(default_worker_count).max(1);
    let jobs: Vec<CompressJob> = targets
        .iter()
        .enumerate()
        .map(|(index, target)| CompressJob {
            index,
            path: target.local.clone(),
        })
        .collect();

    let mut results: Vec<Option<PreparedPayload>> = Vec::new();
    results.resize_with(targets.len(), || None);
    compress_files(jobs, options.level, workers, true, |done| {
        let raw_sha1 = done.raw_sha1.ok_or_else(|| {
            Error::VerificationFailed("compression worker returned no digest".into())
        })?;
        results[done.index] = Some(PreparedPayload {
            wrapped: done.wrapped,
            raw_size: done.raw_size,
            raw_sha1,
            start_block: 0,
        });
        Ok(())
    })?;
    let mut payloads: Vec<PreparedPayload> = Vec::with_capacity(targets.len());
    for (i, slot) in results.into_iter().enumerate() {
        payloads.push(slot.ok_or_else(|| {
            Error::VerificationFailed(format!("no compression result for {}", targets[i].key))
        })?);
    }

    // Block ranges are contiguous in dispatch order, starting at the
    // current end of the data file
    let mut next_block = fat_count as u32;
    for payload in payloads.iter_mut() {
        payload.start_block = next_block;
        next_block += payload.wrapped.len().div_ceil(BLOCK_SIZE) as u32;
    }
    let new_fat_size = next_block as u64 * 4;

    if new_fat_size > layout.channel_capacity(CHANNEL_FAT) {
        return Err(Error::CapacityExceeded(format!(
            "FAT would grow to {} bytes, channel holds {}",
            new_fat_size,
            layout.channel_capacity(CHANNEL_FAT)
        )));
    }
    for target in &targets {
        let end = (target.meta_index as u64 + 1) * META_RECORD_SIZE as u64;
        if end > layout.channel_capacity(CHANNEL_META) {
            return Err(Error::CapacityExceeded(format!(
                "meta record {} lies beyond the meta channel capacity {}",
                target.meta_index,
                layout.channel_capacity(CHANNEL_META)
            )));
        }
    }

    let new_metas: Vec<MetaRecord> = targets
        .iter()
        .zip(&payloads)
        .map(|(target, payload)| MetaRecord {
            flags: target.old_meta.flags | META_FLAG_COMPRESSED,
            size: payload.wrapped.len() as u32,
            start_block: payload.start_block,
            extra: target.old_meta.extra,
        })
        .collect();

    state = PatchState::Prepared;
    debug!("{:?}: {} new blocks", state, next_block as u64 - fat_count);

    // Release the read handle (and its mmap) before mutating the pair
    drop(archive);

    match commit(
        idx_path,
        dat_path,
        &layout,
        &targets,
        &payloads,
        &new_metas,
        original_dat_len,
        original_fat_size,
        new_fat_size,
        &mut state,
        tamper_before_verify,
    ) {
        Ok(()) => {
            state = PatchState::Verified;
            debug!("{:?}", state);
            summary.patched = targets.into_iter().map(|t| t.key).collect();
            Ok(summary)
        }
        Err(e) if state >= PatchState::DatAppended => {
            warn!("patch failed after writes began, rolling back: {}", e);
            match rollback(
                idx_path,
                dat_path,
                &layout,
                &targets,
                original_dat_len,
                original_fat_size,
            ) {
                Ok(()) => Err(Error::RolledBack(Box::new(e))),
                Err(rollback_err) => {
                    error!(
                        "rollback failed: {} (original failure: {})",
                        rollback_err, e
                    );
                    Err(rollback_err)
                }
            }
        }
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
fn commit(
    idx_path: &Path,
    dat_path: &Path,
    layout: &IndexLayout,
    targets: &[PatchTarget],
    payloads: &[PreparedPayload],
    new_metas: &[MetaRecord],
    original_dat_len: u64,
    original_fat_size: u64,
    new_fat_size: u64,
    state: &mut PatchState,
    tamper_before_verify: Option<&dyn Fn()>,
) -> Result<()> {
    // Grow the data file first; block writes are coalesced
    {
        let mut dat = OpenOptions::new().write(true).open(dat_path)?;
        dat.seek(SeekFrom::Start(original_dat_len))?;

        let mut pending: Vec<u8> = Vec::new();
        for payload in payloads {
            pending.extend_from_slice(&payload.wrapped);
            let padded = payload.wrapped.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            pending.resize(pending.len() + padded - payload.wrapped.len(), 0);
            if pending.len() >= FLUSH_THRESHOLD {
                dat.write_all(&pending)?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            dat.write_all(&pending)?;
        }
        dat.sync_all()?;
    }
    *state = PatchState::DatAppended;
    debug!("{:?}", state);

    // Then rewire the index: FAT tail, FAT length word, meta slots
    {
        let mut idx = OpenOptions::new().read(true).write(true).open(idx_path)?;

        let mut fat_tail = Vec::new();
        for payload in payloads {
            let blocks = payload.wrapped.len().div_ceil(BLOCK_SIZE) as u32;
            for i in 0..blocks {
                let word = if i + 1 == blocks {
                    FAT_END_OF_CHAIN
                } else {
                    payload.start_block + i + 1
                };
                fat_tail.extend_from_slice(&word.to_le_bytes());
            }
        }
        layout.write_channel_bytes(&mut idx, CHANNEL_FAT, original_fat_size, &fat_tail)?;

        idx.seek(SeekFrom::Start(IndexLayout::channel_size_field_offset(
            CHANNEL_FAT,
        )))?;
        idx.write_all(&(new_fat_size as u32).to_le_bytes())?;

        for (target, new_meta) in targets.iter().zip(new_metas) {
            layout.write_channel_bytes(
                &mut idx,
                CHANNEL_META,
                target.meta_index as u64 * META_RECORD_SIZE as u64,
                &new_meta.to_bytes(),
            )?;
        }
        idx.sync_all()?;
    }
    *state = PatchState::IdxUpdated;
    debug!("{:?}", state);

    if let Some(tamper) = tamper_before_verify {
        tamper();
    }

    // Verify: read every patched entry back through a fresh handle
    let mut reopened = Archive::open(idx_path, Some(dat_path))?;
    for (target, payload) in targets.iter().zip(payloads) {
        let resolved = reopened.find_meta(target.key.as_bytes())?.ok_or_else(|| {
            Error::VerificationFailed(format!("{} vanished after patch", target.key))
        })?;
        let raw = reopened.read_file_bytes(resolved.meta_index)?;
        if raw.len() as u64 != payload.raw_size {
            return Err(Error::VerificationFailed(format!(
                "{}: read back {} bytes, expected {}",
                target.key,
                raw.len(),
                payload.raw_size
            )));
        }
        let mut hasher = Sha1::new();
        hasher.update(&raw);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != payload.raw_sha1 {
            return Err(Error::VerificationFailed(format!(
                "{}: digest {} does not match {}",
                target.key,
                hex::encode(digest),
                hex::encode(payload.raw_sha1)
            )));
        }
    }

    info!("patched {} entries", targets.len());
    Ok(())
}

fn rollback(
    idx_path: &Path,
    dat_path: &Path,
    layout: &IndexLayout,
    targets: &[PatchTarget],
    original_dat_len: u64,
    original_fat_size: u64,
) -> Result<()> {
    let dat = OpenOptions::new().write(true).open(dat_path)?;
    dat.set_len(original_dat_len)?;
    dat.sync_all()?;

    let mut idx = OpenOptions::new().read(true).write(true).open(idx_path)?;
    for target in targets {
        layout.write_channel_bytes(
            &mut idx,
            CHANNEL_META,
            target.meta_index as u64 * META_RECORD_SIZE as u64,
            &target.old_meta.to_bytes(),
        )?;
    }
    idx.seek(SeekFrom::Start(IndexLayout::channel_size_field_offset(
        CHANNEL_FAT,
    )))?;
    idx.write_all(&(original_fat_size as u32).to_le_bytes())?;
    idx.sync_all()?;

    // FAT words past the restored length word are dead bytes in the page
    // tail; the header word is authoritative
    info!("rolled back to pre-patch state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repack::{repack, RepackInput, RepackOptions};
    use std::fs;

    fn build_fixture(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let src = dir.join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.dds"), b"ABC").unwrap();
        fs::write(src.join("b.dds"), vec![0x5Au8; 1400]).unwrap();

        let idx = dir.join("game.idx");
        let dat = dir.join("game.dat");
        let inputs = vec![
            RepackInput {
                key: "texture\\a.dds".into(),
                local: src.join("a.dds"),
            },
            RepackInput {
                key: "texture\\b.dds".into(),
                local: src.join("b.dds"),
            },
        ];
        repack(&inputs, &idx, &dat, &RepackOptions::default()).unwrap();
        (idx, dat)
    }

    #[test]
    fn test_patch_success_appends_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, dat) = build_fixture(dir.path());
        let old_blocks = fs::metadata(&dat).unwrap().len() / BLOCK_SIZE as u64;

        let new_content = vec![0u8; 700];
        let local = dir.path().join("new-a.bin");
        fs::write(&local, &new_content).unwrap();

        let summary = patch(
            &idx,
            &dat,
            &[PatchRequest {
                key: "texture\\a.dds".into(),
                local,
            }],
            &PatchOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.patched, vec!["texture\\a.dds".to_string()]);

        let mut archive = Archive::open(&idx, Some(&dat)).unwrap();
        let resolved = archive.find_meta(b"texture\\a.dds").unwrap().unwrap();
        let meta = *archive.meta_record(resolved.meta_index).unwrap();
        assert!(meta.start_block as u64 >= old_blocks);
        assert!(meta.is_compressed());
        assert_eq!(
            archive.read_file_bytes(resolved.meta_index).unwrap(),
            new_content
        );

        // The untouched entry still reads back
        let other = archive.find_meta(b"texture\\b.dds").unwrap().unwrap();
        assert_eq!(
            archive.read_file_bytes(other.meta_index).unwrap(),
            vec![0x5Au8; 1400]
        );
    }

    #[test]
    fn test_patch_lowercase_fallback_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, dat) = build_fixture(dir.path());

        let local = dir.path().join("new.bin");
        fs::write(&local, b"fresh bytes").unwrap();

        let summary = patch(
            &idx,
            &dat,
            &[
                PatchRequest {
                    key: "TEXTURE/A.DDS".into(),
                    local: local.clone(),
                },
                PatchRequest {
                    key: "texture\\a.dds".into(),
                    local: local.clone(),
                },
                PatchRequest {
                    key: "texture\\missing.dds".into(),
                    local,
                },
            ],
            &PatchOptions::default(),
        )
        .unwrap();

        assert_eq!(summary.patched, vec!["TEXTURE\\A.DDS".to_string()]);
        assert_eq!(
            summary.skipped_duplicates,
            vec!["texture\\a.dds".to_string()]
        );
        assert_eq!(
            summary.skipped_unresolved,
            vec!["texture\\missing.dds".to_string()]
        );
    }

    #[test]
    fn test_empty_patch_leaves_files_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, dat) = build_fixture(dir.path());
        let idx_before = fs::read(&idx).unwrap();
        let dat_before = fs::read(&dat).unwrap();

        let summary = patch(&idx, &dat, &[], &PatchOptions::default()).unwrap();
        assert!(summary.patched.is_empty());
        assert_eq!(fs::read(&idx).unwrap(), idx_before);
        assert_eq!(fs::read(&dat).unwrap(), dat_before);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, dat) = build_fixture(dir.path());
        let idx_before = fs::read(&idx).unwrap();
        let dat_before = fs::read(&dat).unwrap();

        let local = dir.path().join("new.bin");
        fs::write(&local, b"would-be content").unwrap();

        let summary = patch(
            &idx,
            &dat,
            &[PatchRequest {
                key: "texture\\a.dds".into(),
                local,
            }],
            &PatchOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(summary.dry_run);
        assert!(summary.patched.is_empty());
        assert_eq!(fs::read(&idx).unwrap(), idx_before);
        assert_eq!(fs::read(&dat).unwrap(), dat_before);
    }

    #[test]
    fn test_verify_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, dat) = build_fixture(dir.path());
        let dat_before = fs::read(&dat).unwrap();
        let original_dat_len = dat_before.len() as u64;

        let local = dir.path().join("new.bin");
        fs::write(&local, vec![7u8; 900]).unwrap();

        let dat_for_tamper = dat.clone();
        let tamper = move || {
            // Corrupt the first appended block between commit and verify
            let mut bytes = fs::read(&dat_for_tamper).unwrap();
            bytes[original_dat_len as usize] ^= 0xFF;
            fs::write(&dat_for_tamper, bytes).unwrap();
        };

        let result = run_patch(
            &idx,
            &dat,
            &[PatchRequest {
                key: "texture\\a.dds".into(),
                local,
            }],
            &PatchOptions::default(),
            Some(&tamper),
        );
        assert!(matches!(result, Err(Error::RolledBack(_))));

        // The data file is back to its pre-patch bytes
        assert_eq!(fs::read(&dat).unwrap(), dat_before);

        // The archive still serves the original content
        let mut archive = Archive::open(&idx, Some(&dat)).unwrap();
        let resolved = archive.find_meta(b"texture\\a.dds").unwrap().unwrap();
        assert_eq!(archive.read_file_bytes(resolved.meta_index).unwrap(), b"ABC");
        assert_eq!(
            archive.fat().len() as u64,
            original_dat_len / BLOCK_SIZE as u64
        );
    }

    #[test]
    fn test_preflight_rejects_truncated_dat() {
        let dir = tempfile::tempdir().unwrap();
        let (idx, dat) = build_fixture(dir.path());

        // Leave the DAT no longer a block multiple
        let mut bytes = fs::read(&dat).unwrap();
        bytes.extend_from_slice(&[0u8; 100]);
        fs::write(&dat, bytes).unwrap();

        let local = dir.path().join("new.bin");
        fs::write(&local, b"x").unwrap();

        let result = patch(
            &idx,
            &dat,
            &[PatchRequest {
                key: "texture\\a.dds".into(),
                local,
            }],
            &PatchOptions::default(),
        );
        assert!(matches!(result, Err(Error::InconsistentArchive(_))));
    }
}
