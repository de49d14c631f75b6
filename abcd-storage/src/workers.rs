//! Parallel compression of local files
//!
//! A pool of OS worker threads pulls jobs off a shared queue, wraps each
//! file's bytes, and streams self-contained results back over a channel.
//! The coordinator drains results as they arrive and stays the sole
//! writer to the output files. With one worker the coordinator compresses
//! inline; results then arrive in dispatch order.

use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::wrapper;

/// One file queued for compression
#[derive(Debug, Clone)]
pub struct CompressJob {
    /// Caller-chosen slot; carried through untouched
    pub index: usize,
    pub path: PathBuf,
}

/// A finished compression result
#[derive(Debug)]
pub struct CompressedFile {
    pub index: usize,
    pub wrapped: Vec<u8>,
    pub raw_size: u64,
    pub raw_sha1: Option<[u8; 20]>,
}

/// Default worker count: one per logical CPU.
pub fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

fn compress_one(job: &CompressJob, level: u32, digest: bool) -> Result<CompressedFile> {
    let raw = std::fs::read(&job.path)?;
    let raw_sha1 = digest.then(|| {
        let mut hasher = Sha1::new();
        hasher.update(&raw);
        hasher.finalize().into()
    });
    let wrapped = wrapper::wrap(&raw, level)?;

    Ok(CompressedFile {
        index: job.index,
        wrapped,
        raw_size: raw.len() as u64,
        raw_sha1,
    })
}

/// Compress every job and feed results to `on_result` as they complete.
///
/// Results arrive in completion order; `job.index` identifies the slot.
/// The first error (from a worker or from `on_result`) aborts dispatch,
/// terminates the peers, and is the call's return value; results still in
/// flight are discarded.
pub fn compress_files(
    jobs: Vec<CompressJob>,
    level: u32,
    workers: usize,
    digest: bool,
    mut on_result: impl FnMut(CompressedFile) -> Result<()>,
) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    if workers <= 1 {
        debug!("compressing {} files inline", jobs.len());
        for job in &jobs {
            on_result(compress_one(job, level, digest)?)?;
        }
        return Ok(());
    }

    let worker_count = workers.min(jobs.len());
    debug!(
        "compressing {} files on {} workers",
        jobs.len(),
        worker_count
    );

    let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
    let abort = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<Result<CompressedFile>>();

    let mut handles = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let queue = Arc::clone(&queue);
        let abort = Arc::clone(&abort);
        let tx = tx.clone();
        let handle = thread::Builder::new()
            .name(format!("abcd-compress-{i}"))
            .spawn(move || {
                while !abort.load(Ordering::Relaxed) {
                    let job = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(_) => break,
                    };
                    let Some(job) = job else { break };

                    let result = compress_one(&job, level, digest);
                    let failed = result.is_err();
                    if tx.send(result).is_err() || failed {
                        break;
                    }
                }
            })?;
        handles.push(handle);
    }
    drop(tx);

    let mut first_error: Option<Error> = None;
    for result in rx {
        match result {
            Ok(done) if first_error.is_none() => {
                if let Err(e) = on_result(done) {
                    abort.store(true, Ordering::Relaxed);
                    first_error = Some(e);
                }
            }
            Ok(_) => {
                // Late result after an abort; discard
            }
            Err(e) => {
                abort.store(true, Ordering::Relaxed);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            warn!("compression worker panicked");
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_inputs(dir: &std::path::Path, count: usize) -> Vec<CompressJob> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("input-{i}.bin"));
                fs::write(&path, format!("payload number {i}").repeat(i + 1)).unwrap();
                CompressJob { index: i, path }
            })
            .collect()
    }

    #[test]
    fn test_inline_matches_pool() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = write_inputs(dir.path(), 8);

        let mut inline = vec![None; 8];
        compress_files(jobs.clone(), 6, 1, true, |done| {
            inline[done.index] = Some((done.wrapped, done.raw_size, done.raw_sha1));
            Ok(())
        })
        .unwrap();

        let mut pooled = vec![None; 8];
        compress_files(jobs, 6, 4, true, |done| {
            pooled[done.index] = Some((done.wrapped, done.raw_size, done.raw_sha1));
            Ok(())
        })
        .unwrap();

        assert_eq!(inline, pooled);
        assert!(inline.iter().all(Option::is_some));
    }

    #[test]
    fn test_missing_input_propagates_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut jobs = write_inputs(dir.path(), 4);
        jobs.push(CompressJob {
            index: 4,
            path: dir.path().join("does-not-exist.bin"),
        });

        let result = compress_files(jobs, 6, 2, false, |_| Ok(()));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_consumer_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = write_inputs(dir.path(), 6);

        let mut seen = 0;
        let result = compress_files(jobs, 6, 2, false, |_| {
            seen += 1;
            if seen == 2 {
                Err(Error::CapacityExceeded("synthetic".into()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::CapacityExceeded(_))));
    }

    #[test]
    fn test_digest_matches_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();

        compress_files(
            vec![CompressJob { index: 0, path }],
            6,
            1,
            true,
            |done| {
                assert_eq!(
                    hex::encode(done.raw_sha1.unwrap()),
                    "a9993e364706816aba3e25717850c26c9cd0d89d"
                );
                assert_eq!(done.raw_size, 3);
                Ok(())
            },
        )
        .unwrap();
    }
}
