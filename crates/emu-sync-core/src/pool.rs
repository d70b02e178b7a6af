//! Bounded worker pool shared by the upload and sync engines
//!
//! Workers pull jobs from a shared queue and report each outcome back over a
//! channel. Only the calling thread sees outcomes, so state such as the hash
//! cache or the local manifest is mutated without locks.

use std::thread;

use crossbeam_channel::unbounded;
use tracing::debug;

use crate::cancel::CancelToken;

/// Accumulated bytes after which the local manifest is persisted mid-run
pub const DEFAULT_SAVE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// What happened to one job
#[derive(Debug)]
pub enum JobOutcome<J, O> {
    /// The job ran and produced `output`
    Finished { job: J, output: O },
    /// Cancellation fired before the job started
    NotStarted(J),
}

/// Run `work` over `jobs` on up to `workers` threads.
///
/// `on_outcome` is called on the calling thread exactly once per job, in
/// completion order. With `workers <= 1` (or a single job) everything runs
/// inline with the same observable results.
pub fn run_jobs<J, O, W, C>(
    jobs: Vec<J>,
    workers: usize,
    cancel: &CancelToken,
    work: W,
    mut on_outcome: C,
) where
    J: Send,
    O: Send,
    W: Fn(&J) -> O + Sync,
    C: FnMut(JobOutcome<J, O>),
{
    if workers <= 1 || jobs.len() <= 1 {
        for job in jobs {
            if cancel.is_cancelled() {
                on_outcome(JobOutcome::NotStarted(job));
                continue;
            }
            let output = work(&job);
            on_outcome(JobOutcome::Finished { job, output });
        }
        return;
    }

    let workers = workers.min(jobs.len());
    debug!(workers, jobs = jobs.len(), "starting worker pool");

    let (job_tx, job_rx) = unbounded::<J>();
    let (result_tx, result_rx) = unbounded::<JobOutcome<J, O>>();
    for job in jobs {
        // The receiver is alive until the scope below ends
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let work = &work;
    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for job in job_rx.iter() {
                    let outcome = if cancel.is_cancelled() {
                        JobOutcome::NotStarted(job)
                    } else {
                        let output = work(&job);
                        JobOutcome::Finished { job, output }
                    };
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for outcome in result_rx.iter() {
            on_outcome(outcome);
        }
    });
}

/// Tracks transferred bytes and signals when a checkpoint save is due
#[derive(Debug, Clone, Copy)]
pub struct SaveThreshold {
    threshold: u64,
    unsaved: u64,
}

impl SaveThreshold {
    /// A threshold of zero falls back to [`DEFAULT_SAVE_THRESHOLD`]
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: if threshold == 0 {
                DEFAULT_SAVE_THRESHOLD
            } else {
                threshold
            },
            unsaved: 0,
        }
    }

    /// Record `bytes`; returns `true` (and resets) once the threshold is crossed.
    pub fn record(&mut self, bytes: u64) -> bool {
        self.unsaved = self.unsaved.saturating_add(bytes);
        if self.unsaved >= self.threshold {
            self.unsaved = 0;
            true
        } else {
            false
        }
    }
}

impl Default for SaveThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_SAVE_THRESHOLD)
    }
}
