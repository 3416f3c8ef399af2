// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded worker pool for resource hashing and validation.
//!
//! Jobs are produced by a single thread (typically a resource tree scan) and
//! processed by a fixed number of scoped worker threads. Results flow back
//! over a channel and are merged by the producing thread once every worker
//! has finished.

use {
    crate::error::CodeSignError,
    log::debug,
    std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Upper bound on the default worker count.
const MAX_DEFAULT_WORKERS: usize = 8;

/// A cooperative cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Progress check. Errors with [CodeSignError::Cancelled] once cancelled.
    pub fn check(&self) -> Result<(), CodeSignError> {
        if self.is_cancelled() {
            Err(CodeSignError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A pool running at most a fixed number of jobs concurrently.
#[derive(Clone, Debug)]
pub struct LimitedAsync {
    workers: usize,
    cancel: CancellationToken,
}

impl Default for LimitedAsync {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_DEFAULT_WORKERS);

        Self::new(workers)
    }
}

impl LimitedAsync {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancel: CancellationToken::default(),
        }
    }

    pub fn single_threaded() -> Self {
        Self::new(1)
    }

    /// Construct a pool appropriate for processing files under `path`.
    ///
    /// Rotational media get a single worker, as do callers forcing it.
    pub fn for_path(path: &Path, single_threaded: bool) -> Self {
        if single_threaded {
            Self::single_threaded()
        } else if is_rotational(path) {
            debug!("{} is on rotational media; using 1 worker", path.display());
            Self::single_threaded()
        } else {
            Self::default()
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run jobs through the pool.
    ///
    /// `producer` is called on the current thread with a submit function.
    /// Each submitted job is handed to `work` on a worker thread. Once the
    /// producer returns, this waits for every job to finish.
    ///
    /// Results are returned in submission order. The first error, in
    /// submission order, is returned instead if any job failed.
    pub fn run<J, R, P, W>(&self, producer: P, work: W) -> Result<Vec<R>, CodeSignError>
    where
        J: Send,
        R: Send,
        P: FnOnce(&mut dyn FnMut(J) -> Result<(), CodeSignError>) -> Result<(), CodeSignError>,
        W: Fn(J) -> Result<R, CodeSignError> + Sync,
    {
        if self.workers == 1 {
            let mut results = vec![];
            let mut submit = |job: J| -> Result<(), CodeSignError> {
                self.cancel.check()?;
                results.push(work(job)?);
                Ok(())
            };

            producer(&mut submit)?;
            self.cancel.check()?;

            return Ok(results);
        }

        let (job_tx, job_rx) = crossbeam::channel::bounded::<(usize, J)>(self.workers * 4);
        let (result_tx, result_rx) = crossbeam::channel::unbounded();

        let work = &work;
        let cancel = &self.cancel;

        let produced = crossbeam::scope(|s| {
            let mut threads = Vec::with_capacity(self.workers);

            for _ in 0..self.workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();

                threads.push(s.spawn(move |_| {
                    while let Ok((index, job)) = job_rx.recv() {
                        let res = match cancel.check() {
                            Ok(()) => work(job),
                            Err(e) => Err(e),
                        };

                        if result_tx.send((index, res)).is_err() {
                            break;
                        }
                    }
                }));
            }

            drop(result_tx);

            let mut next_index = 0;
            let mut submit = |job: J| -> Result<(), CodeSignError> {
                cancel.check()?;
                job_tx
                    .send((next_index, job))
                    .map_err(|_| CodeSignError::InternalError("worker pool closed".into()))?;
                next_index += 1;
                Ok(())
            };

            let res = producer(&mut submit);

            // Close the queue so workers exit once drained.
            drop(job_tx);

            for thread in threads {
                if thread.join().is_err() {
                    return Err(CodeSignError::InternalError("worker thread panicked".into()));
                }
            }

            res
        })
        .map_err(|_| CodeSignError::InternalError("worker pool panicked".into()))?;

        produced?;
        self.cancel.check()?;

        let mut results = result_rx.into_iter().collect::<Vec<_>>();
        results.sort_by_key(|(index, _)| *index);

        results.into_iter().map(|(_, res)| res).collect()
    }
}

/// Whether the file system holding `path` is backed by rotational media.
#[cfg(target_os = "linux")]
pub fn is_rotational(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let dev = match std::fs::metadata(path) {
        Ok(md) => md.dev(),
        Err(_) => return false,
    };

    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);

    let device = Path::new("/sys/dev/block").join(format!("{}:{}", major, minor));

    let read_flag = |p: &Path| -> Option<bool> {
        std::fs::read_to_string(p.join("queue/rotational"))
            .ok()
            .map(|s| s.trim() == "1")
    };

    if let Some(flag) = read_flag(&device) {
        return flag;
    }

    // Partitions only carry a queue on their parent device.
    std::fs::canonicalize(&device)
        .ok()
        .and_then(|p| p.parent().and_then(read_flag))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
pub fn is_rotational(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squares(pool: &LimitedAsync) -> Result<Vec<u64>, CodeSignError> {
        pool.run(
            |submit| {
                for i in 0..100u64 {
                    submit(i)?;
                }
                Ok(())
            },
            |i| Ok(i * i),
        )
    }

    #[test]
    fn results_in_submission_order() -> Result<(), CodeSignError> {
        let expected = (0..100u64).map(|i| i * i).collect::<Vec<_>>();

        assert_eq!(squares(&LimitedAsync::new(4))?, expected);
        assert_eq!(squares(&LimitedAsync::single_threaded())?, expected);

        Ok(())
    }

    #[test]
    fn first_error_wins() {
        let pool = LimitedAsync::new(3);

        let res = pool.run(
            |submit| {
                for i in 0..20u32 {
                    submit(i)?;
                }
                Ok(())
            },
            |i| {
                if i == 7 || i == 15 {
                    Err(CodeSignError::InternalError(format!("job {}", i)))
                } else {
                    Ok(i)
                }
            },
        );

        match res {
            Err(CodeSignError::InternalError(msg)) => assert_eq!(msg, "job 7"),
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn cancellation() {
        let pool = LimitedAsync::new(2);
        let cancel = pool.cancellation().clone();

        let res = pool.run(
            |submit| {
                for i in 0..10u32 {
                    if i == 5 {
                        cancel.cancel();
                    }
                    submit(i)?;
                }
                Ok(())
            },
            Ok,
        );

        assert!(matches!(res, Err(CodeSignError::Cancelled)));
    }
}
