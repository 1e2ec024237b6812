//! # Parallel Execution
//!
//! The caller owns a [`WorkerPool`] with an explicit lifecycle (create, run,
//! shut down) and hands it to every run; there is no process-wide backend.
//!
//! [`ParallelReducer`] dispatches one task per chunk. Tasks report back over a
//! channel tagged with their chunk index, in whatever order they finish, and
//! [`OrderedMerge`] buffers early arrivals until their predecessors are in.
//! Row `i` of the output is therefore row `i` of the input no matter how the
//! scheduler interleaves the chunks.

use crate::progress::RunProgressObserver;
use crate::run::PartitionError;
use crossbeam_channel::unbounded;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::collections::BTreeMap;
use thiserror::Error;

/// A handle on the worker threads of a run.
#[derive(Debug)]
pub struct WorkerPool {
    pool: Option<ThreadPool>,
    threads: usize,
}

impl WorkerPool {
    /// Starts `threads` workers; `0` means one per logical CPU.
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("varpart-worker-{i}"))
            .build()?;
        log::debug!("Started worker pool with {threads} threads.");
        Ok(Self {
            pool: Some(pool),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_live(&self) -> bool {
        self.pool.is_some()
    }

    /// Stops the workers. Any later run on this pool fails with
    /// [`PartitionError::PoolUnavailable`].
    pub fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            log::debug!("Shut down worker pool of {} threads.", self.threads);
        }
    }

    pub(crate) fn live(&self) -> Result<&ThreadPool, PartitionError> {
        self.pool.as_ref().ok_or(PartitionError::PoolUnavailable)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("Chunk {index} was reported more than once.")]
    Duplicate { index: usize },
    #[error("Chunk {index} is outside the plan of {expected} chunks.")]
    OutOfRange { index: usize, expected: usize },
    #[error("Only {received} of {expected} chunks reported back.")]
    Incomplete { received: usize, expected: usize },
}

/// Reassembles tagged chunk outputs in chunk order.
#[derive(Debug)]
pub struct OrderedMerge<T> {
    expected: usize,
    next: usize,
    pending: BTreeMap<usize, Vec<T>>,
    output: Vec<T>,
}

impl<T> OrderedMerge<T> {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            next: 0,
            pending: BTreeMap::new(),
            output: Vec::new(),
        }
    }

    /// Accepts chunk `index`. Returns how many chunks are now in order.
    pub fn accept(&mut self, index: usize, items: Vec<T>) -> Result<usize, MergeError> {
        if index >= self.expected {
            return Err(MergeError::OutOfRange {
                index,
                expected: self.expected,
            });
        }
        if index < self.next || self.pending.contains_key(&index) {
            return Err(MergeError::Duplicate { index });
        }
        self.pending.insert(index, items);
        while let Some(items) = self.pending.remove(&self.next) {
            self.output.extend(items);
            self.next += 1;
        }
        Ok(self.next)
    }

    pub fn finish(self) -> Result<Vec<T>, MergeError> {
        if self.next != self.expected {
            return Err(MergeError::Incomplete {
                received: self.next + self.pending.len(),
                expected: self.expected,
            });
        }
        Ok(self.output)
    }
}

/// Something that can be dispatched as one task.
pub trait WorkItem: Send {
    /// Position in the plan.
    fn index(&self) -> usize;
    /// Rows covered, for progress reporting.
    fn rows(&self) -> usize;
}

impl WorkItem for crate::chunk::Chunk<'_> {
    fn index(&self) -> usize {
        self.index
    }

    fn rows(&self) -> usize {
        self.len()
    }
}

/// Runs chunk tasks on a [`WorkerPool`] and concatenates their outputs in
/// chunk order.
pub struct ParallelReducer<'p> {
    pool: &'p WorkerPool,
}

impl<'p> ParallelReducer<'p> {
    pub fn new(pool: &'p WorkerPool) -> Self {
        Self { pool }
    }

    /// Runs `work` on every item. Items must be indexed `0..items.len()`.
    ///
    /// The calling thread does not run tasks; it drains results as they arrive
    /// and reports progress.
    pub fn run<I, T, F>(
        &self,
        items: Vec<I>,
        work: F,
        progress: &mut dyn RunProgressObserver,
    ) -> Result<Vec<T>, PartitionError>
    where
        I: WorkItem,
        T: Send,
        F: Fn(I) -> Vec<T> + Sync,
    {
        let pool = self.pool.live()?;
        let total = items.len();
        let total_rows = items.iter().map(|item| item.rows()).sum();
        progress.on_start(total, total_rows);

        let (tx, rx) = unbounded::<(usize, usize, Vec<T>)>();
        let work = &work;
        let merged = pool.in_place_scope(|scope| {
            for item in items {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let index = item.index();
                    let rows = item.rows();
                    let out = work(item);
                    // The receiver outlives every task in this scope.
                    let _ = tx.send((index, rows, out));
                });
            }
            drop(tx);

            let mut merge = OrderedMerge::new(total);
            for (index, rows, out) in rx.iter() {
                merge.accept(index, out)?;
                progress.on_chunk_complete(index, rows);
            }
            merge.finish()
        });
        progress.on_finish();
        Ok(merged?)
    }
}
