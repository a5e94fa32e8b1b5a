use crate::error::{Result, ScacError};
use crate::executor::CancellationToken;
use crate::input::Batch;
use crate::oracle::InstructionOracle;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Mutex;
use tracing::{debug, error};

pub const DEFAULT_CONCURRENCY: usize = 15;

/// Evaluates a batch into instruction counts aligned with the batch order.
pub trait BatchEvaluator {
    fn evaluate(&self, batch: &Batch) -> Result<Vec<u64>>;
}

/// Runs every candidate of a batch against an oracle on a bounded worker pool.
///
/// The pool belongs to this evaluator and is torn down with it. Results come
/// back in candidate order regardless of which worker finished first. The
/// first oracle failure cancels the rest of the batch and is returned as is;
/// there are no partial results.
pub struct ParallelEvaluator<O: InstructionOracle> {
    oracle: O,
    pool: ThreadPool,
    concurrency: usize,
}

impl<O: InstructionOracle> ParallelEvaluator<O> {
    pub fn new(oracle: O, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(ScacError::config("concurrency must be at least 1"));
        }
        let pool = ThreadPoolBuilder::new()
            .thread_name(|i| format!("scac-worker-{i}"))
            .num_threads(concurrency)
            .build()
            .map_err(|e| ScacError::resource(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            oracle,
            pool,
            concurrency,
        })
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl<O: InstructionOracle> BatchEvaluator for ParallelEvaluator<O> {
    fn evaluate(&self, batch: &Batch) -> Result<Vec<u64>> {
        if batch.is_empty() {
            return Err(ScacError::config("cannot evaluate an empty batch"));
        }

        let cancel = CancellationToken::new();
        let first_error: Mutex<Option<ScacError>> = Mutex::new(None);

        debug!(
            candidates = batch.len(),
            workers = self.concurrency,
            oracle = self.oracle.name(),
            "evaluating batch"
        );

        let counts: Vec<Option<u64>> = self.pool.install(|| {
            batch
                .candidates()
                .par_iter()
                .enumerate()
                .map(|(index, candidate)| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    match self.oracle.count(candidate, &cancel) {
                        Ok(count) => Some(count),
                        Err(ScacError::Cancelled) => None,
                        Err(e) => {
                            error!(index, error = %e, "oracle failed, cancelling batch");
                            cancel.cancel();
                            let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            None
                        }
                    }
                })
                .collect()
        });

        if let Some(e) = first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(e);
        }
        counts
            .into_iter()
            .collect::<Option<Vec<u64>>>()
            .ok_or(ScacError::Cancelled)
    }
}
