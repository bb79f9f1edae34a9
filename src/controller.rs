//! Controls the execution of a PageRank computation.
//!
//! Every iteration is a sequence of barrier-separated stages (map, reduce,
//! damping), each running one task per partition on a worker pool. An
//! iteration reads only the committed generation `k` and produces generation
//! `k + 1` under a staging name; the new generation becomes visible only once
//! all of its partitions and its manifest are written.

use crate::damping::{DampPartition, DampStats, Damping};
use crate::error::{RankError, Result};
use crate::formats::wire::read_side_value;
use crate::generation::{GenerationStore, Manifest};
use crate::logprob::{log_sum_exp_all, missing_mass};
use crate::map::{MapPartition, MapStats};
use crate::parameters::RankParameters;
use crate::partitioner::Partitioner;
use crate::reduce::ReducePartition;
use crate::shuffle::LocalShuffle;

use log::{info, warn};
use predicates::Predicate;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Instant;

use scoped_threadpool::Pool;

pub mod preds {
    //! Predicates implementing stopping conditions.
    //!
    //! [`RankController::run`](super::RankController::run) evaluates a
    //! [`Predicate`] after each iteration and stops when it is true. Combine
    //! them with the `and`/`or` methods of the `predicates` crate:
    //!
    //! ```
    //! use predicates::prelude::*;
    //! use schimmyrank::controller::preds::{L1Norm, MaxIter};
    //!
    //! let predicate = L1Norm::try_from(1E-6).unwrap().or(MaxIter::from(100));
    //! ```

    use crate::error::RankError;
    use predicates::{reflection::PredicateReflection, Predicate};
    use std::fmt::Display;

    /// This structure is passed to stopping predicates to provide the
    /// information that is needed to evaluate them.
    #[derive(Debug)]
    pub struct PredParams {
        /// Number of the newest committed generation, that is, the number of
        /// iterations run since the graph was seeded.
        pub iteration: usize,
        /// ℓ₁ distance between the last two generations, or `∞` if no
        /// iteration has run yet.
        pub norm_delta: f64,
    }

    /// Stops once the given number of iterations has been reached.
    #[derive(Debug, Clone)]
    pub struct MaxIter {
        max_iter: usize,
    }

    impl From<usize> for MaxIter {
        fn from(max_iter: usize) -> Self {
            MaxIter { max_iter }
        }
    }

    impl Display for MaxIter {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!("(max iter: {})", self.max_iter))
        }
    }

    impl PredicateReflection for MaxIter {}

    impl Predicate<PredParams> for MaxIter {
        fn eval(&self, pred_params: &PredParams) -> bool {
            pred_params.iteration >= self.max_iter
        }
    }

    /// Stops when the ℓ₁ norm of the difference between successive
    /// generations falls below a given threshold.
    #[derive(Debug, Clone)]
    pub struct L1Norm {
        threshold: f64,
    }

    impl L1Norm {
        pub const DEFAULT_THRESHOLD: f64 = 1E-6;
    }

    impl TryFrom<f64> for L1Norm {
        type Error = RankError;
        fn try_from(threshold: f64) -> Result<Self, RankError> {
            if threshold.is_nan() || threshold <= 0.0 {
                return Err(RankError::InvalidParameter(format!(
                    "the threshold must be positive, got {}",
                    threshold
                )));
            }
            Ok(L1Norm { threshold })
        }
    }

    impl Default for L1Norm {
        fn default() -> Self {
            L1Norm {
                threshold: Self::DEFAULT_THRESHOLD,
            }
        }
    }

    impl Display for L1Norm {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!("(norm: {})", self.threshold))
        }
    }

    impl PredicateReflection for L1Norm {}

    impl Predicate<PredParams> for L1Norm {
        fn eval(&self, pred_params: &PredParams) -> bool {
            pred_params.norm_delta <= self.threshold
        }
    }
}

use self::preds::PredParams;

/// Requests cancellation of a running computation from another thread.
///
/// Checked at task starts and between stages; a cancelled iteration discards
/// its staging generation and the last committed generation stays intact.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RankError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What one iteration did.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationStats {
    /// The generation the iteration produced.
    pub generation: usize,
    pub dangling_nodes: u64,
    pub messages_emitted: u64,
    pub messages_shuffled: u64,
    /// Log-domain mass delivered along links, over all partitions.
    pub delivered: f64,
    pub missing_mass: f64,
    pub l1_delta: f64,
    /// Log-domain total mass of the new generation.
    pub total_mass: f64,
}

/// Outcome of [`RankController::run`].
#[derive(Clone, Debug)]
pub struct RankSummary {
    pub generation: usize,
    pub iterations: Vec<IterationStats>,
    pub norm_delta: f64,
}

pub struct RankController<P: Partitioner> {
    params: RankParameters,
    partitioner: P,
    store: GenerationStore,
    cancel: CancelHandle,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// Runs `task` for partition `p`, rerunning it after retryable failures.
///
/// Tasks read only immutable inputs and write their outputs under temporary
/// names, so a rerun simply starts over.
pub fn run_with_retry<T, F>(stage: &'static str, p: usize, attempts: usize, task: &F) -> Result<T>
where
    F: Fn(usize) -> Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| task(p))).unwrap_or_else(|payload| {
            Err(RankError::TaskPanicked {
                stage,
                partition: p,
                message: panic_message(payload.as_ref()),
            })
        });
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    "{} task for partition {} failed (attempt {}/{}): {}",
                    stage, p, attempt, attempts, e
                );
            }
            Err(e) if e.is_retryable() => {
                return Err(RankError::TaskFailed {
                    stage,
                    partition: p,
                    attempts: attempt,
                    source: Box::new(e),
                })
            }
            Err(e) => return Err(e),
        }
    }
}

impl<P: Partitioner> RankController<P> {
    pub fn new(params: RankParameters, partitioner: P, store: GenerationStore) -> Result<Self> {
        params.validate()?;
        Ok(RankController {
            params,
            partitioner,
            store,
            cancel: CancelHandle::default(),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn store(&self) -> &GenerationStore {
        &self.store
    }

    pub fn params(&self) -> &RankParameters {
        &self.params
    }

    /// Iterates from the newest committed generation until `predicate`
    /// holds. The predicate is also evaluated before the first iteration,
    /// so a resumed computation that already reached its iteration cap does
    /// nothing.
    pub fn run(&self, predicate: impl Predicate<PredParams>) -> Result<RankSummary> {
        self.store.remove_stale()?;
        let latest = self.store.latest()?.ok_or_else(|| {
            RankError::InvalidParameter(format!(
                "{} holds no generation",
                self.store.root().display()
            ))
        })?;
        let mut manifest = self.store.manifest(latest)?;
        self.check_layout(&manifest)?;
        info!(
            "Starting from generation {} ({} nodes, {} partitions, {} variant, alpha {})",
            latest,
            manifest.nodes,
            manifest.partitions,
            self.params.variant.name(),
            self.params.alpha
        );

        let mut summary = RankSummary {
            generation: latest,
            iterations: Vec::new(),
            norm_delta: f64::INFINITY,
        };
        loop {
            let pred_params = PredParams {
                iteration: manifest.generation,
                norm_delta: summary.norm_delta,
            };
            if predicate.eval(&pred_params) {
                break;
            }
            let stats = self.run_iteration(&manifest)?;
            manifest = self.store.manifest(stats.generation)?;
            summary.generation = stats.generation;
            summary.norm_delta = stats.l1_delta;
            summary.iterations.push(stats);
        }
        info!(
            "Completed after {} iteration(s) at generation {}, norm delta = {}",
            summary.iterations.len(),
            summary.generation,
            summary.norm_delta
        );
        Ok(summary)
    }

    fn check_layout(&self, manifest: &Manifest) -> Result<()> {
        if manifest.partitions != self.params.partitions {
            return Err(RankError::InvalidParameter(format!(
                "generation {} has {} partitions, {} requested",
                manifest.generation, manifest.partitions, self.params.partitions
            )));
        }
        if manifest.partitioner != self.partitioner.name() {
            return Err(RankError::InvalidParameter(format!(
                "generation {} was laid out by partitioner '{}', not '{}'",
                manifest.generation,
                manifest.partitioner,
                self.partitioner.name()
            )));
        }
        Ok(())
    }

    /// Runs one iteration on committed generation `manifest.generation` and
    /// commits the next generation.
    pub fn run_iteration(&self, manifest: &Manifest) -> Result<IterationStats> {
        self.check_layout(manifest)?;
        let k = manifest.generation;
        let start = Instant::now();
        self.cancel.check()?;
        self.store.prepare_iteration(k)?;

        let shuffle = LocalShuffle::new(
            &self.store,
            k,
            self.params.partitions,
            self.partitioner.clone(),
        );

        let maps: Vec<MapStats> = self.run_stage("map", |p| {
            MapPartition::new(&self.params, &self.store, &shuffle, k, p).run()
        })?;
        self.cancel.check()?;

        let map_tasks = self.params.partitions;
        self.run_stage("reduce", |p| {
            ReducePartition::new(&self.params, &self.store, &shuffle, k, p, map_tasks).run()
        })?;
        self.cancel.check()?;

        // The side files, not the in-memory task results, carry the
        // delivered mass across the barrier.
        let sides = (0..self.params.partitions)
            .map(|p| read_side_value(self.store.dangling_path(k, p)).map(f64::from))
            .collect::<Result<Vec<_>>>()?;
        let delivered = log_sum_exp_all(sides);
        let missing = missing_mass(delivered);
        let damping = Damping::new(self.params.alpha, manifest.nodes, missing);

        self.store.begin_generation(k + 1)?;
        let damped = self
            .run_stage("damp", |p| DampPartition::new(&self.store, damping, k, p).run())
            .and_then(|damped| {
                self.cancel.check()?;
                Ok(damped)
            });
        let damped: Vec<DampStats> = match damped {
            Ok(damped) => damped,
            Err(e) => return Err(self.abandon(k + 1, e)),
        };

        let nodes: u64 = damped.iter().map(|d| d.nodes).sum();
        if nodes != manifest.nodes as u64 {
            let e = RankError::Corrupt(format!(
                "generation {} would hold {} nodes instead of {}",
                k + 1,
                nodes,
                manifest.nodes
            ));
            return Err(self.abandon(k + 1, e));
        }
        self.store.commit_generation(&manifest.next())?;
        if !self.params.keep_temp_files {
            self.store.remove_iteration(k)?;
        }

        let stats = IterationStats {
            generation: k + 1,
            dangling_nodes: maps.iter().map(|m| m.dangling).sum(),
            messages_emitted: maps.iter().map(|m| m.emitted).sum(),
            messages_shuffled: maps.iter().map(|m| m.spilled).sum(),
            delivered,
            missing_mass: missing,
            l1_delta: damped.iter().map(|d| d.l1_delta).sum(),
            total_mass: log_sum_exp_all(damped.iter().map(|d| d.mass)),
        };
        info!(
            "Generation {}: missing mass {:.3e}, total mass {:.6}, l1 delta {:.3e}, {} message(s) shuffled, {:?}",
            stats.generation,
            stats.missing_mass,
            stats.total_mass.exp(),
            stats.l1_delta,
            stats.messages_shuffled,
            start.elapsed()
        );
        Ok(stats)
    }

    /// Discards staging generation `k` after `e`. The original error is
    /// returned even if the cleanup fails; `remove_stale` retries it on the
    /// next run.
    fn abandon(&self, k: usize, e: RankError) -> RankError {
        if let Err(cleanup) = self.store.abort_generation(k) {
            warn!("Could not discard staging generation {}: {}", k, cleanup);
        }
        e
    }

    /// Runs one task per partition on the worker pool and waits for all of
    /// them. Results are returned in partition order.
    fn run_stage<T, F>(&self, stage: &'static str, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        let partitions = self.params.partitions;
        let attempts = self.params.max_task_attempts;
        let failed = AtomicBool::new(false);
        let mut pool = Pool::new(self.params.workers as u32);
        let (send, recv) = channel();

        let guarded = |p: usize| -> Result<T> {
            self.cancel.check()?;
            if failed.load(Ordering::SeqCst) {
                return Err(RankError::Cancelled);
            }
            task(p)
        };
        let guarded = &guarded;
        let failed = &failed;

        pool.scoped(|scope| {
            for p in 0..partitions {
                let send = send.clone();
                scope.execute(move || {
                    let result = run_with_retry(stage, p, attempts, guarded);
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    let _ = send.send((p, result));
                });
            }
        });
        drop(send);

        let mut results: Vec<Option<Result<T>>> = (0..partitions).map(|_| None).collect();
        for (p, result) in recv {
            results[p] = Some(result);
        }
        // Report the first real failure, not the tasks skipped because of it.
        let mut out = Vec::with_capacity(partitions);
        let mut skipped = None;
        for (p, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(v)) => out.push(v),
                Some(Err(RankError::Cancelled)) if !self.cancel.is_cancelled() => {
                    skipped = Some(p);
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(RankError::TaskPanicked {
                        stage,
                        partition: p,
                        message: String::from("no result reported"),
                    })
                }
            }
        }
        match skipped {
            Some(p) => Err(RankError::TaskPanicked {
                stage,
                partition: p,
                message: String::from("skipped after another task failed"),
            }),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::preds::{L1Norm, MaxIter, PredParams};
    use super::*;
    use std::cell::Cell;
    use std::io;

    #[test]
    fn test_retry_until_success() {
        let calls = Cell::new(0);
        let task = |p: usize| -> Result<usize> {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(RankError::Io(io::Error::new(io::ErrorKind::Other, "flaky")))
            } else {
                Ok(p * 10)
            }
        };
        assert_eq!(run_with_retry("map", 4, 3, &task).unwrap(), 40);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let task = |_: usize| -> Result<()> {
            Err(RankError::Io(io::Error::new(io::ErrorKind::Other, "down")))
        };
        match run_with_retry("reduce", 1, 2, &task) {
            Err(RankError::TaskFailed {
                stage, attempts, ..
            }) => assert_eq!((stage, attempts), ("reduce", 2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fatal_errors_are_not_retried() {
        let calls = Cell::new(0);
        let task = |p: usize| -> Result<()> {
            calls.set(calls.get() + 1);
            Err(RankError::DuplicateStructure { partition: p, id: 3 })
        };
        assert!(matches!(
            run_with_retry("reduce", 0, 5, &task),
            Err(RankError::DuplicateStructure { .. })
        ));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_panics_are_retried() {
        let calls = Cell::new(0);
        let task = |_: usize| -> Result<&'static str> {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                panic!("worker crashed");
            }
            Ok("done")
        };
        assert_eq!(run_with_retry("damp", 0, 2, &task).unwrap(), "done");
    }

    #[test]
    fn test_predicates() {
        let p = L1Norm::try_from(1e-3).unwrap();
        assert!(p.eval(&PredParams {
            iteration: 1,
            norm_delta: 1e-4
        }));
        assert!(!p.eval(&PredParams {
            iteration: 1,
            norm_delta: f64::INFINITY
        }));
        assert!(L1Norm::try_from(0.0).is_err());
        assert!(L1Norm::try_from(f64::NAN).is_err());

        let m = MaxIter::from(3);
        assert!(!m.eval(&PredParams {
            iteration: 2,
            norm_delta: 0.0
        }));
        assert!(m.eval(&PredParams {
            iteration: 3,
            norm_delta: 1.0
        }));
    }

    #[test]
    fn test_abandon_keeps_the_original_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        let controller =
            RankController::new(RankParameters::new(), crate::partitioner::ModPartitioner, store)
                .unwrap();

        // A file where the staging directory should be makes the cleanup fail.
        std::fs::write(dir.path().join("gen-00001.tmp"), b"x").unwrap();
        assert!(controller.store().abort_generation(1).is_err());
        let err = controller.abandon(
            1,
            RankError::NodeMismatch {
                partition: 0,
                expected: 1,
                found: 2,
            },
        );
        assert!(matches!(err, RankError::NodeMismatch { .. }));
        assert!(!err.is_retryable());

        std::fs::remove_file(dir.path().join("gen-00001.tmp")).unwrap();
        controller.store().begin_generation(1).unwrap();
        let err = controller.abandon(1, RankError::Cancelled);
        assert!(matches!(err, RankError::Cancelled));
        assert_eq!(controller.store().remove_stale().unwrap(), 0);
    }

    #[test]
    fn test_cancel_handle() {
        let h = CancelHandle::default();
        let other = h.clone();
        assert!(h.check().is_ok());
        other.cancel();
        assert!(matches!(h.check(), Err(RankError::Cancelled)));
    }
}
