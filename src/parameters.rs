//! Parameters for a PageRank computation.
//!

use crate::error::{RankError, Result};

/// How node structure reaches the aggregation stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Variant {
    /// Structure is re-emitted by the map stage and shuffled every iteration.
    Basic,
    /// Structure stays in the partition files and is merge-joined against
    /// the sorted message stream.
    #[default]
    Schimmy,
}

impl Variant {
    pub fn name(self) -> &'static str {
        match self {
            Variant::Basic => "basic",
            Variant::Schimmy => "schimmy",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RankParameters {
    pub alpha: f64,

    pub partitions: usize,
    pub workers: usize,

    pub variant: Variant,
    pub combiner: bool,

    pub max_task_attempts: usize,
    pub keep_temp_files: bool,
}

impl Default for RankParameters {
    fn default() -> Self {
        RankParameters::new()
    }
}

impl RankParameters {
    pub const DEFAULT_ALPHA: f64 = 0.15;

    pub fn new() -> RankParameters {
        RankParameters {
            alpha: Self::DEFAULT_ALPHA,
            partitions: 4,
            workers: 4,
            variant: Variant::Schimmy,
            combiner: true,
            max_task_attempts: 3,
            keep_temp_files: false,
        }
    }

    /// The random-jump probability α. The remaining 1 − α of each node's
    /// mass follows links.
    ///
    /// Default 0.15
    pub fn set_alpha(mut self, alpha: f64) -> RankParameters {
        self.alpha = alpha;
        self
    }

    /// Number of graph partitions (one task per partition and stage) and
    /// number of worker threads running those tasks.
    ///
    /// The partition count is fixed when generation 0 is created; a store
    /// cannot be resumed with a different one.
    ///
    /// Default 4/4
    pub fn set_concurrency(mut self, partitions: usize, workers: usize) -> RankParameters {
        self.partitions = partitions;
        self.workers = workers;
        self
    }

    /// Default: Variant::Schimmy
    pub fn set_variant(mut self, variant: Variant) -> RankParameters {
        self.variant = variant;
        self
    }

    /// Whether map tasks pre-aggregate messages per destination before
    /// writing them to the shuffle.
    ///
    /// Default true
    pub fn set_combiner(mut self, combiner: bool) -> RankParameters {
        self.combiner = combiner;
        self
    }

    /// How many times a task failing with a retryable error is run before
    /// the iteration is aborted.
    ///
    /// Default 3
    pub fn set_max_task_attempts(mut self, attempts: usize) -> RankParameters {
        self.max_task_attempts = attempts;
        self
    }

    /// Keep spill files and per-iteration scratch directories after the
    /// next generation has been committed.
    ///
    /// Default: false
    pub fn set_keep_temp_files(mut self, keep: bool) -> RankParameters {
        self.keep_temp_files = keep;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.alpha) {
            return Err(RankError::InvalidParameter(format!(
                "the damping factor must be in [0 . . 1), got {}",
                self.alpha
            )));
        }
        if self.partitions == 0 || self.workers == 0 {
            return Err(RankError::InvalidParameter(String::from(
                "partitions and workers must be positive",
            )));
        }
        if self.max_task_attempts == 0 {
            return Err(RankError::InvalidParameter(String::from(
                "at least one task attempt is required",
            )));
        }
        Ok(())
    }
}
