use std::time::Duration;

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::{DvcError, Result};
use crate::strain::StrainTensor;

/// Progress and cancellation hooks for a run.
///
/// Both methods are called from the thread that started the run. The
/// defaults do nothing, so implementors only override what they need.
pub trait ProgressReporter: Send + Sync {
    /// Fraction of subvolumes finished, monotone in `[0, 1]`.
    fn set_progress(&self, _fraction: f64) {}

    /// Return `Err(DvcError::Cancelled)` to abort the run.
    fn throw_if_cancelled(&self) -> Result<()> {
        Ok(())
    }
}

/// Reporter that ignores progress and never cancels.
pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}

/// Wall time spent per stage of batch processing.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageTimings {
    pub extract: Duration,
    pub correlate: Duration,
    pub refine: Duration,
}

impl std::ops::AddAssign for StageTimings {
    fn add_assign(&mut self, rhs: Self) {
        self.extract += rhs.extract;
        self.correlate += rhs.correlate;
        self.refine += rhs.refine;
    }
}

/// What a worker did with one batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchTally {
    pub count: usize,
    pub rejected: usize,
    pub refined: usize,
    pub refine_fallbacks: usize,
    pub timings: StageTimings,
}

/// Message from a worker to the aggregator.
#[derive(Debug)]
pub enum Completion {
    Completed { batch: usize, tally: BatchTally },
    Failed(DvcError),
}

/// Summary of a finished run, suitable for a JSON run log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub backend: String,
    pub workers: usize,
    pub grid: [usize; 3],
    pub subvolumes: usize,
    pub batches: usize,
    pub rejected: usize,
    pub refined: usize,
    pub refine_fallbacks: usize,
    pub elapsed_secs: f64,
    pub extract_secs: f64,
    pub correlate_secs: f64,
    pub refine_secs: f64,
    pub mapping_secs: f64,
    pub strain_secs: f64,
}

impl RunStats {
    pub(crate) fn absorb(&mut self, tally: &BatchTally) {
        self.batches += 1;
        self.subvolumes += tally.count;
        self.rejected += tally.rejected;
        self.refined += tally.refined;
        self.refine_fallbacks += tally.refine_fallbacks;
        self.extract_secs += tally.timings.extract.as_secs_f64();
        self.correlate_secs += tally.timings.correlate.as_secs_f64();
        self.refine_secs += tally.timings.refine.as_secs_f64();
    }

    /// Average worker time per subvolume, in milliseconds, summed over the
    /// extract, correlate and refine stages.
    pub fn per_subvolume_ms(&self) -> f64 {
        if self.subvolumes == 0 {
            return 0.0;
        }
        let busy = self.extract_secs + self.correlate_secs + self.refine_secs;
        busy * 1000.0 / self.subvolumes as f64
    }

    /// Subvolumes per second of wall time.
    pub fn throughput(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.subvolumes as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// Primary output of a run.
#[derive(Clone, Debug)]
pub enum DvcOutput {
    /// `(cx, cy, cz, 7)`: dx, dy, dz, corr_max, i, j, k per subvolume.
    Records(Array4<f64>),
    /// Per-voxel `(X, Y, Z, 4)` field plus the records it was built from.
    Mapped {
        records: Array4<f64>,
        field: Array4<f64>,
    },
}

impl DvcOutput {
    /// The array the caller asked for: records, or the mapped field.
    pub fn into_array(self) -> Array4<f64> {
        match self {
            Self::Records(records) => records,
            Self::Mapped { field, .. } => field,
        }
    }
}

/// Everything a successful run produces.
#[derive(Clone, Debug)]
pub struct DvcRun {
    pub output: DvcOutput,
    pub strain: Option<StrainTensor>,
    pub stats: RunStats,
}

impl DvcRun {
    /// The subvolume record grid, whether or not it was mapped.
    pub fn records(&self) -> ArrayView4<'_, f64> {
        match &self.output {
            DvcOutput::Records(records) | DvcOutput::Mapped { records, .. } => records.view(),
        }
    }

    pub fn mapped(&self) -> Option<ArrayView4<'_, f64>> {
        match &self.output {
            DvcOutput::Records(_) => None,
            DvcOutput::Mapped { field, .. } => Some(field.view()),
        }
    }
}
