//! JSON run log: the resolved config, the run statistics and the error
//! against the known synthetic displacement.

use std::path::Path;

use anyhow::{Context, Result};
use dvc_core::config::DvcConfig;
use dvc_core::RunStats;
use ndarray::{ArrayView4, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplacementError {
    /// Records that were not rejected.
    pub valid: usize,
    /// Mean absolute error per axis over the valid records.
    pub mean_abs: [f64; 3],
    /// Largest absolute error per axis.
    pub max_abs: [f64; 3],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunLog {
    pub config: DvcConfig,
    pub backend: String,
    pub volume_shape: [usize; 3],
    pub expected_displacement: [f64; 3],
    pub error: DisplacementError,
    pub stats: RunStats,
}

/// Compare every non-rejected record against a uniform expected shift.
pub fn displacement_error(records: &ArrayView4<f64>, expected: [f64; 3]) -> DisplacementError {
    let mut error = DisplacementError::default();
    for record in records.lanes(Axis(3)) {
        if !record[3].is_finite() {
            continue;
        }
        error.valid += 1;
        for d in 0..3 {
            let e = (record[d] - expected[d]).abs();
            error.mean_abs[d] += e;
            error.max_abs[d] = error.max_abs[d].max(e);
        }
    }
    if error.valid > 0 {
        for m in &mut error.mean_abs {
            *m /= error.valid as f64;
        }
    }
    error
}

pub fn write_run_log(path: &Path, log: &RunLog) -> Result<()> {
    let json = serde_json::to_string_pretty(log)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write run log to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_error_skips_rejected_records() {
        let mut records = Array4::<f64>::zeros((2, 1, 1, 7));
        records[[0, 0, 0, 0]] = 2.5;
        records[[0, 0, 0, 3]] = 0.9;
        records[[1, 0, 0, 0]] = f64::NAN;
        records[[1, 0, 0, 3]] = f64::NAN;

        let error = displacement_error(&records.view(), [2.0, 0.0, 0.0]);
        assert_eq!(error.valid, 1);
        assert!((error.mean_abs[0] - 0.5).abs() < 1e-12);
        assert!((error.max_abs[0] - 0.5).abs() < 1e-12);
        assert_eq!(error.mean_abs[1], 0.0);
    }

    #[test]
    fn test_run_log_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let log = RunLog {
            config: DvcConfig::default(),
            backend: "CPU".into(),
            volume_shape: [32, 32, 32],
            expected_displacement: [1.0, 0.0, -1.0],
            error: DisplacementError::default(),
            stats: RunStats::default(),
        };
        write_run_log(&path, &log).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: RunLog = serde_json::from_str(&text).unwrap();
        assert_eq!(back.backend, "CPU");
        assert_eq!(back.volume_shape, [32, 32, 32]);
        assert_eq!(back.config, DvcConfig::default());
    }
}
