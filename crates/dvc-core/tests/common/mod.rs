#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ndarray::ArrayView4;

use dvc_core::config::{CalculationMode, DeviceProbe, DvcConfig, ResolvedConfig};
use dvc_core::engine::ProgressReporter;
use dvc_core::error::{DvcError, Result};

/// Probe with fixed hardware facts.
pub struct FixedProbe {
    pub cores: usize,
    pub gpus: usize,
}

impl DeviceProbe for FixedProbe {
    fn host_cores(&self) -> usize {
        self.cores
    }

    fn gpu_devices(&self) -> usize {
        self.gpus
    }
}

/// CPU config with the given shapes and an explicit worker count.
pub fn cpu_config(kernel: usize, roi: usize, stride: usize, workers: usize) -> DvcConfig {
    DvcConfig {
        kernel_shape: [kernel; 3],
        roi_shape: [roi; 3],
        stride_shape: [stride; 3],
        calculation_mode: CalculationMode::Cpu,
        workers_per_backend_unit: workers,
        ..DvcConfig::default()
    }
}

/// Resolve against a fixed 4-core, GPU-less machine.
pub fn resolve_cpu(config: &DvcConfig) -> ResolvedConfig {
    config
        .resolve_with(&FixedProbe { cores: 4, gpus: 0 })
        .expect("config should resolve")
}

/// Records every progress fraction it is given.
#[derive(Default)]
pub struct RecordingReporter {
    pub fractions: Mutex<Vec<f64>>,
}

impl ProgressReporter for RecordingReporter {
    fn set_progress(&self, fraction: f64) {
        self.fractions.lock().unwrap().push(fraction);
    }
}

/// Cancels once `throw_if_cancelled` has been called `after` times.
pub struct CancelAfter {
    pub after: usize,
    pub calls: AtomicUsize,
}

impl CancelAfter {
    pub fn new(after: usize) -> Self {
        Self {
            after,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ProgressReporter for CancelAfter {
    fn throw_if_cancelled(&self) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.after {
            Err(DvcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Bitwise comparison that treats NaN == NaN.
pub fn assert_records_identical(a: &ArrayView4<f64>, b: &ArrayView4<f64>) {
    assert_eq!(a.dim(), b.dim(), "record grids differ in shape");
    for ((pos, x), y) in a.indexed_iter().zip(b.iter()) {
        assert_eq!(
            x.to_bits(),
            y.to_bits(),
            "records differ at {pos:?}: {x} vs {y}"
        );
    }
}
