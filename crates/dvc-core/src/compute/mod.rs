//! Correlation backends and sub-voxel refiners.
//!
//! The concrete strategy is picked once, when the config is resolved
//! ([`BackendPlan`]); each worker thread then calls [`create_worker_backend`]
//! to build its own instances. Nothing downstream branches on the mode.

pub mod cpu;
pub(crate) mod ncc;
#[cfg(feature = "gpu")]
pub mod wgpu_backend;

use ndarray::{Array4, ArrayView3, Axis};

use crate::config::{BackendPlan, ResolvedConfig};
use crate::error::Result;
use crate::volume::PatchBatch;

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// Per-item windowed statistics and normalized correlation for one batch.
///
/// Every array has shape `(len, cx, cy, cz)` with `c = roi - kernel + 1`.
#[derive(Clone, Debug)]
pub struct CorrelationBatch {
    pub mean: Array4<f64>,
    pub std: Array4<f64>,
    pub correlation: Array4<f64>,
}

impl CorrelationBatch {
    pub(crate) fn zeros(len: usize, shape: [usize; 3]) -> Self {
        let dim = (len, shape[0], shape[1], shape[2]);
        Self {
            mean: Array4::zeros(dim),
            std: Array4::zeros(dim),
            correlation: Array4::zeros(dim),
        }
    }

    pub fn len(&self) -> usize {
        self.correlation.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn correlation(&self, item: usize) -> ArrayView3<'_, f64> {
        self.correlation.index_axis(Axis(0), item)
    }
}

/// Batched normalized cross-correlation of kernels against ROIs.
pub trait CorrelationBackend: Sealed {
    fn name(&self) -> &str;

    fn correlate(&mut self, batch: &PatchBatch) -> Result<CorrelationBatch>;
}

/// Fractional offset between two equal-shaped patches.
pub trait SubvoxelRefiner: Sealed {
    fn refine(&mut self, reference: &ArrayView3<f32>, roi: &ArrayView3<f32>) -> Result<[f64; 3]>;
}

/// Backend instances owned by one worker thread.
pub struct WorkerBackend {
    pub correlator: Box<dyn CorrelationBackend>,
    pub refiner: Option<Box<dyn SubvoxelRefiner>>,
}

/// Instantiate the resolved strategy for one worker bound to backend `unit`.
pub fn create_worker_backend(resolved: &ResolvedConfig, unit: usize) -> Result<WorkerBackend> {
    let config = resolved.config();
    match resolved.plan() {
        BackendPlan::Cpu => {
            let correlator = cpu::CpuCorrelator::new(config.kernel_shape, config.roi_shape);
            let refiner = resolved.refine_enabled().then(|| {
                Box::new(cpu::CpuRefiner::new(resolved.filter_size())) as Box<dyn SubvoxelRefiner>
            });
            Ok(WorkerBackend {
                correlator: Box::new(correlator),
                refiner,
            })
        }
        #[cfg(feature = "gpu")]
        BackendPlan::Gpu { devices } => {
            let device = wgpu_backend::WgpuDevice::open(unit % devices.max(1))?;
            let correlator =
                wgpu_backend::WgpuCorrelator::new(device.clone(), config.kernel_shape, config.roi_shape);
            let refiner = resolved.refine_enabled().then(|| {
                Box::new(wgpu_backend::WgpuRefiner::new(device, resolved.filter_size()))
                    as Box<dyn SubvoxelRefiner>
            });
            Ok(WorkerBackend {
                correlator: Box::new(correlator),
                refiner,
            })
        }
        #[cfg(not(feature = "gpu"))]
        BackendPlan::Gpu { .. } => {
            let _ = unit;
            Err(crate::error::DvcError::BackendUnavailable(
                "built without the `gpu` feature".into(),
            ))
        }
    }
}

/// Location and value of the largest non-NaN sample, first in row-major order.
///
/// Returns `None` when every sample is NaN.
pub fn find_peak(volume: &ArrayView3<f64>) -> Option<([usize; 3], f64)> {
    let mut best: Option<([usize; 3], f64)> = None;
    for ((x, y, z), &v) in volume.indexed_iter() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some(([x, y, z], v)),
        }
    }
    best
}
