use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use ndarray::{s, ArrayView3};
use tracing::debug;

use crate::compute::ncc::mean_std;
use crate::compute::{create_worker_backend, find_peak, WorkerBackend};
use crate::config::{ResolvedConfig, SingularFitPolicy};
use crate::error::{DvcError, Result};
use crate::output::{DisplacementRecord, SharedGrid};
use crate::tasks::TaskBatch;
use crate::volume::PatchBatch;

use super::types::{BatchTally, Completion};

/// Read-only state shared by all workers of a run.
#[derive(Clone, Copy)]
pub(super) struct WorkerShared<'a> {
    pub resolved: &'a ResolvedConfig,
    pub reference: ArrayView3<'a, f32>,
    pub deformed: ArrayView3<'a, f32>,
    pub grid: &'a SharedGrid,
    pub stop: &'a AtomicBool,
}

struct Worker<'a> {
    shared: WorkerShared<'a>,
    backend: WorkerBackend,
    patches: PatchBatch,
    origins: Vec<([usize; 3], [usize; 3])>,
}

/// Worker thread body: pull batches until the task channel closes or the
/// stop flag is raised.
pub(super) fn run_worker(
    id: usize,
    shared: WorkerShared<'_>,
    tasks: Receiver<TaskBatch>,
    done: Sender<Completion>,
) {
    let resolved = shared.resolved;
    let unit = id % resolved.plan().units().max(1);
    let backend = match create_worker_backend(resolved, unit) {
        Ok(backend) => backend,
        Err(e) => {
            // Device failures after spawn count as worker errors.
            let _ = done.send(Completion::Failed(DvcError::WorkerStartup {
                worker: id,
                message: e.to_string(),
            }));
            return;
        }
    };
    debug!(worker = id, unit, backend = backend.correlator.name(), "Worker started");

    let config = resolved.config();
    let mut worker = Worker {
        shared,
        backend,
        patches: PatchBatch::new(config.batch_size, config.kernel_shape, config.roi_shape),
        origins: Vec::with_capacity(config.batch_size),
    };

    for batch in tasks.iter() {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let message = match worker.process(&batch) {
            Ok(tally) => Completion::Completed {
                batch: batch.id,
                tally,
            },
            Err(e) => Completion::Failed(e.in_batch(batch.id)),
        };
        let failed = matches!(message, Completion::Failed(_));
        if done.send(message).is_err() || failed {
            break;
        }
    }
    debug!(worker = id, "Worker exiting");
}

impl Worker<'_> {
    fn process(&mut self, batch: &TaskBatch) -> Result<BatchTally> {
        let resolved = self.shared.resolved;
        let config = resolved.config();
        let stride = config.stride_shape;
        let offset = resolved.kernel_offset();
        let mut tally = BatchTally {
            count: batch.len(),
            ..BatchTally::default()
        };

        let started = Instant::now();
        self.origins.clear();
        self.origins.extend(batch.indices.iter().map(|idx| {
            let p: [usize; 3] = std::array::from_fn(|d| idx[d] * stride[d]);
            (std::array::from_fn(|d| p[d] + offset[d]), p)
        }));
        self.patches
            .load(&self.shared.reference, &self.shared.deformed, &self.origins);
        tally.timings.extract = started.elapsed();

        let started = Instant::now();
        let correlation = self.backend.correlator.correlate(&self.patches)?;
        tally.timings.correlate = started.elapsed();
        if correlation.len() != batch.len() {
            return Err(DvcError::Worker {
                batch: batch.id,
                message: format!(
                    "backend returned {} results for {} subvolumes",
                    correlation.len(),
                    batch.len()
                ),
            });
        }

        let [kx, ky, kz] = config.kernel_shape;
        for (item, &index) in batch.indices.iter().enumerate() {
            let kernel = self.patches.kernel(item);
            let (_, kernel_std) = mean_std(&kernel);
            if kernel_std.is_nan() || kernel_std <= config.std_threshold {
                tally.rejected += 1;
                self.shared.grid.write(&DisplacementRecord::rejected(index));
                continue;
            }

            let Some((peak, correlation_max)) = find_peak(&correlation.correlation(item)) else {
                tally.rejected += 1;
                self.shared.grid.write(&DisplacementRecord::rejected(index));
                continue;
            };
            let mut displacement: [f64; 3] =
                std::array::from_fn(|d| peak[d] as f64 - offset[d] as f64);

            if let Some(refiner) = self.backend.refiner.as_mut() {
                let started = Instant::now();
                let roi = self.patches.roi(item);
                let window = roi.slice(s![
                    peak[0]..peak[0] + kx,
                    peak[1]..peak[1] + ky,
                    peak[2]..peak[2] + kz
                ]);
                match refiner.refine(&kernel, &window) {
                    Ok(fraction) => {
                        for (d, f) in displacement.iter_mut().zip(fraction) {
                            *d += f;
                        }
                        tally.refined += 1;
                    }
                    Err(DvcError::SingularSystem { filter_size })
                        if config.singular_fit == SingularFitPolicy::KeepInteger =>
                    {
                        debug!(?index, filter_size, "Singular sub-voxel fit, keeping integer shift");
                        tally.refine_fallbacks += 1;
                    }
                    Err(e) => return Err(e),
                }
                tally.timings.refine += started.elapsed();
            }

            self.shared.grid.write(&DisplacementRecord {
                displacement,
                correlation: correlation_max,
                index,
            });
        }

        Ok(tally)
    }
}
