//! Run orchestration: task feeding, the worker pool and aggregation.
//!
//! One feeder thread pushes [`TaskBatch`]es into a bounded channel, `W`
//! worker threads correlate them and write disjoint cells of a shared grid,
//! and the calling thread aggregates completions. Everything runs inside a
//! `std::thread::scope`, so the volumes are borrowed and every thread is
//! joined before a run returns.

mod aggregator;
pub mod types;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Sender};
use ndarray::ArrayView3;
use tracing::{info, warn};

use crate::config::{subvolume_counts, DvcConfig, ResolvedConfig};
use crate::consts::TASK_QUEUE_BATCHES_PER_WORKER;
use crate::error::Result;
use crate::mapping::map_displacements;
use crate::output::SharedGrid;
use crate::strain::strain_tensor;
use crate::tasks::{TaskBatch, TaskGenerator};
use crate::volume::check_pair;

pub use types::{
    BatchTally, Completion, DvcOutput, DvcRun, NoOpReporter, ProgressReporter, RunStats,
    StageTimings,
};

use worker::WorkerShared;

/// Resolve `config` against this machine and run.
pub fn run(
    reference: ArrayView3<f32>,
    deformed: ArrayView3<f32>,
    config: &DvcConfig,
    reporter: &dyn ProgressReporter,
) -> Result<DvcRun> {
    let resolved = config.resolve()?;
    run_resolved(reference, deformed, &resolved, reporter)
}

/// Correlate `deformed` against `reference` with an already resolved config.
pub fn run_resolved(
    reference: ArrayView3<f32>,
    deformed: ArrayView3<f32>,
    resolved: &ResolvedConfig,
    reporter: &dyn ProgressReporter,
) -> Result<DvcRun> {
    let config = resolved.config();
    let volume_shape = check_pair(&reference, &deformed)?;
    let counts = subvolume_counts(volume_shape, config.roi_shape, config.stride_shape)?;
    reporter.throw_if_cancelled()?;

    let tasks = TaskGenerator::new(counts, config.batch_size);
    let total = tasks.total_count();
    let workers = resolved.worker_count().min(tasks.batch_count()).max(1);
    info!(
        volume = ?volume_shape,
        grid = ?counts,
        subvolumes = total,
        batches = tasks.batch_count(),
        workers,
        backend = %resolved.plan(),
        "Starting DVC run"
    );

    let started = Instant::now();
    let grid = SharedGrid::new(counts);
    let stop = AtomicBool::new(false);
    let mut stats = RunStats {
        backend: resolved.plan().to_string(),
        workers,
        grid: counts,
        ..RunStats::default()
    };

    let shared = WorkerShared {
        resolved,
        reference,
        deformed,
        grid: &grid,
        stop: &stop,
    };

    thread::scope(|scope| {
        let (task_tx, task_rx) = bounded::<TaskBatch>(TASK_QUEUE_BATCHES_PER_WORKER * workers);
        let (done_tx, done_rx) = unbounded();

        let feeder = scope.spawn(|| feed(tasks, task_tx, &stop));
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let tasks = task_rx.clone();
                let done = done_tx.clone();
                scope.spawn(move || worker::run_worker(id, shared, tasks, done))
            })
            .collect();
        drop(task_rx);
        drop(done_tx);

        let result = aggregator::aggregate(&done_rx, total, reporter, &mut stats);

        stop.store(true, Ordering::Release);
        drop(done_rx);
        if feeder.join().is_err() {
            warn!("Task feeder panicked");
        }
        for (id, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(worker = id, "Worker panicked");
            }
        }
        result
    })?;

    let records = grid.into_array()?;
    reporter.set_progress(1.0);

    let strain = if config.compute_strain {
        let t = Instant::now();
        let strain = strain_tensor(&records.view());
        stats.strain_secs = t.elapsed().as_secs_f64();
        Some(strain)
    } else {
        None
    };

    let output = if config.map_displacements {
        let t = Instant::now();
        let field = map_displacements(
            &records.view(),
            volume_shape,
            config.kernel_shape,
            config.stride_shape,
        );
        stats.mapping_secs = t.elapsed().as_secs_f64();
        DvcOutput::Mapped { records, field }
    } else {
        DvcOutput::Records(records)
    };

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        subvolumes = stats.subvolumes,
        rejected = stats.rejected,
        refined = stats.refined,
        refine_fallbacks = stats.refine_fallbacks,
        elapsed_secs = stats.elapsed_secs,
        "DVC run complete"
    );

    Ok(DvcRun {
        output,
        strain,
        stats,
    })
}

/// Push every batch into the task channel, stopping early when the run is
/// over or all workers have gone.
fn feed(tasks: TaskGenerator, sender: Sender<TaskBatch>, stop: &AtomicBool) {
    for batch in tasks {
        if stop.load(Ordering::Acquire) || sender.send(batch).is_err() {
            break;
        }
    }
}
