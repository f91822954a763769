/// Number of subvolumes handed to a worker at once.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default optimal-filter interpolation order (filter size 4).
pub const DEFAULT_INTERPOLATION_ORDER: usize = 3;

/// Task channel capacity, in batches per worker.
pub const TASK_QUEUE_BATCHES_PER_WORKER: usize = 2;

/// How long the aggregator waits for a completion before polling cancellation.
pub const AGGREGATOR_POLL_INTERVAL_MS: u64 = 100;

/// Windowed variance at or below this fraction of the window's mean square is
/// treated as zero (a flat window), yielding NaN correlation instead of a
/// division by rounding noise.
pub const FLAT_WINDOW_RELATIVE_VARIANCE: f64 = 1e-10;

/// Relative pivot tolerance for the Cholesky solve of the normal equations.
pub const CHOLESKY_RELATIVE_PIVOT: f64 = 1e-12;

/// Minimum voxel count (X*Y*Z) to use Rayon parallelism in post-processing.
pub const PARALLEL_VOXEL_THRESHOLD: usize = 262_144;

/// Number of channels in a record: dx, dy, dz, corr_max, i, j, k.
pub const RECORD_CHANNELS: usize = 7;

/// Number of channels in a mapped voxel: dx, dy, dz, corr_max.
pub const MAPPED_CHANNELS: usize = 4;

/// WGSL workgroup size used by the GPU correlation shaders.
pub const GPU_WORKGROUP_SIZE: u32 = 64;
