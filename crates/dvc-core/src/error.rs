use thiserror::Error;

#[derive(Error, Debug)]
pub enum DvcError {
    #[error("Volume shape mismatch: reference {reference:?} vs deformed {deformed:?}")]
    ShapeMismatch {
        reference: [usize; 3],
        deformed: [usize; 3],
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Volume {volume:?} is smaller than the ROI {roi:?}")]
    VolumeTooSmall { volume: [usize; 3], roi: [usize; 3] },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Worker {worker} could not start its backend: {message}")]
    WorkerStartup { worker: usize, message: String },

    #[error("Worker failed on batch {batch}: {message}")]
    Worker { batch: usize, message: String },

    #[error("Singular normal equations in sub-voxel fit (filter size {filter_size})")]
    SingularSystem { filter_size: usize },

    #[error("GPU error: {0}")]
    GpuError(String),

    #[error("All workers exited after {completed} of {total} subvolumes")]
    WorkersExited { completed: usize, total: usize },

    #[error("Run cancelled")]
    Cancelled,
}

/// Coarse failure category, as seen by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected before any worker starts.
    Configuration,
    /// Raised while a batch was being processed. Partial output is invalid.
    Worker,
    /// Voluntary abort requested by the caller.
    Cancelled,
}

impl DvcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShapeMismatch { .. }
            | Self::InvalidConfig(_)
            | Self::VolumeTooSmall { .. }
            | Self::BackendUnavailable(_) => ErrorKind::Configuration,
            Self::Worker { .. }
            | Self::WorkerStartup { .. }
            | Self::SingularSystem { .. }
            | Self::GpuError(_)
            | Self::WorkersExited { .. } => ErrorKind::Worker,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Attach the batch id to an error raised inside a worker.
    pub(crate) fn in_batch(self, batch: usize) -> Self {
        match self {
            Self::Worker { .. } | Self::WorkerStartup { .. } | Self::Cancelled => self,
            other => Self::Worker {
                batch,
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, DvcError>;
