pub mod compute;
pub mod config;
pub mod consts;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod output;
pub mod strain;
pub mod subvoxel;
pub mod synthetic;
pub mod tasks;
pub mod volume;

pub use config::{CalculationMode, DvcConfig, ResolvedConfig, SubvoxelMode};
pub use engine::{run, run_resolved, DvcOutput, DvcRun, ProgressReporter, RunStats};
pub use error::{DvcError, ErrorKind, Result};
