use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use dvc_core::config::{DvcConfig, SubvoxelMode};
use dvc_core::engine::{run_resolved, ProgressReporter};
use dvc_core::synthetic::{half_voxel_average, random_volume, smooth_random_volume, translate};
use dvc_core::volume::Volume;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::runlog::{displacement_error, write_run_log, RunLog};
use crate::summary::{print_run_stats, print_run_summary};

use super::{parse_triple, ModeArg};

#[derive(Args)]
pub struct RunArgs {
    /// Volume shape: one side length or "x,y,z"
    #[arg(long, default_value = "64")]
    pub shape: String,

    /// Seed for the synthetic reference volume
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Box-blur radius applied to the reference noise (0 = raw noise)
    #[arg(long, default_value = "1")]
    pub smooth: usize,

    /// Integer shift applied to build the deformed volume: "dx,dy,dz"
    #[arg(long, default_value = "2,-1,1", allow_hyphen_values = true)]
    pub shift: String,

    /// Deform by a half-voxel average instead of an integer shift
    #[arg(long)]
    pub half_voxel: bool,

    /// Run config file (TOML); replaces the shape flags below
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Kernel shape: one side length or "x,y,z"
    #[arg(long, default_value = "16")]
    pub kernel: String,

    /// ROI shape: one side length or "x,y,z"
    #[arg(long, default_value = "32")]
    pub roi: String,

    /// Stride between subvolumes: one value or "x,y,z"
    #[arg(long, default_value = "8")]
    pub stride: String,

    /// Enable optimal-filter sub-voxel refinement
    #[arg(long)]
    pub subvoxel: bool,

    /// Optimal filter interpolation order (filter size = order + 1, must be even)
    #[arg(long, default_value = "3")]
    pub order: usize,

    /// Backend selection
    #[arg(long, value_enum, default_value = "auto")]
    pub mode: ModeArg,

    /// Workers per CPU host or GPU device (0 = derive from hardware)
    #[arg(long, default_value = "0")]
    pub workers: usize,

    /// Reject kernels whose standard deviation is at or below this
    #[arg(long, default_value = "0.0")]
    pub threshold: f64,

    /// Subvolumes per worker batch
    #[arg(long, default_value = "64")]
    pub batch: usize,

    /// Expand results to a per-voxel field
    #[arg(long)]
    pub map: bool,

    /// Compute the strain tensor of the displacement grid
    #[arg(long)]
    pub strain: bool,

    /// Write a JSON run log (config + statistics) to this path
    #[arg(long)]
    pub log: Option<PathBuf>,
}

/// Drives an indicatif bar from engine progress.
struct BarReporter {
    bar: ProgressBar,
}

impl ProgressReporter for BarReporter {
    fn set_progress(&self, fraction: f64) {
        self.bar.set_position((fraction * 100.0).round() as u64);
    }
}

pub fn run(args: &RunArgs) -> Result<()> {
    let config = if let Some(ref config_path) = args.config {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        info!("Loaded config from {}", config_path.display());
        toml::from_str(&contents).context("Invalid DVC config")?
    } else {
        build_config_from_args(args)?
    };
    let resolved = config.resolve().context("Failed to resolve DVC config")?;

    let shape = parse_triple::<usize>(&args.shape).context("Invalid --shape")?;
    let reference = if args.smooth > 0 {
        smooth_random_volume(shape, args.seed, args.smooth)
    } else {
        random_volume(shape, args.seed)
    };
    let (deformed, expected): (Volume, [f64; 3]) = if args.half_voxel {
        (half_voxel_average(&reference.view()), [-0.5; 3])
    } else {
        let shift = parse_triple::<isize>(&args.shift).context("Invalid --shift")?;
        (
            translate(&reference.view(), shift),
            shift.map(|s| s as f64),
        )
    };

    print_run_summary(&resolved, shape, expected);

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:12} [{bar:40}] {pos}%")?
            .progress_chars("=> "),
    );
    bar.set_message("Correlating");
    let reporter = BarReporter { bar };

    let result = run_resolved(reference.view(), deformed.view(), &resolved, &reporter)
        .context("DVC run failed")?;
    reporter.bar.finish_with_message("Done");

    let error = displacement_error(&result.records(), expected);
    print_run_stats(&result.stats, &error);

    if let Some(ref strain) = result.strain {
        let mean = |a: &ndarray::Array3<f64>| {
            let finite: Vec<f64> = a.iter().copied().filter(|v| v.is_finite()).collect();
            finite.iter().sum::<f64>() / finite.len().max(1) as f64
        };
        println!(
            "  Mean strain xx/yy/zz: {:.4} / {:.4} / {:.4}",
            mean(&strain.xx),
            mean(&strain.yy),
            mean(&strain.zz)
        );
    }
    if let Some(field) = result.mapped() {
        println!("  Mapped field: {:?}", field.shape());
    }

    if let Some(ref path) = args.log {
        let log = RunLog {
            config: resolved.config().clone(),
            backend: resolved.plan().to_string(),
            volume_shape: shape,
            expected_displacement: expected,
            error,
            stats: result.stats.clone(),
        };
        write_run_log(path, &log)?;
        println!("\nRun log saved to {}", path.display());
    }

    Ok(())
}

fn build_config_from_args(args: &RunArgs) -> Result<DvcConfig> {
    Ok(DvcConfig {
        kernel_shape: parse_triple(&args.kernel).context("Invalid --kernel")?,
        roi_shape: parse_triple(&args.roi).context("Invalid --roi")?,
        stride_shape: parse_triple(&args.stride).context("Invalid --stride")?,
        subvoxel_mode: if args.subvoxel {
            SubvoxelMode::OptimalFilter
        } else {
            SubvoxelMode::Disabled
        },
        calculation_mode: args.mode.into(),
        workers_per_backend_unit: args.workers,
        interpolation_order: args.order,
        std_threshold: args.threshold,
        map_displacements: args.map,
        compute_strain: args.strain,
        batch_size: args.batch,
        ..DvcConfig::default()
    })
}
