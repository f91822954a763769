use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::consts::{DEFAULT_BATCH_SIZE, DEFAULT_INTERPOLATION_ORDER};
use crate::error::{DvcError, Result};

/// Run parameters for one correlation run.
///
/// Construct once, then call [`DvcConfig::resolve`] to obtain the immutable
/// [`ResolvedConfig`] that the engine consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DvcConfig {
    /// Reference window cut from the reference volume.
    pub kernel_shape: [usize; 3],
    /// Search window cut from the deformed volume. Must be >= `kernel_shape`.
    pub roi_shape: [usize; 3],
    /// Voxel spacing between subvolume sampling positions.
    pub stride_shape: [usize; 3],
    #[serde(default)]
    pub subvoxel_mode: SubvoxelMode,
    #[serde(default)]
    pub calculation_mode: CalculationMode,
    /// Workers per CPU host or per GPU device. 0 derives it from the hardware.
    #[serde(default)]
    pub workers_per_backend_unit: usize,
    /// Optimal filter order; the filter cube side is `order + 1`.
    #[serde(default = "default_interpolation_order")]
    pub interpolation_order: usize,
    /// Kernels with a standard deviation at or below this are rejected.
    #[serde(default)]
    pub std_threshold: f64,
    /// Expand the per-subvolume records into a per-voxel field.
    #[serde(default)]
    pub map_displacements: bool,
    /// Compute the Green-Lagrange strain tensor of the displacement grid.
    #[serde(default)]
    pub compute_strain: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub singular_fit: SingularFitPolicy,
}

fn default_interpolation_order() -> usize {
    DEFAULT_INTERPOLATION_ORDER
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for DvcConfig {
    fn default() -> Self {
        Self {
            kernel_shape: [16, 16, 16],
            roi_shape: [32, 32, 32],
            stride_shape: [8, 8, 8],
            subvoxel_mode: SubvoxelMode::default(),
            calculation_mode: CalculationMode::default(),
            workers_per_backend_unit: 0,
            interpolation_order: DEFAULT_INTERPOLATION_ORDER,
            std_threshold: 0.0,
            map_displacements: false,
            compute_strain: false,
            batch_size: DEFAULT_BATCH_SIZE,
            singular_fit: SingularFitPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubvoxelMode {
    #[default]
    Disabled,
    OptimalFilter,
}

impl std::fmt::Display for SubvoxelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::OptimalFilter => write!(f, "Optimal Filter"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationMode {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl std::fmt::Display for CalculationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "Auto"),
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu => write!(f, "GPU"),
        }
    }
}

/// What to do when the sub-voxel normal equations cannot be solved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingularFitPolicy {
    /// Keep the integer displacement for that subvolume and carry on.
    #[default]
    KeepInteger,
    /// Abort the run with a worker error.
    Fail,
}

impl std::fmt::Display for SingularFitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepInteger => write!(f, "Keep Integer"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

/// Hardware facts needed to resolve a config.
pub trait DeviceProbe {
    fn host_cores(&self) -> usize;
    /// Number of usable GPU devices. 0 when GPU support is absent.
    fn gpu_devices(&self) -> usize;
}

/// Probes the machine the process runs on.
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn host_cores(&self) -> usize {
        rayon::current_num_threads().max(1)
    }

    fn gpu_devices(&self) -> usize {
        #[cfg(feature = "gpu")]
        {
            crate::compute::wgpu_backend::probe_device_count()
        }
        #[cfg(not(feature = "gpu"))]
        {
            0
        }
    }
}

/// Concrete backend chosen at resolution time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendPlan {
    Cpu,
    Gpu { devices: usize },
}

impl BackendPlan {
    /// Number of independent backend units (hosts or devices).
    pub fn units(&self) -> usize {
        match self {
            Self::Cpu => 1,
            Self::Gpu { devices } => *devices,
        }
    }
}

impl std::fmt::Display for BackendPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu { devices } => write!(f, "GPU ({devices} device(s))"),
        }
    }
}

/// Immutable, validated run parameters with a concrete backend plan.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    config: DvcConfig,
    plan: BackendPlan,
}

impl ResolvedConfig {
    /// The concrete config: calculation mode and worker count are explicit,
    /// so resolving it again yields the same `ResolvedConfig`.
    pub fn config(&self) -> &DvcConfig {
        &self.config
    }

    pub fn plan(&self) -> BackendPlan {
        self.plan
    }

    pub fn workers_per_unit(&self) -> usize {
        self.config.workers_per_backend_unit
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers_per_backend_unit * self.plan.units()
    }

    pub fn filter_size(&self) -> usize {
        self.config.interpolation_order + 1
    }

    pub fn refine_enabled(&self) -> bool {
        self.config.subvoxel_mode == SubvoxelMode::OptimalFilter
    }

    /// Offset of the kernel window inside the ROI window, per axis.
    pub fn kernel_offset(&self) -> [usize; 3] {
        let c = &self.config;
        std::array::from_fn(|d| (c.roi_shape[d] - c.kernel_shape[d]) / 2)
    }

    /// Shape of the valid correlation volume: `roi - kernel + 1`.
    pub fn correlation_shape(&self) -> [usize; 3] {
        let c = &self.config;
        std::array::from_fn(|d| c.roi_shape[d] - c.kernel_shape[d] + 1)
    }
}

impl DvcConfig {
    /// Validate and resolve against the current machine.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.resolve_with(&SystemProbe)
    }

    pub fn resolve_with(&self, probe: &dyn DeviceProbe) -> Result<ResolvedConfig> {
        self.validate()?;

        let plan = match self.calculation_mode {
            CalculationMode::Cpu => BackendPlan::Cpu,
            CalculationMode::Gpu => {
                let devices = probe.gpu_devices();
                if devices == 0 {
                    return Err(DvcError::BackendUnavailable(
                        "GPU calculation requested but no usable GPU device was found".into(),
                    ));
                }
                BackendPlan::Gpu { devices }
            }
            CalculationMode::Auto => match probe.gpu_devices() {
                0 => {
                    debug!("No usable GPU, falling back to CPU");
                    BackendPlan::Cpu
                }
                devices => BackendPlan::Gpu { devices },
            },
        };

        let workers_per_unit = if self.workers_per_backend_unit > 0 {
            self.workers_per_backend_unit
        } else {
            match plan {
                BackendPlan::Cpu => probe.host_cores().max(1),
                BackendPlan::Gpu { devices } => (probe.host_cores() / devices).max(1),
            }
        };

        let mut config = self.clone();
        config.calculation_mode = match plan {
            BackendPlan::Cpu => CalculationMode::Cpu,
            BackendPlan::Gpu { .. } => CalculationMode::Gpu,
        };
        config.workers_per_backend_unit = workers_per_unit;

        info!(
            backend = %plan,
            workers_per_unit,
            subvoxel = %config.subvoxel_mode,
            "Resolved DVC configuration"
        );

        Ok(ResolvedConfig { config, plan })
    }

    fn validate(&self) -> Result<()> {
        for d in 0..3 {
            if self.kernel_shape[d] == 0 || self.roi_shape[d] == 0 {
                return Err(DvcError::InvalidConfig(format!(
                    "kernel {:?} and ROI {:?} must be positive on every axis",
                    self.kernel_shape, self.roi_shape
                )));
            }
            if self.kernel_shape[d] > self.roi_shape[d] {
                return Err(DvcError::InvalidConfig(format!(
                    "kernel {:?} exceeds ROI {:?} on axis {d}",
                    self.kernel_shape, self.roi_shape
                )));
            }
            if self.stride_shape[d] == 0 {
                return Err(DvcError::InvalidConfig(format!(
                    "stride {:?} must be at least 1 on every axis",
                    self.stride_shape
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(DvcError::InvalidConfig("batch size must be at least 1".into()));
        }
        if self.std_threshold.is_nan() || self.std_threshold < 0.0 {
            return Err(DvcError::InvalidConfig(format!(
                "std threshold {} must be a non-negative number",
                self.std_threshold
            )));
        }
        if self.subvoxel_mode == SubvoxelMode::OptimalFilter {
            let filter_size = self.interpolation_order + 1;
            if filter_size % 2 != 0 {
                return Err(DvcError::InvalidConfig(format!(
                    "interpolation order {} gives odd filter size {filter_size}; use an odd order",
                    self.interpolation_order
                )));
            }
            if self.kernel_shape.iter().any(|&k| k < filter_size) {
                return Err(DvcError::InvalidConfig(format!(
                    "kernel {:?} is smaller than the optimal filter ({filter_size}) on some axis",
                    self.kernel_shape
                )));
            }
        }
        Ok(())
    }
}

/// Number of subvolumes per axis: `ceil((volume - roi + 1) / stride)`.
pub fn subvolume_counts(
    volume_shape: [usize; 3],
    roi_shape: [usize; 3],
    stride_shape: [usize; 3],
) -> Result<[usize; 3]> {
    if (0..3).any(|d| volume_shape[d] < roi_shape[d]) {
        return Err(DvcError::VolumeTooSmall {
            volume: volume_shape,
            roi: roi_shape,
        });
    }
    if stride_shape.contains(&0) {
        return Err(DvcError::InvalidConfig(format!(
            "stride {stride_shape:?} must be at least 1 on every axis"
        )));
    }
    Ok(std::array::from_fn(|d| {
        (volume_shape[d] - roi_shape[d] + 1).div_ceil(stride_shape[d])
    }))
}
