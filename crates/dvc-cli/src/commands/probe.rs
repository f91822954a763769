use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use dvc_core::config::{DeviceProbe, DvcConfig, SystemProbe};

use super::ModeArg;

#[derive(Args)]
pub struct ProbeArgs {
    /// Backend selection
    #[arg(long, value_enum, default_value = "auto")]
    pub mode: ModeArg,

    /// Workers per CPU host or GPU device (0 = derive from hardware)
    #[arg(long, default_value = "0")]
    pub workers: usize,

    /// Resolve this config file (TOML) instead of the flags above
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn run(args: &ProbeArgs) -> Result<()> {
    let config = if let Some(ref path) = args.config {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents).context("Invalid DVC config")?
    } else {
        DvcConfig {
            calculation_mode: args.mode.into(),
            workers_per_backend_unit: args.workers,
            ..DvcConfig::default()
        }
    };

    let probe = SystemProbe;
    println!("Host cores:   {}", probe.host_cores());
    println!("GPU devices:  {}", probe.gpu_devices());

    let resolved = config
        .resolve_with(&probe)
        .context("Config does not resolve on this machine")?;
    println!("Backend:      {}", resolved.plan());
    println!(
        "Workers:      {} ({} per unit)",
        resolved.worker_count(),
        resolved.workers_per_unit()
    );
    Ok(())
}
