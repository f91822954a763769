use console::Style;
use dvc_core::config::ResolvedConfig;
use dvc_core::RunStats;

use crate::runlog::DisplacementError;

struct Styles {
    title: Style,
    header: Style,
    label: Style,
    value: Style,
    method: Style,
    disabled: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            header: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            method: Style::new().green(),
            disabled: Style::new().dim().yellow(),
        }
    }
}

fn triple<T: std::fmt::Display>(v: [T; 3]) -> String {
    format!("{} x {} x {}", v[0], v[1], v[2])
}

pub fn print_run_summary(resolved: &ResolvedConfig, volume_shape: [usize; 3], expected: [f64; 3]) {
    let s = Styles::new();
    let config = resolved.config();

    println!();
    println!("  {}", s.title.apply_to("Digital Volume Correlation"));
    println!("  {}", s.title.apply_to("\u{2550}".repeat(26)));
    println!();

    println!(
        "  {:<14}{}",
        s.label.apply_to("Volume"),
        s.value.apply_to(triple(volume_shape))
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Expected"),
        s.value.apply_to(format!(
            "({:+.2}, {:+.2}, {:+.2})",
            expected[0], expected[1], expected[2]
        ))
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Backend"),
        s.method.apply_to(resolved.plan())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Workers"),
        s.value.apply_to(format!(
            "{} ({} per unit)",
            resolved.worker_count(),
            resolved.workers_per_unit()
        ))
    );
    println!();

    println!("  {}", s.header.apply_to("Subvolumes"));
    println!(
        "    {:<12}{}",
        s.label.apply_to("Kernel"),
        s.value.apply_to(triple(config.kernel_shape))
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("ROI"),
        s.value.apply_to(triple(config.roi_shape))
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Stride"),
        s.value.apply_to(triple(config.stride_shape))
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Batch"),
        s.value.apply_to(config.batch_size)
    );
    if config.std_threshold > 0.0 {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Threshold"),
            s.value.apply_to(config.std_threshold)
        );
    }
    println!();

    println!("  {}", s.header.apply_to("Sub-voxel"));
    if resolved.refine_enabled() {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Method"),
            s.method.apply_to(config.subvoxel_mode)
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Filter"),
            s.value.apply_to(resolved.filter_size())
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Singular"),
            s.value.apply_to(config.singular_fit)
        );
    } else {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Method"),
            s.disabled.apply_to("integer only")
        );
    }

    let extras = [
        ("mapping", config.map_displacements),
        ("strain", config.compute_strain),
    ];
    let enabled: Vec<&str> = extras.iter().filter(|(_, on)| *on).map(|(n, _)| *n).collect();
    if !enabled.is_empty() {
        println!();
        println!(
            "  {:<14}{}",
            s.label.apply_to("Post"),
            s.method.apply_to(enabled.join(", "))
        );
    }
    println!();
}

pub fn print_run_stats(stats: &RunStats, error: &DisplacementError) {
    let s = Styles::new();

    println!();
    println!("  {}", s.header.apply_to("Results"));
    println!(
        "    {:<12}{}",
        s.label.apply_to("Grid"),
        s.value.apply_to(triple(stats.grid))
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Subvolumes"),
        s.value.apply_to(format!(
            "{} in {} batches, {} rejected",
            stats.subvolumes, stats.batches, stats.rejected
        ))
    );
    if stats.refined > 0 || stats.refine_fallbacks > 0 {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Refined"),
            s.value.apply_to(format!(
                "{} ({} kept integer)",
                stats.refined, stats.refine_fallbacks
            ))
        );
    }
    println!(
        "    {:<12}{}",
        s.label.apply_to("Elapsed"),
        s.value.apply_to(format!(
            "{:.2}s ({:.0} subvolumes/s, {:.2} ms each)",
            stats.elapsed_secs,
            stats.throughput(),
            stats.per_subvolume_ms()
        ))
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Stages"),
        s.value.apply_to(format!(
            "extract {:.2}s, correlate {:.2}s, refine {:.2}s",
            stats.extract_secs, stats.correlate_secs, stats.refine_secs
        ))
    );
    println!();

    println!("  {}", s.header.apply_to("Accuracy"));
    if error.valid == 0 {
        println!("    {}", s.disabled.apply_to("no valid records"));
        return;
    }
    println!(
        "    {:<12}{}",
        s.label.apply_to("Mean |err|"),
        s.value.apply_to(format!(
            "({:.4}, {:.4}, {:.4})",
            error.mean_abs[0], error.mean_abs[1], error.mean_abs[2]
        ))
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Max |err|"),
        s.value.apply_to(format!(
            "({:.4}, {:.4}, {:.4})",
            error.max_abs[0], error.max_abs[1], error.max_abs[2]
        ))
    );
}
