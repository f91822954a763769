mod common;

use approx::assert_abs_diff_eq;
use ndarray::{Array3, Axis};

use common::{
    assert_records_identical, cpu_config, resolve_cpu, CancelAfter, FixedProbe,
    RecordingReporter,
};
use dvc_core::config::{CalculationMode, DvcConfig, SingularFitPolicy, SubvoxelMode};
use dvc_core::engine::{run_resolved, DvcOutput, NoOpReporter};
use dvc_core::error::{DvcError, ErrorKind};
use dvc_core::synthetic::{half_voxel_average, random_volume, smooth_random_volume, translate};

// ---------------------------------------------------------------------------
// Grid and record layout
// ---------------------------------------------------------------------------

#[test]
fn test_reference_grid_has_125_subvolumes() {
    let volume = random_volume([64, 64, 64], 1);
    let resolved = resolve_cpu(&cpu_config(16, 32, 8, 4));
    let run = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap();

    let records = run.records();
    assert_eq!(records.dim(), (5, 5, 5, 7));
    assert_eq!(run.stats.subvolumes, 125);
    assert_eq!(run.stats.grid, [5, 5, 5]);
    assert_eq!(run.stats.batches, 2);
}

#[test]
fn test_records_carry_grid_indices() {
    let volume = random_volume([40, 40, 40], 2);
    let resolved = resolve_cpu(&cpu_config(8, 16, 8, 2));
    let run = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap();
    for ((i, j, k, c), &v) in run.records().indexed_iter() {
        match c {
            4 => assert_eq!(v, i as f64),
            5 => assert_eq!(v, j as f64),
            6 => assert_eq!(v, k as f64),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Displacement recovery
// ---------------------------------------------------------------------------

#[test]
fn test_identity_reports_zero_displacement() {
    let volume = random_volume([48, 48, 48], 3);
    let resolved = resolve_cpu(&cpu_config(8, 16, 8, 4));
    let run = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap();

    for record in run.records().lanes(Axis(3)) {
        assert_eq!(record[0], 0.0, "dx in {record}");
        assert_eq!(record[1], 0.0, "dy in {record}");
        assert_eq!(record[2], 0.0, "dz in {record}");
        assert_abs_diff_eq!(record[3], 1.0, epsilon = 1e-5);
    }
    assert_eq!(run.stats.rejected, 0);
}

#[test]
fn test_integer_shift_is_recovered() {
    let shift = [2isize, -1, 3];
    let reference = random_volume([48, 48, 48], 4);
    let deformed = translate(&reference.view(), shift);
    let resolved = resolve_cpu(&cpu_config(8, 16, 8, 4));
    let run = run_resolved(reference.view(), deformed.view(), &resolved, &NoOpReporter).unwrap();

    let records = run.records();
    let (cx, cy, cz, _) = records.dim();
    for i in 1..cx - 1 {
        for j in 1..cy - 1 {
            for k in 1..cz - 1 {
                for d in 0..3 {
                    assert_eq!(
                        records[[i, j, k, d]],
                        shift[d] as f64,
                        "subvolume ({i},{j},{k}) axis {d}"
                    );
                }
                assert!(records[[i, j, k, 3]] > 0.99);
            }
        }
    }
}

#[test]
fn test_subvoxel_refinement_recovers_half_voxel() {
    let reference = random_volume([40, 40, 40], 7);
    let deformed = half_voxel_average(&reference.view());
    let config = DvcConfig {
        subvoxel_mode: SubvoxelMode::OptimalFilter,
        interpolation_order: 3,
        ..cpu_config(8, 16, 8, 4)
    };
    let resolved = resolve_cpu(&config);
    let run = run_resolved(reference.view(), deformed.view(), &resolved, &NoOpReporter).unwrap();

    let records = run.records();
    for record in records.lanes(Axis(3)) {
        for d in 0..3 {
            assert!(
                (record[d] + 0.5).abs() < 0.01,
                "axis {d} of record {record}"
            );
        }
    }
    assert_eq!(run.stats.refined, run.stats.subvolumes);
    assert_eq!(run.stats.refine_fallbacks, 0);
}

#[test]
fn test_smooth_volume_shift_with_refinement() {
    let reference = smooth_random_volume([40, 40, 40], 21, 1);
    let deformed = translate(&reference.view(), [1, 0, -2]);
    let config = DvcConfig {
        subvoxel_mode: SubvoxelMode::OptimalFilter,
        ..cpu_config(8, 16, 8, 2)
    };
    let resolved = resolve_cpu(&config);
    let run = run_resolved(reference.view(), deformed.view(), &resolved, &NoOpReporter).unwrap();

    let r = run.records();
    assert_abs_diff_eq!(r[[2, 2, 2, 0]], 1.0, epsilon = 0.05);
    assert_abs_diff_eq!(r[[2, 2, 2, 1]], 0.0, epsilon = 0.05);
    assert_abs_diff_eq!(r[[2, 2, 2, 2]], -2.0, epsilon = 0.05);
}

// ---------------------------------------------------------------------------
// Rejection
// ---------------------------------------------------------------------------

#[test]
fn test_flat_kernels_are_rejected_without_error() {
    let flat = Array3::<f32>::zeros((40, 40, 40));
    let resolved = resolve_cpu(&cpu_config(8, 16, 8, 2));
    let run = run_resolved(flat.view(), flat.view(), &resolved, &NoOpReporter).unwrap();

    for record in run.records().lanes(Axis(3)) {
        assert!(record.iter().take(4).all(|v| v.is_nan()), "record {record}");
        assert!(record.iter().skip(4).all(|v| !v.is_nan()));
    }
    assert_eq!(run.stats.rejected, run.stats.subvolumes);
}

#[test]
fn test_std_threshold_rejects_low_contrast_kernels() {
    // Left half noisy, right half nearly flat.
    let mut volume = random_volume([48, 40, 40], 5);
    volume
        .slice_mut(ndarray::s![24.., .., ..])
        .mapv_inplace(|v| 0.5 + 0.001 * v);
    let config = DvcConfig {
        std_threshold: 0.01,
        ..cpu_config(8, 16, 8, 2)
    };
    let resolved = resolve_cpu(&config);
    let run = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap();

    let records = run.records();
    // Kernel of subvolume i starts at 8 * i + 4.
    assert_eq!(records[[0, 1, 1, 0]], 0.0);
    assert!(records[[4, 1, 1, 0]].is_nan());
    assert!(records[[4, 1, 1, 3]].is_nan());
    assert!(run.stats.rejected > 0);
}

// ---------------------------------------------------------------------------
// Determinism and progress
// ---------------------------------------------------------------------------

#[test]
fn test_output_independent_of_worker_count() {
    let reference = random_volume([48, 48, 48], 6);
    let deformed = translate(&reference.view(), [1, 1, -1]);

    let single = DvcConfig {
        batch_size: 7,
        ..cpu_config(8, 16, 8, 1)
    };
    let many = DvcConfig {
        batch_size: 3,
        ..cpu_config(8, 16, 8, 6)
    };
    let a = run_resolved(reference.view(), deformed.view(), &resolve_cpu(&single), &NoOpReporter)
        .unwrap();
    let b = run_resolved(reference.view(), deformed.view(), &resolve_cpu(&many), &NoOpReporter)
        .unwrap();
    assert_records_identical(&a.records(), &b.records());
}

#[test]
fn test_progress_is_monotone_and_reaches_one() {
    let volume = random_volume([40, 40, 40], 8);
    let config = DvcConfig {
        batch_size: 5,
        ..cpu_config(8, 16, 8, 3)
    };
    let reporter = RecordingReporter::default();
    run_resolved(volume.view(), volume.view(), &resolve_cpu(&config), &reporter).unwrap();

    let fractions = reporter.fractions.lock().unwrap();
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{fractions:?}");
    assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
    assert_eq!(*fractions.last().unwrap(), 1.0);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn test_cancellation_surfaces_cancelled() {
    let volume = random_volume([64, 64, 64], 9);
    let config = DvcConfig {
        batch_size: 1,
        ..cpu_config(8, 16, 4, 2)
    };
    let reporter = CancelAfter::new(3);
    let err = run_resolved(volume.view(), volume.view(), &resolve_cpu(&config), &reporter)
        .unwrap_err();
    assert!(matches!(err, DvcError::Cancelled), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn test_cancellation_before_start() {
    let volume = random_volume([32, 32, 32], 10);
    let reporter = CancelAfter::new(0);
    let err = run_resolved(
        volume.view(),
        volume.view(),
        &resolve_cpu(&cpu_config(8, 16, 8, 2)),
        &reporter,
    )
    .unwrap_err();
    assert!(matches!(err, DvcError::Cancelled), "got {err:?}");
}

#[test]
fn test_shape_mismatch_is_configuration_error() {
    let a = random_volume([32, 32, 32], 11);
    let b = random_volume([32, 32, 33], 12);
    let err = run_resolved(a.view(), b.view(), &resolve_cpu(&cpu_config(8, 16, 8, 1)), &NoOpReporter)
        .unwrap_err();
    assert!(matches!(err, DvcError::ShapeMismatch { .. }), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_volume_smaller_than_roi_is_configuration_error() {
    let a = random_volume([12, 32, 32], 13);
    let err = run_resolved(a.view(), a.view(), &resolve_cpu(&cpu_config(8, 16, 8, 1)), &NoOpReporter)
        .unwrap_err();
    assert!(matches!(err, DvcError::VolumeTooSmall { .. }), "got {err:?}");
}

#[cfg(not(feature = "gpu"))]
#[test]
fn test_worker_backend_failure_aborts_run() {
    // A GPU plan in a build without GPU support: every worker fails to start.
    let config = DvcConfig {
        calculation_mode: CalculationMode::Gpu,
        workers_per_backend_unit: 2,
        ..cpu_config(8, 16, 8, 2)
    };
    let resolved = config
        .resolve_with(&FixedProbe { cores: 4, gpus: 1 })
        .unwrap();
    let volume = random_volume([32, 32, 32], 14);
    let err = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap_err();
    assert!(matches!(err, DvcError::WorkerStartup { .. }), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Worker);
    assert!(err.to_string().contains("gpu"), "cause lost: {err}");
}

/// Varies along x only, so every sub-voxel normal matrix is singular.
fn x_only_volume(n: usize) -> Array3<f32> {
    Array3::from_shape_fn((n, n, n), |(x, _, _)| (0.7 * x as f32).sin())
}

fn singular_fit_config(policy: SingularFitPolicy) -> DvcConfig {
    DvcConfig {
        subvoxel_mode: SubvoxelMode::OptimalFilter,
        singular_fit: policy,
        batch_size: 16,
        ..cpu_config(8, 16, 8, 2)
    }
}

#[test]
fn test_singular_fit_fails_run_with_worker_error() {
    let volume = x_only_volume(48);
    let resolved = resolve_cpu(&singular_fit_config(SingularFitPolicy::Fail));
    let reporter = RecordingReporter::default();
    let err = run_resolved(volume.view(), volume.view(), &resolved, &reporter).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Worker, "got {err:?}");
    assert!(matches!(err, DvcError::Worker { .. }), "got {err:?}");
    assert!(err.to_string().contains("Singular"), "got {err}");
    // The failure is raised before every subvolume was reported.
    let fractions = reporter.fractions.lock().unwrap();
    assert!(fractions.iter().all(|&f| f < 1.0), "progress {fractions:?}");
}

#[test]
fn test_singular_fit_keeps_integer_displacement() {
    let volume = x_only_volume(48);
    let resolved = resolve_cpu(&singular_fit_config(SingularFitPolicy::KeepInteger));
    let run = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap();

    assert_eq!(run.stats.subvolumes, 125);
    assert_eq!(run.stats.refined, 0);
    assert_eq!(run.stats.refine_fallbacks, run.stats.subvolumes);
    for record in run.records().lanes(Axis(3)) {
        assert_eq!(record[0], 0.0, "dx should stay integer zero: {record:?}");
        for d in 1..3 {
            assert_eq!(record[d].fract(), 0.0, "non-integer displacement {record:?}");
        }
    }
}

// ---------------------------------------------------------------------------
// Post-processing
// ---------------------------------------------------------------------------

#[test]
fn test_mapped_output_keeps_records() {
    let reference = random_volume([40, 40, 40], 15);
    let deformed = translate(&reference.view(), [1, 0, 0]);
    let config = DvcConfig {
        map_displacements: true,
        ..cpu_config(8, 16, 8, 2)
    };
    let run = run_resolved(reference.view(), deformed.view(), &resolve_cpu(&config), &NoOpReporter)
        .unwrap();

    let field = run.mapped().expect("mapped output");
    assert_eq!(field.dim(), (40, 40, 40, 4));
    assert_eq!(run.records().dim(), (4, 4, 4, 7));
    // Voxel 20 on each axis is covered last by subvolume 2 ([16, 24)).
    let records = run.records();
    for c in 0..4 {
        assert_eq!(field[[20, 20, 20, c]], records[[2, 2, 2, c]]);
    }
    // Beyond the last kernel window nothing is written.
    assert!(field.slice(ndarray::s![32.., .., .., ..]).iter().all(|&v| v == 0.0));
    assert!(matches!(run.output, DvcOutput::Mapped { .. }));
}

#[test]
fn test_strain_of_uniform_shift_is_zero_inside() {
    let reference = random_volume([56, 56, 56], 16);
    let deformed = translate(&reference.view(), [1, -1, 2]);
    let config = DvcConfig {
        compute_strain: true,
        ..cpu_config(8, 16, 8, 4)
    };
    let run = run_resolved(reference.view(), deformed.view(), &resolve_cpu(&config), &NoOpReporter)
        .unwrap();
    let strain = run.strain.expect("strain requested");
    assert_eq!(strain.xx.dim(), (6, 6, 6));
    for component in [&strain.xx, &strain.yy, &strain.zz, &strain.xy, &strain.xz, &strain.yz] {
        assert_abs_diff_eq!(component[[2, 3, 2]], 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_auto_mode_runs_on_cpu_without_gpu() {
    let volume = random_volume([32, 32, 32], 17);
    let config = DvcConfig {
        kernel_shape: [8; 3],
        roi_shape: [16; 3],
        stride_shape: [8; 3],
        calculation_mode: CalculationMode::Auto,
        batch_size: 4,
        ..DvcConfig::default()
    };
    let resolved = config
        .resolve_with(&FixedProbe { cores: 2, gpus: 0 })
        .unwrap();
    let run = run_resolved(volume.view(), volume.view(), &resolved, &NoOpReporter).unwrap();
    assert_eq!(run.stats.backend, "CPU");
    assert_eq!(run.stats.workers, 2);
}
