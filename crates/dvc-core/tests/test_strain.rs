use approx::assert_abs_diff_eq;
use ndarray::{Array3, Array4};

use dvc_core::consts::RECORD_CHANNELS;
use dvc_core::strain::{sobel, strain_tensor};

fn grid_from(f: impl Fn(usize, usize, usize, usize) -> f64) -> Array4<f64> {
    Array4::from_shape_fn((5, 5, 5, RECORD_CHANNELS), |(i, j, k, c)| f(i, j, k, c))
}

#[test]
fn test_sobel_of_ramp() {
    let ramp = Array3::from_shape_fn((5, 5, 5), |(x, _, _)| x as f64);
    let d = sobel(&ramp.view(), 0);
    // (u[x+1] - u[x-1]) * 4 * 4 inside the grid
    assert_abs_diff_eq!(d[[2, 2, 2]], 32.0);
    assert_abs_diff_eq!(sobel(&ramp.view(), 1)[[2, 2, 2]], 0.0);
}

#[test]
fn test_sobel_uses_zero_boundary() {
    let ones = Array3::<f64>::ones((4, 4, 4));
    let d = sobel(&ones.view(), 0);
    assert_abs_diff_eq!(d[[1, 1, 1]], 0.0);
    // At x = 0 the missing neighbour counts as zero: (1 - 0) * 16.
    assert_abs_diff_eq!(d[[0, 1, 1]], 16.0);
    assert_abs_diff_eq!(d[[3, 1, 1]], -16.0);
}

#[test]
fn test_uniform_displacement_has_no_interior_strain() {
    let records = grid_from(|_, _, _, c| [0.7, -1.2, 2.5, 1.0, 0.0, 0.0, 0.0][c]);
    let strain = strain_tensor(&records.view());
    for e in [&strain.xx, &strain.yy, &strain.zz, &strain.xy, &strain.xz, &strain.yz] {
        assert_abs_diff_eq!(e[[2, 2, 2]], 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_linear_stretch() {
    let a = 0.01;
    let records = grid_from(|i, _, _, c| if c == 0 { a * i as f64 } else { 0.0 });
    let strain = strain_tensor(&records.view());
    let g = 32.0 * a;
    assert_abs_diff_eq!(strain.xx[[2, 2, 2]], g + 0.5 * g * g, epsilon = 1e-12);
    assert_abs_diff_eq!(strain.yy[[2, 2, 2]], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(strain.xy[[2, 2, 2]], 0.0, epsilon = 1e-12);
}

#[test]
fn test_linear_shear() {
    let a = 0.01;
    let records = grid_from(|_, j, _, c| if c == 0 { a * j as f64 } else { 0.0 });
    let strain = strain_tensor(&records.view());
    let g = 32.0 * a;
    assert_abs_diff_eq!(strain.xy[[2, 2, 2]], 0.5 * g, epsilon = 1e-12);
    assert_abs_diff_eq!(strain.xx[[2, 2, 2]], 0.5 * g * g, epsilon = 1e-12);
    assert_abs_diff_eq!(strain.xz[[2, 2, 2]], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(strain.yz[[2, 2, 2]], 0.0, epsilon = 1e-12);
}

#[test]
fn test_nan_displacement_propagates() {
    let records = grid_from(|i, j, k, c| {
        if c == 1 && (i, j, k) == (2, 2, 2) {
            f64::NAN
        } else {
            0.0
        }
    });
    let strain = strain_tensor(&records.view());
    assert!(strain.yy[[2, 1, 2]].is_nan());
    assert!(strain.xx[[0, 0, 0]] == 0.0);
}
