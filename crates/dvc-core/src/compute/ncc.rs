//! Normalization steps shared by every correlation backend.

use ndarray::{Array3, ArrayView3, ArrayViewMut3, Zip};

use crate::consts::FLAT_WINDOW_RELATIVE_VARIANCE;

/// Population mean and standard deviation of a patch.
pub fn mean_std(patch: &ArrayView3<f32>) -> (f64, f64) {
    let n = patch.len() as f64;
    if n == 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = patch.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = patch
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

/// Zero-mean, unit-norm kernel: `(k - mean) / (std * N)`.
///
/// With this scaling, `sum(k_n * r) / std_r` over a window equals the
/// zero-normalized cross-correlation. Returns the kernel and its sum, which
/// is zero up to rounding. A flat kernel comes back all NaN.
pub fn normalize_kernel(kernel: &ArrayView3<f32>) -> (Array3<f64>, f64) {
    let (mean, std) = mean_std(kernel);
    let scale = 1.0 / (std * kernel.len() as f64);
    let normalized = kernel.mapv(|v| (v as f64 - mean) * scale);
    let sum = normalized.sum();
    (normalized, sum)
}

/// Turn raw window sums and the raw correlation into mean, std and the
/// normalized correlation, in place.
///
/// On entry `mean` holds the windowed sum, `std` the windowed sum of squares
/// and `corr` the raw cross-correlation with the normalized kernel.
pub fn finalize_window(
    mut mean: ArrayViewMut3<f64>,
    mut std: ArrayViewMut3<f64>,
    mut corr: ArrayViewMut3<f64>,
    kernel_sum: f64,
    window_len: usize,
) {
    let inv_n = 1.0 / window_len as f64;
    Zip::from(&mut mean)
        .and(&mut std)
        .and(&mut corr)
        .for_each(|m, s, c| {
            let mu = *m * inv_n;
            let mean_sq = *s * inv_n;
            let var = mean_sq - mu * mu;
            let sigma = var.max(0.0).sqrt();
            *c = if var <= FLAT_WINDOW_RELATIVE_VARIANCE * mean_sq || mean_sq == 0.0 {
                f64::NAN
            } else {
                (*c - kernel_sum * mu) / sigma
            };
            *m = mu;
            *s = sigma;
        });
}
