//! Optimal-filter sub-voxel shift estimation.
//!
//! A cubic interpolation filter `f` of side `filter_size` is fitted in the
//! least-squares sense so that filtering the reference patch reproduces the
//! ROI patch. The filter's centre of mass along each axis is the fractional
//! shift between the two patches.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array3, ArrayView3};

use crate::consts::CHOLESKY_RELATIVE_PIVOT;
use crate::error::{DvcError, Result};

/// Fractional shift `(ox, oy, oz)` of `target` relative to `reference`.
///
/// `interpolation_order + 1` is the filter side and must be even.
pub fn optimal_filter_shift(
    reference: &ArrayView3<f32>,
    target: &ArrayView3<f32>,
    interpolation_order: usize,
) -> Result<[f64; 3]> {
    filter_shift(reference, target, interpolation_order + 1)
}

/// Same as [`optimal_filter_shift`], parameterized by the filter side.
pub fn filter_shift(
    reference: &ArrayView3<f32>,
    target: &ArrayView3<f32>,
    filter_size: usize,
) -> Result<[f64; 3]> {
    let filter = optimal_filter(reference, target, filter_size)?;
    Ok(filter_offset(&filter))
}

/// Fit the normalized (unit-sum) optimal filter.
pub fn optimal_filter(
    reference: &ArrayView3<f32>,
    target: &ArrayView3<f32>,
    filter_size: usize,
) -> Result<Array3<f64>> {
    check_patches(reference, target, filter_size)?;
    let (xtx, xti) = normal_equations(reference, target, filter_size);
    solve_filter(&xtx, &xti, filter_size)
}

pub(crate) fn check_patches(
    reference: &ArrayView3<f32>,
    target: &ArrayView3<f32>,
    filter_size: usize,
) -> Result<()> {
    if reference.dim() != target.dim() {
        return Err(DvcError::InvalidConfig(format!(
            "reference patch {:?} and target patch {:?} must have equal shapes",
            reference.shape(),
            target.shape()
        )));
    }
    if filter_size < 2 || filter_size % 2 != 0 {
        return Err(DvcError::InvalidConfig(format!(
            "optimal filter size {filter_size} must be even and at least 2"
        )));
    }
    if reference.shape().iter().any(|&s| s < filter_size) {
        return Err(DvcError::InvalidConfig(format!(
            "patch {:?} is smaller than the filter size {filter_size}",
            reference.shape()
        )));
    }
    Ok(())
}

/// Assemble `X^T X` (row-major, `f^3 x f^3`) and `X^T i`.
///
/// Row `p` of the im2col matrix `X` holds the `f^3` reference samples under
/// the filter placed at `p`; `i[p]` is the target sample at the filter's
/// centre, `p + f/2 - 1`.
pub fn normal_equations(
    reference: &ArrayView3<f32>,
    target: &ArrayView3<f32>,
    filter_size: usize,
) -> (Vec<f64>, Vec<f64>) {
    let f = filter_size;
    let taps = f * f * f;
    let centre = f / 2 - 1;
    let (sx, sy, sz) = reference.dim();
    let (vx, vy, vz) = (sx + 1 - f, sy + 1 - f, sz + 1 - f);

    let mut xtx = vec![0.0f64; taps * taps];
    let mut xti = vec![0.0f64; taps];
    let mut row = Vec::with_capacity(taps);

    for px in 0..vx {
        for py in 0..vy {
            for pz in 0..vz {
                row.clear();
                for a in 0..f {
                    for b in 0..f {
                        for c in 0..f {
                            row.push(reference[[px + a, py + b, pz + c]] as f64);
                        }
                    }
                }
                let t = target[[px + centre, py + centre, pz + centre]] as f64;
                for u in 0..taps {
                    let xu = row[u];
                    xti[u] += xu * t;
                    let dst = &mut xtx[u * taps..(u + 1) * taps];
                    for v in u..taps {
                        dst[v] += xu * row[v];
                    }
                }
            }
        }
    }

    for u in 0..taps {
        for v in 0..u {
            xtx[u * taps + v] = xtx[v * taps + u];
        }
    }
    (xtx, xti)
}

/// Solve the normal equations and normalize the filter to unit sum.
///
/// `xtx` is row-major `f^3 x f^3`. The system counts as singular when the
/// Cholesky factorization fails or a squared pivot falls below
/// `CHOLESKY_RELATIVE_PIVOT` times the largest diagonal entry.
pub fn solve_filter(xtx: &[f64], xti: &[f64], filter_size: usize) -> Result<Array3<f64>> {
    let singular = || DvcError::SingularSystem { filter_size };
    let taps = xti.len();
    if xtx.len() != taps * taps {
        return Err(DvcError::InvalidConfig(format!(
            "normal matrix has {} entries, expected {}",
            xtx.len(),
            taps * taps
        )));
    }

    let a = DMatrix::from_row_slice(taps, taps, xtx);
    let max_diag = a.diagonal().max();
    if !max_diag.is_finite() || max_diag <= 0.0 {
        return Err(singular());
    }
    let cholesky = a.cholesky().ok_or_else(singular)?;
    let tolerance = CHOLESKY_RELATIVE_PIVOT * max_diag;
    if cholesky.l_dirty().diagonal().iter().any(|&l| l.is_nan() || l * l <= tolerance) {
        return Err(singular());
    }
    let coefficients = cholesky.solve(&DVector::from_row_slice(xti));

    let sum = coefficients.sum();
    if !sum.is_finite() || sum.abs() < f64::EPSILON {
        return Err(singular());
    }
    let f = filter_size;
    Array3::from_shape_vec((f, f, f), coefficients.iter().map(|c| c / sum).collect())
        .map_err(|e| DvcError::InvalidConfig(format!("filter reshape: {e}")))
}

/// Per-axis shift encoded by a unit-sum filter: `-sum(marginal * weight)`
/// with `weight = [-(f/2 - 1) ..= f/2]`.
pub fn filter_offset(filter: &Array3<f64>) -> [f64; 3] {
    let f = filter.shape()[0];
    let first = -((f / 2) as f64 - 1.0);
    let mut offset = [0.0f64; 3];
    for ((a, b, c), &v) in filter.indexed_iter() {
        offset[0] -= v * (first + a as f64);
        offset[1] -= v * (first + b as f64);
        offset[2] -= v * (first + c as f64);
    }
    offset
}
