//! Green-Lagrange strain of the displacement grid.

use ndarray::{Array3, ArrayView3, ArrayView4, Axis, Zip};
use rayon::prelude::*;

/// The six independent components of the symmetric strain tensor, each on
/// the subvolume grid.
#[derive(Clone, Debug)]
pub struct StrainTensor {
    pub xx: Array3<f64>,
    pub yy: Array3<f64>,
    pub zz: Array3<f64>,
    pub xy: Array3<f64>,
    pub xz: Array3<f64>,
    pub yz: Array3<f64>,
}

/// Strain of the `(dx, dy, dz)` channels of a record grid.
///
/// With `g[c][a]` the derivative of component `c` along axis `a`:
/// `e_aa = g[a][a] + sum_b g[a][b]^2 / 2` and
/// `e_ab = (g[a][b] + g[b][a]) / 2 + sum_c g[a][c] g[b][c] / 2`.
///
/// Derivatives are unscaled Sobel responses (zero outside the grid), so
/// values are in units of displacement per grid step times the Sobel gain.
pub fn strain_tensor(records: &ArrayView4<f64>) -> StrainTensor {
    let components = [0usize, 1, 2].map(|c| records.index_axis(Axis(3), c));

    // grad[c][a]: derivative of displacement component c along grid axis a.
    let flat: Vec<Array3<f64>> = (0..9)
        .into_par_iter()
        .map(|n| sobel(&components[n / 3], n % 3))
        .collect();
    let g = |c: usize, a: usize| &flat[c * 3 + a];

    let normal = |a: usize| {
        let mut out = g(a, a).clone();
        Zip::from(&mut out)
            .and(g(a, 0))
            .and(g(a, 1))
            .and(g(a, 2))
            .for_each(|e, &u, &v, &w| *e += 0.5 * (u * u + v * v + w * w));
        out
    };
    let shear = |a: usize, b: usize| {
        let mut out = Array3::<f64>::zeros(g(0, 0).raw_dim());
        Zip::from(&mut out)
            .and(g(a, b))
            .and(g(b, a))
            .for_each(|e, &ab, &ba| *e = 0.5 * (ab + ba));
        for c in 0..3 {
            Zip::from(&mut out)
                .and(g(a, c))
                .and(g(b, c))
                .for_each(|e, &ac, &bc| *e += 0.5 * ac * bc);
        }
        out
    };

    StrainTensor {
        xx: normal(0),
        yy: normal(1),
        zz: normal(2),
        xy: shear(0, 1),
        xz: shear(0, 2),
        yz: shear(1, 2),
    }
}

/// Sobel derivative along `axis`: `[-1, 0, 1]` on that axis, `[1, 2, 1]`
/// smoothing on the others, zero padding.
pub fn sobel(data: &ArrayView3<f64>, axis: usize) -> Array3<f64> {
    let mut out = correlate_axis(&data.view(), axis, [-1.0, 0.0, 1.0]);
    for other in (0..3).filter(|&d| d != axis) {
        out = correlate_axis(&out.view(), other, [1.0, 2.0, 1.0]);
    }
    out
}

fn correlate_axis(data: &ArrayView3<f64>, axis: usize, weights: [f64; 3]) -> Array3<f64> {
    let mut out = Array3::<f64>::zeros(data.raw_dim());
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(data.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            let n = src.len();
            for i in 0..n {
                let prev = if i > 0 { src[i - 1] } else { 0.0 };
                let next = if i + 1 < n { src[i + 1] } else { 0.0 };
                dst[i] = weights[0] * prev + weights[1] * src[i] + weights[2] * next;
            }
        });
    out
}
