//! Reproducible test volumes with known displacement.

use ndarray::{s, Array3, ArrayView3, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::volume::Volume;

/// Uniform `[0, 1)` noise, reproducible for a given seed.
pub fn random_volume(shape: [usize; 3], seed: u64) -> Volume {
    let mut rng = StdRng::seed_from_u64(seed);
    let [x, y, z] = shape;
    Array3::from_shape_simple_fn((x, y, z), || rng.random::<f32>())
}

/// Noise box-blurred with a `(2 * radius + 1)`-wide window per axis.
///
/// Blurring gives the field spatial correlation, so sub-voxel fits behave
/// like they do on real scans. The window is clipped at the borders.
pub fn smooth_random_volume(shape: [usize; 3], seed: u64, radius: usize) -> Volume {
    let mut volume = random_volume(shape, seed);
    for axis in 0..3 {
        volume = box_blur_axis(&volume.view(), axis, radius);
    }
    volume
}

fn box_blur_axis(data: &ArrayView3<f32>, axis: usize, radius: usize) -> Volume {
    let mut out = Array3::<f32>::zeros(data.raw_dim());
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(data.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            let n = src.len();
            for i in 0..n {
                let lo = i.saturating_sub(radius);
                let hi = (i + radius + 1).min(n);
                let sum: f32 = src.slice(s![lo..hi]).sum();
                dst[i] = sum / (hi - lo) as f32;
            }
        });
    out
}

/// Move the content by an integer `shift`: `out[x] = volume[x - shift]`.
///
/// Voxels shifted in from outside are zero.
pub fn translate(volume: &ArrayView3<f32>, shift: [isize; 3]) -> Volume {
    let (x, y, z) = volume.dim();
    let shape = [x, y, z];
    let mut out = Array3::<f32>::zeros((x, y, z));

    let mut src = [(0usize, 0usize); 3];
    let mut dst = [(0usize, 0usize); 3];
    for d in 0..3 {
        let len = shape[d] as isize;
        let s = shift[d];
        if s.abs() >= len {
            return out;
        }
        let (from, to) = if s >= 0 { (0, len - s) } else { (-s, len) };
        src[d] = (from as usize, to as usize);
        dst[d] = ((from + s) as usize, (to + s) as usize);
    }

    out.slice_mut(s![dst[0].0..dst[0].1, dst[1].0..dst[1].1, dst[2].0..dst[2].1])
        .assign(&volume.slice(s![src[0].0..src[0].1, src[1].0..src[1].1, src[2].0..src[2].1]));
    out
}

/// Content moved by `-0.5` voxel on every axis:
/// `b[x, y, z] = (a[x, y, z] + a[x + 1, y + 1, z + 1]) / 2`.
///
/// The last plane on each axis has no neighbour and is left zero.
pub fn half_voxel_average(volume: &ArrayView3<f32>) -> Volume {
    let (x, y, z) = volume.dim();
    let mut out = Array3::<f32>::zeros((x, y, z));
    if x < 2 || y < 2 || z < 2 {
        return out;
    }
    let lower = volume.slice(s![..x - 1, ..y - 1, ..z - 1]);
    let upper = volume.slice(s![1.., 1.., 1..]);
    Zip::from(out.slice_mut(s![..x - 1, ..y - 1, ..z - 1]))
        .and(&lower)
        .and(&upper)
        .for_each(|o, &a, &b| *o = 0.5 * (a + b));
    out
}
