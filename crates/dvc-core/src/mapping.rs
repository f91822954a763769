//! Expansion of the subvolume records into a per-voxel displacement field.

use ndarray::{s, Array4, ArrayView4, ArrayViewMut1, Axis, Zip};

use crate::consts::{MAPPED_CHANNELS, PARALLEL_VOXEL_THRESHOLD};

/// Per-voxel `(dx, dy, dz, corr)` of shape `volume_shape + (4,)`.
///
/// Subvolume `(i, j, k)` covers `[p, p + kernel)` with `p = (i, j, k) * stride`.
/// Where subvolumes overlap, the one later in row-major order wins. Voxels no
/// subvolume covers stay zero.
pub fn map_displacements(
    records: &ArrayView4<f64>,
    volume_shape: [usize; 3],
    kernel_shape: [usize; 3],
    stride_shape: [usize; 3],
) -> Array4<f64> {
    let (cx, cy, cz, _) = records.dim();
    let counts = [cx, cy, cz];
    let [vx, vy, vz] = volume_shape;
    let mut field = Array4::<f64>::zeros((vx, vy, vz, MAPPED_CHANNELS));

    // Row-major "last writer" factors per axis: the covering subvolume with
    // the largest index on each axis.
    let owners: [Vec<Option<usize>>; 3] = std::array::from_fn(|d| {
        last_cover(volume_shape[d], counts[d], kernel_shape[d], stride_shape[d])
    });

    let fill = |(x, y, z): (usize, usize, usize), mut voxel: ArrayViewMut1<f64>| {
        if let (Some(i), Some(j), Some(k)) = (owners[0][x], owners[1][y], owners[2][z]) {
            voxel.assign(&records.slice(s![i, j, k, ..MAPPED_CHANNELS]));
        }
    };

    let zip = Zip::indexed(field.lanes_mut(Axis(3)));
    if vx * vy * vz >= PARALLEL_VOXEL_THRESHOLD {
        zip.par_for_each(fill);
    } else {
        zip.for_each(fill);
    }
    field
}

fn last_cover(len: usize, count: usize, kernel: usize, stride: usize) -> Vec<Option<usize>> {
    (0..len)
        .map(|x| {
            if count == 0 || stride == 0 {
                return None;
            }
            let i = (x / stride).min(count - 1);
            (i * stride + kernel > x).then_some(i)
        })
        .collect()
}
