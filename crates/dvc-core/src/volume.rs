use ndarray::{s, Array3, Array4, ArrayView3, ArrayViewMut3, Axis};

use crate::error::{DvcError, Result};

/// A 3D scalar field, shape (X, Y, Z).
pub type Volume = Array3<f32>;

/// Shape of a volume as a fixed array.
pub fn shape_of(volume: &ArrayView3<f32>) -> [usize; 3] {
    let (x, y, z) = volume.dim();
    [x, y, z]
}

/// Check that the reference and deformed volumes can be correlated.
pub fn check_pair(reference: &ArrayView3<f32>, deformed: &ArrayView3<f32>) -> Result<[usize; 3]> {
    let r = shape_of(reference);
    let d = shape_of(deformed);
    if r != d {
        return Err(DvcError::ShapeMismatch {
            reference: r,
            deformed: d,
        });
    }
    Ok(r)
}

/// Copy the window of `volume` starting at `origin` into `dst`.
///
/// The part of the window outside the volume is zero-filled.
pub fn fill_patch(dst: &mut ArrayViewMut3<f32>, volume: &ArrayView3<f32>, origin: [usize; 3]) {
    dst.fill(0.0);
    let shape = shape_of(volume);
    let (px, py, pz) = dst.dim();
    let patch = [px, py, pz];

    let mut end = [0usize; 3];
    for d in 0..3 {
        if origin[d] >= shape[d] {
            return;
        }
        end[d] = (origin[d] + patch[d]).min(shape[d]);
    }
    let [ex, ey, ez] = end;
    let [ox, oy, oz] = origin;

    let src = volume.slice(s![ox..ex, oy..ey, oz..ez]);
    dst.slice_mut(s![..ex - ox, ..ey - oy, ..ez - oz]).assign(&src);
}

/// Kernel and ROI patches for one batch of subvolumes.
///
/// Buffers are sized for a full batch and reused; only the first `len` items
/// are meaningful.
pub struct PatchBatch {
    kernels: Array4<f32>,
    rois: Array4<f32>,
    len: usize,
}

impl PatchBatch {
    pub fn new(capacity: usize, kernel_shape: [usize; 3], roi_shape: [usize; 3]) -> Self {
        let [kx, ky, kz] = kernel_shape;
        let [rx, ry, rz] = roi_shape;
        Self {
            kernels: Array4::zeros((capacity, kx, ky, kz)),
            rois: Array4::zeros((capacity, rx, ry, rz)),
            len: 0,
        }
    }

    /// Build a batch from already cut patches.
    pub fn from_patches(kernels: &[Array3<f32>], rois: &[Array3<f32>]) -> Result<Self> {
        let (Some(k0), Some(r0)) = (kernels.first(), rois.first()) else {
            return Err(DvcError::InvalidConfig("empty patch batch".into()));
        };
        if kernels.len() != rois.len() {
            return Err(DvcError::InvalidConfig(format!(
                "{} kernels but {} ROIs",
                kernels.len(),
                rois.len()
            )));
        }
        let (kx, ky, kz) = k0.dim();
        let (rx, ry, rz) = r0.dim();
        let mut batch = Self::new(kernels.len(), [kx, ky, kz], [rx, ry, rz]);
        for (i, (k, r)) in kernels.iter().zip(rois).enumerate() {
            if k.dim() != k0.dim() || r.dim() != r0.dim() {
                return Err(DvcError::InvalidConfig(
                    "patches in a batch must share one shape".into(),
                ));
            }
            batch.kernels.index_axis_mut(Axis(0), i).assign(k);
            batch.rois.index_axis_mut(Axis(0), i).assign(r);
        }
        batch.len = kernels.len();
        Ok(batch)
    }

    pub fn capacity(&self) -> usize {
        self.kernels.len_of(Axis(0))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kernel_shape(&self) -> [usize; 3] {
        let (_, x, y, z) = self.kernels.dim();
        [x, y, z]
    }

    pub fn roi_shape(&self) -> [usize; 3] {
        let (_, x, y, z) = self.rois.dim();
        [x, y, z]
    }

    pub fn kernel(&self, item: usize) -> ArrayView3<'_, f32> {
        self.kernels.index_axis(Axis(0), item)
    }

    pub fn roi(&self, item: usize) -> ArrayView3<'_, f32> {
        self.rois.index_axis(Axis(0), item)
    }

    /// Refill the batch from the two volumes.
    ///
    /// `origins` holds (kernel origin, ROI origin) per item.
    pub fn load(
        &mut self,
        reference: &ArrayView3<f32>,
        deformed: &ArrayView3<f32>,
        origins: &[([usize; 3], [usize; 3])],
    ) {
        debug_assert!(origins.len() <= self.capacity());
        for (i, &(kernel_origin, roi_origin)) in origins.iter().enumerate() {
            fill_patch(
                &mut self.kernels.index_axis_mut(Axis(0), i),
                reference,
                kernel_origin,
            );
            fill_patch(&mut self.rois.index_axis_mut(Axis(0), i), deformed, roi_origin);
        }
        self.len = origins.len();
    }
}
