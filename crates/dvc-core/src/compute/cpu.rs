use std::sync::Arc;

use ndarray::{s, Array3, ArrayView3, Axis, Zip};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::Result;
use crate::subvoxel::filter_shift;
use crate::volume::PatchBatch;

use super::ncc::{finalize_window, normalize_kernel};
use super::{CorrelationBackend, CorrelationBatch, Sealed, SubvoxelRefiner};

/// CPU correlation backend: rustfft 3D transforms in `f64`.
///
/// One instance per worker thread; FFT plans and scratch volumes are reused
/// across batches.
pub struct CpuCorrelator {
    kernel_shape: [usize; 3],
    roi_shape: [usize; 3],
    fft: Fft3d,
    roi_spectrum: Array3<Complex<f64>>,
    kernel_spectrum: Array3<Complex<f64>>,
}

impl CpuCorrelator {
    pub fn new(kernel_shape: [usize; 3], roi_shape: [usize; 3]) -> Self {
        let [rx, ry, rz] = roi_shape;
        Self {
            kernel_shape,
            roi_shape,
            fft: Fft3d::new(roi_shape),
            roi_spectrum: Array3::zeros((rx, ry, rz)),
            kernel_spectrum: Array3::zeros((rx, ry, rz)),
        }
    }
}

impl Sealed for CpuCorrelator {}

impl CorrelationBackend for CpuCorrelator {
    fn name(&self) -> &str {
        "CPU/rustfft"
    }

    fn correlate(&mut self, batch: &PatchBatch) -> Result<CorrelationBatch> {
        debug_assert_eq!(batch.kernel_shape(), self.kernel_shape);
        debug_assert_eq!(batch.roi_shape(), self.roi_shape);

        let [kx, ky, kz] = self.kernel_shape;
        let valid: [usize; 3] = std::array::from_fn(|d| self.roi_shape[d] - self.kernel_shape[d] + 1);
        let [cx, cy, cz] = valid;
        let mut out = CorrelationBatch::zeros(batch.len(), valid);

        for item in 0..batch.len() {
            let roi = batch.roi(item);
            let (kernel_n, kernel_sum) = normalize_kernel(&batch.kernel(item));

            Zip::from(&mut self.roi_spectrum)
                .and(&roi)
                .for_each(|c, &v| *c = Complex::new(v as f64, 0.0));
            self.kernel_spectrum.fill(Complex::new(0.0, 0.0));
            Zip::from(self.kernel_spectrum.slice_mut(s![..kx, ..ky, ..kz]))
                .and(&kernel_n)
                .for_each(|c, &v| *c = Complex::new(v, 0.0));

            self.fft.forward(&mut self.roi_spectrum);
            self.fft.forward(&mut self.kernel_spectrum);

            // corr = IFFT(FFT(roi) * conj(FFT(kernel)))
            Zip::from(&mut self.roi_spectrum)
                .and(&self.kernel_spectrum)
                .for_each(|r, k| *r *= k.conj());
            self.fft.inverse(&mut self.roi_spectrum);

            let mut corr = out.correlation.index_axis_mut(Axis(0), item);
            Zip::from(&mut corr)
                .and(self.roi_spectrum.slice(s![..cx, ..cy, ..cz]))
                .for_each(|o, c| *o = c.re);

            let (sum, sum_sq) = window_sums(&roi, self.kernel_shape);
            let mut mean = out.mean.index_axis_mut(Axis(0), item);
            let mut std = out.std.index_axis_mut(Axis(0), item);
            mean.assign(&sum);
            std.assign(&sum_sq);

            finalize_window(mean, std, corr, kernel_sum, kx * ky * kz);
        }

        Ok(out)
    }
}

/// CPU optimal-filter refiner.
pub struct CpuRefiner {
    filter_size: usize,
}

impl CpuRefiner {
    pub fn new(filter_size: usize) -> Self {
        Self { filter_size }
    }
}

impl Sealed for CpuRefiner {}

impl SubvoxelRefiner for CpuRefiner {
    fn refine(&mut self, reference: &ArrayView3<f32>, roi: &ArrayView3<f32>) -> Result<[f64; 3]> {
        filter_shift(reference, roi, self.filter_size)
    }
}

// ---------------------------------------------------------------------------
// 3D FFT
// ---------------------------------------------------------------------------

/// Separable 3D FFT built from one 1D plan per axis.
pub struct Fft3d {
    shape: [usize; 3],
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
    lane: Vec<Complex<f64>>,
}

impl Fft3d {
    pub fn new(shape: [usize; 3]) -> Self {
        let mut planner = FftPlanner::new();
        let forward = std::array::from_fn(|d| planner.plan_fft_forward(shape[d]));
        let inverse = std::array::from_fn(|d| planner.plan_fft_inverse(shape[d]));
        let longest = shape.iter().copied().max().unwrap_or(0);
        Self {
            shape,
            forward,
            inverse,
            lane: Vec::with_capacity(longest),
        }
    }

    pub fn forward(&mut self, data: &mut Array3<Complex<f64>>) {
        for axis in 0..3 {
            let plan = Arc::clone(&self.forward[axis]);
            self.transform_axis(data, axis, plan.as_ref());
        }
    }

    /// Inverse transform, normalized by `1 / (X*Y*Z)`.
    pub fn inverse(&mut self, data: &mut Array3<Complex<f64>>) {
        for axis in 0..3 {
            let plan = Arc::clone(&self.inverse[axis]);
            self.transform_axis(data, axis, plan.as_ref());
        }
        let scale = 1.0 / self.shape.iter().product::<usize>() as f64;
        data.mapv_inplace(|c| c * scale);
    }

    fn transform_axis(&mut self, data: &mut Array3<Complex<f64>>, axis: usize, plan: &dyn Fft<f64>) {
        for mut lane in data.lanes_mut(Axis(axis)) {
            if let Some(contiguous) = lane.as_slice_mut() {
                plan.process(contiguous);
                continue;
            }
            self.lane.clear();
            self.lane.extend(lane.iter().copied());
            plan.process(&mut self.lane);
            for (dst, &src) in lane.iter_mut().zip(self.lane.iter()) {
                *dst = src;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Windowed sums (separable box filter)
// ---------------------------------------------------------------------------

/// Sum and sum of squares over every `window`-sized box fully inside `data`.
///
/// Output shape is `data - window + 1` per axis.
pub fn window_sums(data: &ArrayView3<f32>, window: [usize; 3]) -> (Array3<f64>, Array3<f64>) {
    let mut sum = data.mapv(|v| v as f64);
    let mut sum_sq = data.mapv(|v| (v as f64) * (v as f64));
    for (axis, &w) in window.iter().enumerate() {
        sum = moving_sum(&sum, axis, w);
        sum_sq = moving_sum(&sum_sq, axis, w);
    }
    (sum, sum_sq)
}

fn moving_sum(data: &Array3<f64>, axis: usize, width: usize) -> Array3<f64> {
    let mut shape = data.raw_dim();
    shape[axis] = shape[axis] + 1 - width;
    let mut out = Array3::<f64>::zeros(shape);

    Zip::from(out.lanes_mut(Axis(axis)))
        .and(data.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            let mut acc: f64 = src.iter().take(width).sum();
            dst[0] = acc;
            for i in 1..dst.len() {
                acc += src[i + width - 1] - src[i - 1];
                dst[i] = acc;
            }
        });
    out
}
