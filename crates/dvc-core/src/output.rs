//! Result grid shared by all workers of a run.

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::Array4;

use crate::consts::RECORD_CHANNELS;
use crate::error::{DvcError, Result};

/// One subvolume's result: displacement, peak correlation and grid index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplacementRecord {
    pub displacement: [f64; 3],
    pub correlation: f64,
    pub index: [usize; 3],
}

impl DisplacementRecord {
    /// Record for a subvolume with no usable correlation.
    pub fn rejected(index: [usize; 3]) -> Self {
        Self {
            displacement: [f64::NAN; 3],
            correlation: f64::NAN,
            index,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.correlation.is_nan()
    }

    /// `[dx, dy, dz, corr, i, j, k]`.
    pub fn to_channels(&self) -> [f64; RECORD_CHANNELS] {
        let [dx, dy, dz] = self.displacement;
        let [i, j, k] = self.index;
        [dx, dy, dz, self.correlation, i as f64, j as f64, k as f64]
    }
}

/// Dense `(cx, cy, cz, 7)` grid of `f64` cells stored as bit-cast atomics.
///
/// Each grid cell is owned by exactly one task, so relaxed stores suffice;
/// the completion channel orders them before the final read.
pub struct SharedGrid {
    counts: [usize; 3],
    cells: Vec<AtomicU64>,
}

impl SharedGrid {
    pub fn new(counts: [usize; 3]) -> Self {
        let len = counts.iter().product::<usize>() * RECORD_CHANNELS;
        let zero = 0.0f64.to_bits();
        Self {
            counts,
            cells: (0..len).map(|_| AtomicU64::new(zero)).collect(),
        }
    }

    pub fn counts(&self) -> [usize; 3] {
        self.counts
    }

    fn offset(&self, index: [usize; 3]) -> usize {
        let [_, cy, cz] = self.counts;
        ((index[0] * cy + index[1]) * cz + index[2]) * RECORD_CHANNELS
    }

    pub fn write(&self, record: &DisplacementRecord) {
        let base = self.offset(record.index);
        for (cell, value) in self.cells[base..base + RECORD_CHANNELS]
            .iter()
            .zip(record.to_channels())
        {
            cell.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    /// Copy the grid into an owned array of shape `counts + (7,)`.
    pub fn into_array(self) -> Result<Array4<f64>> {
        let [cx, cy, cz] = self.counts;
        let values = self
            .cells
            .into_iter()
            .map(|cell| f64::from_bits(cell.into_inner()))
            .collect();
        Array4::from_shape_vec((cx, cy, cz, RECORD_CHANNELS), values)
            .map_err(|e| DvcError::InvalidConfig(format!("output grid shape: {e}")))
    }
}
