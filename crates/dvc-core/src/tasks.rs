//! Enumeration of the subvolume grid in fixed-size batches.

/// One unit of work: a run of consecutive subvolume grid indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskBatch {
    /// Sequence number, starting at 0.
    pub id: usize,
    pub indices: Vec<[usize; 3]>,
}

impl TaskBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Lazy row-major walk over `counts[0] x counts[1] x counts[2]` grid cells,
/// yielding batches of `batch_size` (the last one may be shorter).
#[derive(Clone, Debug)]
pub struct TaskGenerator {
    counts: [usize; 3],
    batch_size: usize,
    next: usize,
    next_id: usize,
}

impl TaskGenerator {
    pub fn new(counts: [usize; 3], batch_size: usize) -> Self {
        Self {
            counts,
            batch_size: batch_size.max(1),
            next: 0,
            next_id: 0,
        }
    }

    /// Number of subvolumes in the whole grid.
    pub fn total_count(&self) -> usize {
        self.counts.iter().product()
    }

    /// Number of batches the generator yields in total.
    pub fn batch_count(&self) -> usize {
        self.total_count().div_ceil(self.batch_size)
    }

    fn unravel(&self, flat: usize) -> [usize; 3] {
        let [_, cy, cz] = self.counts;
        [flat / (cy * cz), (flat / cz) % cy, flat % cz]
    }
}

impl Iterator for TaskGenerator {
    type Item = TaskBatch;

    fn next(&mut self) -> Option<TaskBatch> {
        let total = self.total_count();
        if self.next >= total {
            return None;
        }
        let end = (self.next + self.batch_size).min(total);
        let indices = (self.next..end).map(|flat| self.unravel(flat)).collect();
        let batch = TaskBatch {
            id: self.next_id,
            indices,
        };
        self.next = end;
        self.next_id += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .total_count()
            .saturating_sub(self.next)
            .div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TaskGenerator {}
