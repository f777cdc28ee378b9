// Bounded per-device sample ring
//
// Rows (one sample across all channels) are appended at the tail. Once the
// retention capacity is reached the oldest rows are overwritten in place, so
// memory never exceeds `capacity x channels` and each append costs O(rows
// appended), independent of how much history has streamed through.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    #[error("Batch has {actual} channels but the buffer holds {expected}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// Fixed-capacity ring of i16 sample rows, oldest first
#[derive(Debug, Clone)]
pub struct SampleRing {
    storage: Vec<i16>,
    num_channels: usize,
    capacity: usize,
    // Physical row index of the oldest row; stays 0 until the ring first fills
    start: usize,
    len: usize,
}

impl SampleRing {
    pub fn new(num_channels: usize, capacity: usize) -> Self {
        Self {
            storage: Vec::new(),
            num_channels,
            capacity,
            start: 0,
            len: 0,
        }
    }

    /// Ring holding `retention_seconds` worth of samples at `sampling_rate`
    pub fn for_retention(num_channels: usize, sampling_rate: f64, retention_seconds: f64) -> Self {
        let capacity = (sampling_rate * retention_seconds).floor().max(0.0) as usize;
        Self::new(num_channels, capacity)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Append a (samples, channels) batch, discarding the oldest rows beyond capacity
    pub fn push_rows(&mut self, batch: ArrayView2<'_, i16>) -> Result<(), BufferError> {
        if batch.ncols() != self.num_channels {
            return Err(BufferError::ChannelMismatch {
                expected: self.num_channels,
                actual: batch.ncols(),
            });
        }
        if self.capacity == 0 {
            return Ok(());
        }

        // Rows that would be overwritten within this same batch are never written
        let skip = batch.nrows().saturating_sub(self.capacity);
        for row in batch.rows().into_iter().skip(skip) {
            if self.len < self.capacity {
                self.storage.extend(row.iter().copied());
                self.len += 1;
            } else {
                let offset = self.start * self.num_channels;
                for (slot, &value) in self.storage[offset..offset + self.num_channels]
                    .iter_mut()
                    .zip(row.iter())
                {
                    *slot = value;
                }
                self.start = (self.start + 1) % self.capacity;
            }
        }

        Ok(())
    }

    /// The most recent `rows` rows, oldest first; `None` if fewer are held
    pub fn latest(&self, rows: usize) -> Option<Array2<i16>> {
        if rows > self.len {
            return None;
        }

        let mut data = Vec::with_capacity(rows * self.num_channels);
        for logical in (self.len - rows)..self.len {
            let physical = (self.start + logical) % self.capacity.max(1);
            let offset = physical * self.num_channels;
            data.extend_from_slice(&self.storage[offset..offset + self.num_channels]);
        }

        Array2::from_shape_vec((rows, self.num_channels), data).ok()
    }

    /// Copy of every retained row, oldest first
    pub fn to_array(&self) -> Array2<i16> {
        self.latest(self.len)
            .unwrap_or_else(|| Array2::zeros((0, self.num_channels)))
    }

    pub fn clear(&mut self) {
        self.storage.clear();
        self.start = 0;
        self.len = 0;
    }
}
