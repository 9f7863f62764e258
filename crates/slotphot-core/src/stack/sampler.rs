use std::ops::Range;

use ndarray::{Array2, Axis};

use crate::error::{PhotError, Result};
use crate::io::cube::ImageCube;
use crate::stack::median::median_stack;

/// Builds sample images: NaN-aware medians of a few frames drawn from an
/// interval of the cube, with bad columns masked out.
pub struct ImageSampler<'a> {
    cube: &'a ImageCube,
    n_comb: usize,
    bad_columns: Vec<usize>,
}

impl<'a> ImageSampler<'a> {
    pub fn new(cube: &'a ImageCube, n_comb: usize) -> Self {
        Self {
            cube,
            n_comb: n_comb.max(1),
            bad_columns: Vec::new(),
        }
    }

    pub fn with_bad_columns(mut self, columns: &[usize]) -> Self {
        self.bad_columns = columns.to_vec();
        self
    }

    pub fn cube_len(&self) -> usize {
        self.cube.len()
    }

    /// One frame with bad columns masked.
    pub fn frame(&self, index: usize) -> Result<Array2<f64>> {
        let mut image = self.cube.frame(index)?;
        self.mask_bad_columns(&mut image);
        Ok(image)
    }

    /// Split `range` into `n` contiguous, non-empty intervals of near-equal length.
    pub fn intervals(range: Range<usize>, n: usize) -> Vec<Range<usize>> {
        let total = range.len();
        let n = n.clamp(1, total.max(1));
        (0..n)
            .map(|k| {
                let lo = range.start + k * total / n;
                let hi = range.start + (k + 1) * total / n;
                lo..hi
            })
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Frame indices combined for an interval: `n_comb` frames evenly spaced
    /// across it (all of them when the interval is shorter).
    pub fn frame_indices(&self, interval: &Range<usize>) -> Vec<usize> {
        let len = interval.len();
        if len <= self.n_comb {
            return interval.clone().collect();
        }
        (0..self.n_comb)
            .map(|k| interval.start + k * (len - 1) / (self.n_comb - 1).max(1))
            .collect()
    }

    /// Median of the chosen frames of `interval`.
    pub fn sample(&self, interval: &Range<usize>) -> Result<Array2<f64>> {
        let indices = self.frame_indices(interval);
        if indices.is_empty() {
            return Err(PhotError::EmptySequence);
        }
        let frames = indices
            .iter()
            .map(|&i| self.cube.frame(i))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        let mut image = median_stack(&views)?;
        self.mask_bad_columns(&mut image);
        Ok(image)
    }

    /// Median of the contiguous block of frames `block`, used by the
    /// full-cube pass.
    pub fn block(&self, block: &Range<usize>) -> Result<Array2<f64>> {
        let frames = block
            .clone()
            .map(|i| self.cube.frame(i))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        let mut image = median_stack(&views)?;
        self.mask_bad_columns(&mut image);
        Ok(image)
    }

    /// Set every configured bad column to NaN.
    pub fn mask_bad_columns(&self, image: &mut Array2<f64>) {
        let w = image.ncols();
        for &col in self.bad_columns.iter().filter(|&&c| c < w) {
            image.index_axis_mut(Axis(1), col).fill(f64::NAN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals_cover_range() {
        let iv = ImageSampler::intervals(0..10, 3);
        assert_eq!(iv, vec![0..3, 3..6, 6..10]);
        let iv = ImageSampler::intervals(5..7, 4);
        assert_eq!(iv, vec![5..6, 6..7]);
    }
}
