use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{PhotError, Result};
use crate::segmentation::morphology::dilate_labels;

/// Pairs of `(old, new)` labels produced by a relabelling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap(pub Vec<(u32, u32)>);

impl LabelMap {
    /// New label for `old`, if it was remapped.
    pub fn get(&self, old: u32) -> Option<u32> {
        self.0.iter().find(|(o, _)| *o == old).map(|(_, n)| *n)
    }

    pub fn new_labels(&self) -> Vec<u32> {
        self.0.iter().map(|(_, n)| *n).collect()
    }

    pub fn old_labels(&self) -> Vec<u32> {
        self.0.iter().map(|(o, _)| *o).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply the mapping to a list of labels, keeping unmapped ones.
    pub fn apply(&self, labels: &[u32]) -> Vec<u32> {
        labels.iter().map(|&l| self.get(l).unwrap_or(l)).collect()
    }
}

/// Flux-weighted position of one labelled object.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub y: f64,
    pub x: f64,
    /// Sum of the positive weights.
    pub flux: f64,
    /// Number of finite pixels used.
    pub n_pixels: usize,
}

/// A label image: 0 is background, every other value names one segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentationImage {
    data: Array2<u32>,
}

impl SegmentationImage {
    pub fn new(data: Array2<u32>) -> Self {
        Self { data }
    }

    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            data: Array2::zeros(shape),
        }
    }

    pub fn data(&self) -> &Array2<u32> {
        &self.data
    }

    pub fn into_data(self) -> Array2<u32> {
        self.data
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn max_label(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// Distinct non-zero labels, ascending.
    pub fn labels(&self) -> Vec<u32> {
        let mut seen = vec![false; self.max_label() as usize + 1];
        for &l in self.data.iter() {
            seen[l as usize] = true;
        }
        seen.iter()
            .enumerate()
            .skip(1)
            .filter(|(_, s)| **s)
            .map(|(l, _)| l as u32)
            .collect()
    }

    pub fn n_labels(&self) -> usize {
        self.labels().len()
    }

    /// True where any segment lies.
    pub fn object_mask(&self) -> Array2<bool> {
        self.data.mapv(|l| l != 0)
    }

    /// True where one of `labels` lies.
    pub fn select_mask(&self, labels: &[u32]) -> Array2<bool> {
        self.data.mapv(|l| l != 0 && labels.contains(&l))
    }

    /// Merge `other` into this segmentation.
    ///
    /// Every distinct non-zero label of `other` is moved to a fresh label
    /// above the current maximum (ascending order preserved), then written
    /// over this image wherever `other` is non-zero. Returns the mapping.
    pub fn add_segments(&mut self, other: &Array2<u32>) -> Result<LabelMap> {
        if other.dim() != self.data.dim() {
            return Err(PhotError::LabelShapeMismatch {
                expected: self.data.dim(),
                found: other.dim(),
            });
        }
        let offset = self.max_label();
        let incoming = SegmentationImage::new(other.clone()).labels();
        let map = LabelMap(
            incoming
                .iter()
                .enumerate()
                .map(|(k, &old)| (old, offset + k as u32 + 1))
                .collect(),
        );

        let mut lookup = vec![0u32; incoming.last().copied().unwrap_or(0) as usize + 1];
        for &(old, new) in &map.0 {
            lookup[old as usize] = new;
        }
        for (dst, &src) in self.data.iter_mut().zip(other.iter()) {
            if src != 0 {
                *dst = lookup[src as usize];
            }
        }
        Ok(map)
    }

    /// Non-mutating variant of [`add_segments`](Self::add_segments).
    pub fn with_segments(&self, other: &Array2<u32>) -> Result<(SegmentationImage, LabelMap)> {
        let mut merged = self.clone();
        let map = merged.add_segments(other)?;
        Ok((merged, map))
    }

    /// Sub-image of `shape` whose top-left corner sits at `start` in this
    /// image. Pixels outside the image are 0.
    pub fn window(&self, start: [isize; 2], shape: (usize, usize)) -> Array2<u32> {
        let mut out = Array2::<u32>::zeros(shape);
        let (h, w) = self.shape();
        let (oh, ow) = shape;

        let y0 = start[0].max(0);
        let x0 = start[1].max(0);
        let y1 = (start[0] + oh as isize).min(h as isize);
        let x1 = (start[1] + ow as isize).min(w as isize);
        if y0 >= y1 || x0 >= x1 {
            return out;
        }
        let src = self
            .data
            .slice(s![y0 as usize..y1 as usize, x0 as usize..x1 as usize]);
        let dy = (y0 - start[0]) as usize;
        let dx = (x0 - start[1]) as usize;
        out.slice_mut(s![dy..dy + src.nrows(), dx..dx + src.ncols()])
            .assign(&src);
        out
    }

    /// Apply `map` in place; labels not in the map are kept.
    pub fn relabel(&mut self, map: &LabelMap) {
        let max = self.max_label().max(map.0.iter().map(|(o, _)| *o).max().unwrap_or(0));
        let mut lookup: Vec<u32> = (0..=max).collect();
        for &(old, new) in &map.0 {
            lookup[old as usize] = new;
        }
        self.data.mapv_inplace(|l| lookup[l as usize]);
    }

    /// Sum of the finite image values per label.
    pub fn sums(&self, image: &ArrayView2<f64>) -> BTreeMap<u32, f64> {
        let mut sums = BTreeMap::new();
        for (&l, &v) in self.data.iter().zip(image.iter()) {
            if l != 0 && v.is_finite() {
                *sums.entry(l).or_insert(0.0) += v;
            }
        }
        sums
    }

    /// Background-subtracted counts per label: sum minus `background` per pixel.
    pub fn counts(&self, image: &ArrayView2<f64>, background: f64) -> BTreeMap<u32, f64> {
        let mut counts = BTreeMap::new();
        for (&l, &v) in self.data.iter().zip(image.iter()) {
            if l != 0 && v.is_finite() {
                *counts.entry(l).or_insert(0.0) += v - background;
            }
        }
        counts
    }

    /// Flux-weighted centroids per label, weighting by the positive part of
    /// `image`. Labels without positive finite pixels are omitted.
    pub fn centroids(&self, image: &ArrayView2<f64>) -> BTreeMap<u32, Centroid> {
        let mut acc: BTreeMap<u32, (f64, f64, f64, usize)> = BTreeMap::new();
        for ((row, col), &l) in self.data.indexed_iter() {
            if l == 0 {
                continue;
            }
            let v = image[[row, col]];
            if !v.is_finite() {
                continue;
            }
            let e = acc.entry(l).or_insert((0.0, 0.0, 0.0, 0));
            let wgt = v.max(0.0);
            e.0 += wgt * row as f64;
            e.1 += wgt * col as f64;
            e.2 += wgt;
            e.3 += 1;
        }
        acc.into_iter()
            .filter(|(_, (_, _, f, _))| *f > 0.0)
            .map(|(l, (sy, sx, f, n))| {
                (
                    l,
                    Centroid {
                        y: sy / f,
                        x: sx / f,
                        flux: f,
                        n_pixels: n,
                    },
                )
            })
            .collect()
    }

    /// Renumber labels `1..=n` by descending counts in `image` (brightest
    /// first). Ties keep ascending label order.
    pub fn count_sort(&mut self, image: &ArrayView2<f64>) -> LabelMap {
        let sums = self.sums(image);
        let mut order: Vec<(u32, f64)> = self
            .labels()
            .into_iter()
            .map(|l| (l, sums.get(&l).copied().unwrap_or(0.0)))
            .collect();
        order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let map = LabelMap(
            order
                .iter()
                .enumerate()
                .map(|(k, (old, _))| (*old, k as u32 + 1))
                .collect(),
        );
        self.relabel(&map);
        map
    }

    /// Grow all segments into the background.
    pub fn dilate(&mut self, iterations: usize) {
        if iterations > 0 {
            self.data = dilate_labels(&self.data, iterations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_window_pads_outside() {
        let seg = SegmentationImage::new(array![[1, 2], [3, 4]]);
        let w = seg.window([-1, 1], (3, 2));
        assert_eq!(w, array![[0, 0], [2, 0], [4, 0]]);
    }

    #[test]
    fn test_count_sort_brightest_first() {
        let mut seg = SegmentationImage::new(array![[1, 0, 2]]);
        let img = array![[1.0, 0.0, 5.0]];
        let map = seg.count_sort(&img.view());
        assert_eq!(seg.data(), &array![[2, 0, 1]]);
        assert_eq!(map.get(2), Some(1));
    }
}
