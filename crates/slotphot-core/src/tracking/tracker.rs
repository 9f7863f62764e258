use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::consts::{DEFAULT_CLIP_ITERATIONS, DEFAULT_CLIP_SIGMA};
use crate::error::{PhotError, Result};
use crate::segmentation::{LabelMap, SegmentationImage};
use crate::stats::{masked_values, nan_median, sigma_clipped_stats};
use crate::tracking::groups::Groups;
use crate::workspace::SharedArray;

/// Lifecycle of a tracker within one pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerStage {
    Uninitialized,
    SampleSeeded,
    DeepRefined,
    Frozen,
}

impl TrackerStage {
    fn allows(self, to: TrackerStage) -> bool {
        use TrackerStage::*;
        matches!(
            (self, to),
            (Uninitialized, SampleSeeded)
                | (SampleSeeded, DeepRefined)
                | (DeepRefined, DeepRefined)
                | (DeepRefined, Frozen)
                | (Frozen, DeepRefined)
        )
    }
}

/// Camera displacement of one frame or sample, `(dy, dx)` in pixels.
/// `None` means the offset could not be measured.
pub type Offset = Option<[f64; 2]>;

/// Global object segmentation plus per-index camera offsets.
///
/// `segm` covers an extended frame holding every observed camera footprint.
/// Index `i` is seen through the window starting at
/// `round(zero_point - offsets[i])`. A star whose reference position is `r`
/// (extended coordinates) appears at `r - zero_point + offsets[i]` in frame `i`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tracker {
    segm: SegmentationImage,
    pub groups: Groups,
    offsets: Vec<Offset>,
    zero_point: [f64; 2],
    frame_shape: (usize, usize),
    stage: TrackerStage,
    /// Extended-frame positions of the bright objects used for tracking.
    reference: BTreeMap<u32, [f64; 2]>,
    /// Minimum centroid SNR for a star to vote on an offset.
    pub snr_threshold: f64,
}

impl Tracker {
    pub fn new(frame_shape: (usize, usize), snr_threshold: f64) -> Self {
        Self {
            segm: SegmentationImage::zeros(frame_shape),
            groups: Groups::default(),
            offsets: Vec::new(),
            zero_point: [0.0, 0.0],
            frame_shape,
            stage: TrackerStage::Uninitialized,
            reference: BTreeMap::new(),
            snr_threshold,
        }
    }

    pub fn stage(&self) -> TrackerStage {
        self.stage
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: TrackerStage) -> Result<()> {
        if !self.stage.allows(to) {
            return Err(PhotError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        debug!(from = ?self.stage, to = ?to, "Tracker transition");
        self.stage = to;
        Ok(())
    }

    pub fn freeze(&mut self) -> Result<()> {
        self.transition(TrackerStage::Frozen)
    }

    pub fn segm(&self) -> &SegmentationImage {
        &self.segm
    }

    pub fn frame_shape(&self) -> (usize, usize) {
        self.frame_shape
    }

    pub fn extended_shape(&self) -> (usize, usize) {
        self.segm.shape()
    }

    pub fn zero_point(&self) -> [f64; 2] {
        self.zero_point
    }

    pub fn reference(&self) -> &BTreeMap<u32, [f64; 2]> {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: BTreeMap<u32, [f64; 2]>) {
        self.reference = reference;
    }

    /// Replace the extended frame. `zero_point` places the reference frame's
    /// origin within it.
    pub fn set_extended_frame(&mut self, segm: SegmentationImage, zero_point: [f64; 2]) {
        info!(
            shape = ?segm.shape(),
            zero_point = ?zero_point,
            "Tracker extended frame set"
        );
        self.segm = segm;
        self.zero_point = zero_point;
    }

    /// Clear every segment, keeping the extended frame geometry.
    pub fn reset_segments(&mut self) {
        self.segm = SegmentationImage::zeros(self.segm.shape());
        self.groups.clear();
        self.reference.clear();
    }

    // ------------------------------------------------------------------
    // Offsets
    // ------------------------------------------------------------------

    /// Size the offset table for `n` indices, all unknown.
    pub fn init_offsets(&mut self, n: usize) {
        self.offsets = vec![None; n];
    }

    pub fn offsets(&self) -> &[Offset] {
        &self.offsets
    }

    pub fn offset(&self, index: usize) -> Offset {
        self.offsets.get(index).copied().flatten()
    }

    /// Store measured offsets starting at `first`. `None` entries leave the
    /// stored value masked.
    pub fn set_offsets(&mut self, first: usize, values: &[Offset]) -> Result<()> {
        let end = first + values.len();
        if end > self.offsets.len() {
            return Err(PhotError::FrameIndexOutOfRange {
                index: end.saturating_sub(1),
                total: self.offsets.len(),
            });
        }
        self.offsets[first..end].copy_from_slice(values);
        Ok(())
    }

    /// Window start of an offset within the extended frame.
    pub fn start_for(&self, offset: [f64; 2]) -> [isize; 2] {
        [
            (self.zero_point[0] - offset[0]).round() as isize,
            (self.zero_point[1] - offset[1]).round() as isize,
        ]
    }

    /// Window start of index `i`, `None` when its offset is unknown.
    pub fn start(&self, index: usize) -> Option<[isize; 2]> {
        self.offset(index).map(|o| self.start_for(o))
    }

    pub fn starts(&self) -> Vec<Option<[isize; 2]>> {
        (0..self.offsets.len()).map(|i| self.start(i)).collect()
    }

    // ------------------------------------------------------------------
    // Segments
    // ------------------------------------------------------------------

    /// Labels seen by a frame whose window starts at `start`. Pixels outside
    /// the extended frame are background.
    pub fn get_segments(&self, start: [isize; 2], shape: (usize, usize)) -> Array2<u32> {
        self.segm.window(start, shape)
    }

    /// Merge `other` (extended-frame shaped) into the segmentation, moving
    /// its labels above the current maximum. Returns the label mapping.
    pub fn add_segments(&mut self, other: &Array2<u32>) -> Result<LabelMap> {
        self.segm.add_segments(other)
    }

    /// Non-mutating variant of [`add_segments`](Self::add_segments).
    pub fn with_segments(&self, other: &Array2<u32>) -> Result<(SegmentationImage, LabelMap)> {
        self.segm.with_segments(other)
    }

    /// Apply a relabelling to the segmentation, groups and references.
    pub fn relabel(&mut self, map: &LabelMap) {
        self.segm.relabel(map);
        self.groups.remap(map);
        self.reference = std::mem::take(&mut self.reference)
            .into_iter()
            .map(|(l, p)| (map.get(l).unwrap_or(l), p))
            .collect();
    }

    /// Part of an extended-frame `mask` seen by a frame at `start`. Pixels
    /// outside the mask are false.
    pub fn select_overlap(
        &self,
        mask: &Array2<bool>,
        start: [isize; 2],
        shape: (usize, usize),
    ) -> Array2<bool> {
        let mut out = Array2::from_elem(shape, false);
        let (h, w) = mask.dim();
        let y0 = start[0].max(0);
        let x0 = start[1].max(0);
        let y1 = (start[0] + shape.0 as isize).min(h as isize);
        let x1 = (start[1] + shape.1 as isize).min(w as isize);
        if y0 < y1 && x0 < x1 {
            let src = mask.slice(s![y0 as usize..y1 as usize, x0 as usize..x1 as usize]);
            let dy = (y0 - start[0]) as usize;
            let dx = (x0 - start[1]) as usize;
            out.slice_mut(s![dy..dy + src.nrows(), dx..dx + src.ncols()])
                .assign(&src);
        }
        out
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    /// Estimate the offset of one residual image, looking through the window
    /// at `guess`. Each bright object with centroid SNR at or above the
    /// threshold votes; the result is the median vote, or `None` when no
    /// object qualifies.
    pub fn measure_offset(&self, residual: &ArrayView2<f64>, guess: [isize; 2]) -> Offset {
        if self.reference.is_empty() {
            return None;
        }
        let labels = self.get_segments(guess, residual.dim());

        let sky = masked_values(residual, &labels.mapv(|l| l == 0));
        let Some((sky_level, sky_std)) =
            sigma_clipped_stats(&sky, DEFAULT_CLIP_SIGMA, DEFAULT_CLIP_ITERATIONS)
        else {
            return None;
        };

        let window = SegmentationImage::new(labels);
        let shifted = residual.mapv(|v| v - sky_level);
        let centroids = window.centroids(&shifted.view());

        let mut dy = Vec::new();
        let mut dx = Vec::new();
        for (label, r) in &self.reference {
            let Some(c) = centroids.get(label) else {
                continue;
            };
            let noise = sky_std * (c.n_pixels as f64).sqrt();
            let snr = if noise > 0.0 { c.flux / noise } else { f64::INFINITY };
            if snr < self.snr_threshold {
                continue;
            }
            dy.push(c.y + self.zero_point[0] - r[0]);
            dx.push(c.x + self.zero_point[1] - r[1]);
        }
        if dy.is_empty() {
            return None;
        }
        Some([nan_median(dy), nan_median(dx)])
    }

    /// Offsets of rows `range` of `residuals`, without mutating the tracker.
    /// Each index is looked at through its own start when known, otherwise
    /// through the start of the last good estimate.
    pub fn measure_offsets(
        &self,
        range: Range<usize>,
        residuals: &SharedArray<f64>,
        mut guess: [f64; 2],
    ) -> Result<Vec<Offset>> {
        let mut out = Vec::with_capacity(range.len());
        for i in range {
            let image = residuals.read_image(i)?;
            let look = self.offset(i).unwrap_or(guess);
            let measured = self.measure_offset(&image.view(), self.start_for(look));
            if let Some(o) = measured {
                guess = o;
            }
            out.push(measured);
        }
        Ok(out)
    }

    /// Measure and store offsets for rows `range` of `residuals`. Indices
    /// without a confident estimate stay masked. Returns how many were
    /// measured.
    pub fn track_loop(&mut self, range: Range<usize>, residuals: &SharedArray<f64>) -> Result<usize> {
        if range.end > self.offsets.len() {
            return Err(PhotError::FrameIndexOutOfRange {
                index: range.end.saturating_sub(1),
                total: self.offsets.len(),
            });
        }
        let guess = self
            .offsets
            .get(..range.start)
            .and_then(|prior| prior.iter().rev().find_map(|o| *o))
            .unwrap_or([0.0, 0.0]);
        let first = range.start;
        let measured = self.measure_offsets(range, residuals, guess)?;
        let n_good = measured.iter().filter(|o| o.is_some()).count();
        for (k, o) in measured.into_iter().enumerate() {
            if o.is_some() {
                self.offsets[first + k] = o;
            }
        }
        debug!(first, measured = n_good, "Tracked offsets");
        Ok(n_good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_transitions() {
        let mut t = Tracker::new((4, 4), 3.0);
        assert!(t.transition(TrackerStage::DeepRefined).is_err());
        t.transition(TrackerStage::SampleSeeded).unwrap();
        t.transition(TrackerStage::DeepRefined).unwrap();
        t.transition(TrackerStage::DeepRefined).unwrap();
        t.freeze().unwrap();
        assert!(t.transition(TrackerStage::SampleSeeded).is_err());
        t.transition(TrackerStage::DeepRefined).unwrap();
    }

    #[test]
    fn test_start_rounds_offset() {
        let mut t = Tracker::new((4, 4), 3.0);
        t.set_extended_frame(SegmentationImage::zeros((6, 6)), [2.0, 1.0]);
        assert_eq!(t.start_for([0.4, -0.6]), [2, 2]);
    }
}
