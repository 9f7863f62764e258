use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::segmentation::{LabelMap, SegmentationImage};
use crate::stats::nan_median;

/// One bleed trail: a band of columns spanning the full frame height.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Streak {
    /// Label of the streak region in the segmentation.
    pub label: u32,
    /// Bright object the trail belongs to.
    pub source: u32,
    /// First column of the band in extended-frame coordinates.
    pub col0: isize,
}

/// Frame-transfer bleed corrector.
///
/// During frame transfer a bright star leaves excess charge along its
/// columns. The model is linear: one additive level per column of each
/// streak band, estimated as the median residual of the band pixels in that
/// column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameTransferBleed {
    pub width: usize,
    pub streaks: Vec<Streak>,
}

impl FrameTransferBleed {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
            streaks: Vec::new(),
        }
    }

    pub fn n_streaks(&self) -> usize {
        self.streaks.len()
    }

    pub fn labels(&self) -> Vec<u32> {
        self.streaks.iter().map(|s| s.label).collect()
    }

    /// Follow a relabelling of the segmentation the streaks live in.
    pub fn relabel(&mut self, map: &LabelMap) {
        for streak in &mut self.streaks {
            streak.label = map.get(streak.label).unwrap_or(streak.label);
            streak.source = map.get(streak.source).unwrap_or(streak.source);
        }
    }

    /// Add a streak band for each bright object in `sources`, given its
    /// extended-frame column `x`. Band pixels already holding an object keep
    /// their label. Replaces any previous streaks and returns the new labels.
    pub fn adapt_segments(
        &mut self,
        segm: &mut SegmentationImage,
        sources: &[(u32, f64)],
    ) -> Result<Vec<u32>> {
        let (h, w) = segm.shape();
        let half = (self.width / 2) as isize;
        let mut streaks = Vec::with_capacity(sources.len());
        let mut bands = Array2::<u32>::zeros((h, w));

        for (k, &(source, x)) in sources.iter().enumerate() {
            let col0 = x.round() as isize - half;
            let band_label = k as u32 + 1;
            for c in col0.max(0)..(col0 + self.width as isize).min(w as isize) {
                for r in 0..h {
                    let c = c as usize;
                    if segm.data()[[r, c]] == 0 && bands[[r, c]] == 0 {
                        bands[[r, c]] = band_label;
                    }
                }
            }
            streaks.push((source, col0));
        }

        let map = segm.add_segments(&bands)?;
        self.streaks = streaks
            .into_iter()
            .enumerate()
            .filter_map(|(k, (source, col0))| {
                map.get(k as u32 + 1).map(|label| Streak {
                    label,
                    source,
                    col0,
                })
            })
            .collect();
        debug!(n = self.streaks.len(), width = self.width, "Bleed streak regions set");
        Ok(self.labels())
    }

    /// Fit the bleed levels on `residual` (a frame seen through a window
    /// starting at `start`) and subtract them in place.
    ///
    /// `labels` is the tracker segmentation for that window. Returns the
    /// `(n_streaks, width)` coefficients; columns outside the frame are NaN.
    pub fn fit_subtract(
        &self,
        residual: &mut Array2<f64>,
        labels: &Array2<u32>,
        start: [isize; 2],
    ) -> Array2<f64> {
        let (h, w) = residual.dim();
        let mut coeffs = Array2::<f64>::from_elem((self.streaks.len(), self.width), f64::NAN);

        for (s, streak) in self.streaks.iter().enumerate() {
            for k in 0..self.width {
                let col = streak.col0 + k as isize - start[1];
                if col < 0 || col >= w as isize {
                    continue;
                }
                let col = col as usize;
                let rows: Vec<usize> = (0..h).filter(|&r| labels[[r, col]] == streak.label).collect();
                let level = nan_median(rows.iter().map(|&r| residual[[r, col]]));
                if !level.is_finite() {
                    continue;
                }
                coeffs[[s, k]] = level;
                for &r in &rows {
                    residual[[r, col]] -= level;
                }
            }
        }
        coeffs
    }
}
