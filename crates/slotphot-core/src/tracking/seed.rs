use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayView2, Zip};
use tracing::{info, warn};

use crate::error::{PhotError, Result};
use crate::model::FrameTransferBleed;
use crate::segmentation::components::label_components;
use crate::segmentation::{Measurement, SegmentationImage};
use crate::stack::{shift_combine, CombinedImage, Statistic};
use crate::stats::{masked_values, nan_median};
use crate::tracking::groups::Groups;
use crate::tracking::tracker::{Offset, Tracker, TrackerStage};
use crate::tracking::TrackingConfig;

/// Output of tracker seeding.
pub struct Seeded {
    pub tracker: Tracker,
    pub bleed: FrameTransferBleed,
    /// Offset-aligned mean of the sample images on the extended frame.
    pub mean: CombinedImage,
    /// Index of the sample that defines zero offset.
    pub reference_index: usize,
}

/// Offsets of every sample relative to `reference`, by matching its
/// brightest detections to the nearest detection within `radius`.
pub fn match_offsets(
    measurements: &[Measurement],
    reference: usize,
    match_count: usize,
    radius: f64,
) -> Vec<Offset> {
    let stars: Vec<[f64; 2]> = measurements[reference]
        .centroids
        .iter()
        .copied()
        .filter(|c| c[0].is_finite() && c[1].is_finite())
        .take(match_count)
        .collect();
    if stars.is_empty() {
        warn!("Reference sample has no detections; assuming a static camera");
        return vec![Some([0.0, 0.0]); measurements.len()];
    }

    measurements
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if i == reference {
                return Some([0.0, 0.0]);
            }
            let candidates: Vec<[f64; 2]> = m
                .centroids
                .iter()
                .copied()
                .take(2 * match_count)
                .collect();
            let mut dy = Vec::new();
            let mut dx = Vec::new();
            for star in &stars {
                let nearest = candidates
                    .iter()
                    .map(|c| (c, (c[0] - star[0]).hypot(c[1] - star[1])))
                    .filter(|(_, d)| d.is_finite() && *d <= radius)
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                if let Some((c, _)) = nearest {
                    dy.push(c[0] - star[0]);
                    dx.push(c[1] - star[1]);
                }
            }
            (!dy.is_empty()).then(|| [nan_median(dy), nan_median(dx)])
        })
        .collect()
}

/// Zero point and extended shape holding every known offset footprint.
pub fn extended_frame(offsets: &[Offset], frame_shape: (usize, usize)) -> ([f64; 2], (usize, usize)) {
    let known: Vec<[f64; 2]> = offsets.iter().flatten().copied().collect();
    if known.is_empty() {
        return ([0.0, 0.0], frame_shape);
    }
    let max_y = known.iter().map(|o| o[0]).fold(f64::NEG_INFINITY, f64::max);
    let max_x = known.iter().map(|o| o[1]).fold(f64::NEG_INFINITY, f64::max);
    let zero_point = [max_y.max(0.0).ceil(), max_x.max(0.0).ceil()];
    let max_start = |axis: usize| {
        known
            .iter()
            .map(|o| (zero_point[axis] - o[axis]).round().max(0.0) as usize)
            .max()
            .unwrap_or(0)
    };
    let shape = (frame_shape.0 + max_start(0), frame_shape.1 + max_start(1));
    (zero_point, shape)
}

/// Extended-frame window of `shape` at `start`, NaN outside `image`.
pub fn crop_window(image: &ArrayView2<f64>, start: [isize; 2], shape: (usize, usize)) -> Array2<f64> {
    let mut out = Array2::from_elem(shape, f64::NAN);
    let (h, w) = image.dim();
    let y0 = start[0].max(0);
    let x0 = start[1].max(0);
    let y1 = (start[0] + shape.0 as isize).min(h as isize);
    let x1 = (start[1] + shape.1 as isize).min(w as isize);
    if y0 < y1 && x0 < x1 {
        let src = image.slice(s![y0 as usize..y1 as usize, x0 as usize..x1 as usize]);
        let dy = (y0 - start[0]) as usize;
        let dx = (x0 - start[1]) as usize;
        out.slice_mut(s![dy..dy + src.nrows(), dx..dx + src.ncols()])
            .assign(&src);
    }
    out
}

/// Build the initial tracker from per-sample detections.
///
/// The sample with the most detections is the offset reference. Sample
/// segmentations are placed on the extended frame and a pixel is kept when
/// the fraction of covering samples that flag it exceeds
/// `config.merge_accept`.
pub fn seed_tracker(
    measurements: &[Measurement],
    images: &[ArrayView2<f64>],
    config: &TrackingConfig,
) -> Result<Seeded> {
    if measurements.is_empty() || measurements.len() != images.len() {
        return Err(PhotError::EmptySequence);
    }
    let frame_shape = images[0].dim();

    let reference_index = measurements
        .iter()
        .enumerate()
        .max_by(|a, b| {
            a.1.counts
                .len()
                .cmp(&b.1.counts.len())
                .then(b.0.cmp(&a.0))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    let offsets = match_offsets(
        measurements,
        reference_index,
        config.match_count,
        config.match_radius,
    );
    let (zero_point, ext_shape) = extended_frame(&offsets, frame_shape);
    let mut tracker = Tracker::new(frame_shape, config.snr);
    tracker.set_extended_frame(SegmentationImage::zeros(ext_shape), zero_point);
    tracker.init_offsets(offsets.len());
    tracker.set_offsets(0, &offsets)?;
    let starts = tracker.starts();

    // Vote merge of the per-sample segmentations.
    let mut votes = Array2::<u32>::zeros(ext_shape);
    let mut coverage = Array2::<u32>::zeros(ext_shape);
    for (m, start) in measurements.iter().zip(&starts) {
        let Some([sy, sx]) = *start else { continue };
        let (sy, sx) = (sy as usize, sx as usize);
        let (h, w) = m.segm.shape();
        let mut v = votes.slice_mut(s![sy..sy + h, sx..sx + w]);
        Zip::from(&mut v)
            .and(m.segm.data())
            .for_each(|v, &l| *v += u32::from(l != 0));
        coverage
            .slice_mut(s![sy..sy + h, sx..sx + w])
            .mapv_inplace(|c| c + 1);
    }
    let accept = config.merge_accept;
    let merged = Zip::from(&votes)
        .and(&coverage)
        .map_collect(|&v, &c| v > 0 && v as f64 >= accept * c as f64);
    let (labels, n_objects) = label_components(&merged, 1);
    let mut segm = SegmentationImage::new(labels);
    segm.dilate(config.post_merge_dilate);

    let mean = shift_combine(images, &starts, ext_shape, Statistic::Mean)?;
    let sky = masked_values(&mean.image.view(), &segm.object_mask().mapv(|o| !o));
    let background = nan_median(sky);
    let background = if background.is_finite() { background } else { 0.0 };
    let above = mean.image.mapv(|v| v - background);
    segm.count_sort(&above.view());

    let counts = segm.counts(&mean.image.view(), background);
    let centroids = segm.centroids(&above.view());
    let bright: Vec<u32> = counts
        .iter()
        .filter(|(_, c)| **c > config.bright_thresh_counts)
        .map(|(l, _)| *l)
        .collect();
    let faint: Vec<u32> = counts
        .keys()
        .copied()
        .filter(|l| !bright.contains(l))
        .collect();

    let reference: BTreeMap<u32, [f64; 2]> = bright
        .iter()
        .filter_map(|&l| centroids.get(&l).map(|c| (l, [c.y, c.x])))
        .collect();
    let sources: Vec<(u32, f64)> = reference.iter().map(|(&l, p)| (l, p[1])).collect();

    let mut bleed = FrameTransferBleed::new(config.ftb_width);
    let streaks = bleed.adapt_segments(&mut segm, &sources)?;

    tracker.set_extended_frame(segm, zero_point);
    tracker.groups.set(Groups::BRIGHT, bright.clone());
    tracker.groups.set("objects", faint);
    tracker.groups.set(Groups::STREAKS, streaks);
    tracker.set_reference(reference);
    tracker.transition(TrackerStage::SampleSeeded)?;

    info!(
        samples = measurements.len(),
        tracked = offsets.iter().filter(|o| o.is_some()).count(),
        objects = n_objects,
        bright = bright.len(),
        extended = ?ext_shape,
        "Tracker seeded"
    );
    Ok(Seeded {
        tracker,
        bleed,
        mean,
        reference_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_frame_covers_offsets() {
        let offsets = vec![Some([0.0, 0.0]), Some([2.4, -1.0]), None, Some([-3.0, 1.6])];
        let (zp, shape) = extended_frame(&offsets, (10, 10));
        assert_eq!(zp, [3.0, 2.0]);
        // starts: [3,2], [1,3], [6,0] -> max start y 6, x 3
        assert_eq!(shape, (16, 13));
    }
}
