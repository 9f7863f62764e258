use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::{
    DEFAULT_CLIP_ITERATIONS, DEFAULT_CLIP_SIGMA, DEFAULT_DILATE, DEFAULT_NPIXELS, DEFAULT_SNR,
};
use crate::error::Result;
use crate::segmentation::components::label_components;
use crate::segmentation::labels::SegmentationImage;
use crate::segmentation::morphology::dilate_labels;
use crate::stats::{masked_values, sigma_clipped_stats};

/// Thresholds for multi-tier object detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Threshold above the background median, in units of background sigma.
    pub snr: f64,
    /// Minimum pixels per object, one entry per detection tier.
    pub npixels: Vec<usize>,
    /// Dilation per tier; tiers past the end are not dilated.
    pub dilate: Vec<usize>,
    pub clip_sigma: f64,
    pub clip_iterations: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            snr: DEFAULT_SNR,
            npixels: DEFAULT_NPIXELS.to_vec(),
            dilate: DEFAULT_DILATE.to_vec(),
            clip_sigma: DEFAULT_CLIP_SIGMA,
            clip_iterations: DEFAULT_CLIP_ITERATIONS,
        }
    }
}

/// Output of a multi-tier detection.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub segm: SegmentationImage,
    /// Labels found in each tier, in tier order.
    pub tiers: Vec<Vec<u32>>,
    /// Background median and sigma of the image.
    pub background: Option<(f64, f64)>,
}

/// Per-image detections with positions and counts, brightest first.
#[derive(Clone, Debug)]
pub struct Measurement {
    pub segm: SegmentationImage,
    /// `(y, x)` centroid per label, index `label - 1`.
    pub centroids: Vec<[f64; 2]>,
    /// Background-subtracted counts per label, index `label - 1`.
    pub counts: Vec<f64>,
    pub background: f64,
}

/// Sigma-clipped background statistics of the finite pixels not in `mask`.
pub fn background_stats(
    image: &ArrayView2<f64>,
    mask: Option<&Array2<bool>>,
    config: &DetectionConfig,
) -> Option<(f64, f64)> {
    let values = match mask {
        Some(m) => masked_values(image, &m.mapv(|v| !v)),
        None => image.iter().copied().filter(|v| v.is_finite()).collect(),
    };
    sigma_clipped_stats(&values, config.clip_sigma, config.clip_iterations)
}

/// Single-threshold detection: connected pixels above `median + snr * std`
/// (outside `mask`) with at least `npixels` members, grown by `dilate`.
pub fn detect(
    image: &ArrayView2<f64>,
    mask: Option<&Array2<bool>>,
    snr: f64,
    npixels: usize,
    dilate: usize,
    config: &DetectionConfig,
) -> SegmentationImage {
    let Some((median, std)) = background_stats(image, mask, config) else {
        return SegmentationImage::zeros(image.dim());
    };
    let threshold = median + snr * std;

    let mut above = image.mapv(|v| v.is_finite() && v > threshold);
    if let Some(m) = mask {
        Zip::from(&mut above).and(m).for_each(|a, &masked| *a &= !masked);
    }
    let (labels, n) = label_components(&above, npixels.max(1));
    debug!(threshold, objects = n, npixels, "Detected objects");

    let mut labels = if dilate > 0 {
        dilate_labels(&labels, dilate)
    } else {
        labels
    };
    if let Some(m) = mask {
        Zip::from(&mut labels).and(m).for_each(|l, &masked| {
            if masked {
                *l = 0;
            }
        });
    }
    SegmentationImage::new(labels)
}

/// Multi-tier detection. Each tier masks everything found by earlier tiers
/// and searches again with its own minimum size and dilation.
pub fn detect_loop(
    image: &ArrayView2<f64>,
    mask: Option<&Array2<bool>>,
    config: &DetectionConfig,
) -> Result<DetectionResult> {
    let shape = image.dim();
    let mut segm = SegmentationImage::zeros(shape);
    let mut covered = match mask {
        Some(m) => m.clone(),
        None => Array2::from_elem(shape, false),
    };
    let background = background_stats(image, mask, config);

    let mut tiers = Vec::with_capacity(config.npixels.len());
    for (tier, &npixels) in config.npixels.iter().enumerate() {
        let dilate = config.dilate.get(tier).copied().unwrap_or(0);
        let found = detect(image, Some(&covered), config.snr, npixels, dilate, config);
        let map = segm.add_segments(found.data())?;
        Zip::from(&mut covered)
            .and(found.data())
            .for_each(|c, &l| *c |= l != 0);
        debug!(tier, npixels, new = map.len(), "Detection tier complete");
        tiers.push(map.new_labels());
    }

    Ok(DetectionResult {
        segm,
        tiers,
        background,
    })
}

/// Detect objects in one tier and measure them. Labels are sorted by
/// descending counts.
pub fn detect_measure(
    image: &ArrayView2<f64>,
    mask: Option<&Array2<bool>>,
    config: &DetectionConfig,
) -> Measurement {
    let npixels = config.npixels.first().copied().unwrap_or(1);
    let dilate = config.dilate.first().copied().unwrap_or(0);
    let mut segm = detect(image, mask, config.snr, npixels, dilate, config);
    let background = background_stats(image, mask, config)
        .map(|(m, _)| m)
        .unwrap_or(0.0);

    let mut shifted = image.to_owned();
    shifted.mapv_inplace(|v| v - background);
    segm.count_sort(&shifted.view());

    let counts = segm.counts(image, background);
    let centroids = segm.centroids(&shifted.view());
    let labels = segm.labels();
    Measurement {
        centroids: labels
            .iter()
            .map(|l| {
                centroids
                    .get(l)
                    .map(|c| [c.y, c.x])
                    .unwrap_or([f64::NAN, f64::NAN])
            })
            .collect(),
        counts: labels
            .iter()
            .map(|l| counts.get(l).copied().unwrap_or(0.0))
            .collect(),
        segm,
        background,
    }
}
