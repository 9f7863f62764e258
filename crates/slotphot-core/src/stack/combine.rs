use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::consts::PARALLEL_PIXEL_THRESHOLD;
use crate::error::{PhotError, Result};
use crate::stats::median_in_place;

/// Per-pixel statistic used when combining offset images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    #[default]
    Median,
}

/// An offset-aligned combination of several images on a shared canvas.
#[derive(Clone, Debug)]
pub struct CombinedImage {
    /// Combined values; NaN where no image contributed.
    pub image: Array2<f64>,
    /// Number of finite values that entered each pixel.
    pub coverage: Array2<u32>,
    /// Indices (into the input slice) of the images that were combined.
    pub contributors: Vec<usize>,
}

/// Combine `images` on a canvas of `canvas_shape`, placing image `i` with its
/// top-left corner at `starts[i]`.
///
/// Images whose start is `None` (untracked) are skipped entirely. Parts of an
/// image falling outside the canvas are clipped. Canvas pixels not covered by
/// any finite value are NaN.
pub fn shift_combine(
    images: &[ArrayView2<f64>],
    starts: &[Option<[isize; 2]>],
    canvas_shape: (usize, usize),
    statistic: Statistic,
) -> Result<CombinedImage> {
    if images.len() != starts.len() {
        return Err(PhotError::Config(format!(
            "{} images but {} start positions",
            images.len(),
            starts.len()
        )));
    }

    let placed: Vec<(usize, &ArrayView2<f64>, [isize; 2])> = images
        .iter()
        .zip(starts)
        .enumerate()
        .filter_map(|(i, (img, start))| start.map(|s| (i, img, s)))
        .collect();
    if placed.is_empty() {
        return Err(PhotError::EmptySequence);
    }

    let (h, w) = canvas_shape;
    let mut image = Array2::<f64>::from_elem((h, w), f64::NAN);
    let mut coverage = Array2::<u32>::zeros((h, w));

    let combine_row = |row: usize, out: &mut [f64], cov: &mut [u32], scratch: &mut Vec<f64>| {
        for col in 0..w {
            scratch.clear();
            for (_, img, [sy, sx]) in &placed {
                let y = row as isize - sy;
                let x = col as isize - sx;
                if y < 0 || x < 0 {
                    continue;
                }
                let (ih, iw) = img.dim();
                let (y, x) = (y as usize, x as usize);
                if y >= ih || x >= iw {
                    continue;
                }
                let v = img[[y, x]];
                if v.is_finite() {
                    scratch.push(v);
                }
            }
            cov[col] = scratch.len() as u32;
            out[col] = match statistic {
                _ if scratch.is_empty() => f64::NAN,
                Statistic::Mean => scratch.iter().sum::<f64>() / scratch.len() as f64,
                Statistic::Median => median_in_place(scratch),
            };
        }
    };

    let rows = image
        .axis_iter_mut(Axis(0))
        .zip(coverage.axis_iter_mut(Axis(0)));
    if h * w >= PARALLEL_PIXEL_THRESHOLD {
        rows.collect::<Vec<_>>()
            .into_par_iter()
            .enumerate()
            .for_each_init(
                || Vec::with_capacity(placed.len()),
                |scratch, (row, (mut out, mut cov))| {
                    if let (Some(o), Some(c)) = (out.as_slice_mut(), cov.as_slice_mut()) {
                        combine_row(row, o, c, scratch);
                    }
                },
            );
    } else {
        let mut scratch = Vec::with_capacity(placed.len());
        for (row, (mut out, mut cov)) in rows.enumerate() {
            if let (Some(o), Some(c)) = (out.as_slice_mut(), cov.as_slice_mut()) {
                combine_row(row, o, c, &mut scratch);
            }
        }
    }

    Ok(CombinedImage {
        image,
        coverage,
        contributors: placed.iter().map(|(i, _, _)| *i).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_image_excluded() {
        let a = Array2::<f64>::from_elem((4, 4), 1.0);
        let b = Array2::<f64>::from_elem((4, 4), 100.0);
        let out = shift_combine(
            &[a.view(), b.view()],
            &[Some([0, 0]), None],
            (4, 4),
            Statistic::Mean,
        )
        .unwrap();
        assert_eq!(out.contributors, vec![0]);
        assert!(out.image.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_uncovered_pixels_are_nan() {
        let a = Array2::<f64>::from_elem((2, 2), 3.0);
        let out = shift_combine(&[a.view()], &[Some([1, 1])], (4, 4), Statistic::Median).unwrap();
        assert!(out.image[[0, 0]].is_nan());
        assert_eq!(out.coverage[[0, 0]], 0);
        assert_eq!(out.image[[2, 2]], 3.0);
        assert_eq!(out.coverage[[1, 1]], 1);
    }
}
