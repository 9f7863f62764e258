mod common;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use slotphot_core::segmentation::{detect_measure, DetectionConfig, Measurement, SegmentationImage};
use slotphot_core::stack::{shift_combine, Statistic};
use slotphot_core::tracking::seed::{crop_window, match_offsets};
use slotphot_core::tracking::{seed_tracker, Groups, Tracker, TrackerStage, TrackingConfig};
use slotphot_core::workspace::{SharedArray, Workspace};

use common::{gaussian, synthetic_frame};

const FRAME: (usize, usize) = (40, 40);

/// Tracker with one disk-shaped bright object at extended position
/// `(22, 22)` and zero point `(2, 2)`.
fn star_tracker() -> Tracker {
    let mut segm = Array2::<u32>::zeros((44, 44));
    for ((r, c), l) in segm.indexed_iter_mut() {
        let d2 = (r as f64 - 22.0).powi(2) + (c as f64 - 22.0).powi(2);
        if d2 <= 36.0 {
            *l = 1;
        }
    }
    let mut tracker = Tracker::new(FRAME, 3.0);
    tracker.set_extended_frame(SegmentationImage::new(segm), [2.0, 2.0]);
    tracker.groups.set(Groups::BRIGHT, vec![1]);
    tracker.set_reference([(1, [22.0, 22.0])].into_iter().collect());
    tracker
}

/// Residual-like image: zero sky, unit noise and a star at `pos`.
fn residual_with_star(pos: [f64; 2], seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn(FRAME, |(r, c)| {
        let d2 = (r as f64 - pos[0]).powi(2) + (c as f64 - pos[1]).powi(2);
        500.0 * (-d2 / 4.5).exp() + gaussian(&mut rng)
    })
}

fn residual_buffer(dir: &tempfile::TempDir, images: &[Array2<f64>]) -> SharedArray<f64> {
    let ws = Workspace::new(dir.path()).unwrap();
    let buf: SharedArray<f64> = ws
        .allocate("residuals", &[images.len(), FRAME.0, FRAME.1], f64::NAN, true)
        .unwrap();
    for (i, image) in images.iter().enumerate() {
        let flat: Vec<f64> = image.iter().copied().collect();
        buf.write_row(i, &flat).unwrap();
    }
    buf
}

// ---------------------------------------------------------------------------
// Offset measurement
// ---------------------------------------------------------------------------

#[test]
fn test_track_loop_measures_shift() {
    let mut tracker = star_tracker();
    // Reference (22, 22) minus zero point, displaced by (1, -1).
    let image = residual_with_star([21.0, 19.0], 1);
    let dir = tempfile::tempdir().unwrap();
    let residuals = residual_buffer(&dir, &[image]);

    tracker.init_offsets(1);
    let n = tracker.track_loop(0..1, &residuals).unwrap();
    assert_eq!(n, 1);
    let [dy, dx] = tracker.offset(0).unwrap();
    assert!((dy - 1.0).abs() < 0.1, "dy = {dy}");
    assert!((dx + 1.0).abs() < 0.1, "dx = {dx}");
    assert_eq!(tracker.start(0), Some([1, 3]));
}

#[test]
fn test_all_nan_residual_stays_unknown() {
    let mut tracker = star_tracker();
    let good = residual_with_star([20.0, 20.0], 2);
    let blank = Array2::<f64>::from_elem(FRAME, f64::NAN);
    let dir = tempfile::tempdir().unwrap();
    let residuals = residual_buffer(&dir, &[good, blank]);

    tracker.init_offsets(2);
    let n = tracker.track_loop(0..2, &residuals).unwrap();
    assert_eq!(n, 1);
    assert!(tracker.offset(0).is_some());
    assert_eq!(tracker.offset(1), None);
    assert_eq!(tracker.start(1), None);
}

#[test]
fn test_untracked_image_not_combined() {
    let mut tracker = star_tracker();
    tracker.init_offsets(2);
    tracker.set_offsets(0, &[Some([0.0, 0.0]), None]).unwrap();

    let a = residual_with_star([20.0, 20.0], 3);
    let b = Array2::<f64>::from_elem(FRAME, 1e6);
    let starts = tracker.starts();
    let combined = shift_combine(
        &[a.view(), b.view()],
        &starts,
        tracker.extended_shape(),
        Statistic::Median,
    )
    .unwrap();
    assert_eq!(combined.contributors, vec![0]);
    assert!(combined.image.iter().all(|v| !v.is_finite() || *v < 1e5));
    assert_eq!(combined.coverage[[0, 0]], 0);
}

#[test]
fn test_no_bright_objects_gives_no_offset() {
    let mut tracker = star_tracker();
    tracker.set_reference(Default::default());
    let image = residual_with_star([20.0, 20.0], 4);
    assert_eq!(tracker.measure_offset(&image.view(), [2, 2]), None);
}

#[test]
fn test_set_offsets_out_of_range() {
    let mut tracker = star_tracker();
    tracker.init_offsets(2);
    assert!(tracker.set_offsets(1, &[None, None]).is_err());
}

#[test]
fn test_select_overlap_clips_window() {
    let tracker = star_tracker();
    let mask = tracker.segm().object_mask();
    let seen = tracker.select_overlap(&mask, [-4, -4], (10, 10));
    assert!(seen.iter().all(|&v| !v));
    let seen = tracker.select_overlap(&mask, [18, 18], (10, 10));
    assert!(seen[[4, 4]]);
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

fn shifted_samples(shifts: &[[f64; 2]]) -> (Vec<Array2<f64>>, Vec<Measurement>) {
    let mut rng = StdRng::seed_from_u64(11);
    let images: Vec<Array2<f64>> = shifts
        .iter()
        .map(|d| synthetic_frame((48, 48), [20.0 + d[0], 24.0 + d[1]], &mut rng))
        .collect();
    let config = DetectionConfig::default();
    let measurements = images
        .iter()
        .map(|im| detect_measure(&im.view(), None, &config))
        .collect();
    (images, measurements)
}

#[test]
fn test_match_offsets_recovers_shifts() {
    let shifts = [[0.0, 0.0], [1.0, 2.0], [-1.0, 0.0], [2.0, -1.0]];
    let (_, measurements) = shifted_samples(&shifts);
    let offsets = match_offsets(&measurements, 0, 5, 20.0);
    for (o, d) in offsets.iter().zip(&shifts) {
        let o = o.unwrap();
        assert!((o[0] - d[0]).abs() < 0.2 && (o[1] - d[1]).abs() < 0.2, "{o:?} vs {d:?}");
    }
}

#[test]
fn test_seed_tracker_places_every_sample() {
    let shifts = [[0.0, 0.0], [1.0, 2.0], [-1.0, 0.0], [2.0, -1.0]];
    let (images, measurements) = shifted_samples(&shifts);
    let views: Vec<_> = images.iter().map(|im| im.view()).collect();
    let seeded = seed_tracker(&measurements, &views, &TrackingConfig::default()).unwrap();
    let tracker = &seeded.tracker;

    assert_eq!(tracker.stage(), TrackerStage::SampleSeeded);
    assert_eq!(tracker.groups.bright().len(), 1);
    assert_eq!(tracker.groups.streaks().len(), 1);
    assert_eq!(seeded.bleed.n_streaks(), 1);

    let (eh, ew) = tracker.extended_shape();
    for start in tracker.starts() {
        let [sy, sx] = start.unwrap();
        assert!(sy >= 0 && sx >= 0);
        assert!(sy as usize + 48 <= eh && sx as usize + 48 <= ew);
    }

    // The star sits on the same extended-frame pixel in every sample.
    let bright = tracker.groups.bright()[0];
    let r = tracker.reference()[&bright];
    for (i, image) in images.iter().enumerate() {
        let start = tracker.start(i).unwrap();
        let window = tracker.get_segments(start, (48, 48));
        let at_star = window[[(r[0] - start[0] as f64).round() as usize, (r[1] - start[1] as f64).round() as usize]];
        assert_eq!(at_star, bright, "sample {i}");
        let seen = crop_window(&seeded.mean.image.view(), start, (48, 48));
        assert_eq!(seen.dim(), image.dim());
    }
}

#[test]
fn test_seed_tracker_rejects_empty_input() {
    assert!(seed_tracker(&[], &[], &TrackingConfig::default()).is_err());
}
