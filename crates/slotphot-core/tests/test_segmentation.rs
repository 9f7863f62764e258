mod common;

use std::collections::BTreeSet;

use ndarray::{array, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use slotphot_core::model::FrameTransferBleed;
use slotphot_core::segmentation::components::label_components;
use slotphot_core::segmentation::{detect_loop, detect_measure, DetectionConfig, SegmentationImage};
use slotphot_core::tracking::{Groups, Tracker};
use slotphot_core::PhotError;

use common::synthetic_frame;

// ---------------------------------------------------------------------------
// Label merging
// ---------------------------------------------------------------------------

#[test]
fn test_add_segments_never_reuses_labels() {
    let mut segm = SegmentationImage::new(array![[1, 1, 0, 0], [0, 0, 0, 2], [0, 0, 0, 2]]);
    let other = array![[0, 0, 1, 0], [5, 0, 0, 0], [5, 0, 0, 0]];
    let before: BTreeSet<u32> = segm.labels().into_iter().collect();

    let map = segm.add_segments(&other).unwrap();

    assert_eq!(map.0, vec![(1, 3), (5, 4)]);
    for new in map.new_labels() {
        assert!(!before.contains(&new));
    }
    assert_eq!(segm.data()[[0, 0]], 1);
    assert_eq!(segm.data()[[0, 2]], 3);
    assert_eq!(segm.data()[[2, 0]], 4);
    assert_eq!(segm.data()[[2, 3]], 2);
    assert_eq!(segm.n_labels(), 4);
}

#[test]
fn test_add_segments_overwrites_existing_pixels() {
    let mut segm = SegmentationImage::new(array![[1, 1], [0, 0]]);
    let map = segm.add_segments(&array![[0, 7], [0, 0]]).unwrap();
    assert_eq!(map.get(7), Some(2));
    assert_eq!(segm.data(), &array![[1, 2], [0, 0]]);
}

#[test]
fn test_add_segments_shape_mismatch() {
    let mut segm = SegmentationImage::zeros((3, 3));
    let err = segm.add_segments(&Array2::zeros((3, 4))).unwrap_err();
    assert!(matches!(err, PhotError::LabelShapeMismatch { .. }));
}

#[test]
fn test_with_segments_leaves_original() {
    let segm = SegmentationImage::new(array![[1, 0], [0, 0]]);
    let (merged, map) = segm.with_segments(&array![[0, 0], [0, 1]]).unwrap();
    assert_eq!(segm.n_labels(), 1);
    assert_eq!(merged.data()[[1, 1]], 2);
    assert_eq!(map.len(), 1);
}

#[test]
fn test_count_sort_brightest_first() {
    let mut segm = SegmentationImage::new(array![[1, 0, 2], [1, 0, 2], [0, 0, 3]]);
    let image = array![[1.0, 0.0, 9.0], [1.0, 0.0, 9.0], [0.0, 0.0, 5.0]];
    let map = segm.count_sort(&image.view());
    assert_eq!(map.get(2), Some(1));
    assert_eq!(map.get(3), Some(2));
    assert_eq!(map.get(1), Some(3));
    assert_eq!(segm.data()[[0, 2]], 1);
}

#[test]
fn test_components_are_eight_connected() {
    let mask = array![
        [true, false, false, false],
        [false, true, false, false],
        [false, false, false, true],
        [false, false, false, false]
    ];
    let (labels, n) = label_components(&mask, 1);
    assert_eq!(n, 2);
    assert_eq!(labels[[0, 0]], labels[[1, 1]]);
    assert_ne!(labels[[0, 0]], labels[[2, 3]]);

    let (_, n) = label_components(&mask, 2);
    assert_eq!(n, 1);
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[test]
fn test_detect_measure_finds_star() {
    let mut rng = StdRng::seed_from_u64(3);
    let image = synthetic_frame((48, 48), [20.0, 30.0], &mut rng);
    let m = detect_measure(&image.view(), None, &DetectionConfig::default());

    assert!(!m.counts.is_empty());
    let [y, x] = m.centroids[0];
    assert!((y - 20.0).abs() < 0.3, "y = {y}");
    assert!((x - 30.0).abs() < 0.3, "x = {x}");
    assert!(m.counts.windows(2).all(|w| w[0] >= w[1]));
    assert!((m.background - common::SKY).abs() < 5.0);
}

#[test]
fn test_detect_loop_tiers_do_not_overlap() {
    let mut rng = StdRng::seed_from_u64(4);
    let image = synthetic_frame((48, 48), [24.0, 24.0], &mut rng);
    let result = detect_loop(&image.view(), None, &DetectionConfig::default()).unwrap();

    let mut seen = BTreeSet::new();
    for tier in &result.tiers {
        for &l in tier {
            assert!(seen.insert(l), "label {l} in two tiers");
        }
    }
    assert!(result.tiers[0].contains(&result.segm.data()[[24, 24]]));
}

#[test]
fn test_detect_on_all_nan_is_empty() {
    let image = Array2::<f64>::from_elem((16, 16), f64::NAN);
    let m = detect_measure(&image.view(), None, &DetectionConfig::default());
    assert_eq!(m.segm.n_labels(), 0);
    assert!(m.counts.is_empty());
}

// ---------------------------------------------------------------------------
// Bleed streaks inside the tracker segmentation
// ---------------------------------------------------------------------------

#[test]
fn test_streak_labels_follow_tracker_merge() {
    let mut tracker = Tracker::new((10, 10), 3.0);
    tracker.set_extended_frame(SegmentationImage::zeros((10, 10)), [0.0, 0.0]);
    let mut existing = Array2::<u32>::zeros((10, 10));
    existing[[0, 0]] = 1;
    tracker.add_segments(&existing).unwrap();

    let mut local = Array2::<u32>::zeros((10, 10));
    local[[5, 5]] = 1;
    let mut local = SegmentationImage::new(local);
    let mut bleed = FrameTransferBleed::new(3);
    let streaks = bleed.adapt_segments(&mut local, &[(1, 5.0)]).unwrap();
    assert_eq!(streaks, vec![2]);

    let map = tracker.add_segments(local.data()).unwrap();
    bleed.relabel(&map);
    tracker.groups.set(Groups::STREAKS, map.apply(&streaks));

    let streak = &bleed.streaks[0];
    assert_eq!(streak.source, 2);
    assert_eq!(streak.label, 3);
    assert_eq!(tracker.segm().data()[[0, 4]], 3);
    assert_eq!(tracker.segm().data()[[5, 5]], 2);
    assert_eq!(tracker.groups.streaks(), &[3]);
}
