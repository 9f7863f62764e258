mod common;

use slotphot_core::exec::FailureCap;
use slotphot_core::io::npy::{NpyDtype, NpyFile};
use slotphot_core::io::persist::{
    check_resume_compatibility, load_state, save_state, start_indices, PersistedState, StatePaths,
};
use slotphot_core::io::ImageCube;
use slotphot_core::model::{BackgroundModel, FrameTransferBleed, Models, SplineOrders};
use slotphot_core::pipeline::{ConvergenceConfig, PipelineConfig};
use slotphot_core::segmentation::SegmentationImage;
use slotphot_core::tracking::{Tracker, TrackerStage};
use slotphot_core::PhotError;

use common::write_test_npy;

fn ramp(n: usize) -> Vec<f64> {
    (0..n).map(|v| v as f64).collect()
}

// ---------------------------------------------------------------------------
// NPY cubes
// ---------------------------------------------------------------------------

#[test]
fn test_npy_header_parsed() {
    let file = write_test_npy(&[5, 6, 7], &ramp(5 * 6 * 7));
    let npy = NpyFile::open(file.path()).unwrap();
    assert_eq!(npy.shape(), &[5, 6, 7]);
    assert_eq!(npy.header.dtype, NpyDtype::F64);
    assert!(npy.header.little_endian);
    assert_eq!(npy.header.data_offset % 64, 0);
}

#[test]
fn test_cube_frames_and_subset() {
    let file = write_test_npy(&[5, 6, 7], &ramp(5 * 6 * 7));
    let cube = ImageCube::open(file.path(), None).unwrap();
    assert_eq!(cube.len(), 5);
    assert_eq!(cube.frame_shape(), (6, 7));
    let frame = cube.frame(2).unwrap();
    assert_eq!(frame[[1, 3]], (2 * 42 + 7 + 3) as f64);

    let cube = cube.with_subset(1..4).unwrap();
    assert_eq!(cube.len(), 3);
    assert_eq!(cube.frame(0).unwrap()[[0, 0]], 42.0);
    assert!(cube.frame(3).is_err());
}

#[test]
fn test_bad_subset_rejected() {
    let file = write_test_npy(&[5, 2, 2], &ramp(20));
    let cube = ImageCube::open(file.path(), None).unwrap();
    assert!(cube.with_subset(3..9).is_err());
}

#[test]
fn test_four_dimensional_cube_needs_channel() {
    let file = write_test_npy(&[2, 3, 2, 2], &ramp(24));
    let err = ImageCube::open(file.path(), None).err().unwrap();
    assert!(matches!(err, PhotError::ChannelRequired { n_channels: 3 }));

    let cube = ImageCube::open(file.path(), Some(1)).unwrap();
    // Frame 1, channel 1 starts at plane 4.
    assert_eq!(cube.frame(1).unwrap()[[0, 0]], 16.0);
    assert!(ImageCube::open(file.path(), Some(3)).is_err());
}

#[test]
fn test_truncated_file_rejected() {
    let file = write_test_npy(&[4, 4, 4], &ramp(10));
    assert!(NpyFile::open(file.path()).is_err());
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn test_config_toml_round_trip() {
    let mut config = PipelineConfig::default();
    config.subset = Some([10, 200]);
    config.convergence = ConvergenceConfig::FixedRounds { rounds: 3 };
    config.failure_cap = FailureCap::Count(4);
    let text = config.to_toml_string().unwrap();
    let back = PipelineConfig::from_toml_str(&text).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_partial_config_uses_defaults() {
    let text = r#"
        failure_cap = "10%"

        [sampling]
        n_comb = 5

        [convergence]
        policy = "fixed_rounds"
        rounds = 2
    "#;
    let config = PipelineConfig::from_toml_str(text).unwrap();
    assert_eq!(config.sampling.n_comb, 5);
    assert_eq!(config.failure_cap, FailureCap::Fraction(0.1));
    assert_eq!(config.convergence, ConvergenceConfig::FixedRounds { rounds: 2 });
    assert_eq!(config.background, PipelineConfig::default().background);
}

#[test]
fn test_invalid_config_rejected() {
    assert!(PipelineConfig::from_toml_str("[sampling]\nn_comb = 0\n").is_err());
    assert!(PipelineConfig::from_toml_str("subset = [5, 5]\n").is_err());
    assert!(PipelineConfig::from_toml_str("failure_cap = \"lots\"\n").is_err());
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

fn seeded_state() -> PersistedState {
    let mut tracker = Tracker::new((8, 8), 3.0);
    let mut segm = ndarray::Array2::<u32>::zeros((10, 10));
    segm[[4, 4]] = 1;
    tracker.set_extended_frame(SegmentationImage::new(segm), [1.0, 1.0]);
    tracker.set_reference([(1, [4.0, 4.0])].into_iter().collect());
    tracker.init_offsets(3);
    tracker
        .set_offsets(0, &[Some([0.0, 0.0]), None, Some([1.2, -0.4])])
        .unwrap();
    tracker.transition(TrackerStage::SampleSeeded).unwrap();

    let orders = SplineOrders {
        y: vec![1],
        x: vec![1],
    };
    let models = Models {
        background: BackgroundModel::new((8, 8), orders).unwrap(),
        bleed: FrameTransferBleed::new(3),
    };
    PersistedState {
        start_idx: start_indices(&tracker),
        tracker,
        models,
    }
}

#[test]
fn test_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StatePaths::new(dir.path());
    assert!(!paths.exist());

    let state = seeded_state();
    assert_eq!(state.start_idx, vec![Some([1, 1]), None, Some([0, 1])]);
    save_state(&paths, &state).unwrap();
    assert!(paths.exist());

    let back = load_state(&paths).unwrap();
    assert_eq!(back.start_idx, state.start_idx);
    assert_eq!(back.models, state.models);
    assert_eq!(back.tracker.stage(), TrackerStage::SampleSeeded);
    assert_eq!(back.tracker.offsets(), state.tracker.offsets());
    assert_eq!(back.tracker.segm(), state.tracker.segm());
    assert_eq!(back.tracker.reference(), state.tracker.reference());
    check_resume_compatibility(&back, (8, 8), Some(3)).unwrap();
}

#[test]
fn test_resume_mismatch_detected() {
    let state = seeded_state();
    let mismatch = |r: slotphot_core::Result<()>| matches!(r, Err(PhotError::ResumeMismatch(_)));

    assert!(mismatch(check_resume_compatibility(&state, (8, 9), None)));
    assert!(mismatch(check_resume_compatibility(&state, (8, 8), Some(4))));

    let mut outside = state.clone();
    outside.start_idx[0] = Some([5, 0]);
    assert!(mismatch(check_resume_compatibility(&outside, (8, 8), None)));

    let mut fresh = state;
    fresh.tracker = Tracker::new((8, 8), 3.0);
    assert!(mismatch(check_resume_compatibility(&fresh, (8, 8), None)));
}
