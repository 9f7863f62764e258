mod common;

use ndarray::{s, Array3};
use slotphot_core::exec::FailureCap;
use slotphot_core::io::persist::{load_state, StatePaths};
use slotphot_core::io::ImageCube;
use slotphot_core::pipeline::convergence::round_gof;
use slotphot_core::pipeline::{run_pipeline, ConvergenceConfig, NoOpReporter, PipelineConfig};
use slotphot_core::tracking::TrackerStage;
use slotphot_core::PhotError;

use common::{synthetic_cube, NOISE};

const N_FRAMES: usize = 20;
const SHAPE: (usize, usize) = (64, 64);
const STAR: [f64; 2] = [32.0, 20.0];

fn scenario_config(results: &std::path::Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        results: results.to_path_buf(),
        n_workers: 2,
        convergence: ConvergenceConfig::FixedRounds { rounds: 2 },
        ..Default::default()
    };
    config.sampling.n_comb = 1;
    config.sampling.detect_per_worker = 3;
    config.sampling.fit_per_worker = 2;
    config.background.orders_y = vec![2];
    config.background.orders_x = vec![2];
    config
}

// ---------------------------------------------------------------------------
// Static camera, one bright star
// ---------------------------------------------------------------------------

#[test]
fn test_static_star_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path());
    let cube = ImageCube::from_array(synthetic_cube(N_FRAMES, SHAPE, STAR, 42));

    let summary = run_pipeline(&cube, &config, &NoOpReporter).unwrap();

    assert_eq!(summary.n_frames, N_FRAMES);
    assert_eq!(summary.n_samples, 6);
    assert!(!summary.resumed);
    assert_eq!(summary.rounds.len(), 2);
    assert_eq!(summary.n_bright, 1);
    assert_eq!(summary.stage, TrackerStage::Frozen);
    assert_eq!(summary.tracked_frames, Some(N_FRAMES));

    let last = summary.rounds.last().unwrap();
    assert_eq!(last.n_failed(), 0);
    let gof: Vec<f64> = last.gof.iter().map(|(_, g)| *g).collect();
    let median = round_gof(&gof);
    assert!(
        (median / (NOISE * NOISE) - 1.0).abs() < 0.3,
        "median gof {median}"
    );

    let sampling = &summary.tasks[0];
    assert_eq!(sampling.name, "sampling");
    assert_eq!(sampling.successes, 6);
    assert_eq!(sampling.failures, 0);

    // The camera never moves, so every frame offset is close to zero.
    let state = load_state(&StatePaths::new(dir.path())).unwrap();
    assert_eq!(state.tracker.offsets().len(), N_FRAMES);
    for (i, o) in state.tracker.offsets().iter().enumerate() {
        let [dy, dx] = o.unwrap();
        assert!(dy.abs() < 0.5 && dx.abs() < 0.5, "frame {i}: {dy}, {dx}");
    }
    assert_eq!(state.start_idx.len(), 6);
}

#[test]
fn test_rerun_resumes_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path());
    let cube = ImageCube::from_array(synthetic_cube(N_FRAMES, SHAPE, STAR, 7));

    let first = run_pipeline(&cube, &config, &NoOpReporter).unwrap();
    let second = run_pipeline(&cube, &config, &NoOpReporter).unwrap();

    assert!(second.resumed);
    assert!(second.rounds.is_empty());
    assert_eq!(second.n_objects, first.n_objects);
    assert_eq!(second.n_bright, 1);
    assert_eq!(second.tracked_frames, Some(N_FRAMES));

    let clobbered = PipelineConfig {
        clobber: true,
        ..config
    };
    let third = run_pipeline(&cube, &clobbered, &NoOpReporter).unwrap();
    assert!(!third.resumed);
    assert_eq!(third.rounds.len(), 2);
}

#[test]
fn test_resume_with_other_frame_shape_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path());
    let cube = ImageCube::from_array(synthetic_cube(N_FRAMES, SHAPE, STAR, 8));
    run_pipeline(&cube, &config, &NoOpReporter).unwrap();

    let narrow = ImageCube::from_array(synthetic_cube(N_FRAMES, (64, 48), STAR, 8));
    match run_pipeline(&narrow, &config, &NoOpReporter) {
        Err(PhotError::ResumeMismatch(msg)) => assert!(msg.contains("frame shape"), "{msg}"),
        other => panic!("expected a resume mismatch, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Frames without usable pixels
// ---------------------------------------------------------------------------

#[test]
fn test_blank_frame_skipped_by_full_cube_pass() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path());

    // No sample is built from frame 4, only its own full-cube block.
    let mut data: Array3<f64> = synthetic_cube(N_FRAMES, SHAPE, STAR, 11);
    data.slice_mut(s![4, .., ..]).fill(f64::NAN);
    let cube = ImageCube::from_array(data);

    let summary = run_pipeline(&cube, &config, &NoOpReporter).unwrap();
    assert_eq!(summary.tracked_frames, Some(N_FRAMES - 1));

    let blocks = summary.tasks.iter().find(|t| t.name == "full-cube").unwrap();
    assert_eq!(blocks.size, N_FRAMES);
    assert_eq!(blocks.failures, 1);
    assert_eq!(blocks.successes, N_FRAMES - 1);

    // Frames after the blank one in the same interval are still tracked.
    let state = load_state(&StatePaths::new(dir.path())).unwrap();
    for (i, o) in state.tracker.offsets().iter().enumerate() {
        if i == 4 {
            assert!(o.is_none());
            continue;
        }
        let [dy, dx] = o.unwrap();
        assert!(dy.abs() < 0.5 && dx.abs() < 0.5, "frame {i}: {dy}, {dx}");
    }
}
// ---------------------------------------------------------------------------

#[test]
fn test_blank_sample_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = scenario_config(dir.path());
    config.convergence = ConvergenceConfig::FixedRounds { rounds: 1 };
    config.sampling.fit_per_worker = 3;
    config.full_cube_pass = false;
    config.failure_cap = FailureCap::Unlimited;

    // Samples cover frames [0,3) [3,6) [6,10) [10,13) [13,16) [16,20); the
    // third one only sees blank frames.
    let mut data: Array3<f64> = synthetic_cube(N_FRAMES, SHAPE, STAR, 9);
    data.slice_mut(s![6..10, .., ..]).fill(f64::NAN);
    let cube = ImageCube::from_array(data);

    let summary = run_pipeline(&cube, &config, &NoOpReporter).unwrap();
    assert_eq!(summary.rounds.len(), 1);
    let fitted: Vec<usize> = summary.rounds[0].gof.iter().map(|(i, _)| *i).collect();
    assert_eq!(fitted, vec![0, 1, 3, 4, 5]);
    assert_eq!(summary.rounds[0].n_failed(), 0);
    assert_eq!(summary.tracked_frames, None);

    let state = load_state(&StatePaths::new(dir.path())).unwrap();
    assert_eq!(state.start_idx[2], None);
    assert!(state
        .start_idx
        .iter()
        .enumerate()
        .all(|(i, s)| i == 2 || s.is_some()));
}
