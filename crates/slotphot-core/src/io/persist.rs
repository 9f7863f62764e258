use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{PhotError, Result};
use crate::model::Models;
use crate::tracking::{Tracker, TrackerStage};

/// Window starts of the sample images within the tracker's extended frame.
pub type StartIndices = Vec<Option<[i64; 2]>>;

/// Locations of the persisted pipeline state under a results folder.
#[derive(Clone, Debug)]
pub struct StatePaths {
    pub tracker: PathBuf,
    pub models: PathBuf,
    pub start_idx: PathBuf,
}

impl StatePaths {
    pub fn new(results: &Path) -> Self {
        Self {
            tracker: results.join("tracking").join("tracker.json"),
            models: results.join("modelling").join("models.json"),
            start_idx: results
                .join("detection")
                .join("modelling")
                .join("start_idx.json"),
        }
    }

    /// True when all three artifacts are present.
    pub fn exist(&self) -> bool {
        self.tracker.is_file() && self.models.is_file() && self.start_idx.is_file()
    }
}

/// Everything a later run needs to skip sample detection.
#[derive(Clone, Debug)]
pub struct PersistedState {
    pub tracker: Tracker,
    pub models: Models,
    pub start_idx: StartIndices,
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, value)?;
    Ok(())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn save_state(paths: &StatePaths, state: &PersistedState) -> Result<()> {
    save_json(&paths.tracker, &state.tracker)?;
    save_json(&paths.models, &state.models)?;
    save_json(&paths.start_idx, &state.start_idx)?;
    info!(
        tracker = %paths.tracker.display(),
        stage = ?state.tracker.stage(),
        "Pipeline state saved"
    );
    Ok(())
}

pub fn load_state(paths: &StatePaths) -> Result<PersistedState> {
    let state = PersistedState {
        tracker: load_json(&paths.tracker)?,
        models: load_json(&paths.models)?,
        start_idx: load_json(&paths.start_idx)?,
    };
    info!(
        tracker = %paths.tracker.display(),
        stage = ?state.tracker.stage(),
        "Pipeline state loaded"
    );
    Ok(state)
}

/// Reject persisted state that cannot describe the current cube.
///
/// Checks the tracker lifecycle stage, the frame shape of the tracker and
/// both models, the sample count when `n_samples` is given, and that every
/// stored window lies inside the extended frame.
pub fn check_resume_compatibility(
    state: &PersistedState,
    frame_shape: (usize, usize),
    n_samples: Option<usize>,
) -> Result<()> {
    let tracker = &state.tracker;
    if tracker.stage() == TrackerStage::Uninitialized {
        return Err(PhotError::ResumeMismatch(
            "tracker was never seeded".to_string(),
        ));
    }
    if tracker.frame_shape() != frame_shape {
        return Err(PhotError::ResumeMismatch(format!(
            "tracker frame shape {:?} differs from cube frame shape {:?}",
            tracker.frame_shape(),
            frame_shape
        )));
    }
    let model_shape = state.models.background.frame_shape();
    if model_shape != frame_shape {
        return Err(PhotError::ResumeMismatch(format!(
            "background model shape {model_shape:?} differs from cube frame shape {frame_shape:?}"
        )));
    }
    if let Some(n) = n_samples {
        if state.start_idx.len() != n {
            return Err(PhotError::ResumeMismatch(format!(
                "{} stored sample starts, {n} samples expected",
                state.start_idx.len()
            )));
        }
    }

    let (eh, ew) = tracker.extended_shape();
    let (h, w) = frame_shape;
    for (i, start) in state.start_idx.iter().enumerate() {
        let Some([sy, sx]) = *start else { continue };
        let fits = sy >= 0 && sx >= 0 && sy as usize + h <= eh && sx as usize + w <= ew;
        if !fits {
            return Err(PhotError::ResumeMismatch(format!(
                "sample {i} window at [{sy}, {sx}] leaves the extended frame {:?}",
                (eh, ew)
            )));
        }
    }
    Ok(())
}

/// Tracker window starts in their persisted form.
pub fn start_indices(tracker: &Tracker) -> StartIndices {
    tracker
        .starts()
        .into_iter()
        .map(|s| s.map(|[y, x]| [y as i64, x as i64]))
        .collect()
}
