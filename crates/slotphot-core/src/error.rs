use std::path::PathBuf;

use thiserror::Error;

use crate::tracking::TrackerStage;

#[derive(Error, Debug)]
pub enum PhotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cube file: {0}")]
    InvalidCube(String),

    #[error("Cube has {n_channels} channels; a channel must be selected")]
    ChannelRequired { n_channels: usize },

    #[error("Frame index {index} out of range (total: {total})")]
    FrameIndexOutOfRange { index: usize, total: usize },

    #[error("Workspace buffer '{name}' exists with shape {found:?}, requested {expected:?}")]
    WorkspaceShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Workspace buffer '{name}' has element type {found}, requested {expected}")]
    WorkspaceTypeMismatch {
        name: String,
        expected: &'static str,
        found: String,
    },

    #[error("Invalid workspace buffer {path}: {reason}")]
    InvalidBuffer { path: PathBuf, reason: String },

    #[error("Row {row} out of range for buffer '{name}' with {rows} rows")]
    RowOutOfRange { name: String, row: usize, rows: usize },

    #[error("Label image shape {found:?} does not match segmentation shape {expected:?}")]
    LabelShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("Task '{task}' aborted: {failures} failures exceed the cap of {cap}")]
    FailureCapExceeded {
        task: String,
        failures: usize,
        cap: usize,
    },

    #[error("Invalid tracker transition {from:?} -> {to:?}")]
    InvalidTransition { from: TrackerStage, to: TrackerStage },

    #[error("Persisted state is incompatible with the current cube: {0}")]
    ResumeMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Empty frame sequence")]
    EmptySequence,
}

/// Reasons a single background fit can fail. Recorded per sample; never fatal
/// to a round on their own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("region {region} has {available} usable pixels for {required} free parameters")]
    InsufficientData {
        region: u32,
        available: usize,
        required: usize,
    },

    #[error("minimizer did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("non-finite coefficients")]
    NonFinite,

    #[error("singular normal equations")]
    Singular,

    #[error("image scale is not finite or zero ({0})")]
    BadScale(f64),

    #[error("invalid knots: {0}")]
    InvalidKnots(String),
}

pub type Result<T> = std::result::Result<T, PhotError>;
