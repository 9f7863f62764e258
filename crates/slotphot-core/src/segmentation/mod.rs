pub mod components;
pub mod detect;
pub mod labels;
pub mod morphology;

pub use detect::{detect, detect_loop, detect_measure, DetectionConfig, DetectionResult, Measurement};
pub use labels::{Centroid, LabelMap, SegmentationImage};
