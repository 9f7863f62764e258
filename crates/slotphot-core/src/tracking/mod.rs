pub mod groups;
pub mod seed;
pub mod tracker;

use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_FTB_THRESH_COUNTS, DEFAULT_FTB_WIDTH, DEFAULT_MATCH_RADIUS,
    DEFAULT_POST_MERGE_DILATE, DEFAULT_SEED_MATCH_COUNT, DEFAULT_SEG_MERGE_ACCEPT,
    DEFAULT_TRACKING_SNR,
};

pub use groups::Groups;
pub use seed::{seed_tracker, Seeded};
pub use tracker::{Offset, Tracker, TrackerStage};

/// Parameters for seeding and running the object tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Minimum centroid SNR for a star to vote on an offset.
    pub snr: f64,
    /// Brightest detections of the reference sample used for matching.
    pub match_count: usize,
    /// Maximum displacement, in pixels, of a matched star between samples.
    pub match_radius: f64,
    /// Fraction of covering samples that must flag a pixel for it to be kept.
    pub merge_accept: f64,
    pub post_merge_dilate: usize,
    /// Objects above these background-subtracted counts are tracked and
    /// get a bleed streak.
    pub bright_thresh_counts: f64,
    /// Columns per bleed streak.
    pub ftb_width: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            snr: DEFAULT_TRACKING_SNR,
            match_count: DEFAULT_SEED_MATCH_COUNT,
            match_radius: DEFAULT_MATCH_RADIUS,
            merge_accept: DEFAULT_SEG_MERGE_ACCEPT,
            post_merge_dilate: DEFAULT_POST_MERGE_DILATE,
            bright_thresh_counts: DEFAULT_FTB_THRESH_COUNTS,
            ftb_width: DEFAULT_FTB_WIDTH,
        }
    }
}
