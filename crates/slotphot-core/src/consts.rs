/// Minimum pixel count (h*w) to use row-level Rayon parallelism.
pub const PARALLEL_PIXEL_THRESHOLD: usize = 65_536;

/// Small epsilon to avoid division by zero in floating-point comparisons.
pub const EPSILON: f64 = 1e-12;

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Number of raw frames median-combined into one sample image.
pub const DEFAULT_N_COMB: usize = 10;

/// Sample images created per worker for the initial detection.
pub const DEFAULT_DETECT_PER_WORKER: usize = 3;

/// Sample images fitted per worker in the deep detection loop.
pub const DEFAULT_FIT_PER_WORKER: usize = 1;

/// Detection threshold in units of the background noise.
pub const DEFAULT_SNR: f64 = 3.0;

/// Minimum connected pixels per detection tier, brightest tier first.
pub const DEFAULT_NPIXELS: [usize; 3] = [5, 3, 2];

/// Dilation applied to each detection tier. Tiers past the end are not dilated.
pub const DEFAULT_DILATE: [usize; 2] = [2, 1];

/// Sigma clipping threshold for background statistics.
pub const DEFAULT_CLIP_SIGMA: f64 = 3.0;

/// Sigma clipping passes for background statistics.
pub const DEFAULT_CLIP_ITERATIONS: usize = 3;

/// Polynomial order of each spline segment along the row axis.
pub const DEFAULT_ORDERS_Y: [usize; 3] = [5, 1, 5];

/// Polynomial order of each spline segment along the column axis.
pub const DEFAULT_ORDERS_X: [usize; 2] = [1, 5];

/// Frames between knot optimisations in the full-cube pass.
pub const DEFAULT_KNOT_SEARCH_EVERY: usize = 5 * DEFAULT_N_COMB;

/// Integrated counts above which an object leaves a frame-transfer bleed trail.
pub const DEFAULT_FTB_THRESH_COUNTS: f64 = 3e4;

/// Width in columns of a frame-transfer bleed streak region.
pub const DEFAULT_FTB_WIDTH: usize = 5;

/// Fraction of sample segmentations that must flag a pixel for it to enter
/// the global segmentation.
pub const DEFAULT_SEG_MERGE_ACCEPT: f64 = 0.0;

/// Dilation of the merged global segmentation.
pub const DEFAULT_POST_MERGE_DILATE: usize = 3;

/// Minimum centroid SNR for a star to contribute to an offset estimate.
pub const DEFAULT_TRACKING_SNR: f64 = 3.0;

/// Number of bright objects matched between samples when seeding the tracker.
pub const DEFAULT_SEED_MATCH_COUNT: usize = 5;

/// Maximum distance (pixels) between matched detections of the same star.
pub const DEFAULT_MATCH_RADIUS: f64 = 20.0;

/// Round budget of the deep detection loop.
pub const DEFAULT_MAX_ROUNDS: usize = 4;

/// Relative goodness-of-fit change below which a round counts as stable.
pub const DEFAULT_GOF_EPSILON: f64 = 1e-3;

/// Consecutive stable rounds required before the deep loop stops.
pub const DEFAULT_GOF_PATIENCE: usize = 2;

/// Default failure cap for sample fits, as a fraction of the batch.
pub const DEFAULT_MAX_FAIL_FRACTION: f64 = 0.3;

/// Huber tuning constant (in units of the robust residual scale).
pub const HUBER_K: f64 = 1.345;

/// Step sizes (pixels) tried around each knot during the knot search.
pub const DEFAULT_KNOT_SEARCH_STEPS: [usize; 3] = [8, 4, 2];

/// Maximum coordinate-descent passes in the knot search.
pub const DEFAULT_KNOT_SEARCH_PASSES: usize = 3;
