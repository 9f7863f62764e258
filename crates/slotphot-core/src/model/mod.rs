pub mod ftb;
pub mod knots;
pub mod solver;
pub mod spline;

use serde::{Deserialize, Serialize};

pub use ftb::{FrameTransferBleed, Streak};
pub use knots::{guess_knots, optimize_knots, resolve_knots, KnotMode, KnotSearch};
pub use solver::{IrlsConfig, LmConfig, Minimizer};
pub use spline::{BackgroundFit, BackgroundModel, Knots, SplineOrders};

/// The background surface and the bleed corrector, persisted together.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Models {
    pub background: BackgroundModel,
    pub bleed: FrameTransferBleed,
}
