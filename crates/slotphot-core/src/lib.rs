pub mod consts;
pub mod error;
pub mod exec;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod segmentation;
pub mod stack;
pub mod stats;
pub mod tracking;
pub mod workspace;

pub use error::{FitError, PhotError, Result};
