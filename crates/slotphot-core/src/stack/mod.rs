pub mod combine;
pub mod median;
pub mod sampler;

pub use combine::{shift_combine, CombinedImage, Statistic};
pub use median::median_stack;
pub use sampler::ImageSampler;
