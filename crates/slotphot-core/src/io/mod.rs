pub mod cube;
pub mod npy;
pub mod persist;

pub use cube::ImageCube;
