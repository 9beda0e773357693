pub mod loader;
pub mod postprocessing;
pub mod transforms;

pub use loader::ImageLoader;
pub use postprocessing::{InferenceResult, OutputFormat, ResultFormatter};
pub use transforms::ImageTransforms;
