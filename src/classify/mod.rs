mod adapter;
mod backend;
mod backends;
mod prediction;

pub use adapter::ClassifierAdapter;
pub use backend::ClipClassifier;
pub use backends::{StubClassifier, StubVerdict};
pub use prediction::Prediction;

#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
