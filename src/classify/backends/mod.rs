pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubClassifier, StubVerdict};

#[cfg(feature = "backend-tract")]
pub use tract::TractClassifier;
