use anyhow::Result;

use crate::frame::Frame;

/// Clip classifier backend.
///
/// A backend receives one window of `WINDOW_LEN` classifier-sized frames in
/// capture order and returns a probability distribution over `NUM_CLASSES`.
/// The adapter validates both sides of that contract; backends may assume
/// well-formed input.
///
/// Backends take `&mut self` and are therefore never entered concurrently;
/// the adapter serializes access.
pub trait ClipClassifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the model on one clip.
    fn predict(&mut self, clip: &[Frame]) -> Result<Vec<f32>>;

    /// Optional warm-up hook, run once when the adapter is built.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
