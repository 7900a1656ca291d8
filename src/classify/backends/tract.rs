#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::classify::backend::ClipClassifier;
use crate::frame::Frame;
use crate::{INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH, WINDOW_LEN};

/// Tract-based backend for ONNX clip models.
///
/// Input is `(1, T, H, W, C)` f32 with raw 0..255 pixel values in RGB order;
/// output is one probability per class.
pub struct TractClassifier {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
}

impl TractClassifier {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(
                        1,
                        WINDOW_LEN,
                        INPUT_HEIGHT as usize,
                        INPUT_WIDTH as usize,
                        INPUT_CHANNELS
                    ),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model })
    }

    fn build_input(&self, clip: &[Frame]) -> Result<Tensor> {
        if clip.len() != WINDOW_LEN {
            return Err(anyhow!(
                "expected {} frames, received {}",
                WINDOW_LEN,
                clip.len()
            ));
        }
        let width = INPUT_WIDTH as usize;
        let input = tract_ndarray::Array5::from_shape_fn(
            (1, WINDOW_LEN, INPUT_HEIGHT as usize, width, INPUT_CHANNELS),
            |(_, t, y, x, c)| clip[t].pixels()[(y * width + x) * INPUT_CHANNELS + c] as f32,
        );
        Ok(input.into_tensor())
    }
}

impl ClipClassifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn predict(&mut self, clip: &[Frame]) -> Result<Vec<f32>> {
        let input = self.build_input(clip)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(scores.iter().copied().collect())
    }
}
