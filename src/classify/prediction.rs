use anyhow::{anyhow, Result};

use crate::{ACCIDENT_CLASS, NUM_CLASSES};

/// Classifier output for one window.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Probability per class, index 1 is "accident".
    pub probabilities: [f32; NUM_CLASSES],
    /// Arg-max of `probabilities`.
    pub class_index: usize,
}

impl Prediction {
    /// Validate a raw model output and pick the arg-max class.
    ///
    /// Ties resolve to the lower index, so an undecided model never reports an accident.
    pub fn from_probabilities(raw: &[f32]) -> Result<Self> {
        if raw.len() != NUM_CLASSES {
            return Err(anyhow!(
                "classifier returned {} scores, expected {}",
                raw.len(),
                NUM_CLASSES
            ));
        }
        if raw.iter().any(|p| !p.is_finite()) {
            return Err(anyhow!("classifier returned non-finite scores: {:?}", raw));
        }
        let mut probabilities = [0.0f32; NUM_CLASSES];
        probabilities.copy_from_slice(raw);

        let mut class_index = 0;
        for (idx, p) in probabilities.iter().enumerate() {
            if *p > probabilities[class_index] {
                class_index = idx;
            }
        }
        Ok(Self {
            probabilities,
            class_index,
        })
    }

    pub fn is_accident(&self) -> bool {
        self.class_index == ACCIDENT_CLASS
    }

    pub fn confidence(&self) -> f32 {
        self.probabilities[self.class_index]
    }
}
