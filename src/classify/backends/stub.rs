use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::classify::backend::ClipClassifier;
use crate::frame::Frame;
use crate::NUM_CLASSES;

/// Scripted outcome for one call of the stub classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubVerdict {
    Class(usize),
    Fail,
}

/// Stub backend for testing and model-less demos.
///
/// Plays back a script of verdicts, then keeps answering with a fallback class.
pub struct StubClassifier {
    script: VecDeque<StubVerdict>,
    fallback: usize,
}

impl StubClassifier {
    pub fn constant(class_index: usize) -> Self {
        Self::scripted(Vec::new(), class_index)
    }

    pub fn scripted(script: Vec<StubVerdict>, fallback: usize) -> Self {
        Self {
            script: script.into(),
            fallback,
        }
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::constant(0)
    }
}

impl ClipClassifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn predict(&mut self, _clip: &[Frame]) -> Result<Vec<f32>> {
        let verdict = self
            .script
            .pop_front()
            .unwrap_or(StubVerdict::Class(self.fallback));
        match verdict {
            StubVerdict::Class(idx) if idx < NUM_CLASSES => Ok((0..NUM_CLASSES)
                .map(|c| if c == idx { 0.9 } else { 0.1 / (NUM_CLASSES - 1) as f32 })
                .collect()),
            StubVerdict::Class(idx) => Err(anyhow!("stub class {} out of range", idx)),
            StubVerdict::Fail => Err(anyhow!("stub classifier failure")),
        }
    }
}
