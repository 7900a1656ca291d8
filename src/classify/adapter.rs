use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};

use crate::config::ClassifierSettings;
use crate::frame::Window;
use crate::{INPUT_HEIGHT, INPUT_WIDTH, WINDOW_LEN};

use super::backend::ClipClassifier;
use super::backends::StubClassifier;
use super::prediction::Prediction;

/// Process-wide classifier shared by every camera worker.
///
/// Built once and passed to workers behind an `Arc`. The backend sits behind
/// a `Mutex` because `ClipClassifier::predict` takes `&mut self`: one window
/// is evaluated at a time and other workers queue only for the duration of
/// that call. Frame capture never holds the lock. A panicking backend is
/// reported as an error for that window and does not disable the adapter.
pub struct ClassifierAdapter {
    name: &'static str,
    backend: Mutex<Box<dyn ClipClassifier>>,
    invocations: AtomicU64,
}

impl ClassifierAdapter {
    pub fn new<B: ClipClassifier + 'static>(backend: B) -> Result<Self> {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(mut backend: Box<dyn ClipClassifier>) -> Result<Self> {
        backend.warm_up()?;
        Ok(Self {
            name: backend.name(),
            backend: Mutex::new(backend),
            invocations: AtomicU64::new(0),
        })
    }

    /// Build the backend named in the settings (`stub` or `tract`).
    pub fn from_settings(settings: &ClassifierSettings) -> Result<Self> {
        match settings.backend.as_str() {
            "stub" => Self::new(StubClassifier::constant(settings.stub_class)),
            #[cfg(feature = "backend-tract")]
            "tract" => Self::new(super::backends::TractClassifier::new(&settings.model_path)?),
            #[cfg(not(feature = "backend-tract"))]
            "tract" => Err(anyhow!(
                "classifier backend 'tract' requires the backend-tract feature"
            )),
            other => Err(anyhow!("unknown classifier backend '{}'", other)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of windows handed to the backend so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Classify one full window.
    ///
    /// The window must hold exactly `WINDOW_LEN` frames of the classifier
    /// input size; anything else is rejected without touching the backend.
    pub fn classify(&self, window: &Window) -> Result<Prediction> {
        if window.len() != WINDOW_LEN {
            return Err(anyhow!(
                "classifier needs exactly {} frames, window holds {}",
                WINDOW_LEN,
                window.len()
            ));
        }
        if let Some(frame) = window.frames().iter().find(|f| !f.has_input_shape()) {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                INPUT_WIDTH,
                INPUT_HEIGHT
            ));
        }

        let raw = {
            // Poison only means an earlier call unwound; the backend stays in service.
            let mut guard = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
            self.invocations.fetch_add(1, Ordering::SeqCst);
            panic::catch_unwind(AssertUnwindSafe(|| guard.predict(window.frames())))
                .map_err(|payload| {
                    anyhow!(
                        "classifier backend {} panicked: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    )
                })??
        };
        Prediction::from_probabilities(&raw)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::StubVerdict;
    use crate::frame::Frame;

    fn full_window() -> Window {
        let mut window = Window::new();
        let frame = Frame::filled(INPUT_WIDTH, INPUT_HEIGHT, [5, 5, 5]).unwrap();
        while !window.is_full() {
            window.push(frame.clone()).unwrap();
        }
        window
    }

    #[test]
    fn classifies_full_window() -> Result<()> {
        let adapter = ClassifierAdapter::new(StubClassifier::constant(1))?;
        let prediction = adapter.classify(&full_window())?;
        assert!(prediction.is_accident());
        assert_eq!(adapter.invocations(), 1);
        assert_eq!(adapter.name(), "stub");
        Ok(())
    }

    #[test]
    fn partial_window_never_reaches_backend() -> Result<()> {
        let adapter = ClassifierAdapter::new(StubClassifier::constant(1))?;
        let mut window = Window::new();
        window.push(Frame::filled(INPUT_WIDTH, INPUT_HEIGHT, [0, 0, 0])?)?;
        assert!(adapter.classify(&window).is_err());
        assert_eq!(adapter.invocations(), 0);
        Ok(())
    }

    #[test]
    fn wrong_frame_size_is_rejected() -> Result<()> {
        let adapter = ClassifierAdapter::new(StubClassifier::constant(0))?;
        let mut window = Window::new();
        let frame = Frame::filled(8, 8, [0, 0, 0])?;
        while !window.is_full() {
            window.push(frame.clone())?;
        }
        assert!(adapter.classify(&window).is_err());
        assert_eq!(adapter.invocations(), 0);
        Ok(())
    }

    #[test]
    fn backend_errors_propagate() -> Result<()> {
        let adapter = ClassifierAdapter::new(StubClassifier::scripted(vec![StubVerdict::Fail], 0))?;
        assert!(adapter.classify(&full_window()).is_err());
        assert!(!adapter.classify(&full_window())?.is_accident());
        Ok(())
    }

    struct PanicsOnce {
        fired: bool,
    }

    impl ClipClassifier for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics-once"
        }

        fn predict(&mut self, _clip: &[crate::frame::Frame]) -> Result<Vec<f32>> {
            if !self.fired {
                self.fired = true;
                panic!("model runtime crashed");
            }
            Ok(vec![0.1, 0.9])
        }
    }

    #[test]
    fn backend_panic_fails_only_that_window() -> Result<()> {
        let adapter = std::sync::Arc::new(ClassifierAdapter::new(PanicsOnce { fired: false })?);
        let worker = {
            let adapter = adapter.clone();
            std::thread::spawn(move || adapter.classify(&full_window()).is_err())
        };
        assert!(worker.join().expect("classify must not unwind into the caller"));

        assert!(adapter.classify(&full_window())?.is_accident());
        assert_eq!(adapter.invocations(), 2);
        Ok(())
    }

    #[test]
    fn poisoned_lock_is_recovered() -> Result<()> {
        let adapter = std::sync::Arc::new(ClassifierAdapter::new(StubClassifier::constant(1))?);
        let poisoner = adapter.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.backend.lock().unwrap();
            panic!("holder died");
        })
        .join();
        assert!(adapter.backend.is_poisoned());

        assert!(adapter.classify(&full_window())?.is_accident());
        Ok(())
    }

    #[test]
    fn settings_select_backend() -> Result<()> {
        let mut settings = ClassifierSettings::default();
        settings.backend = "stub".to_string();
        settings.stub_class = 1;
        let adapter = ClassifierAdapter::from_settings(&settings)?;
        assert!(adapter.classify(&full_window())?.is_accident());

        settings.backend = "mystery".to_string();
        assert!(ClassifierAdapter::from_settings(&settings).is_err());
        Ok(())
    }

    #[test]
    fn shared_adapter_serializes_concurrent_callers() -> Result<()> {
        let adapter = std::sync::Arc::new(ClassifierAdapter::new(StubClassifier::constant(0))?);
        let mut joins = Vec::new();
        for _ in 0..4 {
            let adapter = adapter.clone();
            joins.push(std::thread::spawn(move || {
                let window = full_window();
                for _ in 0..5 {
                    adapter.classify(&window).unwrap();
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(adapter.invocations(), 20);
        Ok(())
    }
}
