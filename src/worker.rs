//! Per-camera worker.
//!
//! ```text
//!   Connecting --open ok--> Streaming --window full--> Classifying
//!       ^  |                   |                           |
//!       |  +--open failed,     +--read failed,             |
//!       |     backoff             release + clear window   |
//!       +--------------------------+                       |
//!                               Streaming <----------------+  (window cleared)
//!
//!   any state --stop signal--> Stopped (session released, terminal)
//! ```
//!
//! Everything a worker touches besides the shared `PipelineContext` is owned
//! by the worker: the capture session, the window and the last raw frame.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::artifacts::ArtifactStore;
use crate::classify::ClassifierAdapter;
use crate::frame::{Frame, Window};
use crate::geo::Geolocator;
use crate::ingest::{FrameSource, SourceConnector};
use crate::runtime::{CycleControl, CycleTask, StopSignal};
use crate::storage::EventStore;
use crate::{CameraDescriptor, DetectionEvent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Delay after a failed connect before the next attempt.
    pub reconnect_backoff: Duration,
    /// Pacing delay between cycles.
    pub cycle_interval: Duration,
    pub health_log_interval: Duration,
    /// Frame rate requested from sources.
    pub target_fps: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Streaming,
    Classifying,
    Stopped,
}

/// Collaborators shared by every worker of one process.
#[derive(Clone)]
pub struct PipelineContext {
    pub classifier: Arc<ClassifierAdapter>,
    pub geolocator: Arc<dyn Geolocator>,
    pub events: Arc<dyn EventStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub connector: Arc<dyn SourceConnector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub windows_classified: u64,
    pub classification_failures: u64,
    /// Positive windows.
    pub detections: u64,
    /// Detections whose event could not be appended, even after a retry.
    pub events_lost: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    /// Transitions into Streaming.
    pub streaming_entries: u64,
}

pub struct CameraWorker {
    camera: CameraDescriptor,
    ctx: PipelineContext,
    settings: WorkerSettings,
    state: WorkerState,
    session: Option<Box<dyn FrameSource>>,
    window: Window,
    /// Most recent frame as captured; becomes the snapshot on detection.
    last_raw: Option<Frame>,
    stats: WorkerStats,
    last_health_log: Instant,
}

impl CameraWorker {
    pub fn new(camera: CameraDescriptor, ctx: PipelineContext, settings: WorkerSettings) -> Self {
        Self {
            camera,
            ctx,
            settings,
            state: WorkerState::Connecting,
            session: None,
            window: Window::new(),
            last_raw: None,
            stats: WorkerStats::default(),
            last_health_log: Instant::now(),
        }
    }

    pub fn camera(&self) -> &CameraDescriptor {
        &self.camera
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn connect(&mut self, stop: &StopSignal) {
        self.stats.connect_attempts += 1;
        match self.ctx.connector.open(&self.camera.source_uri) {
            Ok(session) => {
                log::info!(
                    "camera {} ({}) connected to {}",
                    self.camera.id,
                    self.camera.name,
                    self.camera.source_uri
                );
                self.session = Some(session);
                self.window.clear();
                self.last_raw = None;
                self.stats.streaming_entries += 1;
                self.state = WorkerState::Streaming;
            }
            Err(err) => {
                self.stats.connect_failures += 1;
                log::warn!(
                    "camera {} connect failed (attempt {}): {:#}; retrying in {:?}",
                    self.camera.id,
                    self.stats.connect_attempts,
                    err,
                    self.settings.reconnect_backoff
                );
                stop.sleep(self.settings.reconnect_backoff);
            }
        }
    }

    fn stream(&mut self) {
        let read = match self.session.as_mut() {
            Some(session) if session.is_open() => session.read_frame(),
            _ => Err(anyhow::anyhow!("session closed")),
        };
        let frame = match read {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("camera {} stream lost: {:#}", self.camera.id, err);
                self.disconnect();
                return;
            }
        };
        self.stats.frames += 1;

        let input = match frame.to_input_shape() {
            Ok(input) => input,
            Err(err) => {
                log::warn!("camera {} dropped undecodable frame: {:#}", self.camera.id, err);
                return;
            }
        };
        self.last_raw = Some(frame);
        if let Err(err) = self.window.push(input) {
            // Only reachable if a full window survived a cycle; start over.
            log::warn!("camera {} window reset: {:#}", self.camera.id, err);
            self.window.clear();
            return;
        }
        if self.window.is_full() {
            self.state = WorkerState::Classifying;
            self.classify_window();
            self.state = WorkerState::Streaming;
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release();
        }
        self.window.clear();
        self.last_raw = None;
        self.stats.disconnects += 1;
        self.state = WorkerState::Connecting;
    }

    fn classify_window(&mut self) {
        match self.ctx.classifier.classify(&self.window) {
            Ok(prediction) => {
                self.stats.windows_classified += 1;
                if prediction.is_accident() {
                    self.stats.detections += 1;
                    self.record_detection(prediction.confidence());
                } else {
                    log::debug!(
                        "camera {} window negative ({:.2})",
                        self.camera.id,
                        prediction.confidence()
                    );
                }
            }
            Err(err) => {
                self.stats.classification_failures += 1;
                log::warn!(
                    "camera {} classification failed, treating window as negative: {:#}",
                    self.camera.id,
                    err
                );
            }
        }
        self.window.clear();
    }

    fn record_detection(&mut self, confidence: f32) {
        let at = crate::now_local();
        let artifacts = &self.ctx.artifacts;
        let snapshot_name = artifacts.reserve_snapshot_name(&self.camera.id, at);

        match self.last_raw.as_ref() {
            Some(frame) => {
                if let Err(err) = retry_once("snapshot write", || {
                    artifacts.write_snapshot(&snapshot_name, frame)
                }) {
                    log::error!(
                        "camera {} snapshot {} not saved: {:#}",
                        self.camera.id,
                        snapshot_name,
                        err
                    );
                }
            }
            None => log::error!("camera {} has no frame to snapshot", self.camera.id),
        }
        if let Err(err) = artifacts.write_clip(&snapshot_name, &self.window) {
            log::error!(
                "camera {} clip for {} not saved: {:#}",
                self.camera.id,
                snapshot_name,
                err
            );
        }

        let location = match &self.camera.location {
            Some(fixed) => fixed.clone(),
            None => self.ctx.geolocator.resolve_location(),
        };
        let event = DetectionEvent::new(at, &snapshot_name, &location, &self.camera);
        match retry_once("event append", || self.ctx.events.append(&event)) {
            Ok(()) => log::info!(
                "accident detected on camera {} ({}) at {} [{:.2}], snapshot {}",
                self.camera.id,
                self.camera.name,
                event.location,
                confidence,
                snapshot_name
            ),
            Err(err) => {
                self.stats.events_lost += 1;
                log::error!(
                    "camera {} detection at {} NOT logged: {:#}",
                    self.camera.id,
                    event.timestamp,
                    err
                );
            }
        }
    }

    fn enter_stopped(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        if let Some(mut session) = self.session.take() {
            session.release();
        }
        self.window.clear();
        self.last_raw = None;
        self.state = WorkerState::Stopped;
        log::info!(
            "camera {} stopped (frames={}, windows={}, detections={})",
            self.camera.id,
            self.stats.frames,
            self.stats.windows_classified,
            self.stats.detections
        );
    }

    fn maybe_log_health(&mut self) {
        if self.last_health_log.elapsed() < self.settings.health_log_interval {
            return;
        }
        self.last_health_log = Instant::now();
        let s = &self.stats;
        log::info!(
            "camera {} health: state={:?} frames={} windows={} failures={} detections={} reconnects={}",
            self.camera.id,
            self.state,
            s.frames,
            s.windows_classified,
            s.classification_failures,
            s.detections,
            s.disconnects
        );
    }
}

impl CycleTask for CameraWorker {
    fn name(&self) -> String {
        format!("camera-{}", self.camera.id)
    }

    fn run_cycle(&mut self, stop: &StopSignal) -> CycleControl {
        if stop.is_raised() {
            self.enter_stopped();
        }
        match self.state {
            WorkerState::Stopped => return CycleControl::Exit,
            WorkerState::Connecting => self.connect(stop),
            WorkerState::Streaming | WorkerState::Classifying => self.stream(),
        }
        self.maybe_log_health();
        CycleControl::Continue
    }

    fn shutdown(&mut self) {
        self.enter_stopped();
    }

    fn cycle_interval(&self) -> Duration {
        self.settings.cycle_interval
    }
}

fn retry_once<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            log::warn!("{} failed, retrying once: {:#}", what, first);
            op()
        }
    }
}
