//! Accident Sentinel
//!
//! This crate implements a multi-camera accident detection pipeline.
//!
//! # Architecture
//!
//! Each configured camera gets its own worker thread. A worker owns a capture
//! session and a fixed-length frame window; every time the window fills it is
//! handed to the clip classifier and then reset. Positive windows become
//! detection events carrying a snapshot, a timestamp and a location.
//!
//! 1. **Independent workers**: a camera that disconnects reconnects on its own
//!    and never stalls any other camera.
//! 2. **Non-sliding windows**: classification runs iff the window holds exactly
//!    `WINDOW_LEN` frames; the window is cleared after every attempt and on
//!    every reconnect.
//! 3. **Detections survive side-effect failures**: a failed snapshot write or
//!    geolocation lookup degrades the event, it never suppresses it.
//! 4. **Append-only event log**: concurrent appends are serialized and every
//!    write replaces the log atomically.
//!
//! # Module Structure
//!
//! - `frame`: frames and the classification window
//! - `ingest`: capture sessions (RTSP, synthetic `stub://` sources)
//! - `classify`: classifier backends and the shared adapter
//! - `geo`: best-effort geolocation
//! - `storage`: the detection event log
//! - `artifacts`: snapshots, labeled clips and feedback relabeling
//! - `runtime`, `worker`, `supervisor`: per-camera execution and lifecycle
//! - `config`: daemon settings and the camera list

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod frame;
pub mod geo;
pub mod ingest;
pub mod runtime;
pub mod storage;
pub mod supervisor;
pub mod worker;

pub use artifacts::{ArtifactStore, FeedbackOutcome, Verdict};
pub use classify::{ClassifierAdapter, ClipClassifier, Prediction, StubClassifier, StubVerdict};
pub use config::{load_cameras, CameraList, RejectedCamera, SentinelConfig};
pub use frame::{Frame, Window};
pub use geo::{
    CachingGeolocator, DisabledGeolocator, FixedLocation, Geolocator, IpGeolocator, UNKNOWN,
    UNKNOWN_LOCATION,
};
pub use ingest::{FrameSource, RtspConnector, SourceConnector, SourceStats};
pub use ingest::{rtsp::RtspConfig, RtspSource};
pub use runtime::{CycleControl, CycleTask, StopSignal, TaskHandle};
pub use storage::{most_recent_first, EventStore, InMemoryEventStore, JsonEventStore};
pub use supervisor::{StartReport, StreamSupervisor};
pub use worker::{CameraWorker, PipelineContext, WorkerSettings, WorkerState, WorkerStats};

// -------------------- Classifier contract --------------------

/// Number of frames in one classification window.
pub const WINDOW_LEN: usize = 16;

/// Classifier input frame width in pixels.
pub const INPUT_WIDTH: u32 = 224;

/// Classifier input frame height in pixels.
pub const INPUT_HEIGHT: u32 = 224;

/// Channels per pixel (RGB).
pub const INPUT_CHANNELS: usize = 3;

/// Size of the classifier's output distribution.
pub const NUM_CLASSES: usize = 2;

/// Class index that signals an accident.
pub const ACCIDENT_CLASS: usize = 1;

// -------------------- Timestamps --------------------

/// Event timestamp format (ISO-8601, local time, second resolution).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Format accepted when reading logs written by older tooling.
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, LEGACY_TIMESTAMP_FORMAT))
        .ok()
}

// -------------------- Cameras --------------------

/// Camera ids end up in file names, so they are restricted to a safe alphabet.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera id '{}' must match [A-Za-z0-9_-]{{1,64}}",
            camera_id
        ));
    }
    Ok(())
}

/// One configured camera. Immutable after load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub id: String,
    pub name: String,
    pub source_uri: String,
    /// Fixed place string; when set it replaces IP geolocation for this camera.
    pub location: Option<String>,
}

impl CameraDescriptor {
    pub fn new(id: &str, name: &str, source_uri: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            source_uri: source_uri.to_string(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }
}

// -------------------- Events --------------------

/// A recorded positive classification.
///
/// Field names on disk follow the dashboard's expectations (`snapshot`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionEvent {
    pub timestamp: String,
    #[serde(rename = "snapshot", alias = "snapshot_ref")]
    pub snapshot_ref: String,
    pub location: String,
    pub camera_id: String,
    pub camera_name: String,
}

impl DetectionEvent {
    pub fn new(
        at: NaiveDateTime,
        snapshot_ref: &str,
        location: &str,
        camera: &CameraDescriptor,
    ) -> Self {
        Self {
            timestamp: format_timestamp(at),
            snapshot_ref: snapshot_ref.to_string(),
            location: location.to_string(),
            camera_id: camera.id.clone(),
            camera_name: camera.name.clone(),
        }
    }

    pub fn occurred_at(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn camera_ids_must_be_filename_safe() {
        assert!(validate_camera_id("cam1").is_ok());
        assert!(validate_camera_id("north-gate_02").is_ok());
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("../etc").is_err());
        assert!(validate_camera_id("cam 1").is_err());
        assert!(validate_camera_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn event_serializes_with_dashboard_field_names() -> Result<()> {
        let camera = CameraDescriptor::new("cam1", "Lobby", "rtsp://x");
        let ev = DetectionEvent::new(at(14, 5, 9), "cam1_20240309_140509.jpg", "Kyiv", &camera);
        let json: serde_json::Value = serde_json::to_value(&ev)?;
        assert_eq!(json["timestamp"], "2024-03-09T14:05:09");
        assert_eq!(json["snapshot"], "cam1_20240309_140509.jpg");
        assert_eq!(json["camera_id"], "cam1");
        assert_eq!(json["camera_name"], "Lobby");
        assert!(json.get("snapshot_ref").is_none());
        Ok(())
    }

    #[test]
    fn legacy_timestamps_still_parse() {
        assert_eq!(parse_timestamp("2024-03-09 14:05:09"), Some(at(14, 5, 9)));
        assert_eq!(parse_timestamp("2024-03-09T14:05:09"), Some(at(14, 5, 9)));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
