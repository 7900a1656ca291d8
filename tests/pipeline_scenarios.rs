use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use accident_sentinel::config::GeoSettings;
use accident_sentinel::{
    ArtifactStore, CameraDescriptor, CameraWorker, ClassifierAdapter, CycleControl, CycleTask,
    EventStore, FixedLocation, Frame, FrameSource, Geolocator, IpGeolocator, JsonEventStore,
    PipelineContext, SourceConnector, SourceStats, StopSignal, StubClassifier, StubVerdict,
    WorkerSettings, WorkerState, INPUT_HEIGHT, INPUT_WIDTH, UNKNOWN_LOCATION, WINDOW_LEN,
};

/// Refuses the first `failures` opens, then hands out sessions that produce
/// classifier-sized frames until `frames_per_session` is reached.
struct ScriptedConnector {
    failures: Mutex<u32>,
    frames_per_session: Option<u64>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(failures: u32, frames_per_session: Option<u64>) -> Self {
        Self {
            failures: Mutex::new(failures),
            frames_per_session,
            opened: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SourceConnector for ScriptedConnector {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(anyhow!("{} unreachable", uri));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource {
            uri: uri.to_string(),
            open: true,
            produced: 0,
            limit: self.frames_per_session,
            released: self.released.clone(),
        }))
    }
}

struct ScriptedSource {
    uri: String,
    open: bool,
    produced: u64,
    limit: Option<u64>,
    released: Arc<AtomicUsize>,
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open || self.limit.is_some_and(|limit| self.produced >= limit) {
            self.open = false;
            return Err(anyhow!("stream ended"));
        }
        self.produced += 1;
        Frame::filled(INPUT_WIDTH, INPUT_HEIGHT, [(self.produced % 255) as u8, 40, 90])
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn release(&mut self) {
        self.open = false;
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.produced,
            uri: self.uri.clone(),
        }
    }
}

struct Harness {
    worker: CameraWorker,
    stop: StopSignal,
    events: Arc<JsonEventStore>,
    classifier: Arc<ClassifierAdapter>,
    connector: Arc<ScriptedConnector>,
}

impl Harness {
    fn new(dir: &Path, classifier: StubClassifier, connector: ScriptedConnector) -> Result<Self> {
        Self::with_geolocator(dir, classifier, connector, Arc::new(FixedLocation("Depot".into())))
    }

    fn with_geolocator(
        dir: &Path,
        classifier: StubClassifier,
        connector: ScriptedConnector,
        geolocator: Arc<dyn Geolocator>,
    ) -> Result<Self> {
        let events = Arc::new(JsonEventStore::open(dir.join("logs/events.json"))?);
        let classifier = Arc::new(ClassifierAdapter::new(classifier)?);
        let connector = Arc::new(connector);
        let ctx = PipelineContext {
            classifier: classifier.clone(),
            geolocator,
            events: events.clone(),
            artifacts: Arc::new(ArtifactStore::with_dirs(
                &dir.join("snapshots"),
                &dir.join("dataset/preprocessed"),
            )?),
            connector: connector.clone(),
        };
        let settings = WorkerSettings {
            reconnect_backoff: Duration::from_millis(1),
            cycle_interval: Duration::from_millis(1),
            ..WorkerSettings::default()
        };
        let camera = CameraDescriptor::new("cam1", "Lobby", "rtsp://x");
        Ok(Self {
            worker: CameraWorker::new(camera, ctx, settings),
            stop: StopSignal::new(),
            events,
            classifier,
            connector,
        })
    }

    fn cycles(&mut self, n: usize) {
        for _ in 0..n {
            assert_eq!(self.worker.run_cycle(&self.stop), CycleControl::Continue);
            assert!(self.worker.window().len() < WINDOW_LEN);
        }
    }
}

#[test]
fn positive_window_logs_exactly_one_event() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(1), ScriptedConnector::new(0, None))?;

    h.cycles(1 + WINDOW_LEN);

    let events = h.events.read_all()?;
    assert_eq!(events.len(), 1);
    let ev = &events[0];
    assert_eq!(ev.camera_id, "cam1");
    assert_eq!(ev.camera_name, "Lobby");
    assert_eq!(ev.location, "Depot");
    assert!(ev.snapshot_ref.ends_with(".jpg"));
    assert!(ev.occurred_at().is_some());
    assert!(dir.path().join("snapshots").join(&ev.snapshot_ref).is_file());
    let clip = ev.snapshot_ref.replace(".jpg", ".npy");
    assert!(dir.path().join("dataset/preprocessed/accident").join(clip).is_file());
    assert!(h.worker.window().is_empty());
    Ok(())
}

#[test]
fn negative_windows_log_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(0), ScriptedConnector::new(0, None))?;

    h.cycles(1);
    for _ in 0..5 {
        h.cycles(WINDOW_LEN);
        assert!(h.worker.window().is_empty());
    }

    assert!(h.events.read_all()?.is_empty());
    assert_eq!(h.classifier.invocations(), 5);
    assert_eq!(h.worker.stats().windows_classified, 5);
    assert_eq!(h.worker.stats().detections, 0);
    Ok(())
}

#[test]
fn short_sequences_never_reach_the_classifier() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(1), ScriptedConnector::new(0, None))?;

    h.cycles(WINDOW_LEN);
    assert_eq!(h.worker.window().len(), WINDOW_LEN - 1);
    assert_eq!(h.classifier.invocations(), 0);
    Ok(())
}

#[test]
fn stop_mid_stream_releases_the_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(1), ScriptedConnector::new(0, None))?;

    h.cycles(6);
    assert_eq!(h.worker.state(), WorkerState::Streaming);
    assert_eq!(h.worker.stats().frames, 5);

    h.stop.raise();
    assert_eq!(h.worker.run_cycle(&h.stop), CycleControl::Exit);
    assert_eq!(h.worker.state(), WorkerState::Stopped);
    assert!(!h.worker.has_session());
    assert_eq!(h.connector.released.load(Ordering::SeqCst), 1);

    assert_eq!(h.worker.run_cycle(&h.stop), CycleControl::Exit);
    assert_eq!(h.worker.stats().frames, 5);
    assert_eq!(h.classifier.invocations(), 0);
    Ok(())
}

#[test]
fn reaches_streaming_once_after_repeated_connect_failures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(0), ScriptedConnector::new(3, None))?;

    for _ in 0..3 {
        h.cycles(1);
        assert_eq!(h.worker.state(), WorkerState::Connecting);
    }
    h.cycles(1);
    assert_eq!(h.worker.state(), WorkerState::Streaming);
    h.cycles(3);

    let stats = h.worker.stats();
    assert_eq!(stats.connect_attempts, 4);
    assert_eq!(stats.connect_failures, 3);
    assert_eq!(stats.streaming_entries, 1);
    assert_eq!(h.connector.opened.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn windows_do_not_carry_over_a_reconnect() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(1), ScriptedConnector::new(0, Some(10)))?;

    // Sessions die after 10 frames, so no window ever fills.
    h.cycles(1 + 10 + 1 + 1 + 10 + 1);
    assert_eq!(h.worker.stats().disconnects, 2);
    assert_eq!(h.worker.stats().streaming_entries, 2);
    assert_eq!(h.connector.released.load(Ordering::SeqCst), 2);
    assert_eq!(h.classifier.invocations(), 0);
    assert!(h.events.read_all()?.is_empty());
    Ok(())
}

#[test]
fn classifier_failure_is_a_negative_window() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = StubClassifier::scripted(vec![StubVerdict::Fail, StubVerdict::Class(1)], 0);
    let mut h = Harness::new(dir.path(), script, ScriptedConnector::new(0, None))?;

    h.cycles(1 + 2 * WINDOW_LEN);

    let stats = h.worker.stats();
    assert_eq!(stats.classification_failures, 1);
    assert_eq!(stats.windows_classified, 1);
    assert_eq!(stats.detections, 1);
    assert_eq!(h.events.read_all()?.len(), 1);
    assert_eq!(h.worker.state(), WorkerState::Streaming);
    Ok(())
}

#[test]
fn failed_snapshot_write_still_logs_the_event() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut h = Harness::new(dir.path(), StubClassifier::constant(1), ScriptedConnector::new(0, None))?;
    let snapshots = dir.path().join("snapshots");
    std::fs::remove_dir_all(&snapshots)?;
    std::fs::write(&snapshots, b"not a directory")?;

    h.cycles(1 + WINDOW_LEN);

    let events = h.events.read_all()?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].camera_id, "cam1");
    assert_eq!(h.worker.stats().events_lost, 0);
    Ok(())
}

#[test]
fn unreachable_geolocation_degrades_to_sentinel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let geo = IpGeolocator::new(&GeoSettings {
        ip_lookup_url: format!("http://127.0.0.1:{}/json/", port),
        timeout: Duration::from_millis(500),
        ..GeoSettings::default()
    })?;
    let mut h = Harness::with_geolocator(
        dir.path(),
        StubClassifier::constant(1),
        ScriptedConnector::new(0, None),
        Arc::new(geo),
    )?;

    h.cycles(1 + WINDOW_LEN);

    let events = h.events.read_all()?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].location, UNKNOWN_LOCATION);
    Ok(())
}

#[test]
fn hanging_geolocation_provider_does_not_stall_the_worker() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    std::thread::spawn(move || {
        // Hold every accepted socket open without answering.
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept() {
            held.push(stream);
            if held.len() > 4 {
                break;
            }
        }
        std::thread::sleep(Duration::from_secs(5));
    });
    let timeout = Duration::from_millis(400);
    let geo = IpGeolocator::new(&GeoSettings {
        ip_lookup_url: format!("http://127.0.0.1:{}/json/", port),
        timeout,
        cache_ttl: Duration::ZERO,
        ..GeoSettings::default()
    })?;
    let mut h = Harness::with_geolocator(
        dir.path(),
        StubClassifier::constant(1),
        ScriptedConnector::new(0, None),
        Arc::new(geo),
    )?;

    h.cycles(WINDOW_LEN);
    let started = Instant::now();
    h.cycles(1);
    let detection_cycle = started.elapsed();

    assert!(detection_cycle < timeout * 2 + Duration::from_millis(500), "took {:?}", detection_cycle);
    let events = h.events.read_all()?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].location, UNKNOWN_LOCATION);

    h.cycles(WINDOW_LEN);
    assert_eq!(h.events.read_all()?.len(), 2);
    Ok(())
}
