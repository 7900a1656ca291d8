//! sentineld - accident detection daemon
//!
//! This daemon:
//! 1. Loads settings and the camera list
//! 2. Builds the shared classifier, geolocator, event log and artifact store
//! 3. Starts one worker per camera
//! 4. Restarts workers that die, until Ctrl-C stops every worker

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use accident_sentinel::{
    config::SentinelConfig, geo, load_cameras, ArtifactStore, ClassifierAdapter, JsonEventStore,
    PipelineContext, RtspConnector, StreamSupervisor,
};

/// How often dead workers are looked for.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "sentineld", about = "Multi-camera accident detection daemon")]
struct Args {
    /// Settings file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "SENTINEL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SentinelConfig::load_from(args.config.as_deref())?;
    let cameras = load_cameras(&config.cameras_path)?;
    log::info!(
        "loaded {} camera(s) from {} ({} rejected)",
        cameras.cameras.len(),
        config.cameras_path.display(),
        cameras.rejected.len()
    );

    let classifier = ClassifierAdapter::from_settings(&config.classifier)?;
    log::info!("classifier backend: {}", classifier.name());
    if config.classifier.uses_stub() {
        log::warn!(
            "stub classifier active: every window is answered with class {}, no real detection will happen; \
             set classifier.backend = \"tract\" with a model to detect accidents",
            config.classifier.stub_class
        );
    }
    let ctx = PipelineContext {
        classifier: Arc::new(classifier),
        geolocator: Arc::from(geo::from_settings(&config.geolocation)?),
        events: Arc::new(JsonEventStore::open(&config.storage.event_log)?),
        artifacts: Arc::new(ArtifactStore::open(&config.storage)?),
        connector: Arc::new(RtspConnector::new(config.worker.target_fps)),
    };

    let mut supervisor = StreamSupervisor::new(ctx, config.worker.clone());
    let report = supervisor.start_all(&cameras.cameras);
    for (camera_id, reason) in &report.failed {
        log::warn!("camera {} not started: {}", camera_id, reason);
    }
    log::info!(
        "sentineld running: {} worker(s), events -> {}",
        supervisor.worker_count(),
        config.storage.event_log.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("sentineld waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(WATCHDOG_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {
                let restarted = supervisor.restart_finished();
                if !restarted.is_empty() {
                    log::warn!("restarted worker(s) for: {}", restarted.join(", "));
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("shutdown signal received, stopping workers...");
    supervisor.stop_all();
    log::info!("all workers stopped");

    Ok(())
}
