use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geo::MAX_GEO_TIMEOUT;
use crate::worker::WorkerSettings;
use crate::{CameraDescriptor, NUM_CLASSES};

const DEFAULT_CAMERAS_PATH: &str = "camera_config.json";
const DEFAULT_EVENT_LOG: &str = "logs/events.json";
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_CORPUS_ROOT: &str = "dataset/preprocessed";
const DEFAULT_CLASSIFIER: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "model/accident_detector.onnx";
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 2000;
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 33;
const DEFAULT_HEALTH_LOG_SECS: u64 = 30;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_GEO_TIMEOUT_MS: u64 = 3000;
const DEFAULT_IP_LOOKUP_URL: &str = "http://ip-api.com/json/";
const DEFAULT_REVERSE_URL: &str = "https://nominatim.openstreetmap.org/reverse";
const DEFAULT_USER_AGENT: &str = "accident_sentinel";
const DEFAULT_GEO_CACHE_SECS: u64 = 600;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    cameras_path: Option<PathBuf>,
    storage: Option<StorageConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    worker: Option<WorkerConfigFile>,
    geolocation: Option<GeoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    event_log: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    corpus_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    stub_class: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    reconnect_backoff_ms: Option<u64>,
    cycle_interval_ms: Option<u64>,
    health_log_secs: Option<u64>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct GeoConfigFile {
    enabled: Option<bool>,
    timeout_ms: Option<u64>,
    ip_lookup_url: Option<String>,
    reverse_url: Option<String>,
    user_agent: Option<String>,
    cache_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub cameras_path: PathBuf,
    pub storage: StorageSettings,
    pub classifier: ClassifierSettings,
    pub worker: WorkerSettings,
    pub geolocation: GeoSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub event_log: PathBuf,
    pub snapshot_dir: PathBuf,
    pub corpus_root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            event_log: PathBuf::from(DEFAULT_EVENT_LOG),
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            corpus_root: PathBuf::from(DEFAULT_CORPUS_ROOT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub model_path: PathBuf,
    /// Class the stub backend answers with.
    pub stub_class: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_CLASSIFIER.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            stub_class: 0,
        }
    }
}

impl ClassifierSettings {
    /// The stub answers a fixed class and never looks at the frames.
    pub fn uses_stub(&self) -> bool {
        self.backend.trim().eq_ignore_ascii_case("stub")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoSettings {
    pub enabled: bool,
    /// Shared deadline for one whole resolution.
    pub timeout: Duration,
    pub ip_lookup_url: String,
    pub reverse_url: String,
    pub user_agent: String,
    /// Zero disables caching.
    pub cache_ttl: Duration,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(DEFAULT_GEO_TIMEOUT_MS),
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.to_string(),
            reverse_url: DEFAULT_REVERSE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cache_ttl: Duration::from_secs(DEFAULT_GEO_CACHE_SECS),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            cycle_interval: Duration::from_millis(DEFAULT_CYCLE_INTERVAL_MS),
            health_log_interval: Duration::from_secs(DEFAULT_HEALTH_LOG_SECS),
            target_fps: DEFAULT_TARGET_FPS,
        }
    }
}

impl SentinelConfig {
    /// Load using the file named by `SENTINEL_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let cameras_path = file
            .cameras_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CAMERAS_PATH));

        let storage_file = file.storage.unwrap_or_default();
        let defaults = StorageSettings::default();
        let storage = StorageSettings {
            event_log: storage_file.event_log.unwrap_or(defaults.event_log),
            snapshot_dir: storage_file.snapshot_dir.unwrap_or(defaults.snapshot_dir),
            corpus_root: storage_file.corpus_root.unwrap_or(defaults.corpus_root),
        };

        let classifier_file = file.classifier.unwrap_or_default();
        let defaults = ClassifierSettings::default();
        let classifier = ClassifierSettings {
            backend: classifier_file.backend.unwrap_or(defaults.backend),
            model_path: classifier_file.model_path.unwrap_or(defaults.model_path),
            stub_class: classifier_file.stub_class.unwrap_or(defaults.stub_class),
        };

        let worker_file = file.worker.unwrap_or_default();
        let worker = WorkerSettings {
            reconnect_backoff: Duration::from_millis(
                worker_file
                    .reconnect_backoff_ms
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
            ),
            cycle_interval: Duration::from_millis(
                worker_file
                    .cycle_interval_ms
                    .unwrap_or(DEFAULT_CYCLE_INTERVAL_MS),
            ),
            health_log_interval: Duration::from_secs(
                worker_file.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
            target_fps: worker_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
        };

        let geo_file = file.geolocation.unwrap_or_default();
        let defaults = GeoSettings::default();
        let geolocation = GeoSettings {
            enabled: geo_file.enabled.unwrap_or(defaults.enabled),
            timeout: geo_file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            ip_lookup_url: geo_file.ip_lookup_url.unwrap_or(defaults.ip_lookup_url),
            reverse_url: geo_file.reverse_url.unwrap_or(defaults.reverse_url),
            user_agent: geo_file.user_agent.unwrap_or(defaults.user_agent),
            cache_ttl: geo_file
                .cache_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        };

        Ok(Self {
            cameras_path,
            storage,
            classifier,
            worker,
            geolocation,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("SENTINEL_CAMERAS") {
            self.cameras_path = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("SENTINEL_EVENT_LOG") {
            self.storage.event_log = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("SENTINEL_SNAPSHOT_DIR") {
            self.storage.snapshot_dir = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("SENTINEL_CORPUS_ROOT") {
            self.storage.corpus_root = PathBuf::from(path);
        }
        if let Some(backend) = env_nonempty("SENTINEL_CLASSIFIER") {
            self.classifier.backend = backend;
        }
        if let Some(path) = env_nonempty("SENTINEL_MODEL_PATH") {
            self.classifier.model_path = PathBuf::from(path);
        }
        if let Some(flag) = env_nonempty("SENTINEL_GEOLOCATION") {
            self.geolocation.enabled = match flag.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                _ => return Err(anyhow!("SENTINEL_GEOLOCATION must be on or off")),
            };
        }
        if let Some(timeout) = env_nonempty("SENTINEL_GEO_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("SENTINEL_GEO_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.geolocation.timeout = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.classifier.backend = self.classifier.backend.trim().to_lowercase();
        if self.classifier.stub_class >= NUM_CLASSES {
            return Err(anyhow!(
                "classifier.stub_class must be below {}",
                NUM_CLASSES
            ));
        }
        if self.worker.reconnect_backoff.is_zero() {
            return Err(anyhow!("worker.reconnect_backoff_ms must be greater than zero"));
        }
        if self.worker.cycle_interval.is_zero() {
            return Err(anyhow!("worker.cycle_interval_ms must be greater than zero"));
        }
        if self.worker.health_log_interval.is_zero() {
            return Err(anyhow!("worker.health_log_secs must be greater than zero"));
        }
        if self.worker.target_fps == 0 {
            return Err(anyhow!("worker.target_fps must be greater than zero"));
        }

        let geo = &self.geolocation;
        if geo.timeout.is_zero() || geo.timeout > MAX_GEO_TIMEOUT {
            return Err(anyhow!(
                "geolocation.timeout_ms must be within 1..={}",
                MAX_GEO_TIMEOUT.as_millis()
            ));
        }
        for (key, value) in [
            ("geolocation.ip_lookup_url", &geo.ip_lookup_url),
            ("geolocation.reverse_url", &geo.reverse_url),
        ] {
            url::Url::parse(value).map_err(|e| anyhow!("{} is not a valid url: {}", key, e))?;
        }
        if geo.user_agent.trim().is_empty() {
            return Err(anyhow!("geolocation.user_agent must not be empty"));
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

// ----------------------------------------------------------------------------
// Camera list
// ----------------------------------------------------------------------------

/// A camera entry that was skipped while loading the list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedCamera {
    /// Position in the JSON array.
    pub index: usize,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct CameraList {
    pub cameras: Vec<CameraDescriptor>,
    pub rejected: Vec<RejectedCamera>,
}

/// Load the camera list: a JSON array of `{id, name, rtsp_url, location?}`.
///
/// Bad entries are rejected one by one; the load fails only when the file
/// cannot be read, is not an array, or leaves no usable camera.
pub fn load_cameras(path: &Path) -> Result<CameraList> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read camera list {}: {}", path.display(), e))?;
    let doc: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid camera list {}: {}", path.display(), e))?;
    let entries = doc
        .as_array()
        .ok_or_else(|| anyhow!("camera list {} must be a JSON array", path.display()))?;

    let mut cameras = Vec::new();
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();
    for (index, entry) in entries.iter().enumerate() {
        match parse_camera(entry) {
            Ok(camera) if !seen.insert(camera.id.clone()) => {
                rejected.push(RejectedCamera {
                    index,
                    reason: format!("duplicate camera id '{}'", camera.id),
                });
            }
            Ok(camera) => cameras.push(camera),
            Err(e) => rejected.push(RejectedCamera {
                index,
                reason: e.to_string(),
            }),
        }
    }
    for r in &rejected {
        log::warn!("camera entry #{} rejected: {}", r.index, r.reason);
    }
    if cameras.is_empty() {
        return Err(anyhow!(
            "camera list {} has no valid cameras",
            path.display()
        ));
    }
    Ok(CameraList { cameras, rejected })
}

fn parse_camera(entry: &serde_json::Value) -> Result<CameraDescriptor> {
    let obj = entry
        .as_object()
        .ok_or_else(|| anyhow!("entry is not an object"))?;
    let field = |key: &str| -> Result<String> {
        let value = obj
            .get(key)
            .ok_or_else(|| anyhow!("missing field '{}'", key))?
            .as_str()
            .ok_or_else(|| anyhow!("field '{}' must be a string", key))?
            .trim();
        if value.is_empty() {
            return Err(anyhow!("field '{}' is empty", key));
        }
        Ok(value.to_string())
    };

    let id = field("id")?;
    crate::validate_camera_id(&id)?;
    let mut camera = CameraDescriptor::new(&id, &field("name")?, &field("rtsp_url")?);
    if let Some(location) = obj.get("location") {
        let location = location
            .as_str()
            .ok_or_else(|| anyhow!("field 'location' must be a string"))?
            .trim();
        if !location.is_empty() {
            camera = camera.with_location(location);
        }
    }
    Ok(camera)
}
