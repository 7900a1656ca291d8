//! Detection event log.
//!
//! The log is a JSON array of `DetectionEvent` records in write order. Every
//! append reads the current array, pushes one record and replaces the file via
//! write-to-temp + rename, so readers only ever see a complete document.
//! Appends are serialized by a mutex held across the whole read-modify-write.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::DetectionEvent;

pub trait EventStore: Send + Sync {
    /// Append one event. Existing entries are never rewritten or dropped.
    fn append(&self, event: &DetectionEvent) -> Result<()>;

    /// All events in append order. A store that was never written is empty.
    fn read_all(&self) -> Result<Vec<DetectionEvent>>;
}

/// Sort events newest first by timestamp; unparseable timestamps sort last.
pub fn most_recent_first(mut events: Vec<DetectionEvent>) -> Vec<DetectionEvent> {
    events.sort_by(|a, b| b.occurred_at().cmp(&a.occurred_at()));
    events
}

// ----------------------------------------------------------------------------
// JSON file store
// ----------------------------------------------------------------------------

pub struct JsonEventStore {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonEventStore {
    /// Open the log at `path`, creating its directory.
    ///
    /// An existing log must parse; a corrupt log fails here, not at the
    /// first detection.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log directory {}", parent.display()))?;
        }
        let existing = read_events(&path)?;
        log::debug!("event log {} holds {} event(s)", path.display(), existing.len());
        Ok(Self {
            path,
            append_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventStore for JsonEventStore {
    fn append(&self, event: &DetectionEvent) -> Result<()> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;

        // A log that exists but does not parse is left untouched: rewriting it
        // would silently discard every earlier record.
        let mut events = read_events(&self.path)?;
        events.push(event.clone());
        let json = serde_json::to_vec_pretty(&events)?;
        write_atomic(&self.path, &json)
            .with_context(|| format!("write event log {}", self.path.display()))?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<DetectionEvent>> {
        read_events(&self.path)
    }
}

/// Read an event log file; a missing file is an empty log.
pub fn read_events(path: &Path) -> Result<Vec<DetectionEvent>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(anyhow!("failed to read event log {}: {}", path.display(), e)),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&raw)
        .map_err(|e| anyhow!("corrupt event log {}: {}", path.display(), e))
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<DetectionEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: &DetectionEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?
            .push(event.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<DetectionEvent>> {
        Ok(self
            .events
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(camera: &str, timestamp: &str) -> DetectionEvent {
        DetectionEvent {
            timestamp: timestamp.to_string(),
            snapshot_ref: format!("{}_x.jpg", camera),
            location: "Unknown".to_string(),
            camera_id: camera.to_string(),
            camera_name: camera.to_uppercase(),
        }
    }

    #[test]
    fn missing_log_reads_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonEventStore::open(dir.path().join("logs/events.json"))?;
        assert!(store.read_all()?.is_empty());
        assert!(dir.path().join("logs").is_dir());
        Ok(())
    }

    #[test]
    fn append_preserves_order_and_existing_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonEventStore::open(dir.path().join("events.json"))?;
        store.append(&event("a", "2024-01-01T00:00:02"))?;
        store.append(&event("b", "2024-01-01T00:00:01"))?;
        store.append(&event("c", "2024-01-01T00:00:03"))?;

        let ids: Vec<String> = store.read_all()?.into_iter().map(|e| e.camera_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!dir.path().join("events.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn log_file_is_a_readable_json_array() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.json");
        let store = JsonEventStore::open(&path)?;
        store.append(&event("a", "2024-01-01T00:00:00"))?;

        let raw = fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        assert_eq!(value.as_array().map(|a| a.len()), Some(1));
        assert_eq!(value[0]["snapshot"], "a_x.jpg");
        Ok(())
    }

    #[test]
    fn open_refuses_a_corrupt_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.json");
        fs::write(&path, b"[{")?;

        let err = match JsonEventStore::open(&path) {
            Ok(_) => panic!("corrupt log accepted"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("corrupt event log"));
        assert_eq!(fs::read(&path)?, b"[{");
        Ok(())
    }

    #[test]
    fn log_corrupted_after_open_is_never_overwritten() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.json");
        let store = JsonEventStore::open(&path)?;
        fs::write(&path, b"[{\"timestamp\": ")?;

        assert!(store.read_all().is_err());
        assert!(store.append(&event("a", "2024-01-01T00:00:00")).is_err());
        assert_eq!(fs::read(&path)?, b"[{\"timestamp\": ");
        Ok(())
    }

    #[test]
    fn reads_legacy_snapshot_field_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.json");
        fs::write(
            &path,
            r#"[{"timestamp":"2024-05-01 10:00:00","snapshot_ref":"cam1_20240501_100000.jpg",
                "location":"Unknown","camera_id":"cam1","camera_name":"Lobby"}]"#,
        )?;
        let events = read_events(&path)?;
        assert_eq!(events[0].snapshot_ref, "cam1_20240501_100000.jpg");
        Ok(())
    }

    #[test]
    fn most_recent_first_sorts_descending() {
        let sorted = most_recent_first(vec![
            event("old", "2024-01-01T08:00:00"),
            event("bad", "not a time"),
            event("new", "2024-01-02 08:00:00"),
            event("mid", "2024-01-01T09:00:00"),
        ]);
        let ids: Vec<&str> = sorted.iter().map(|e| e.camera_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old", "bad"]);
    }

    #[test]
    fn in_memory_store_appends() -> Result<()> {
        let store = InMemoryEventStore::new();
        assert!(store.read_all()?.is_empty());
        store.append(&event("a", "2024-01-01T00:00:00"))?;
        assert_eq!(store.read_all()?.len(), 1);
        Ok(())
    }
}
