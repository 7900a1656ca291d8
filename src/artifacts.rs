//! Detection artifacts on disk.
//!
//! - Snapshots: `<snapshot_dir>/<camera_id>_<YYYYmmdd_HHMMSS>.jpg`, served by
//!   the dashboard as static files.
//! - Labeled clips: the classified window as a NumPy `.npy` array
//!   (`uint8`, shape `(T, H, W, C)`), stored under `<corpus_root>/accident/`
//!   with the snapshot's stem, e.g. `cam1_20240309_140509.npy`.
//! - Feedback: a reviewer's verdict moves a clip between the `accident` and
//!   `normal` corpora. Repeating a verdict is harmless.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use crate::config::StorageSettings;
use crate::frame::{Frame, Window, SNAPSHOT_JPEG_QUALITY};
use crate::storage::write_atomic;

const SNAPSHOT_EXT: &str = "jpg";
const CLIP_EXT: &str = "npy";
const ACCIDENT_CORPUS: &str = "accident";
const NORMAL_CORPUS: &str = "normal";

/// Reviewer verdict on a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    FalsePositive,
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "correct" => Ok(Verdict::Correct),
            "false_positive" => Ok(Verdict::FalsePositive),
            other => Err(anyhow!(
                "unknown verdict '{}'; expected correct or false_positive",
                other
            )),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Correct => f.write_str("correct"),
            Verdict::FalsePositive => f.write_str("false_positive"),
        }
    }
}

/// What a feedback call did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Moved { from: PathBuf, to: PathBuf },
    /// The clip is already in the corpus the verdict asks for.
    AlreadyLabeled(PathBuf),
    NotFound { clip_name: String },
}

pub struct ArtifactStore {
    snapshot_dir: PathBuf,
    accident_dir: PathBuf,
    normal_dir: PathBuf,
    /// Per camera: the last base name reserved and the suffix handed out for it.
    issued: Mutex<HashMap<String, (String, u32)>>,
}

impl ArtifactStore {
    pub fn open(settings: &StorageSettings) -> Result<Self> {
        Self::with_dirs(&settings.snapshot_dir, &settings.corpus_root)
    }

    pub fn with_dirs(snapshot_dir: &Path, corpus_root: &Path) -> Result<Self> {
        let store = Self {
            snapshot_dir: snapshot_dir.to_path_buf(),
            accident_dir: corpus_root.join(ACCIDENT_CORPUS),
            normal_dir: corpus_root.join(NORMAL_CORPUS),
            issued: Mutex::new(HashMap::new()),
        };
        for dir in [&store.snapshot_dir, &store.accident_dir, &store.normal_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create artifact directory {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn accident_dir(&self) -> &Path {
        &self.accident_dir
    }

    pub fn normal_dir(&self) -> &Path {
        &self.normal_dir
    }

    /// Pick a snapshot name for `camera_id` at `at` that is not taken yet.
    ///
    /// Two detections on one camera within the same second get `_1`, `_2`, ...
    /// A name is never handed out twice, even when nothing was written under it.
    pub fn reserve_snapshot_name(&self, camera_id: &str, at: NaiveDateTime) -> String {
        let base = snapshot_name(camera_id, at);
        let stem = base.trim_end_matches(".jpg").to_string();
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let first = match issued.get(camera_id) {
            Some((last_base, suffix)) if *last_base == base => suffix + 1,
            _ => 0,
        };
        let (suffix, name) = (first..)
            .map(|n| {
                let name = match n {
                    0 => base.clone(),
                    n => format!("{}_{}.{}", stem, n, SNAPSHOT_EXT),
                };
                (n, name)
            })
            .find(|(_, candidate)| !self.snapshot_taken(candidate))
            .unwrap_or((first, base.clone()));
        issued.insert(camera_id.to_string(), (base, suffix));
        name
    }

    fn snapshot_taken(&self, name: &str) -> bool {
        if self.snapshot_dir.join(name).exists() {
            return true;
        }
        clip_name_for(name)
            .map(|clip| self.accident_dir.join(&clip).exists() || self.normal_dir.join(&clip).exists())
            .unwrap_or(false)
    }

    pub fn write_snapshot(&self, name: &str, frame: &Frame) -> Result<PathBuf> {
        validate_artifact_name(name)?;
        let path = self.snapshot_dir.join(name);
        let jpeg = frame.encode_jpeg(SNAPSHOT_JPEG_QUALITY)?;
        write_atomic(&path, &jpeg).with_context(|| format!("write snapshot {}", path.display()))?;
        Ok(path)
    }

    /// Persist the window as a labeled accident clip correlated with `snapshot_name`.
    pub fn write_clip(&self, snapshot_name: &str, window: &Window) -> Result<PathBuf> {
        let clip_name = clip_name_for(snapshot_name)?;
        let path = self.accident_dir.join(clip_name);
        let npy = encode_npy_u8(&window.shape(), &window.to_contiguous())?;
        write_atomic(&path, &npy).with_context(|| format!("write clip {}", path.display()))?;
        Ok(path)
    }

    /// Apply a reviewer verdict to the clip behind `snapshot_ref`.
    pub fn apply_feedback(&self, snapshot_ref: &str, verdict: Verdict) -> Result<FeedbackOutcome> {
        let clip_name = clip_name_for(snapshot_ref)?;
        let (from_dir, to_dir) = match verdict {
            Verdict::FalsePositive => (&self.accident_dir, &self.normal_dir),
            Verdict::Correct => (&self.normal_dir, &self.accident_dir),
        };
        let from = from_dir.join(&clip_name);
        let to = to_dir.join(&clip_name);

        if from.exists() {
            fs::rename(&from, &to)
                .with_context(|| format!("move {} to {}", from.display(), to.display()))?;
            log::info!(
                "relabeled clip {} ({}): {} -> {}",
                clip_name,
                verdict,
                from.display(),
                to.display()
            );
            return Ok(FeedbackOutcome::Moved { from, to });
        }
        if to.exists() {
            return Ok(FeedbackOutcome::AlreadyLabeled(to));
        }
        log::warn!("clip not found for feedback: {}", clip_name);
        Ok(FeedbackOutcome::NotFound { clip_name })
    }
}

/// `<camera_id>_<YYYYmmdd_HHMMSS>.jpg`
pub fn snapshot_name(camera_id: &str, at: NaiveDateTime) -> String {
    format!("{}_{}.{}", camera_id, at.format("%Y%m%d_%H%M%S"), SNAPSHOT_EXT)
}

/// Clip file name correlated with a snapshot name.
pub fn clip_name_for(snapshot_ref: &str) -> Result<String> {
    validate_artifact_name(snapshot_ref)?;
    let stem = snapshot_ref
        .strip_suffix(".jpg")
        .ok_or_else(|| anyhow!("snapshot reference '{}' is not a .jpg name", snapshot_ref))?;
    if stem.is_empty() {
        return Err(anyhow!("snapshot reference '{}' has an empty stem", snapshot_ref));
    }
    Ok(format!("{}.{}", stem, CLIP_EXT))
}

/// Artifact names are bare file names; anything that could escape the
/// artifact directories is rejected.
fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.chars().any(char::is_control)
    {
        return Err(anyhow!("invalid artifact name '{}'", name));
    }
    Ok(())
}

/// NumPy format v1.0 for a C-ordered `uint8` array.
pub fn encode_npy_u8(shape: &[usize], data: &[u8]) -> Result<Vec<u8>> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(anyhow!(
            "npy shape {:?} needs {} bytes, got {}",
            shape,
            expected,
            data.len()
        ));
    }
    let dims = match shape {
        [single] => format!("{},", single),
        _ => shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    };
    let mut header = format!(
        "{{'descr': '|u1', 'fortran_order': False, 'shape': ({}), }}",
        dims
    );
    // magic(6) + version(2) + header_len(2) + header, padded to 64 bytes with a trailing newline.
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');
    let header_len =
        u16::try_from(header.len()).map_err(|_| anyhow!("npy header too long"))?;

    let mut out = Vec::with_capacity(10 + header.len() + data.len());
    out.extend_from_slice(b"\x93NUMPY");
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    Ok(out)
}
