//! Capture sessions.
//!
//! A capture session is the live handle to one camera stream. Sessions are
//! transient: a worker opens one through a `SourceConnector`, reads frames
//! until the stream fails, releases it and opens a new one. Nothing about a
//! session outlives it.
//!
//! Sources:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - Synthetic `stub://` streams (testing, demos)

use anyhow::Result;

use crate::frame::Frame;

pub mod rtsp;

pub use rtsp::RtspSource;

/// Statistics for a capture session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// One open capture session.
pub trait FrameSource: Send {
    /// Read the next decoded frame. Blocks up to the source's I/O timeout.
    ///
    /// An error means the session is no longer usable and must be released.
    fn read_frame(&mut self) -> Result<Frame>;

    /// False once the source has observed a disconnect or end of stream.
    fn is_open(&self) -> bool;

    /// Tear down the underlying connection. Safe to call more than once.
    fn release(&mut self);

    fn stats(&self) -> SourceStats;
}

/// Opens capture sessions against a source URI.
pub trait SourceConnector: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;
}

/// Connector for RTSP (and `stub://`) URIs.
#[derive(Clone, Debug)]
pub struct RtspConnector {
    pub target_fps: u32,
}

impl RtspConnector {
    pub fn new(target_fps: u32) -> Self {
        Self { target_fps }
    }
}

impl Default for RtspConnector {
    fn default() -> Self {
        Self { target_fps: 30 }
    }
}

impl SourceConnector for RtspConnector {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let config = rtsp::RtspConfig {
            url: uri.to_string(),
            target_fps: self.target_fps,
            ..rtsp::RtspConfig::default()
        };
        let mut source = RtspSource::new(config)?;
        source.connect()?;
        Ok(Box::new(source))
    }
}
