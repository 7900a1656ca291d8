//! RTSP frame source.
//!
//! This module provides `RtspSource` for reading frames from IP cameras via RTSP.
//!
//! The RTSP source is responsible for:
//! - Connecting to camera streams
//! - Decoding video frames to RGB8
//! - Reporting stalls and stream errors as read failures
//!
//! Reconnection is NOT handled here; the owning worker releases a failed
//! source and opens a new one.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate; used to size read timeouts.
    pub target_fps: u32,
    /// Frame width for synthetic streams.
    pub width: u32,
    /// Frame height for synthetic streams.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)?),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "RTSP source {} requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }

    /// Connect to the RTSP stream.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }
}

impl FrameSource for RtspSource {
    fn read_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_open(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

/// `stub://name` streams forever. Query options:
/// - `fail_after=N`: the stream drops after N frames (simulated disconnect)
/// - `offline=1`: every connect attempt fails
struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    fail_after: Option<u64>,
    offline: bool,
    connected: bool,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| anyhow!("invalid stub url {}: {}", config.url, e))?;
        let mut fail_after = None;
        let mut offline = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fail_after" => {
                    fail_after = Some(value.parse().map_err(|_| {
                        anyhow!("stub url {}: fail_after must be an integer", config.url)
                    })?)
                }
                "offline" => offline = value != "0",
                _ => {}
            }
        }
        Ok(Self {
            config,
            frame_count: 0,
            fail_after,
            offline,
            connected: false,
        })
    }

    fn connect(&mut self) -> Result<()> {
        if self.offline {
            return Err(anyhow!("{} is offline (synthetic)", self.config.url));
        }
        self.connected = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("{} is not connected", self.config.url));
        }
        if self.fail_after.is_some_and(|limit| self.frame_count >= limit) {
            self.connected = false;
            return Err(anyhow!("{} dropped (synthetic)", self.config.url));
        }
        self.frame_count += 1;
        Ok(self.road_scene())
    }

    /// Grey road under a sky band with one block crossing left to right.
    fn road_scene(&self) -> Frame {
        let (w, h) = (self.config.width, self.config.height);
        let block_w = (w / 8).max(1);
        let block_h = (h / 6).max(1);
        let block_x = ((self.frame_count * 4) % u64::from(w)) as u32;
        let block_y = h / 2;

        let mut img = image::RgbImage::from_pixel(w, h, image::Rgb([96, 96, 96]));
        for (x, y, px) in img.enumerate_pixels_mut() {
            if y < h / 3 {
                *px = image::Rgb([150, 190, 230]);
            } else if (block_x..block_x + block_w).contains(&x)
                && (block_y..block_y + block_h).contains(&y)
            {
                *px = image::Rgb([200, 30, 30]);
            }
        }
        Frame::from(img)
    }

    fn is_open(&self) -> bool {
        self.connected
    }

    fn release(&mut self) {
        self.connected = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start RTSP pipeline for {}", self.config.url))?;
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                self.frame_timeout().as_millis() as u64,
            ))
            .ok_or_else(|| {
                self.last_error = Some("RTSP stream stalled".to_string());
                anyhow!("RTSP stream stalled: {}", self.config.url)
            })?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Frame::new(pixels, width, height)
    }

    fn is_open(&self) -> bool {
        self.connected_at.is_some() && self.last_error.is_none()
    }

    fn release(&mut self) {
        if self.connected_at.take().is_some() {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            log::info!("RtspSource: released {}", self.config.url);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
