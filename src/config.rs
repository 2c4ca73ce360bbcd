use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::format::{CaptureFormat, FrameRate};
use crate::queue::DEFAULT_MAX_DEPTH;

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_STREAM_NAME: &str = "Stream";
const DEFAULT_BUFFERS: u32 = 8;
const DEFAULT_READY_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// How captured frames reach the sink. Fixed for the process lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Send from the capture thread and wait for the sink.
    #[default]
    Sync,
    /// Copy into a double buffer and send without waiting.
    Async,
    /// Hand off to the processing thread through the frame queue.
    Threaded,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Ndi,
    Stub,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ndi" => Ok(SinkKind::Ndi),
            "stub" => Ok(SinkKind::Stub),
            other => Err(anyhow!("unknown sink {:?} (expected ndi or stub)", other)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    capture: Option<CaptureConfigFile>,
    output: Option<OutputConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<CaptureFormat>,
    frame_rate: Option<FrameRate>,
    buffers: Option<u32>,
    ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    stream_name: Option<String>,
    sink: Option<SinkKind>,
    ndi_library: Option<PathBuf>,
    probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    mode: Option<DispatchMode>,
    queue_depth: Option<usize>,
    stats_interval_secs: Option<u64>,
    frame_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub device: String,
    pub stream_name: String,
    /// Width override; `None` keeps the driver's current width.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: CaptureFormat,
    pub frame_rate: FrameRate,
    pub buffers: u32,
    pub mode: DispatchMode,
    /// Frame queue cap in threaded mode. 0 means unbounded.
    pub queue_depth: usize,
    pub sink: SinkKind,
    pub ndi_library: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub probe_timeout: Duration,
    pub stats_interval: Duration,
    /// Stop after this many captured frames.
    pub frame_limit: Option<u64>,
}

/// Command-line overrides, applied on top of file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub device: Option<String>,
    pub stream_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate_numerator: Option<u32>,
    pub frame_rate_denominator: Option<u32>,
    pub format: Option<CaptureFormat>,
    pub mode: Option<DispatchMode>,
    pub buffers: Option<u32>,
    pub queue_depth: Option<usize>,
    pub sink: Option<SinkKind>,
    pub probe_timeout_ms: Option<u64>,
    pub frame_limit: Option<u64>,
    pub ndi_library: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            width: None,
            height: None,
            format: CaptureFormat::Native,
            frame_rate: FrameRate::default(),
            buffers: DEFAULT_BUFFERS,
            mode: DispatchMode::Sync,
            queue_depth: DEFAULT_MAX_DEPTH,
            sink: SinkKind::Ndi,
            ndi_library: None,
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            frame_limit: None,
        }
    }
}

impl RelayConfig {
    /// Defaults, then the file named by `V4L2NDI_CONFIG`, then environment.
    pub fn load() -> Result<Self> {
        Self::load_with(&Overrides::default())
    }

    /// Full layering: defaults < config file < environment < `overrides`.
    ///
    /// `overrides.config_path` takes precedence over `V4L2NDI_CONFIG`.
    pub fn load_with(overrides: &Overrides) -> Result<Self> {
        let config_path = overrides
            .config_path
            .clone()
            .or_else(|| std::env::var("V4L2NDI_CONFIG").ok().map(PathBuf::from));
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let defaults = Self::default();
        let capture = file.capture.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        Self {
            device: capture.device.unwrap_or(defaults.device),
            stream_name: output.stream_name.unwrap_or(defaults.stream_name),
            width: capture.width,
            height: capture.height,
            format: capture.format.unwrap_or(defaults.format),
            frame_rate: capture.frame_rate.unwrap_or(defaults.frame_rate),
            buffers: capture.buffers.unwrap_or(defaults.buffers),
            mode: pipeline.mode.unwrap_or(defaults.mode),
            queue_depth: pipeline.queue_depth.unwrap_or(defaults.queue_depth),
            sink: output.sink.unwrap_or(defaults.sink),
            ndi_library: output.ndi_library,
            ready_timeout: capture
                .ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_timeout),
            probe_timeout: output
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            stats_interval: pipeline
                .stats_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_interval),
            frame_limit: pipeline.frame_limit,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("V4L2NDI_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(name) = std::env::var("V4L2NDI_STREAM_NAME") {
            if !name.trim().is_empty() {
                self.stream_name = name;
            }
        }
        if let Ok(depth) = std::env::var("V4L2NDI_QUEUE_DEPTH") {
            self.queue_depth = depth
                .trim()
                .parse()
                .map_err(|_| anyhow!("V4L2NDI_QUEUE_DEPTH must be a non-negative integer"))?;
        }
        if let Ok(buffers) = std::env::var("V4L2NDI_BUFFERS") {
            self.buffers = buffers
                .trim()
                .parse()
                .map_err(|_| anyhow!("V4L2NDI_BUFFERS must be a positive integer"))?;
        }
        if let Ok(path) = std::env::var("V4L2NDI_NDI_LIBRARY") {
            if !path.trim().is_empty() {
                self.ndi_library = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(device) = &o.device {
            self.device = device.clone();
        }
        if let Some(name) = &o.stream_name {
            self.stream_name = name.clone();
        }
        if o.width.is_some() {
            self.width = o.width;
        }
        if o.height.is_some() {
            self.height = o.height;
        }
        if let Some(numerator) = o.frame_rate_numerator {
            self.frame_rate.numerator = numerator;
        }
        if let Some(denominator) = o.frame_rate_denominator {
            self.frame_rate.denominator = denominator;
        }
        if let Some(format) = o.format {
            self.format = format;
        }
        if let Some(mode) = o.mode {
            self.mode = mode;
        }
        if let Some(buffers) = o.buffers {
            self.buffers = buffers;
        }
        if let Some(depth) = o.queue_depth {
            self.queue_depth = depth;
        }
        if let Some(sink) = o.sink {
            self.sink = sink;
        }
        if let Some(path) = &o.ndi_library {
            self.ndi_library = Some(path.clone());
        }
        if let Some(ms) = o.probe_timeout_ms {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if o.frame_limit.is_some() {
            self.frame_limit = o.frame_limit;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(anyhow!("device path must not be empty"));
        }
        if self.stream_name.trim().is_empty() {
            return Err(anyhow!("stream name must not be empty"));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(anyhow!("width and height overrides must be greater than zero"));
        }
        self.frame_rate.validate()?;
        if self.buffers < crate::pool::MIN_BUFFERS {
            return Err(anyhow!(
                "at least {} capture buffers are required (got {})",
                crate::pool::MIN_BUFFERS,
                self.buffers
            ));
        }
        if self.ready_timeout.is_zero() {
            return Err(anyhow!("ready timeout must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(anyhow!("receiver probe timeout must be greater than zero"));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        if self.frame_limit == Some(0) {
            return Err(anyhow!("frame limit must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
