//! v4l2ndi - relay a V4L2 capture device to an NDI stream
//!
//! This binary:
//! 1. Loads configuration (defaults, `V4L2NDI_CONFIG` file, environment, flags)
//! 2. Opens and negotiates the capture device, maps its buffers
//! 3. Creates the NDI sender
//! 4. Relays frames until Ctrl-C or `--count` frames, then shuts down cleanly

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use v4l2ndi::{CaptureFormat, DispatchMode, Overrides, Relay, RelayConfig, SinkKind};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay a V4L2 capture device to an NDI stream")]
struct Args {
    /// Video device path (or stub://name for a synthetic source).
    #[arg(short = 'd', long)]
    device: Option<String>,

    /// Name of the NDI stream.
    #[arg(short = 'v', long = "video")]
    stream_name: Option<String>,

    /// Capture width override.
    #[arg(short = 'x', long)]
    width: Option<u32>,

    /// Capture height override.
    #[arg(short = 'y', long)]
    height: Option<u32>,

    /// Frame rate numerator.
    #[arg(short = 'n', long)]
    numerator: Option<u32>,

    /// Frame rate denominator.
    #[arg(short = 'e', long)]
    denominator: Option<u32>,

    /// Capture YUYV and convert to UYVY before sending.
    #[arg(short = 'f', long, conflicts_with = "uyvy")]
    yuyv: bool,

    /// Capture UYVY.
    #[arg(short = 'u', long)]
    uyvy: bool,

    /// Send from a separate processing thread.
    #[arg(short = 'i', long)]
    threaded: bool,

    /// Send asynchronously through a double buffer. Wins over `--threaded`.
    #[arg(short = 'a', long = "async")]
    async_send: bool,

    /// Configuration file (JSON, or TOML by extension).
    #[arg(long, env = "V4L2NDI_CONFIG")]
    config: Option<PathBuf>,

    /// Number of capture buffers to request.
    #[arg(long)]
    buffers: Option<u32>,

    /// Frame queue depth in threaded mode (0 = unbounded).
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Stop after this many captured frames.
    #[arg(long)]
    count: Option<u64>,

    /// Sink backend: ndi or stub.
    #[arg(long)]
    sink: Option<SinkKind>,

    /// How long to wait for an NDI receiver per frame, in milliseconds.
    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    /// Path to the NDI runtime library.
    #[arg(long)]
    ndi_library: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        let format = match (self.yuyv, self.uyvy) {
            (true, _) => Some(CaptureFormat::Yuyv),
            (false, true) => Some(CaptureFormat::Uyvy),
            (false, false) => None,
        };
        let mode = match (self.async_send, self.threaded) {
            (true, _) => Some(DispatchMode::Async),
            (false, true) => Some(DispatchMode::Threaded),
            (false, false) => None,
        };
        Overrides {
            config_path: self.config.clone(),
            device: self.device.clone(),
            stream_name: self.stream_name.clone(),
            width: self.width,
            height: self.height,
            frame_rate_numerator: self.numerator,
            frame_rate_denominator: self.denominator,
            format,
            mode,
            buffers: self.buffers,
            queue_depth: self.queue_depth,
            sink: self.sink,
            probe_timeout_ms: self.probe_timeout_ms,
            frame_limit: self.count,
            ndi_library: self.ndi_library.clone(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = RelayConfig::load_with(&args.overrides())?;
    log::info!(
        "v4l2ndi {}: {} -> {:?} stream {:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.device,
        cfg.sink,
        cfg.stream_name
    );

    let relay = Relay::open(&cfg)?;

    let stop = relay.stop_flag();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let stats = relay.run()?;
    log::info!(
        "v4l2ndi done: {} captured, {} sent, {} dropped",
        stats.captured,
        stats.dispatched,
        stats.dropped
    );
    Ok(())
}
