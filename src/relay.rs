//! The capture loop and relay lifecycle.
//!
//! `Relay::open` negotiates the device, maps its buffers, opens the sink and
//! builds the dispatch strategy. `Relay::run` streams until the stop flag is
//! raised, the frame limit is reached, or a fatal error occurs, then shuts
//! down in order: drain dispatch, stop streaming, flush the sink, unmap.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{open_device, CaptureDevice, FormatRequest, StubConfig};
use crate::config::{DispatchMode, RelayConfig};
use crate::convert::Conversion;
use crate::dispatch::Dispatcher;
use crate::error::CaptureError;
use crate::format::{FrameRate, Resolution};
use crate::pool::BufferPool;
use crate::sink::{open_sink, Sink};
use crate::stats::{RelayStats, StatsSnapshot};

/// Everything both threads share, built once at startup.
pub struct PipelineContext {
    pub pool: Arc<BufferPool>,
    pub sink: Arc<dyn Sink>,
    pub stats: RelayStats,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub conversion: Conversion,
}

/// Result of one capture-loop iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Readiness was signalled but the driver had nothing to dequeue.
    NoData,
    /// No receiver attached; the buffer went straight back.
    NoReceiver,
    Dispatched,
}

pub struct Relay {
    ctx: Arc<PipelineContext>,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    streaming: bool,
    ready_timeout: Duration,
    probe_timeout: Duration,
    stats_interval: Duration,
    frame_limit: Option<u64>,
}

impl Relay {
    /// Open the configured device and sink.
    pub fn open(config: &RelayConfig) -> Result<Self> {
        let stub = StubConfig {
            resolution: Resolution::new(
                config.width.unwrap_or(StubConfig::default().resolution.width),
                config.height.unwrap_or(StubConfig::default().resolution.height),
            ),
            frame_interval: Some(config.frame_rate.frame_interval()),
            ..StubConfig::default()
        };
        let device = open_device(&config.device, stub)
            .with_context(|| format!("open capture device {}", config.device))?;
        let sink = open_sink(config.sink, &config.stream_name, config.ndi_library.as_deref())
            .with_context(|| format!("create sink {}", config.stream_name))?;
        Self::with_parts(config, device, sink)
    }

    /// Build a relay around an already-open device and sink.
    pub fn with_parts(
        config: &RelayConfig,
        mut device: Box<dyn CaptureDevice>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self> {
        config.validate()?;
        let request = FormatRequest {
            width: config.width,
            height: config.height,
            fourcc: config.format.requested_fourcc(),
        };
        let negotiated = device
            .negotiate(&request)
            .with_context(|| format!("negotiate format on {}", device.name()))?;
        let conversion = Conversion::for_source(negotiated.fourcc)?;
        log::info!(
            "relay: {} {} {} @ {} fps -> {} ({:?}{})",
            device.name(),
            negotiated.resolution,
            negotiated.fourcc,
            config.frame_rate,
            sink.name(),
            config.mode,
            if conversion.is_passthrough() {
                ""
            } else {
                ", converting to UYVY"
            }
        );

        let pool = BufferPool::init(device, config.buffers)?;
        let ctx = Arc::new(PipelineContext {
            pool: Arc::new(pool),
            sink,
            stats: RelayStats::new(),
            resolution: negotiated.resolution,
            frame_rate: config.frame_rate,
            conversion,
        });
        let dispatcher = Dispatcher::new(config.mode, &ctx, config.queue_depth)?;
        Ok(Self {
            ctx,
            dispatcher,
            stop: Arc::new(AtomicBool::new(false)),
            streaming: false,
            ready_timeout: config.ready_timeout,
            probe_timeout: config.probe_timeout,
            stats_interval: config.stats_interval,
            frame_limit: config.frame_limit,
        })
    }

    /// Raising this flag ends `run` after the current iteration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    pub fn queue_len(&self) -> Option<usize> {
        self.dispatcher.queue_len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Queue every buffer to the driver and start streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        self.ctx
            .pool
            .start()
            .with_context(|| format!("start streaming on {}", self.ctx.pool.device_name()))?;
        self.streaming = true;
        log::info!("relay: streaming on {}", self.ctx.pool.device_name());
        Ok(())
    }

    /// Wait for one filled buffer and route it.
    pub fn step(&mut self) -> Result<Step> {
        if !self.streaming {
            return Err(anyhow!("relay is not streaming"));
        }
        let ctx = &self.ctx;
        if !ctx.pool.wait_ready(self.ready_timeout)? {
            return Err(CaptureError::Stalled(self.ready_timeout).into());
        }
        let frame = match ctx.pool.acquire() {
            Ok(frame) => frame,
            Err(err) if err.is_transient() => return Ok(Step::NoData),
            Err(err) => return Err(err.into()),
        };
        ctx.stats.record_captured();
        log::trace!(
            "relay: buffer {} seq {} ({} bytes)",
            frame.index(),
            frame.sequence(),
            frame.bytes_used()
        );

        if !ctx.sink.has_receivers(self.probe_timeout) {
            log::debug!("relay: no receivers, returning buffer {}", frame.index());
            ctx.stats.record_skipped();
            ctx.pool.release(frame)?;
            return Ok(Step::NoReceiver);
        }
        self.dispatcher.dispatch(ctx, frame)?;
        Ok(Step::Dispatched)
    }

    /// Stream until stopped, then shut down. Returns the final counters.
    pub fn run(mut self) -> Result<StatsSnapshot> {
        let outcome = self.start().and_then(|_| self.capture_loop());
        if let Err(err) = &outcome {
            self.ctx.stats.set_last_error(err);
        }
        let shutdown = self.shutdown();
        match (outcome, shutdown) {
            (Err(err), Err(shutdown_err)) => {
                log::error!("relay: shutdown after failure also failed: {:#}", shutdown_err);
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
            (Ok(()), result) => result,
        }
    }

    fn capture_loop(&mut self) -> Result<()> {
        let mut last_health_log = Instant::now();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                log::info!("relay: stop requested");
                return Ok(());
            }
            if let Some(limit) = self.frame_limit {
                if self.ctx.stats.snapshot().captured >= limit {
                    log::info!("relay: frame limit {} reached", limit);
                    return Ok(());
                }
            }
            self.step()?;
            if last_health_log.elapsed() >= self.stats_interval {
                self.log_health();
                last_health_log = Instant::now();
            }
        }
    }

    fn log_health(&self) {
        let stats = self.stats();
        log::info!(
            "relay health: captured={} dispatched={} dropped={} no_receiver={} convert_failures={} driver_owned={}/{}{}",
            stats.captured,
            stats.dispatched,
            stats.dropped,
            stats.skipped_no_receiver,
            stats.conversion_failures,
            self.ctx.pool.driver_owned(),
            self.ctx.pool.len(),
            self.queue_len()
                .map(|len| format!(" queue={}", len))
                .unwrap_or_default()
        );
    }

    /// Drain dispatch, stop streaming and unmap the buffers.
    pub fn shutdown(self) -> Result<StatsSnapshot> {
        let Relay {
            ctx,
            dispatcher,
            streaming,
            ..
        } = self;

        let mut first_err: Option<anyhow::Error> = None;
        if let Err(err) = dispatcher.finish(&ctx) {
            first_err.get_or_insert(err);
        }
        if streaming {
            if let Err(err) = ctx.pool.stop() {
                first_err.get_or_insert(err.into());
            }
        }
        if let Err(err) = ctx.sink.flush() {
            first_err.get_or_insert(err);
        }

        let snapshot = ctx.stats.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => log::info!("relay stopped: {}", json),
            Err(err) => log::warn!("relay stopped (stats unavailable: {})", err),
        }

        match Arc::try_unwrap(ctx) {
            Ok(ctx) => match Arc::try_unwrap(ctx.pool) {
                Ok(pool) => {
                    if let Err(err) = pool.teardown() {
                        first_err.get_or_insert(err.into());
                    }
                }
                Err(_) => log::warn!("relay: buffer pool still shared, unmapping on drop"),
            },
            Err(_) => log::warn!("relay: pipeline context still shared, unmapping on drop"),
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StubDevice;
    use crate::format::FourCc;
    use crate::sink::StubSink;

    fn relay(config: &RelayConfig, stub: StubConfig) -> Result<(Relay, Arc<StubSink>)> {
        let sink = Arc::new(StubSink::new("test"));
        let device = Box::new(StubDevice::new("stub://relay", stub));
        let relay = Relay::with_parts(config, device, sink.clone())?;
        Ok((relay, sink))
    }

    fn config(mode: DispatchMode) -> RelayConfig {
        RelayConfig {
            device: "stub://relay".to_string(),
            mode,
            buffers: 4,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn step_requires_streaming() -> Result<()> {
        let (mut relay, _) = relay(&config(DispatchMode::Sync), StubConfig::default())?;
        assert!(relay.step().is_err());
        relay.shutdown()?;
        Ok(())
    }

    #[test]
    fn stall_is_fatal() -> Result<()> {
        let cfg = RelayConfig {
            ready_timeout: Duration::from_millis(20),
            ..config(DispatchMode::Sync)
        };
        let stub = StubConfig {
            frame_interval: Some(Duration::from_secs(60)),
            ..StubConfig::default()
        };
        let (mut relay, _) = relay(&cfg, stub)?;
        relay.start()?;
        let err = relay.step().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::Stalled(_))
        ));
        relay.shutdown()?;
        Ok(())
    }

    #[test]
    fn yuyv_frames_are_converted_before_sending() -> Result<()> {
        let cfg = RelayConfig {
            format: crate::format::CaptureFormat::Yuyv,
            ..config(DispatchMode::Sync)
        };
        let (mut relay, sink) = relay(&cfg, StubConfig::default())?;
        relay.start()?;
        assert_eq!(relay.step()?, Step::Dispatched);
        let sent = &sink.submissions()[0];
        assert_eq!(sent.fourcc, FourCc::UYVY);
        // Synthetic YUYV grey starts 0x10 0x80 past the sequence header.
        assert_eq!(&sent.prefix[8..10], &[0x80, 0x10]);
        relay.shutdown()?;
        Ok(())
    }

    #[test]
    fn run_stops_at_frame_limit() -> Result<()> {
        let cfg = RelayConfig {
            frame_limit: Some(5),
            ..config(DispatchMode::Sync)
        };
        let (relay, sink) = relay(&cfg, StubConfig::default())?;
        let stats = relay.run()?;
        assert_eq!(stats.captured, 5);
        assert_eq!(sink.submission_count(), 5);
        Ok(())
    }

    #[test]
    fn stop_flag_ends_run() -> Result<()> {
        let (relay, sink) = relay(&config(DispatchMode::Threaded), StubConfig::default())?;
        relay.stop_flag().store(true, Ordering::SeqCst);
        let stats = relay.run()?;
        assert_eq!(stats.captured, 0);
        assert_eq!(sink.submission_count(), 0);
        Ok(())
    }
}
