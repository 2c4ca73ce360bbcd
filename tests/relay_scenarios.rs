use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use v4l2ndi::capture::{Dequeued, MappedBuffer};
use v4l2ndi::{
    CaptureDevice, CaptureError, CaptureFormat, DispatchMode, FormatRequest, NegotiatedFormat,
    Relay, RelayConfig, Resolution, Step, StubConfig, StubDevice, StubSink,
};

fn config(mode: DispatchMode) -> RelayConfig {
    RelayConfig {
        device: "stub://scenario".to_string(),
        mode,
        ..RelayConfig::default()
    }
}

fn relay_with(config: &RelayConfig, stub: StubConfig, sink: StubSink) -> Result<(Relay, Arc<StubSink>)> {
    let sink = Arc::new(sink);
    let device = Box::new(StubDevice::new("stub://scenario", stub));
    let relay = Relay::with_parts(config, device, sink.clone())?;
    Ok((relay, sink))
}

/// Step until one frame has been captured and routed.
fn capture_one(relay: &mut Relay) -> Result<Step> {
    loop {
        match relay.step()? {
            Step::NoData => continue,
            step => return Ok(step),
        }
    }
}

fn expected_sequences(count: u64) -> Vec<Option<u64>> {
    (0..count).map(Some).collect()
}

#[test]
fn sync_mode_delivers_every_frame_in_order() -> Result<()> {
    let cfg = RelayConfig {
        frame_limit: Some(10),
        ..config(DispatchMode::Sync)
    };
    let (relay, sink) = relay_with(&cfg, StubConfig::default(), StubSink::new("sync"))?;

    let stats = relay.run()?;

    assert_eq!(stats.captured, 10);
    assert_eq!(stats.dispatched, 10);
    assert_eq!(stats.dropped, 0);
    assert_eq!(sink.sequences(), expected_sequences(10));
    Ok(())
}

#[test]
fn threaded_mode_caps_queue_depth_under_a_slow_sink() -> Result<()> {
    let cfg = RelayConfig {
        queue_depth: 3,
        ..config(DispatchMode::Threaded)
    };
    let sink = StubSink::new("slow").with_send_delay(Duration::from_millis(250));
    let (mut relay, sink) = relay_with(&cfg, StubConfig::default(), sink)?;
    relay.start()?;

    for _ in 0..20 {
        assert_eq!(capture_one(&mut relay)?, Step::Dispatched);
        assert!(relay.queue_len().unwrap_or(0) <= 3);
    }
    let queued = relay.queue_len().unwrap_or(0) as i64;
    let before_drain = relay.stats();
    assert_eq!(before_drain.captured, 20);
    // Every captured frame is dropped, queued, delivered, or the single frame
    // the processor is sending right now.
    let in_send = before_drain.captured as i64
        - before_drain.dropped as i64
        - queued
        - before_drain.dispatched as i64;
    assert!((0..=1).contains(&in_send), "in send: {}", in_send);
    assert!(before_drain.dropped >= 20 - 3 - 2);

    let stats = relay.shutdown()?;
    assert_eq!(stats.dispatched + stats.dropped, stats.captured);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(sink.lifetime_violations(), 0);

    let sent: Vec<u64> = sink.sequences().into_iter().flatten().collect();
    assert_eq!(sent.len() as u64, stats.dispatched);
    assert!(sent.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[test]
fn threaded_mode_keeps_a_buffer_with_the_driver_on_a_small_grant() -> Result<()> {
    let cfg = RelayConfig {
        buffers: 4,
        queue_depth: 3,
        ready_timeout: Duration::from_millis(300),
        ..config(DispatchMode::Threaded)
    };
    let sink = StubSink::new("slow").with_send_delay(Duration::from_millis(500));
    let (mut relay, sink) = relay_with(&cfg, StubConfig::default(), sink)?;
    relay.start()?;

    for _ in 0..12 {
        assert_eq!(capture_one(&mut relay)?, Step::Dispatched);
        assert!(relay.queue_len().unwrap_or(0) <= 1);
    }
    let before_drain = relay.stats();
    assert_eq!(before_drain.captured, 12);
    assert!(before_drain.dropped >= 12 - 1 - 2);

    let stats = relay.shutdown()?;
    assert_eq!(stats.dispatched + stats.dropped, stats.captured);
    assert_eq!(sink.lifetime_violations(), 0);
    Ok(())
}

#[test]
fn threaded_mode_refuses_too_few_buffers() -> Result<()> {
    let cfg = RelayConfig {
        buffers: 3,
        ..config(DispatchMode::Threaded)
    };
    let err = match relay_with(&cfg, StubConfig::default(), StubSink::new("small")) {
        Ok(_) => panic!("threaded relay opened on three buffers"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<CaptureError>(),
        Some(CaptureError::InsufficientBuffers { granted: 3, .. })
    ));
    Ok(())
}

#[test]
fn threaded_mode_with_unbounded_queue_delivers_everything() -> Result<()> {
    let cfg = RelayConfig {
        queue_depth: 0,
        frame_limit: Some(30),
        ..config(DispatchMode::Threaded)
    };
    let (relay, sink) = relay_with(&cfg, StubConfig::default(), StubSink::new("fast"))?;

    let stats = relay.run()?;

    assert_eq!(stats.dispatched, 30);
    assert_eq!(stats.dropped, 0);
    assert_eq!(sink.sequences(), expected_sequences(30));
    assert_eq!(sink.lifetime_violations(), 0);
    Ok(())
}

#[test]
fn no_receiver_returns_every_buffer_in_every_mode() -> Result<()> {
    for mode in [DispatchMode::Sync, DispatchMode::Async, DispatchMode::Threaded] {
        let (mut relay, sink) = relay_with(
            &config(mode),
            StubConfig::default(),
            StubSink::new("nobody").with_receivers(false),
        )?;
        relay.start()?;

        for _ in 0..12 {
            assert_eq!(capture_one(&mut relay)?, Step::NoReceiver);
        }
        let pool = &relay.context().pool;
        assert_eq!(pool.driver_owned(), pool.len(), "{:?}", mode);
        assert_eq!(sink.submission_count(), 0);

        let stats = relay.shutdown()?;
        assert_eq!(stats.skipped_no_receiver, 12);
        assert_eq!(stats.dispatched, 0);
    }
    Ok(())
}

#[test]
fn async_mode_alternates_two_owned_copies() -> Result<()> {
    let cfg = RelayConfig {
        frame_limit: Some(10),
        ..config(DispatchMode::Async)
    };
    let (relay, sink) = relay_with(&cfg, StubConfig::default(), StubSink::new("async"))?;

    let stats = relay.run()?;
    assert_eq!(stats.dispatched, 10);

    let submissions = sink.submissions();
    let a = submissions[0].data_addr;
    let b = submissions[1].data_addr;
    assert_ne!(a, b);
    for (i, submission) in submissions.iter().enumerate() {
        assert_eq!(submission.data_addr, if i % 2 == 0 { a } else { b });
    }
    assert_eq!(sink.sequences(), expected_sequences(10));
    assert_eq!(sink.lifetime_violations(), 0);
    Ok(())
}

#[test]
fn fatal_dequeue_error_ends_the_relay() -> Result<()> {
    let stub = StubConfig {
        fail_after: Some(3),
        ..StubConfig::default()
    };
    let (relay, sink) = relay_with(&config(DispatchMode::Sync), stub, StubSink::new("io"))?;

    let err = relay.run().unwrap_err();

    assert!(matches!(
        err.downcast_ref::<CaptureError>(),
        Some(CaptureError::Io { .. })
    ));
    assert_eq!(sink.submission_count(), 3);
    Ok(())
}

#[test]
fn processor_failure_surfaces_on_the_capture_thread() -> Result<()> {
    let cfg = RelayConfig {
        frame_limit: Some(1_000_000),
        ..config(DispatchMode::Threaded)
    };
    let (relay, sink) = relay_with(&cfg, StubConfig::default(), StubSink::new("broken"))?;
    sink.fail_sends(true);

    let err = relay.run().unwrap_err();

    assert!(format!("{:#}", err).contains("processing thread failed"));
    assert_eq!(sink.submission_count(), 0);
    Ok(())
}

/// Reports a taller frame than the buffers hold, so every YUYV conversion
/// fails.
struct TruncatingDevice(StubDevice);

impl CaptureDevice for TruncatingDevice {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat> {
        let mut format = self.0.negotiate(request)?;
        format.resolution = Resolution::new(format.resolution.width, format.resolution.height * 2);
        Ok(format)
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<MappedBuffer>, CaptureError> {
        self.0.request_buffers(count)
    }

    fn queue(&self, index: u32) -> Result<(), CaptureError> {
        self.0.queue(index)
    }

    fn dequeue(&self) -> Result<Dequeued, CaptureError> {
        self.0.dequeue()
    }

    fn stream_on(&self) -> Result<(), CaptureError> {
        self.0.stream_on()
    }

    fn stream_off(&self) -> Result<(), CaptureError> {
        self.0.stream_off()
    }

    fn wait_ready(&self, timeout: Duration) -> Result<bool, CaptureError> {
        self.0.wait_ready(timeout)
    }

    fn unmap(&mut self, buffers: Vec<MappedBuffer>) -> Result<(), CaptureError> {
        self.0.unmap(buffers)
    }
}

#[test]
fn conversion_failures_drop_frames_but_keep_running() -> Result<()> {
    for mode in [DispatchMode::Sync, DispatchMode::Async, DispatchMode::Threaded] {
        let cfg = RelayConfig {
            format: CaptureFormat::Yuyv,
            frame_limit: Some(6),
            ..config(mode)
        };
        let sink = Arc::new(StubSink::new("convert"));
        let device = Box::new(TruncatingDevice(StubDevice::new(
            "stub://short",
            StubConfig::default(),
        )));
        let relay = Relay::with_parts(&cfg, device, sink.clone())?;

        let stats = relay.run()?;

        assert_eq!(stats.captured, 6, "{:?}", mode);
        assert_eq!(stats.dispatched, 0);
        assert_eq!(sink.submission_count(), 0);
        assert!(stats.last_error.is_some());
        // Threaded mode may evict some frames before they reach conversion.
        assert_eq!(stats.conversion_failures + stats.dropped, 6);
    }
    Ok(())
}
