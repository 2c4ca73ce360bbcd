use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use v4l2ndi::config::{DispatchMode, Overrides, RelayConfig, SinkKind};
use v4l2ndi::{CaptureFormat, FrameRate};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "V4L2NDI_CONFIG",
        "V4L2NDI_DEVICE",
        "V4L2NDI_STREAM_NAME",
        "V4L2NDI_QUEUE_DEPTH",
        "V4L2NDI_BUFFERS",
        "V4L2NDI_NDI_LIBRARY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": {
            "device": "/dev/video2",
            "width": 1920,
            "height": 1080,
            "format": "yuyv",
            "frame_rate": { "numerator": 60000, "denominator": 1001 },
            "buffers": 6,
            "ready_timeout_ms": 2000
        },
        "output": {
            "stream_name": "Stage Left",
            "sink": "stub",
            "probe_timeout_ms": 500
        },
        "pipeline": {
            "mode": "threaded",
            "queue_depth": 5,
            "stats_interval_secs": 30
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("V4L2NDI_CONFIG", file.path());
    std::env::set_var("V4L2NDI_STREAM_NAME", "Stage Right");
    std::env::set_var("V4L2NDI_QUEUE_DEPTH", "2");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.device, "/dev/video2");
    assert_eq!(cfg.width, Some(1920));
    assert_eq!(cfg.height, Some(1080));
    assert_eq!(cfg.format, CaptureFormat::Yuyv);
    assert_eq!(cfg.frame_rate, FrameRate { numerator: 60_000, denominator: 1_001 });
    assert_eq!(cfg.buffers, 6);
    assert_eq!(cfg.ready_timeout, Duration::from_secs(2));
    assert_eq!(cfg.stream_name, "Stage Right");
    assert_eq!(cfg.sink, SinkKind::Stub);
    assert_eq!(cfg.probe_timeout, Duration::from_millis(500));
    assert_eq!(cfg.mode, DispatchMode::Threaded);
    assert_eq!(cfg.queue_depth, 2);
    assert_eq!(cfg.stats_interval, Duration::from_secs(30));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [capture]
        device = "stub://bench"

        [pipeline]
        mode = "async"
        frame_limit = 120
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = RelayConfig::load_with(&Overrides {
        config_path: Some(file.path().to_path_buf()),
        ..Overrides::default()
    })
    .expect("load config");

    assert_eq!(cfg.device, "stub://bench");
    assert_eq!(cfg.mode, DispatchMode::Async);
    assert_eq!(cfg.frame_limit, Some(120));
    assert_eq!(cfg.stream_name, "Stream");

    clear_env();
}

#[test]
fn command_line_beats_environment() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("V4L2NDI_DEVICE", "/dev/video1");
    std::env::set_var("V4L2NDI_BUFFERS", "4");

    let cfg = RelayConfig::load_with(&Overrides {
        device: Some("/dev/video3".to_string()),
        frame_rate_numerator: Some(25),
        frame_rate_denominator: Some(1),
        ..Overrides::default()
    })
    .expect("load config");

    assert_eq!(cfg.device, "/dev/video3");
    assert_eq!(cfg.buffers, 4);
    assert_eq!(cfg.frame_rate, FrameRate { numerator: 25, denominator: 1 });

    clear_env();
}

#[test]
fn ndi_library_flag_beats_environment() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("V4L2NDI_NDI_LIBRARY", "/usr/lib/libndi.so.5");
    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.ndi_library, Some(PathBuf::from("/usr/lib/libndi.so.5")));

    let cfg = RelayConfig::load_with(&Overrides {
        ndi_library: Some(PathBuf::from("/opt/ndi/libndi.so.6")),
        ..Overrides::default()
    })
    .expect("load config");
    assert_eq!(cfg.ndi_library, Some(PathBuf::from("/opt/ndi/libndi.so.6")));

    clear_env();
}

#[test]
fn rejects_invalid_environment_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("V4L2NDI_QUEUE_DEPTH", "deep");
    let err = RelayConfig::load().unwrap_err();
    assert!(err.to_string().contains("V4L2NDI_QUEUE_DEPTH"));

    clear_env();
}

#[test]
fn rejects_zero_frame_rate_denominator() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = RelayConfig::load_with(&Overrides {
        frame_rate_denominator: Some(0),
        ..Overrides::default()
    })
    .unwrap_err();
    assert!(err.to_string().contains("denominator"));

    clear_env();
}

#[test]
fn rejects_unknown_config_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "capture": { "fps": 30 } }"#)
        .expect("write config");
    std::env::set_var("V4L2NDI_CONFIG", file.path());

    let err = RelayConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
