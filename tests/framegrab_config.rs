use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use framegrab::config::CaptureConfig;
use framegrab::{PixelEncoding, TimeoutPolicy};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FRAMEGRAB_CONFIG",
        "FRAMEGRAB_DEVICE",
        "FRAMEGRAB_WIDTH",
        "FRAMEGRAB_HEIGHT",
        "FRAMEGRAB_PIXEL_FORMAT",
        "FRAMEGRAB_BUFFERS",
        "FRAMEGRAB_TIMEOUT_MS",
        "FRAMEGRAB_MAX_TIMEOUTS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let toml = r#"
        [device]
        path = "/dev/video2"
        width = 1280
        height = 720
        pixel_format = "mjpeg"

        [stream]
        buffers = 4
        timeout_ms = 500
        max_timeouts = 1
        frames = 100
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("FRAMEGRAB_CONFIG", file.path());
    std::env::set_var("FRAMEGRAB_DEVICE", "stub://override");
    std::env::set_var("FRAMEGRAB_BUFFERS", "6");
    std::env::set_var("FRAMEGRAB_MAX_TIMEOUTS", "0");

    let cfg = CaptureConfig::load().expect("load config");
    cfg.validate().expect("valid config");

    assert_eq!(cfg.device, "stub://override");
    assert_eq!(cfg.format.width, 1280);
    assert_eq!(cfg.format.height, 720);
    assert_eq!(cfg.format.encoding, PixelEncoding::Mjpeg);
    assert_eq!(cfg.buffers, 6);
    assert_eq!(cfg.timeout, Duration::from_millis(500));
    assert_eq!(cfg.policy, TimeoutPolicy::Fail);
    assert_eq!(cfg.frames, Some(100));

    clear_env();
}

#[test]
fn defaults_apply_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureConfig::load().expect("load config");
    assert_eq!(cfg, CaptureConfig::default());
    let options = cfg.loop_options();
    assert_eq!(options.timeout, Duration::from_secs(2));
    assert_eq!(options.frame_limit, None);
}

#[test]
fn single_buffer_from_env_fails_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FRAMEGRAB_BUFFERS", "1");
    let cfg = CaptureConfig::load().expect("load config");
    let err = cfg.validate().expect_err("one buffer must be rejected");
    assert!(err.to_string().contains("at least 2 buffers"));

    clear_env();
}

#[test]
fn malformed_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FRAMEGRAB_TIMEOUT_MS", "soon");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("FRAMEGRAB_PIXEL_FORMAT", "not-a-format");
    assert!(CaptureConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FRAMEGRAB_CONFIG", "/nonexistent/framegrab.toml");
    let err = CaptureConfig::load().expect_err("missing file");
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
