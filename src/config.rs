//! Layered capture configuration.
//!
//! Defaults, then the TOML file named by `FRAMEGRAB_CONFIG`, then
//! `FRAMEGRAB_*` environment overrides. Command-line flags are applied on top
//! by the binary.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::acquire::{LoopOptions, TimeoutPolicy};
use crate::format::{FormatRequest, PixelEncoding};
use crate::pool::MIN_BUFFERS;

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_BUFFERS: u32 = 2;
const DEFAULT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    device: Option<DeviceConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DeviceConfigFile {
    path: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    buffers: Option<u32>,
    timeout_ms: Option<u64>,
    max_timeouts: Option<u32>,
    frames: Option<u64>,
}

/// Everything needed to run one capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: String,
    pub format: FormatRequest,
    pub buffers: u32,
    pub timeout: Duration,
    pub policy: TimeoutPolicy,
    pub frames: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            format: FormatRequest {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                encoding: PixelEncoding::Yuyv,
            },
            buffers: DEFAULT_BUFFERS,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            policy: TimeoutPolicy::Fail,
            frames: None,
        }
    }
}

impl CaptureConfig {
    /// Defaults, then the file named by `FRAMEGRAB_CONFIG`, then `FRAMEGRAB_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMEGRAB_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with the file path given explicitly.
    ///
    /// Not validated yet: callers layer command-line flags on top and then
    /// call `validate`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let device = file.device.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let encoding = match device.pixel_format {
            Some(name) => parse_encoding(&name)?,
            None => defaults.format.encoding,
        };
        Ok(Self {
            device: device.path.unwrap_or(defaults.device),
            format: FormatRequest {
                width: device.width.unwrap_or(defaults.format.width),
                height: device.height.unwrap_or(defaults.format.height),
                encoding,
            },
            buffers: stream.buffers.unwrap_or(defaults.buffers),
            timeout: stream
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            policy: stream
                .max_timeouts
                .map(TimeoutPolicy::from_max_timeouts)
                .unwrap_or(defaults.policy),
            frames: stream.frames,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FRAMEGRAB_DEVICE") {
            if !path.trim().is_empty() {
                self.device = path;
            }
        }
        if let Some(width) = env_number("FRAMEGRAB_WIDTH")? {
            self.format.width = width;
        }
        if let Some(height) = env_number("FRAMEGRAB_HEIGHT")? {
            self.format.height = height;
        }
        if let Ok(name) = std::env::var("FRAMEGRAB_PIXEL_FORMAT") {
            if !name.trim().is_empty() {
                self.format.encoding = parse_encoding(&name)?;
            }
        }
        if let Some(buffers) = env_number("FRAMEGRAB_BUFFERS")? {
            self.buffers = buffers;
        }
        if let Some(timeout_ms) = env_number::<u64>("FRAMEGRAB_TIMEOUT_MS")? {
            self.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(max_timeouts) = env_number("FRAMEGRAB_MAX_TIMEOUTS")? {
            self.policy = TimeoutPolicy::from_max_timeouts(max_timeouts);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(anyhow!("device path must not be empty"));
        }
        if self.format.width == 0 || self.format.height == 0 {
            return Err(anyhow!(
                "frame size must be non-zero, got {}x{}",
                self.format.width,
                self.format.height
            ));
        }
        if self.buffers < MIN_BUFFERS {
            return Err(anyhow!(
                "at least {} buffers are required, got {}",
                MIN_BUFFERS,
                self.buffers
            ));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            timeout: self.timeout,
            policy: self.policy,
            frame_limit: self.frames,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

pub fn parse_encoding(name: &str) -> Result<PixelEncoding> {
    name.trim()
        .parse::<PixelEncoding>()
        .map_err(|e| anyhow!("unknown pixel format {:?}: {}", name, e))
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_capture_setup() -> Result<()> {
        let cfg = CaptureConfig::from_file(CaptureConfigFile::default())?;
        assert_eq!(cfg, CaptureConfig::default());
        assert_eq!(cfg.device, "/dev/video0");
        assert_eq!(cfg.format.encoding, PixelEncoding::Yuyv);
        assert_eq!(cfg.timeout, Duration::from_secs(2));
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn file_sections_override_defaults() -> Result<()> {
        let file: CaptureConfigFile = toml::from_str(
            r#"
            [device]
            path = "stub://bench"
            pixel_format = "MJPG"

            [stream]
            buffers = 4
            max_timeouts = 3
            frames = 10
            "#,
        )?;
        let cfg = CaptureConfig::from_file(file)?;
        assert_eq!(cfg.device, "stub://bench");
        assert_eq!(cfg.format.width, 640);
        assert_eq!(cfg.format.encoding, PixelEncoding::Mjpeg);
        assert_eq!(cfg.buffers, 4);
        assert_eq!(cfg.policy, TimeoutPolicy::Tolerate { max_consecutive: 3 });
        assert_eq!(cfg.loop_options().frame_limit, Some(10));
        Ok(())
    }

    #[test]
    fn validation_rejects_a_single_buffer() {
        let cfg = CaptureConfig {
            buffers: 1,
            ..CaptureConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<CaptureConfigFile, _> =
            toml::from_str("[device]\nfps = 30\n");
        assert!(parsed.is_err());
    }
}
