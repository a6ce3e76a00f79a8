use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::StreamError;
use crate::frame::BoundaryMode;

pub const DEFAULT_CMD: &str = "ffmpeg";
pub const DEFAULT_RATE: u32 = 10;
pub const DEFAULT_QUALITY: u32 = 3;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;

/// What to do when the decoder writes to stderr.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrPolicy {
    /// Any stderr output stops the stream and is reported as an error.
    #[default]
    Fatal,
    /// Stderr output is logged and the stream keeps running.
    Log,
}

impl std::str::FromStr for StderrPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(StderrPolicy::Fatal),
            "log" => Ok(StderrPolicy::Log),
            other => Err(format!(
                "unknown stderr policy '{}'; expected fatal or log",
                other
            )),
        }
    }
}

/// Raw stream options, as they arrive from a config file, the environment or
/// the command line. Resolved into a `StreamConfig` with `resolve`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Stream URI, e.g. `rtsp://camera.local:554/stream`.
    pub input: Option<String>,
    /// Frame rate. 0 means default.
    pub rate: Option<u32>,
    /// Output size as `WxH`.
    pub resolution: Option<String>,
    /// JPEG quality (`-q:v`, 1-31 typical). 0 means default.
    pub quality: Option<u32>,
    /// Extra decoder flags, inserted as output options.
    pub arguments: Option<Vec<String>>,
    /// Decoder executable.
    pub cmd: Option<String>,
    pub restart_delay_ms: Option<u64>,
    pub boundary: Option<BoundaryMode>,
    pub stderr_policy: Option<StderrPolicy>,
}

impl StreamOptions {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: Some(input.into()),
            ..Self::default()
        }
    }

    /// Load options from the file named by `RELAY_CONFIG` (if set), then apply
    /// `RELAY_*` environment overrides.
    pub fn load() -> Result<Self> {
        let mut options = match std::env::var("RELAY_CONFIG").ok() {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        options.apply_env()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
        let options = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
        Ok(options)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(input) = non_empty_env("RELAY_INPUT") {
            self.input = Some(input);
        }
        if let Some(rate) = non_empty_env("RELAY_RATE") {
            let rate = rate
                .parse()
                .map_err(|_| anyhow!("RELAY_RATE must be a non-negative integer"))?;
            self.rate = Some(rate);
        }
        if let Some(resolution) = non_empty_env("RELAY_RESOLUTION") {
            self.resolution = Some(resolution);
        }
        if let Some(quality) = non_empty_env("RELAY_QUALITY") {
            let quality = quality
                .parse()
                .map_err(|_| anyhow!("RELAY_QUALITY must be a non-negative integer"))?;
            self.quality = Some(quality);
        }
        if let Some(cmd) = non_empty_env("RELAY_FFMPEG_CMD") {
            self.cmd = Some(cmd);
        }
        if let Some(policy) = non_empty_env("RELAY_STDERR_POLICY") {
            self.stderr_policy = Some(policy.parse().map_err(|e: String| anyhow!(e))?);
        }
        Ok(())
    }

    /// Validate and apply defaults.
    pub fn resolve(self) -> std::result::Result<StreamConfig, StreamError> {
        let input = self
            .input
            .map(|input| input.trim().to_string())
            .filter(|input| !input.is_empty())
            .ok_or(StreamError::MissingInput)?;

        let resolution = match self.resolution {
            Some(resolution) if !resolution.trim().is_empty() => {
                let resolution = resolution.trim().to_string();
                validate_resolution(&resolution)?;
                Some(resolution)
            }
            _ => None,
        };

        let cmd = self
            .cmd
            .filter(|cmd| !cmd.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CMD.to_string());

        Ok(StreamConfig {
            input,
            rate: self.rate.filter(|rate| *rate > 0).unwrap_or(DEFAULT_RATE),
            resolution,
            quality: self
                .quality
                .filter(|quality| *quality > 0)
                .unwrap_or(DEFAULT_QUALITY),
            arguments: self.arguments.unwrap_or_default(),
            cmd,
            restart_delay: Duration::from_millis(
                self.restart_delay_ms.unwrap_or(DEFAULT_RESTART_DELAY_MS),
            ),
            boundary: self.boundary.unwrap_or_default(),
            stderr_policy: self.stderr_policy.unwrap_or_default(),
        })
    }
}

/// Immutable stream configuration. Built only through `StreamOptions::resolve`
/// or `StreamConfig::new`, so every instance has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    input: String,
    rate: u32,
    resolution: Option<String>,
    quality: u32,
    arguments: Vec<String>,
    cmd: String,
    restart_delay: Duration,
    boundary: BoundaryMode,
    stderr_policy: StderrPolicy,
}

impl StreamConfig {
    /// Configuration with every default applied.
    pub fn new(input: impl Into<String>) -> std::result::Result<Self, StreamError> {
        StreamOptions::new(input).resolve()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn resolution(&self) -> Option<&str> {
        self.resolution.as_deref()
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn boundary(&self) -> BoundaryMode {
        self.boundary
    }

    pub fn stderr_policy(&self) -> StderrPolicy {
        self.stderr_policy
    }
}

fn validate_resolution(resolution: &str) -> std::result::Result<(), StreamError> {
    let invalid = || {
        StreamError::InvalidConfig(format!(
            "resolution '{}' must be WxH with positive integers",
            resolution
        ))
    };
    let (width, height) = resolution.split_once(['x', 'X']).ok_or_else(invalid)?;
    let width: u32 = width.parse().map_err(|_| invalid())?;
    let height: u32 = height.parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_fails_construction() {
        let err = StreamOptions::default().resolve().unwrap_err();
        assert!(matches!(err, StreamError::MissingInput));
        let err = StreamConfig::new("   ").unwrap_err();
        assert!(matches!(err, StreamError::MissingInput));
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = StreamConfig::new("rtsp://camera/stream").unwrap();
        assert_eq!(cfg.input(), "rtsp://camera/stream");
        assert_eq!(cfg.rate(), DEFAULT_RATE);
        assert_eq!(cfg.quality(), DEFAULT_QUALITY);
        assert_eq!(cfg.resolution(), None);
        assert!(cfg.arguments().is_empty());
        assert_eq!(cfg.cmd(), "ffmpeg");
        assert_eq!(cfg.restart_delay(), Duration::from_secs(1));
        assert_eq!(cfg.boundary(), BoundaryMode::Scan);
        assert_eq!(cfg.stderr_policy(), StderrPolicy::Fatal);
    }

    #[test]
    fn zero_quality_and_rate_mean_default() {
        let cfg = StreamOptions {
            rate: Some(0),
            quality: Some(0),
            ..StreamOptions::new("rtsp://camera/stream")
        }
        .resolve()
        .unwrap();
        assert_eq!(cfg.rate(), 10);
        assert_eq!(cfg.quality(), 3);
    }

    #[test]
    fn resolution_must_be_width_by_height() {
        for bad in ["640", "640x", "x480", "0x480", "wide x tall"] {
            let err = StreamOptions {
                resolution: Some(bad.to_string()),
                ..StreamOptions::new("rtsp://camera/stream")
            }
            .resolve()
            .unwrap_err();
            assert!(matches!(err, StreamError::InvalidConfig(_)), "{}", bad);
        }
        let cfg = StreamOptions {
            resolution: Some("1280x720".to_string()),
            ..StreamOptions::new("rtsp://camera/stream")
        }
        .resolve()
        .unwrap();
        assert_eq!(cfg.resolution(), Some("1280x720"));
    }

    #[test]
    fn options_deserialize_from_json() {
        let options: StreamOptions = serde_json::from_str(
            r#"{
                "input": "rtsp://camera/stream",
                "rate": 5,
                "arguments": ["-vf", "eq=gamma=1.8"],
                "boundary": "chunk_tail",
                "stderr_policy": "log"
            }"#,
        )
        .unwrap();
        let cfg = options.resolve().unwrap();
        assert_eq!(cfg.rate(), 5);
        assert_eq!(cfg.arguments(), ["-vf", "eq=gamma=1.8"]);
        assert_eq!(cfg.boundary(), BoundaryMode::ChunkTail);
        assert_eq!(cfg.stderr_policy(), StderrPolicy::Log);
    }
}
