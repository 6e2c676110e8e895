use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Direct3D API the agent should hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direct3DVersion {
    Unknown,
    #[default]
    AutoDetect,
    Direct3D9,
    Direct3D10,
    Direct3D10_1,
    Direct3D11,
    Direct3D11_1,
}

impl Direct3DVersion {
    pub fn needs_detection(&self) -> bool {
        matches!(self, Direct3DVersion::Unknown | Direct3DVersion::AutoDetect)
    }
}

impl std::fmt::Display for Direct3DVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Direct3DVersion::Unknown => "unknown",
            Direct3DVersion::AutoDetect => "auto",
            Direct3DVersion::Direct3D9 => "Direct3D 9",
            Direct3DVersion::Direct3D10 => "Direct3D 10",
            Direct3DVersion::Direct3D10_1 => "Direct3D 10.1",
            Direct3DVersion::Direct3D11 => "Direct3D 11",
            Direct3DVersion::Direct3D11_1 => "Direct3D 11.1",
        };
        f.write_str(name)
    }
}

/// Settings the controller hands to the agent at handshake and on `RecordingStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub direct3d_version: Direct3DVersion,
    #[serde(default)]
    pub show_overlay: bool,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default)]
    pub output_folder: Option<PathBuf>,
}

fn default_target_fps() -> u32 {
    30
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            direct3d_version: Direct3DVersion::AutoDetect,
            show_overlay: false,
            target_fps: default_target_fps(),
            output_folder: None,
        }
    }
}

/// Agent-side tunables. Durations serialize as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_watchdog_interval", with = "millis")]
    pub watchdog_interval: Duration,
    #[serde(default = "default_detect_poll", with = "millis")]
    pub detect_poll: Duration,
    #[serde(default = "default_detect_timeout", with = "millis")]
    pub detect_timeout: Duration,
    #[serde(default = "default_teardown_grace", with = "millis")]
    pub teardown_grace: Duration,
    #[serde(default = "default_readback_timeout", with = "millis")]
    pub readback_timeout: Duration,
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_detect_poll() -> Duration {
    Duration::from_millis(100)
}

fn default_detect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_teardown_grace() -> Duration {
    Duration::from_millis(100)
}

fn default_readback_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            watchdog_interval: default_watchdog_interval(),
            detect_poll: default_detect_poll(),
            detect_timeout: default_detect_timeout(),
            teardown_grace: default_teardown_grace(),
            readback_timeout: default_readback_timeout(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default = "default_log_retention")]
    pub log_retention_count: usize,
}

fn default_log_retention() -> usize {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            agent: AgentSettings::default(),
            log_retention_count: default_log_retention(),
        }
    }
}

/// Controller-side paths. The file is optional; missing fields fall back to defaults.
pub struct Config {
    config_path: PathBuf,
    pub app_data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Config {
    pub fn new() -> Result<Self> {
        Self::with_root(Self::default_root()?)
    }

    pub fn with_root(app_data_dir: PathBuf) -> Result<Self> {
        let config_path = app_data_dir.join("config.json");
        let log_dir = app_data_dir.join("logs");
        let output_dir = app_data_dir.join("captures");

        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        fs::create_dir_all(&output_dir).context("Failed to create capture directory")?;

        Ok(Self {
            config_path,
            app_data_dir,
            log_dir,
            output_dir,
        })
    }

    fn default_root() -> Result<PathBuf> {
        if let Ok(app_data) = std::env::var("APPDATA") {
            return Ok(PathBuf::from(app_data).join("FrameHook"));
        }
        let home = std::env::var("HOME").context("Neither APPDATA nor HOME is set")?;
        Ok(PathBuf::from(home).join(".framehook"))
    }

    pub fn load(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_path).context("Failed to read config file")?;
        let config: AppConfig = serde_json::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path().to_path_buf()).unwrap();
        let loaded = config.load().unwrap();

        assert_eq!(loaded.log_retention_count, 10);
        assert_eq!(loaded.agent.readback_timeout, Duration::from_secs(2));
        assert!(config.log_dir.exists());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{ "capture": { "direct3d_version": "Direct3D9" }, "agent": { "detect_timeout": 250 } }"#,
        )
        .unwrap();

        let loaded = Config::with_root(dir.path().to_path_buf()).unwrap().load().unwrap();
        assert_eq!(loaded.capture.direct3d_version, Direct3DVersion::Direct3D9);
        assert_eq!(loaded.capture.target_fps, 30);
        assert_eq!(loaded.agent.detect_timeout, Duration::from_millis(250));
        assert_eq!(loaded.agent.watchdog_interval, Duration::from_secs(1));
    }
}
