use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from counterwatch.toml.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct MonitorConfig {
    pub monitor: LoopConfig,
    pub liveness: LivenessConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub poll_interval_ms: u64,
    pub skew_threshold_secs: f64,
    pub from_start: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Consecutive inconclusive probes tolerated before the monitor gives up.
    pub max_uncertain_checks: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub command: PathBuf,
    /// 0 disables the timeout.
    pub timeout_secs: u64,
}

// --- Default implementations ---

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            skew_threshold_secs: 2.0,
            from_start: false,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            max_uncertain_checks: 50,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("./show_metrics.sh"),
            timeout_secs: 60,
        }
    }
}

impl LoopConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Resolve the snapshot command against the anchor directory.
    /// Absolute paths are returned unchanged.
    pub fn resolve_command(&self, anchor: &Path) -> PathBuf {
        if self.command.is_absolute() {
            self.command.clone()
        } else {
            anchor.join(&self.command)
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub poll_interval_ms: Option<u64>,
    pub skew_threshold_secs: Option<f64>,
    pub from_start: bool,
    pub snapshot_command: Option<PathBuf>,
    pub snapshot_timeout_secs: Option<u64>,
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl MonitorConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply CLI overrides on top of file values.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(ms) = overrides.poll_interval_ms {
            self.monitor.poll_interval_ms = ms;
        }
        if let Some(secs) = overrides.skew_threshold_secs {
            self.monitor.skew_threshold_secs = secs;
        }
        if overrides.from_start {
            self.monitor.from_start = true;
        }
        if let Some(cmd) = overrides.snapshot_command {
            self.snapshot.command = cmd;
        }
        if let Some(secs) = overrides.snapshot_timeout_secs {
            self.snapshot.timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        let skew = self.monitor.skew_threshold_secs;
        if !skew.is_finite() || skew < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "monitor.skew_threshold_secs must be a non-negative number, got {skew}"
            )));
        }
        if self.snapshot.command.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "snapshot.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
