use crate::phase::PhaseThresholds;
use crate::retry::RetryPolicy;
use anyhow::{bail, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "mission-relay.toml";
pub const RC_FILE: &str = ".mission-relay-rc";
pub const ENV_PREFIX: &str = "MISSION_RELAY";

/// Main configuration structure for Mission Relay
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MissionRelayConfig {
    /// Where the shared documents live
    pub mission: MissionConfig,
    /// Lease timing
    pub locks: LockConfig,
    /// Backoff used while waiting on contended leases
    pub retry: RetryConfig,
    /// Content cache settings
    pub cache: CacheConfig,
    /// Notification bus settings
    pub notifications: NotificationConfig,
    /// Collaborative phase budget
    pub phase: PhaseConfig,
    /// Edit pipeline settings
    pub editor: EditorConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Directory holding the mission documents
    pub root: PathBuf,
    /// Lease directory, relative to `root` unless absolute
    pub lock_dir: PathBuf,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            lock_dir: PathBuf::from(".mission-relay/locks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease lifetime before the lock counts as abandoned
    pub timeout_seconds: u64,
    /// Longest an editor waits for a contended lock
    pub max_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_wait_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 25,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Window in which a cached copy is served without a stat; 0 disables it
    pub ttl_ms: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 2_000,
            max_entries: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Changes to one document inside this window collapse into one event
    pub coalesce_window_ms: u64,
    /// Pending events per consumer before the oldest are shed
    pub queue_cap: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 750,
            queue_cap: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Token budget for the whole mission
    pub capacity: u64,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub recompute_interval_seconds: u64,
    pub bytes_per_token: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            capacity: 200_000,
            upper_threshold: 0.6,
            lower_threshold: 0.5,
            recompute_interval_seconds: 5,
            bytes_per_token: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Attempts for a failing document write before the edit is rejected
    pub io_retry_attempts: u32,
    /// Longest before/after excerpt carried in change events
    pub excerpt_chars: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            io_retry_attempts: 3,
            excerpt_chars: 160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level, overridden by RUST_LOG
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl MissionRelayConfig {
    /// Load configuration from the current directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration files in `dir` (mission-relay.toml, .mission-relay-rc)
    /// 3. Environment variables (MISSION_RELAY__SECTION__KEY)
    pub fn load_from(dir: &Path) -> Result<Self> {
        Self::build(dir, Environment::with_prefix(ENV_PREFIX))
    }

    fn build(dir: &Path, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let toml_path = dir.join(CONFIG_FILE);
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path).format(FileFormat::Toml));
        }

        let rc_path = dir.join(RC_FILE);
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            environment
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: MissionRelayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let upper = self.phase.upper_threshold;
        let lower = self.phase.lower_threshold;
        if !(upper > 0.0 && upper <= 1.0) || !(lower > 0.0 && lower <= 1.0) {
            bail!("phase thresholds must lie in (0, 1], got upper={upper} lower={lower}");
        }
        if lower >= upper {
            bail!("phase.lower_threshold ({lower}) must be below phase.upper_threshold ({upper})");
        }
        if self.phase.capacity == 0 {
            bail!("phase.capacity must be positive");
        }
        if self.phase.bytes_per_token == 0 {
            bail!("phase.bytes_per_token must be positive");
        }
        if self.notifications.queue_cap == 0 {
            bail!("notifications.queue_cap must be positive");
        }
        if self.locks.timeout_seconds == 0 {
            bail!("locks.timeout_seconds must be positive");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be at least 1.0, got {}", self.retry.multiplier);
        }
        Ok(())
    }

    /// Lease directory resolved against the mission root.
    pub fn lock_dir(&self) -> PathBuf {
        if self.mission.lock_dir.is_absolute() {
            self.mission.lock_dir.clone()
        } else {
            self.mission.root.join(&self.mission.lock_dir)
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.locks.timeout_seconds)
    }

    pub fn lock_max_wait(&self) -> Duration {
        Duration::from_millis(self.locks.max_wait_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.notifications.coalesce_window_ms)
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.phase.recompute_interval_seconds.max(1))
    }

    /// Backoff for lock contention.
    pub fn lock_retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        );
        if self.retry.jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }

    /// Same backoff shape, bounded by the editor's I/O attempt count.
    pub fn io_retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.editor.io_retry_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        );
        if self.retry.jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }

    pub fn phase_thresholds(&self) -> crate::error::Result<PhaseThresholds> {
        PhaseThresholds::new(self.phase.upper_threshold, self.phase.lower_threshold)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MissionRelayConfig::default();
        assert_eq!(config.locks.timeout_seconds, 30);
        assert_eq!(config.notifications.coalesce_window_ms, 750);
        assert_eq!(config.notifications.queue_cap, 256);
        assert_eq!(config.phase.upper_threshold, 0.6);
        assert_eq!(config.phase.lower_threshold, 0.5);
        assert_eq!(config.lock_dir(), PathBuf::from("./.mission-relay/locks"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[phase]\ncapacity = 5000\nupper_threshold = 0.8\n\n[cache]\nttl_ms = 0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(RC_FILE), "[phase]\ncapacity = 6000\n").unwrap();

        let config = MissionRelayConfig::build(
            dir.path(),
            env(&[("MISSION_RELAY__PHASE__LOWER_THRESHOLD", "0.7")]),
        )
        .unwrap();

        assert_eq!(config.phase.capacity, 6000);
        assert_eq!(config.phase.upper_threshold, 0.8);
        assert_eq!(config.phase.lower_threshold, 0.7);
        assert_eq!(config.cache_ttl(), Duration::ZERO);
        assert_eq!(config.locks.max_wait_ms, 10_000);
    }

    #[test]
    fn test_invalid_band_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = MissionRelayConfig::build(
            dir.path(),
            env(&[("MISSION_RELAY__PHASE__LOWER_THRESHOLD", "0.9")]),
        );
        assert!(result.is_err());

        let mut config = MissionRelayConfig::default();
        config.notifications.queue_cap = 0;
        assert!(config.validate().is_err());
        config = MissionRelayConfig::default();
        config.phase.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_to_file_round_trips_through_loader() {
        let dir = TempDir::new().unwrap();
        let mut config = MissionRelayConfig::default();
        config.editor.excerpt_chars = 40;
        config.save_to_file(dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = MissionRelayConfig::build(dir.path(), env(&[])).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_absolute_lock_dir_is_kept() {
        let mut config = MissionRelayConfig::default();
        config.mission.root = PathBuf::from("/missions/alpha");
        assert_eq!(config.lock_dir(), PathBuf::from("/missions/alpha/.mission-relay/locks"));
        config.mission.lock_dir = PathBuf::from("/var/locks");
        assert_eq!(config.lock_dir(), PathBuf::from("/var/locks"));
    }
}
