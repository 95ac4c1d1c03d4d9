//! Sync engine settings and configuration types.
//!
//! Settings are persisted to `~/.config/mailmirror/settings.json` (or the
//! platform equivalent) and loaded at startup. Missing fields fall back to
//! their defaults, so older settings files keep loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "mailmirror.db";

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no home directory available for settings")]
    NoConfigDir,
}

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sync pass behaviour.
    pub sync: SyncSettings,
    /// Remote fetch concurrency and retry.
    pub fetch: FetchSettings,
    /// Local store location.
    pub storage: StorageSettings,
    /// Gmail binding.
    pub gmail: GmailSettings,
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Loads settings from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Loads settings from the default location, or defaults if no file exists.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Writes settings to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Sync pass configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Messages fetched and upserted per batch.
    pub batch_size: usize,
    /// A local edit older than this no longer blocks remote label changes.
    pub conflict_staleness_secs: u64,
    /// Failed passes tolerated before failing ids are abandoned.
    pub max_consecutive_failures: u32,
    /// Cap on the persisted failed-id set.
    pub max_tracked_failed_ids: usize,
    /// Backfill window when no install time is known.
    pub initial_fallback_days: i64,
    /// Safety margin subtracted from the install time.
    pub install_buffer_secs: i64,
    /// Recovery window when nothing better is known.
    pub recovery_fallback_days: i64,
    /// Safety margin subtracted from the last successful sync.
    pub recovery_buffer_secs: i64,
    /// Window of the reconciler's direct list query.
    pub reconcile_window_hours: i64,
    /// Upper bound on ids the reconciler lists.
    pub reconcile_max_messages: usize,
    /// Recent local messages whose labels are re-checked.
    pub reconcile_label_check_limit: usize,
    /// Minimum time between reconciler sweeps; 0 runs one every pass.
    pub reconcile_interval_secs: u64,
    /// Commit attempts before a pass fails.
    pub commit_max_attempts: u32,
    /// First commit retry delay, doubled per attempt.
    pub commit_base_delay_ms: u64,
    /// Guard against a history feed that never stops paginating.
    pub history_max_pages: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            conflict_staleness_secs: 30 * 60,
            max_consecutive_failures: 3,
            max_tracked_failed_ids: 500,
            initial_fallback_days: 30,
            install_buffer_secs: 3600,
            recovery_fallback_days: 7,
            recovery_buffer_secs: 3600,
            reconcile_window_hours: 48,
            reconcile_max_messages: 500,
            reconcile_label_check_limit: 100,
            reconcile_interval_secs: 300,
            commit_max_attempts: 3,
            commit_base_delay_ms: 200,
            history_max_pages: 1000,
        }
    }
}

impl SyncSettings {
    /// Staleness window of the conflict policy.
    pub fn conflict_staleness(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.conflict_staleness_secs as i64)
    }
}

/// Remote fetch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Concurrent in-flight fetches.
    pub max_concurrency: usize,
    /// Hard timeout per fetch attempt.
    pub item_timeout_secs: u64,
    /// Attempts per item, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles afterwards.
    pub base_delay_ms: u64,
    /// Ceiling on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            item_timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl FetchSettings {
    /// Per-attempt timeout.
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let database_path = project_dirs()
            .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
            .unwrap_or_else(|| PathBuf::from(DATABASE_FILE));
        Self { database_path }
    }
}

/// Gmail API binding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    /// Base URL of the `users/me` resource.
    pub api_base: String,
    /// Keychain service holding OAuth credentials.
    pub keyring_service: String,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            keyring_service: "com.mailmirror.sync".to_string(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "mailmirror", "mailmirror")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.sync.batch_size, 50);
        assert_eq!(settings.sync.conflict_staleness(), ChronoDuration::minutes(30));
        assert_eq!(settings.sync.max_consecutive_failures, 3);
        assert_eq!(settings.fetch.max_concurrency, 10);
        assert_eq!(settings.fetch.max_attempts, 3);
        assert_eq!(settings.fetch.item_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"sync": {"batch_size": 10}}"#).unwrap();
        assert_eq!(settings.sync.batch_size, 10);
        assert_eq!(settings.sync.recovery_fallback_days, 7);
        assert_eq!(settings.fetch, FetchSettings::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        let mut settings = Settings::default();
        settings.fetch.max_concurrency = 4;
        settings.gmail.keyring_service = "test.service".to_string();
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse(_))));
    }
}
