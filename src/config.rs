use crate::application::retry::RetryPolicy;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine settings. Every field has a default, so a partial JSON file works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a granted lock stays valid without its owner completing.
    pub lease_ms: u64,
    /// How long a lock request may wait before it is rejected.
    pub lock_wait_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub recovery_interval_ms: u64,
    /// Size of the runtime worker pool.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            lock_wait_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
            recovery_interval_ms: 5_000,
            workers: 4,
        }
    }
}

impl EngineConfig {
    /// Loads settings from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lease(), Duration::from_secs(30));
        assert_eq!(config.lock_wait_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"lease_ms": 500, "retry": {{"max_attempts": 2}}}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lease(), Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 50);
        assert_eq!(config.recovery_interval_ms, 5_000);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "lease_ms = 5").unwrap();
        assert!(EngineConfig::from_file(file.path()).is_err());
    }
}
