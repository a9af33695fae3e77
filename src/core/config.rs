use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use crate::core::error::Result;

/// Gate for the ad-hoc submission surfaces (inline queries, XUpdate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureEnabled {
    Enabled,
    Disabled,
    AuthenticatedUsersOnly,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_encoding: String,
    pub safe_mode: bool,
    pub xquery_submission: FeatureEnabled,
    pub xupdate_submission: FeatureEnabled,
    pub allow_source: Vec<String>,              // paths whose query source may be shown

    pub lock_timeout_ms: Option<u64>,           // None blocks until granted

    pub query_pool_max_sources: usize,          // distinct fingerprints kept
    pub query_pool_max_per_source: usize,       // idle instances per fingerprint

    pub session_timeout_ms: u64,
    pub session_check_period_ms: u64,
    pub session_initial_slots: usize,

    pub watchdog_max_steps: Option<u64>,
    pub watchdog_timeout_ms: Option<u64>,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_encoding: "UTF-8".to_string(),
            safe_mode: false,
            xquery_submission: FeatureEnabled::Enabled,
            xupdate_submission: FeatureEnabled::Enabled,
            allow_source: Vec::new(),

            lock_timeout_ms: Some(30_000),

            query_pool_max_sources: 128,
            query_pool_max_per_source: 5,

            session_timeout_ms: 120_000,               // 2 minutes
            session_check_period_ms: 2_000,
            session_initial_slots: 10,

            watchdog_max_steps: None,
            watchdog_timeout_ms: None,

            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn session_check_period(&self) -> Duration {
        Duration::from_millis(self.session_check_period_ms)
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.watchdog_timeout_ms.map(Duration::from_millis)
    }

    pub fn allows_source(&self, path: &str) -> bool {
        self.allow_source.iter().any(|allowed| allowed == path)
    }
}
