//! Engine configuration.
//!
//! Loaded once at process start (usually from TOML) and shared read-only by
//! the dispatcher, connection manager and driver registry. Every field has a
//! default so an empty document is a valid configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{BackupError, Result};
use crate::session::SecurityLevel;

/// Default number of devices captured simultaneously.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Upper bound on simultaneous device connections per job run.
pub const MAX_CONCURRENCY: usize = 20;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size for one job run.
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    /// SSH algorithm policy for new connections.
    pub security_level: SecurityLevel,
    /// Verify host keys against the user's known_hosts file.
    pub check_host_keys: bool,
    /// Capacity of the dispatcher event channel.
    pub event_channel_capacity: usize,
    /// Maximum number of diffs kept in the read cache.
    pub diff_cache_capacity: u64,
    /// Per-vendor command and sanitization overrides, keyed by vendor tag.
    pub vendors: BTreeMap<String, VendorOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            security_level: SecurityLevel::Balanced,
            check_host_keys: false,
            event_channel_capacity: 256,
            diff_cache_capacity: 512,
            vendors: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(input)
            .map_err(|e| BackupError::InvalidConfig(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BackupError::InvalidConfig(format!("read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BackupError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(BackupError::InvalidConfig(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        self.timeouts.validate()?;
        if let RetryBackoff::Exponential { base_ms, max_ms } = self.retry.backoff
            && max_ms < base_ms
        {
            return Err(BackupError::InvalidConfig(
                "exponential backoff max_ms is below base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective worker count, clamped to `1..=MAX_CONCURRENCY`.
    pub fn effective_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.concurrency)
            .clamp(1, MAX_CONCURRENCY)
    }

    /// JSON schema of the configuration document, for admin tooling.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(EngineConfig);
        serde_json::to_string_pretty(&schema)
            .map_err(|e| BackupError::InvalidConfig(format!("encode schema: {e}")))
    }
}

/// Retry budget applied to transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: RetryBackoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: RetryBackoff::Fixed { delay_ms: 5_000 },
        }
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(retry - 1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl RetryBackoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            RetryBackoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryBackoff::Exponential { base_ms, max_ms } => {
                let shift = retry.saturating_sub(1).min(31);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Independent timeouts; exceeding any of them aborts the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect plus transport handshake.
    pub connect_secs: u64,
    /// Authentication and first prompt.
    pub auth_secs: u64,
    /// One command round-trip.
    pub command_secs: u64,
    /// Whole attempt: connect, setup, capture.
    pub session_secs: u64,
    /// Snapshot persistence.
    pub storage_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 15,
            auth_secs: 20,
            command_secs: 30,
            session_secs: 300,
            storage_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("connect_secs", self.connect_secs),
            ("auth_secs", self.auth_secs),
            ("command_secs", self.command_secs),
            ("session_secs", self.session_secs),
            ("storage_secs", self.storage_secs),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(BackupError::InvalidConfig(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }

    pub fn storage(&self) -> Duration {
        Duration::from_secs(self.storage_secs)
    }
}

/// Operator overrides for one vendor profile.
///
/// Empty lists keep the built-in table; non-empty lists replace it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VendorOverride {
    pub setup_commands: Vec<String>,
    pub capture_commands: Vec<String>,
    pub info_commands: BTreeMap<String, String>,
    /// Extra show commands, each captured as its own section.
    pub additional_commands: Vec<String>,
    /// Extra regexes; matching lines are dropped before hashing.
    pub drop_line_patterns: Vec<String>,
}
