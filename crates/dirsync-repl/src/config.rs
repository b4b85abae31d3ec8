//! Replication configuration file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::checkpoint::CheckpointKey;
use crate::dn::Dn;
use crate::engine::EngineConfig;
use crate::error::{ReplError, Result};
use crate::query::Query;

/// Connection parameters for one directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// `ldap://` or `ldaps://` URL.
    pub url: String,
    /// Bind DN; empty for anonymous.
    #[serde(default)]
    pub bind_dn: String,
    /// Bind password.
    #[serde(default)]
    pub bind_password: String,
}

/// A remote source and its replication queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// `ldap://` or `ldaps://` URL.
    pub url: String,
    /// Bind DN; empty for anonymous.
    #[serde(default)]
    pub bind_dn: String,
    /// Bind password.
    #[serde(default)]
    pub bind_password: String,
    /// Path fragments, `/<base-dn>??<scope>?<filter>`.
    pub queries: Vec<String>,
}

impl RemoteConfig {
    /// Compile every query fragment.
    pub fn compile_queries(&self) -> Result<Vec<Query>> {
        self.queries
            .iter()
            .map(|fragment| Query::compile(&self.url, fragment))
            .collect()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// The directory replicated into.
    pub local: DirectoryConfig,
    /// Directories replicated from.
    pub remotes: Vec<RemoteConfig>,
    /// Poll timer period.
    pub poll_interval_ms: u64,
    /// Change numbers requested per poll.
    pub page_size: u64,
    /// Container for checkpoint entries in the local directory.
    pub checkpoint_base_dn: String,
    /// What checkpoint DNs are derived from.
    pub checkpoint_key: CheckpointKey,
    /// Changelog container on the remotes.
    pub changelog_base_dn: String,
    /// Delay between attempts to apply a failing record.
    pub retry_delay_ms: u64,
    /// Dead-letter a record after this many failed attempts; unbounded when
    /// unset.
    pub max_apply_retries: Option<u32>,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            local: DirectoryConfig::default(),
            remotes: Vec::new(),
            poll_interval_ms: 1000,
            page_size: 500,
            checkpoint_base_dn: "o=replcheckpoints".to_string(),
            checkpoint_key: CheckpointKey::Url,
            changelog_base_dn: "cn=changelog".to_string(),
            retry_delay_ms: 1000,
            max_apply_retries: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ReplConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_err = |msg: String| ReplError::Config {
            msg: format!("{}: {}", path.display(), msg),
        };
        let contents = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| config_err(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| config_err(e.to_string())),
            _ => Err(config_err(format!("unsupported config file extension '{}'", ext))),
        }
    }

    /// Check everything that can be checked without connecting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ReplError::Config { msg });
        if self.local.url.trim().is_empty() {
            return invalid("local.url is required".to_string());
        }
        if self.remotes.is_empty() {
            return invalid("at least one remote is required".to_string());
        }
        if self.page_size == 0 {
            return invalid("page_size must be positive".to_string());
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive".to_string());
        }
        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            return invalid("backoff.max_delay_ms is below backoff.initial_delay_ms".to_string());
        }
        for remote in &self.remotes {
            if remote.url.trim().is_empty() {
                return invalid("remote url is required".to_string());
            }
            if remote.queries.is_empty() {
                return invalid(format!("remote {} has no queries", remote.url));
            }
            remote.compile_queries()?;
        }
        self.engine_config().map(|_| ())
    }

    /// Engine settings derived from this file.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let dn = |field: &str, value: &str| {
            Dn::parse(value).map_err(|e| ReplError::Config {
                msg: format!("{}: {}", field, e),
            })
        };
        Ok(EngineConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            page_size: self.page_size,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_apply_retries: self.max_apply_retries,
            backoff: self.backoff.clone(),
            checkpoint_base_dn: dn("checkpoint_base_dn", &self.checkpoint_base_dn)?,
            checkpoint_key: self.checkpoint_key,
            changelog_base_dn: dn("changelog_base_dn", &self.changelog_base_dn)?,
        })
    }
}
