use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::storage::ArchiveScope;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CORS allowed origins
    pub cors_origins: Option<String>,

    /// Directory under which `session-{id}` trees are materialized
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    /// Inactivity cooldown before the sweep may evict a session (ms)
    #[serde(default = "default_idle_cooldown_ms")]
    pub idle_cooldown_ms: u64,

    /// Delay between last disconnect and cleanup eligibility (ms)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Interval of the periodic idle sweep (ms)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Quiet window for auto-commit debouncing (ms)
    #[serde(default = "default_autocommit_debounce_ms")]
    pub autocommit_debounce_ms: u64,

    /// Remote blob store endpoint. Absent means local-only mode.
    pub storage_endpoint: Option<String>,

    /// Bearer token for the blob store
    pub storage_token: Option<String>,

    /// Archive addressing scheme: "session" or "repo"
    #[serde(default = "default_storage_scope")]
    pub storage_scope: String,
    pub storage_owner: Option<String>,
    pub storage_repo: Option<String>,
    pub storage_branch: Option<String>,

    /// Timeout for blob store requests (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the archive addressing scheme for this deployment.
    ///
    /// "repo" requires owner/repo/branch; anything incomplete falls back to
    /// session-keyed addressing with a warning.
    pub fn archive_scope(&self) -> ArchiveScope {
        if self.storage_scope.eq_ignore_ascii_case("repo") {
            match (&self.storage_owner, &self.storage_repo, &self.storage_branch) {
                (Some(owner), Some(repo), Some(branch)) => {
                    return ArchiveScope::Repo {
                        owner: owner.clone(),
                        repo: repo.clone(),
                        branch: branch.clone(),
                    }
                }
                _ => {
                    tracing::warn!(
                        "storage_scope=repo but owner/repo/branch incomplete, using session scope"
                    );
                }
            }
        }
        ArchiveScope::Session
    }

    pub fn idle_cooldown(&self) -> Duration {
        Duration::from_millis(self.idle_cooldown_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn autocommit_debounce(&self) -> Duration {
        Duration::from_millis(self.autocommit_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            workspace_root: default_workspace_root(),
            idle_cooldown_ms: default_idle_cooldown_ms(),
            grace_period_ms: default_grace_period_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            autocommit_debounce_ms: default_autocommit_debounce_ms(),
            storage_endpoint: None,
            storage_token: None,
            storage_scope: default_storage_scope(),
            storage_owner: None,
            storage_repo: None,
            storage_branch: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workspace_root() -> String {
    "./data".to_string()
}

fn default_idle_cooldown_ms() -> u64 {
    300_000
}

fn default_grace_period_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_autocommit_debounce_ms() -> u64 {
    2_000
}

fn default_storage_scope() -> String {
    "session".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
