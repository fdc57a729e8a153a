use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::branch_transfer::{BranchTimeZone, DeliveryConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL; in-memory stores are used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// HS256 secret shared with the platform's auth service
    pub jwt_secret: String,
    /// Branch wall-clock offset from UTC
    #[serde(default = "default_utc_offset")]
    pub branch_utc_offset_hours: i32,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Directory + operational fixture for in-memory mode
    #[serde(default)]
    pub fixtures: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DocumentsConfig {
    pub dir: String,
    pub public_base_url: String,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: "./data/documents".to_string(),
            public_base_url: "http://localhost:8080/files".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Requester notifications are POSTed here; logged only when absent
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Outbox sweep interval when no transition wakes the worker
    #[serde(default = "default_outbox_poll_ms")]
    pub outbox_poll_ms: u64,
}

fn default_outbox_poll_ms() -> u64 {
    5_000
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            retry_initial_ms: 500,
            retry_max_ms: 60_000,
            outbox_poll_ms: default_outbox_poll_ms(),
        }
    }
}

impl NotificationConfig {
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            retry_initial: Duration::from_millis(self.retry_initial_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
            outbox_poll: Duration::from_millis(self.outbox_poll_ms),
        }
    }
}

fn default_utc_offset() -> i32 {
    BranchTimeZone::DEFAULT_OFFSET_HOURS
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        Self::from_file(format!("config/{}.yaml", env))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.branch_time_zone()?;
        Ok(config)
    }

    pub fn branch_time_zone(&self) -> Result<BranchTimeZone> {
        BranchTimeZone::from_utc_offset_hours(self.branch_utc_offset_hours).with_context(|| {
            format!(
                "branch_utc_offset_hours out of range: {}",
                self.branch_utc_offset_hours
            )
        })
    }
}
