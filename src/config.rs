use std::{env, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Unset means the service keeps its data in memory.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub orphan_order_hours: i64,
    pub stale_lock_minutes: i64,
    pub cash_days: i64,
    pub reservation_days: i64,
    pub notification_days: i64,
    pub audit_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            orphan_order_hours: 24,
            stale_lock_minutes: 60,
            cash_days: 365,
            reservation_days: 180,
            notification_days: 90,
            audit_days: 180,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub base_delay: Duration,
    pub relay_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub amqp_url: Option<String>,
    pub instance_id: String,
    pub tracking_code_ttl_hours: i64,
    pub reservation_capacity: i64,
    pub job_max_duration: Duration,
    pub retention: RetentionConfig,
    pub webhooks: WebhookConfig,
}

/// Reads the configuration from the environment, falling back to defaults.
pub fn load() -> Result<AppConfig> {
    let retention = RetentionConfig {
        orphan_order_hours: try_load("ORPHAN_ORDER_HOURS", "24")?,
        stale_lock_minutes: try_load("STALE_LOCK_MINUTES", "60")?,
        cash_days: try_load("CASH_RETENTION_DAYS", "365")?,
        reservation_days: try_load("RESERVATION_RETENTION_DAYS", "180")?,
        notification_days: try_load("NOTIFICATION_RETENTION_DAYS", "90")?,
        audit_days: try_load("AUDIT_RETENTION_DAYS", "180")?,
    };

    let database_url = optional("DATABASE_URL");
    if database_url.is_none() {
        warn!("DATABASE_URL not set, data will only be kept in memory");
    }

    Ok(AppConfig {
        server_addr: try_load("SERVER_ADDR", "0.0.0.0:3000")?,
        database: DatabaseConfig { url: database_url },
        amqp_url: optional("AMQP_URL"),
        instance_id: optional("INSTANCE_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
        tracking_code_ttl_hours: try_load("TRACKING_CODE_TTL_HOURS", "24")?,
        reservation_capacity: try_load("RESERVATION_CAPACITY", "40")?,
        job_max_duration: Duration::from_secs(try_load("JOB_MAX_DURATION_SECS", "300")?),
        retention,
        webhooks: WebhookConfig {
            timeout: Duration::from_secs(try_load("WEBHOOK_TIMEOUT_SECS", "10")?),
            base_delay: Duration::from_millis(try_load("WEBHOOK_BASE_DELAY_MS", "1000")?),
            relay_url: optional("NOTIFY_RELAY_URL"),
        },
    })
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let raw = optional(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
        .with_context(|| format!("Invalid {key} value: {raw}"))
}
