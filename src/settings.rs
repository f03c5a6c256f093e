use crate::db::DbSetting;
use crate::error::Error;
use serde::{Deserialize, Serialize};

pub const DEFAULT_OUTGOING_PER_MINUTE: u64 = 30;
pub const DEFAULT_MESSAGE_RATE_UNITS: u64 = 500;
pub const DEFAULT_MESSAGE_RATE_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_INCOMING_BACKLOG_MAX: u64 = 500;
pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_QUEUE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_OUTGOING_FLUSH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_SUBSCRIPTION_REFRESH_MS: u64 = 600_000;
pub const DEFAULT_FILTER_LIMIT: u64 = 200;
pub const DEFAULT_RECOVERY_THRESHOLD_SECS: u64 = 300;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

/// The courtesy limits we apply to our own traffic.
///
/// `message_rate_units` is a credit budget over a sliding window of
/// `message_rate_window_seconds`; each outbound event consumes credits
/// proportional to its serialized length. `outgoing_per_minute` caps how
/// many rows one flush cycle will drain.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub outgoing_per_minute: u64,
    pub message_rate_units: u64,
    pub message_rate_window_seconds: u64,
    pub incoming_backlog_max: u64,
}

impl Default for ResourceLimits {
    fn default() -> ResourceLimits {
        ResourceLimits {
            outgoing_per_minute: DEFAULT_OUTGOING_PER_MINUTE,
            message_rate_units: DEFAULT_MESSAGE_RATE_UNITS,
            message_rate_window_seconds: DEFAULT_MESSAGE_RATE_WINDOW_SECONDS,
            incoming_backlog_max: DEFAULT_INCOMING_BACKLOG_MAX,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    pub limits: ResourceLimits,
    pub status_interval_ms: u64,
    pub queue_interval_ms: u64,
    pub outgoing_flush_interval_ms: u64,
    pub subscription_refresh_ms: u64,
    pub filter_limit: u64,
    pub recovery_threshold_secs: u64,
    pub shutdown_grace_ms: u64,
    pub publish_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            limits: ResourceLimits::default(),
            status_interval_ms: DEFAULT_STATUS_INTERVAL_MS,
            queue_interval_ms: DEFAULT_QUEUE_INTERVAL_MS,
            outgoing_flush_interval_ms: DEFAULT_OUTGOING_FLUSH_INTERVAL_MS,
            subscription_refresh_ms: DEFAULT_SUBSCRIPTION_REFRESH_MS,
            filter_limit: DEFAULT_FILTER_LIMIT,
            recovery_threshold_secs: DEFAULT_RECOVERY_THRESHOLD_SECS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            publish_timeout_secs: DEFAULT_PUBLISH_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    pub async fn load() -> Result<Settings, Error> {
        let limits = ResourceLimits {
            outgoing_per_minute: DbSetting::fetch_setting_u64_or_default(
                "outgoing_per_minute",
                DEFAULT_OUTGOING_PER_MINUTE,
            )
            .await?,
            message_rate_units: DbSetting::fetch_setting_u64_or_default(
                "message_rate_units",
                DEFAULT_MESSAGE_RATE_UNITS,
            )
            .await?,
            message_rate_window_seconds: DbSetting::fetch_setting_u64_or_default(
                "message_rate_window_seconds",
                DEFAULT_MESSAGE_RATE_WINDOW_SECONDS,
            )
            .await?,
            incoming_backlog_max: DbSetting::fetch_setting_u64_or_default(
                "incoming_backlog_max",
                DEFAULT_INCOMING_BACKLOG_MAX,
            )
            .await?,
        };

        Ok(Settings {
            limits,
            status_interval_ms: DbSetting::fetch_setting_u64_or_default(
                "status_interval_ms",
                DEFAULT_STATUS_INTERVAL_MS,
            )
            .await?,
            queue_interval_ms: DbSetting::fetch_setting_u64_or_default(
                "queue_interval_ms",
                DEFAULT_QUEUE_INTERVAL_MS,
            )
            .await?,
            outgoing_flush_interval_ms: DbSetting::fetch_setting_u64_or_default(
                "outgoing_flush_interval_ms",
                DEFAULT_OUTGOING_FLUSH_INTERVAL_MS,
            )
            .await?,
            subscription_refresh_ms: DbSetting::fetch_setting_u64_or_default(
                "subscription_refresh_ms",
                DEFAULT_SUBSCRIPTION_REFRESH_MS,
            )
            .await?,
            filter_limit: DbSetting::fetch_setting_u64_or_default(
                "filter_limit",
                DEFAULT_FILTER_LIMIT,
            )
            .await?,
            recovery_threshold_secs: DbSetting::fetch_setting_u64_or_default(
                "recovery_threshold_secs",
                DEFAULT_RECOVERY_THRESHOLD_SECS,
            )
            .await?,
            shutdown_grace_ms: DbSetting::fetch_setting_u64_or_default(
                "shutdown_grace_ms",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )
            .await?,
            publish_timeout_secs: DbSetting::fetch_setting_u64_or_default(
                "publish_timeout_secs",
                DEFAULT_PUBLISH_TIMEOUT_SECS,
            )
            .await?,
        })
    }

    pub async fn save(&self) -> Result<(), Error> {
        DbSetting::update("outgoing_per_minute", self.limits.outgoing_per_minute).await?;
        DbSetting::update("message_rate_units", self.limits.message_rate_units).await?;
        DbSetting::update(
            "message_rate_window_seconds",
            self.limits.message_rate_window_seconds,
        )
        .await?;
        DbSetting::update("incoming_backlog_max", self.limits.incoming_backlog_max).await?;
        DbSetting::update("status_interval_ms", self.status_interval_ms).await?;
        DbSetting::update("queue_interval_ms", self.queue_interval_ms).await?;
        DbSetting::update(
            "outgoing_flush_interval_ms",
            self.outgoing_flush_interval_ms,
        )
        .await?;
        DbSetting::update("subscription_refresh_ms", self.subscription_refresh_ms).await?;
        DbSetting::update("filter_limit", self.filter_limit).await?;
        DbSetting::update("recovery_threshold_secs", self.recovery_threshold_secs).await?;
        DbSetting::update("shutdown_grace_ms", self.shutdown_grace_ms).await?;
        DbSetting::update("publish_timeout_secs", self.publish_timeout_secs).await?;
        Ok(())
    }
}
