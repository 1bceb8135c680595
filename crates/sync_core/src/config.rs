use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::retry::RetryPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub database_url: String,
    pub server_url: String,
    pub user_id: i64,
    pub log_filter: String,
    pub auth: AuthSettings,
    pub connection: ConnectionSettings,
    pub outbox: OutboxSettings,
    pub resync: ResyncSettings,
    pub unread: UnreadSettings,
    pub durability: DurabilitySettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/sync.db".into(),
            server_url: "http://127.0.0.1:8443".into(),
            user_id: 0,
            log_filter: "info".into(),
            auth: AuthSettings::default(),
            connection: ConnectionSettings::default(),
            outbox: OutboxSettings::default(),
            resync: ResyncSettings::default(),
            unread: UnreadSettings::default(),
            durability: DurabilitySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Remaining validity below which a write triggers a refresh.
    #[serde(with = "millis", rename = "validity_threshold_ms")]
    pub validity_threshold: Duration,
    #[serde(with = "millis", rename = "refresh_timeout_ms")]
    pub refresh_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            validity_threshold: Duration::from_secs(5 * 60),
            refresh_timeout: Duration::from_millis(1_800),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    #[serde(with = "millis", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis", rename = "heartbeat_timeout_ms")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "millis", rename = "subscribe_timeout_ms")]
    pub subscribe_timeout: Duration,
    #[serde(with = "millis", rename = "ack_timeout_ms")]
    pub ack_timeout: Duration,
    #[serde(with = "millis", rename = "backoff_base_ms")]
    pub backoff_base: Duration,
    #[serde(with = "millis", rename = "backoff_max_ms")]
    pub backoff_max: Duration,
    /// Consecutive failures tolerated before falling back to polling.
    pub max_retries: u32,
    #[serde(with = "millis", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(1_500),
            backoff_max: Duration::from_secs(60),
            max_retries: 3,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl ConnectionSettings {
    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.backoff_base,
            multiplier: 2,
            max_delay: self.backoff_max,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub max_attempts: u32,
    #[serde(with = "millis", rename = "retry_base_ms")]
    pub retry_base: Duration,
    #[serde(with = "millis", rename = "retry_max_ms")]
    pub retry_max: Duration,
    pub retry_jitter: f64,
    #[serde(with = "millis", rename = "auth_deferral_ms")]
    pub auth_deferral: Duration,
    #[serde(with = "millis", rename = "write_timeout_ms")]
    pub write_timeout: Duration,
    #[serde(with = "millis", rename = "periodic_interval_ms")]
    pub periodic_interval: Duration,
    pub batch_limit: u32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            retry_jitter: 0.2,
            auth_deferral: Duration::from_millis(700),
            write_timeout: Duration::from_secs(10),
            periodic_interval: Duration::from_secs(30),
            batch_limit: 50,
        }
    }
}

impl OutboxSettings {
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            base_delay: self.retry_base,
            multiplier: 2,
            max_delay: self.retry_max,
            jitter: self.retry_jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResyncSettings {
    pub batch_size: u32,
    #[serde(with = "millis", rename = "fetch_timeout_ms")]
    pub fetch_timeout: Duration,
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnreadSettings {
    #[serde(with = "millis", rename = "reconcile_interval_ms")]
    pub reconcile_interval: Duration,
    #[serde(with = "millis", rename = "fetch_timeout_ms")]
    pub fetch_timeout: Duration,
}

impl Default for UnreadSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurabilitySettings {
    #[serde(with = "millis", rename = "settle_delay_ms")]
    pub settle_delay: Duration,
    #[serde(with = "millis", rename = "idle_interval_ms")]
    pub idle_interval: Duration,
    /// No write for this long counts as idle.
    #[serde(with = "millis", rename = "quiet_period_ms")]
    pub quiet_period: Duration,
    pub wal_threshold_bytes: u64,
    pub wal_ceiling_bytes: u64,
    pub checkpoint_retries: u32,
    #[serde(with = "millis", rename = "checkpoint_backoff_ms")]
    pub checkpoint_backoff: Duration,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1_500),
            idle_interval: Duration::from_secs(30),
            quiet_period: Duration::from_secs(5),
            wal_threshold_bytes: 4 * 1024 * 1024,
            wal_ceiling_bytes: 32 * 1024 * 1024,
            checkpoint_retries: 3,
            checkpoint_backoff: Duration::from_millis(200),
        }
    }
}

impl DurabilitySettings {
    pub fn checkpoint_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.checkpoint_retries,
            base_delay: self.checkpoint_backoff,
            multiplier: 2,
            max_delay: self.checkpoint_backoff.saturating_mul(8),
            jitter: 0.1,
        }
    }
}

/// Reads `path` (or `sync.toml` when absent), then applies `APP__*` overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<SyncSettings> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<SyncSettings>(&raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => SyncSettings::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

pub fn apply_env_overrides(
    settings: &mut SyncSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__USER_ID") {
        settings.user_id = v
            .parse()
            .with_context(|| format!("APP__USER_ID must be an integer, got '{v}'"))?;
    }
    if let Some(v) = lookup("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
    if let Some(v) = lookup("APP__REFRESH_TIMEOUT_MS") {
        settings.auth.refresh_timeout = parse_millis("APP__REFRESH_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("APP__POLL_INTERVAL_MS") {
        settings.connection.poll_interval = parse_millis("APP__POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("APP__HEARTBEAT_INTERVAL_MS") {
        settings.connection.heartbeat_interval = parse_millis("APP__HEARTBEAT_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("APP__OUTBOX_MAX_ATTEMPTS") {
        settings.outbox.max_attempts = v
            .parse()
            .with_context(|| format!("APP__OUTBOX_MAX_ATTEMPTS must be an integer, got '{v}'"))?;
    }
    Ok(())
}

fn parse_millis(key: &str, raw: &str) -> anyhow::Result<Duration> {
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a number of milliseconds, got '{raw}'"))?;
    Ok(Duration::from_millis(ms))
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("  "), "sqlite://./data/sync.db");
    }

    #[test]
    fn defaults_match_documented_constants() {
        let settings = SyncSettings::default();
        assert_eq!(settings.auth.validity_threshold, Duration::from_secs(300));
        assert_eq!(settings.auth.refresh_timeout, Duration::from_millis(1_800));
        assert_eq!(settings.connection.max_retries, 3);
        assert_eq!(settings.connection.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.outbox.auth_deferral, Duration::from_millis(700));
        assert_eq!(settings.outbox.max_attempts, 5);
        assert_eq!(settings.resync.batch_size, 200);
    }

    #[test]
    fn toml_file_overrides_nested_sections() {
        let raw = r#"
            server_url = "https://chat.example"
            user_id = 42

            [connection]
            poll_interval_ms = 2500

            [outbox]
            max_attempts = 7
        "#;
        let settings: SyncSettings = toml::from_str(raw).expect("settings");
        assert_eq!(settings.server_url, "https://chat.example");
        assert_eq!(settings.user_id, 42);
        assert_eq!(settings.connection.poll_interval, Duration::from_millis(2_500));
        assert_eq!(settings.connection.max_retries, 3);
        assert_eq!(settings.outbox.max_attempts, 7);
        assert_eq!(settings.outbox.retry().max_retries, 6);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("APP__DATABASE_URL", "sqlite::memory:"),
            ("APP__USER_ID", "9"),
            ("APP__REFRESH_TIMEOUT_MS", "500"),
        ]);
        let mut settings = SyncSettings::default();
        apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(settings.database_url, "sqlite::memory:");
        assert_eq!(settings.user_id, 9);
        assert_eq!(settings.auth.refresh_timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_non_numeric_override() {
        let mut settings = SyncSettings::default();
        let err = apply_env_overrides(&mut settings, |key| {
            (key == "APP__POLL_INTERVAL_MS").then(|| "soon".to_string())
        })
        .expect_err("invalid override");
        assert!(err.to_string().contains("APP__POLL_INTERVAL_MS"));
    }

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(Some(&dir.path().join("absent.toml"))).expect("settings");
        assert_eq!(settings.resync.batch_size, 200);
    }
}
