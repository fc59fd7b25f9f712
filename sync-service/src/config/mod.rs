//! Configuration module for sync-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub store: StoreConfig,
    pub payment_api: PaymentApiConfig,
    pub sync: SyncConfig,
    pub workers: WorkerConfig,
    pub import: ImportConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown STORE_BACKEND '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PaymentApiConfig {
    /// Source name runs and records are keyed by.
    pub source: String,
    pub base_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub page_size: u32,
    pub max_window_days: u32,
    pub end_date_safety_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl PaymentApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub stale_threshold_minutes: i64,
    pub invocation_budget_secs: u64,
    pub upsert_batch_size: usize,
    pub default_lookback_days: i64,
    pub pause_poll_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub staging_batch_size: usize,
    pub merge_page_size: i64,
    pub merge_retry_max_elapsed_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// `label:key` pairs; empty disables request verification.
    pub api_keys: Vec<(String, Secret<String>)>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse `label:key,label2:key2`. A bare key gets its position as label.
pub fn parse_api_keys(raw: &str) -> Vec<(String, Secret<String>)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once(':') {
            Some((label, key)) => (label.trim().to_string(), Secret::new(key.trim().to_string())),
            None => (format!("key-{}", i), Secret::new(entry.to_string())),
        })
        .collect()
}

impl SyncServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let backend = StoreBackend::parse(
            &env::var("STORE_BACKEND").unwrap_or_else(|_| "postgres".to_string()),
        )?;
        let database = match backend {
            StoreBackend::Postgres => Some(DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            }),
            StoreBackend::Memory => None,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "sync-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            store: StoreConfig { backend, database },
            payment_api: PaymentApiConfig {
                source: env::var("PAYMENT_API_SOURCE")
                    .unwrap_or_else(|_| "payment_gateway".to_string()),
                base_url: env::var("PAYMENT_API_BASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("PAYMENT_API_BASE_URL is required"))
                })?,
                client_id: env::var("PAYMENT_API_CLIENT_ID").unwrap_or_default(),
                client_secret: Secret::new(
                    env::var("PAYMENT_API_CLIENT_SECRET").unwrap_or_default(),
                ),
                page_size: env_or("PAYMENT_API_PAGE_SIZE", 100),
                max_window_days: env_or("PAYMENT_API_MAX_WINDOW_DAYS", 31),
                end_date_safety_secs: env_or("PAYMENT_API_END_DATE_SAFETY_SECS", 300),
                request_timeout_secs: env_or("PAYMENT_API_REQUEST_TIMEOUT_SECS", 30),
                max_retries: env_or("PAYMENT_API_MAX_RETRIES", 3),
                initial_backoff_ms: env_or("PAYMENT_API_INITIAL_BACKOFF_MS", 250),
            },
            sync: SyncConfig {
                stale_threshold_minutes: env_or("SYNC_STALE_THRESHOLD_MINUTES", 15),
                invocation_budget_secs: env_or("SYNC_INVOCATION_BUDGET_SECS", 25),
                upsert_batch_size: env_or("SYNC_UPSERT_BATCH_SIZE", 500),
                default_lookback_days: env_or("SYNC_DEFAULT_LOOKBACK_DAYS", 90),
                pause_poll_secs: env_or("SYNC_PAUSE_POLL_SECS", 10),
            },
            workers: WorkerConfig {
                enabled: env_or("SYNC_WORKERS_ENABLED", true),
                worker_count: env_or("SYNC_WORKER_COUNT", 2),
                queue_size: env_or("SYNC_QUEUE_SIZE", 64),
            },
            import: ImportConfig {
                staging_batch_size: env_or("IMPORT_STAGING_BATCH_SIZE", 500),
                merge_page_size: env_or("IMPORT_MERGE_PAGE_SIZE", 1000),
                merge_retry_max_elapsed_secs: env_or("IMPORT_MERGE_RETRY_MAX_ELAPSED_SECS", 30),
            },
            auth: AuthConfig {
                api_keys: parse_api_keys(&env::var("AUTH_API_KEYS").unwrap_or_default()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn api_keys_are_parsed_with_labels() {
        let keys = parse_api_keys("ops:abc, cron:def ,,xyz");
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].0, "ops");
        assert_eq!(keys[0].1.expose_secret(), "abc");
        assert_eq!(keys[1].0, "cron");
        assert_eq!(keys[2].0, "key-2");
        assert_eq!(keys[2].1.expose_secret(), "xyz");
        assert!(parse_api_keys("").is_empty());
    }

    #[test]
    fn store_backend_parsing() {
        assert_eq!(StoreBackend::parse("Memory").unwrap(), StoreBackend::Memory);
        assert_eq!(StoreBackend::parse("postgres").unwrap(), StoreBackend::Postgres);
        assert!(StoreBackend::parse("sqlite").is_err());
    }
}
