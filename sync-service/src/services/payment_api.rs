//! Client for the external payment provider's transaction report API.
//!
//! Exchanges client credentials for a bearer token, then pages through
//! `/reports/transactions` one window at a time. Transient failures are
//! retried with backoff; authentication problems are surfaced at once.

use crate::config::PaymentApiConfig;
use crate::ingest::chunker::ChunkWindow;
use crate::ingest::normalize::RawTransaction;
use crate::services::metrics::record_fetch_retry;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_with_backoff, RetryConfig, Retryable};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Refresh tokens this long before the provider says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// One page of a report window.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub records: Vec<RawTransaction>,
    pub total_pages: u32,
    pub total_items: u64,
}

impl FetchedPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication rejected: {0}")]
    AuthFailure(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Transient(e.to_string())
        }
    }
}

/// Where transactions come from. The engine only sees this seam.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Fetch `page` (1-based) of `window`.
    async fn fetch_page(&self, window: &ChunkWindow, page: u32) -> Result<FetchedPage, FetchError>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct ReportResponse {
    #[serde(default)]
    data: Vec<RawTransaction>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    total_items: u64,
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

struct CachedToken {
    value: Secret<String>,
    expires_at: Instant,
}

/// Payment API client with an in-process token cache.
pub struct PaymentApiClient {
    client: Client,
    config: PaymentApiConfig,
    retry: RetryConfig,
    token: Mutex<Option<CachedToken>>,
}

impl PaymentApiClient {
    pub fn new(config: PaymentApiConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        let retry = RetryConfig {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            ..Default::default()
        };

        Ok(Self {
            client,
            config,
            retry,
            token: Mutex::new(None),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.value.expose_secret().clone());
            }
        }

        let response = self
            .client
            .post(self.url("/oauth/token"))
            .json(&TokenRequest {
                grant_type: "client_credentials",
                client_id: &self.config.client_id,
                client_secret: self.config.client_secret.expose_secret(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    FetchError::AuthFailure(format!("token exchange returned {}: {}", status, body))
                }
                s if is_transient_status(s) => {
                    FetchError::Transient(format!("token exchange returned {}", status))
                }
                s => FetchError::Rejected {
                    status: s.as_u16(),
                    message: body,
                },
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(format!("token response: {}", e)))?;

        tracing::debug!(expires_in = token.expires_in, "Payment API token refreshed");

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: Secret::new(token.access_token),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_report(
        &self,
        token: &str,
        window: &ChunkWindow,
        page: u32,
    ) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(self.url("/reports/transactions"))
            .bearer_auth(token)
            .query(&[
                (
                    "startDate",
                    window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                (
                    "endDate",
                    window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                ("page", page.to_string()),
                ("pageSize", self.config.page_size.to_string()),
            ])
            .send()
            .await?;
        Ok(response)
    }

    async fn fetch_page_once(
        &self,
        window: &ChunkWindow,
        page: u32,
    ) -> Result<FetchedPage, FetchError> {
        let token = self.access_token().await?;
        let mut response = self.request_report(&token, window, page).await?;

        if is_auth_status(response.status()) {
            // Token may have been revoked early; exchange once more.
            self.invalidate_token().await;
            let token = self.access_token().await?;
            response = self.request_report(&token, window, page).await?;
            if is_auth_status(response.status()) {
                return Err(FetchError::AuthFailure(format!(
                    "report endpoint returned {}",
                    response.status()
                )));
            }
        }

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(FetchedPage::empty());
        }

        if !status.is_success() {
            let error: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
            if error.code.as_deref() == Some("NO_DATA") {
                return Ok(FetchedPage::empty());
            }
            let message = error.message.unwrap_or(body);
            return Err(if is_transient_status(status) {
                FetchError::Transient(format!("report endpoint returned {}: {}", status, message))
            } else {
                FetchError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let report: ReportResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))?;

        if report.data.is_empty() {
            return Ok(FetchedPage::empty());
        }

        let (total_pages, total_items) = report
            .pagination
            .map(|p| (p.total_pages, p.total_items))
            .unwrap_or((page, report.data.len() as u64));

        Ok(FetchedPage {
            records: report.data,
            // A non-empty page implies at least this many pages exist.
            total_pages: total_pages.max(page),
            total_items,
        })
    }
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[async_trait]
impl TransactionSource for PaymentApiClient {
    async fn fetch_page(&self, window: &ChunkWindow, page: u32) -> Result<FetchedPage, FetchError> {
        let source = self.config.source.clone();
        retry_with_backoff(
            &self.retry,
            "payment_api.fetch_page",
            || self.fetch_page_once(window, page),
            |_, _| record_fetch_retry(&source),
        )
        .await
    }
}
