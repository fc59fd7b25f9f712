//! Request verification for the trigger endpoints.
//!
//! Callers present `Authorization: Bearer <key>`. Keys are configured as
//! labelled secrets; the matching label becomes the caller's identity.

use crate::startup::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use subtle::ConstantTimeEq;

/// Outcome of verifying one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub identity: Option<String>,
    pub error: Option<String>,
}

impl Verification {
    pub fn allowed(identity: impl Into<String>) -> Self {
        Self {
            valid: true,
            identity: Some(identity.into()),
            error: None,
        }
    }

    pub fn denied(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            identity: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait RequestVerifier: Send + Sync {
    async fn verify(&self, headers: &HeaderMap) -> Verification;
}

/// Static API keys compared in constant time.
pub struct ApiKeyVerifier {
    keys: Vec<(String, Secret<String>)>,
}

impl ApiKeyVerifier {
    pub fn new(keys: Vec<(String, Secret<String>)>) -> Self {
        Self { keys }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl RequestVerifier for ApiKeyVerifier {
    async fn verify(&self, headers: &HeaderMap) -> Verification {
        let Some(token) = bearer_token(headers) else {
            return Verification::denied("missing bearer token");
        };

        // Check every key so timing does not reveal which one matched.
        let mut matched = None;
        for (label, key) in &self.keys {
            let equal: bool = key.expose_secret().as_bytes().ct_eq(token.as_bytes()).into();
            if equal && matched.is_none() {
                matched = Some(label.clone());
            }
        }

        match matched {
            Some(label) => Verification::allowed(label),
            None => Verification::denied("invalid api key"),
        }
    }
}

/// Accepts every request. Used when no keys are configured.
pub struct DisabledVerifier;

#[async_trait]
impl RequestVerifier for DisabledVerifier {
    async fn verify(&self, _headers: &HeaderMap) -> Verification {
        Verification::allowed("anonymous")
    }
}

/// The verified caller. Rejects with 403 when verification fails.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let verification = state.verifier.verify(&parts.headers).await;
        if !verification.valid {
            let reason = verification
                .error
                .unwrap_or_else(|| "request not authorized".to_string());
            tracing::warn!(reason = %reason, "Rejected unauthorized request");
            return Err(AppError::Forbidden(anyhow::anyhow!(reason)));
        }

        let identity = verification
            .identity
            .unwrap_or_else(|| "anonymous".to_string());
        tracing::Span::current().record("caller", identity.as_str());
        Ok(Identity(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn verifier() -> ApiKeyVerifier {
        ApiKeyVerifier::new(vec![
            ("ops".to_string(), Secret::new("alpha".to_string())),
            ("cron".to_string(), Secret::new("beta".to_string())),
        ])
    }

    #[tokio::test]
    async fn matching_key_yields_its_label() {
        let result = verifier().verify(&headers(Some("Bearer beta"))).await;
        assert_eq!(result, Verification::allowed("cron"));
    }

    #[tokio::test]
    async fn wrong_or_missing_key_is_denied() {
        assert!(!verifier().verify(&headers(Some("Bearer gamma"))).await.valid);
        assert!(!verifier().verify(&headers(Some("Basic alpha"))).await.valid);
        let missing = verifier().verify(&headers(None)).await;
        assert_eq!(missing.error.as_deref(), Some("missing bearer token"));
    }

    #[tokio::test]
    async fn disabled_verifier_allows_everything() {
        assert!(DisabledVerifier.verify(&headers(None)).await.valid);
    }
}
