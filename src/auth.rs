//! Token validation port and bearer-token extraction.
//!
//! The service does not mint or verify tokens itself: tokens are handed to an
//! external validation endpoint that answers with the acting username and
//! admin flag.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};

/// Identity resolved from a bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub username: String,
    pub is_admin: bool,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> AppResult<AuthenticatedUser>;
}

/// Pull the bearer token out of `Authorization` or the legacy `X-Auth-Token`
/// header. Both carry a `Bearer <token>` value.
pub fn extract_token(headers: &HeaderMap) -> AppResult<String> {
    let raw = headers
        .get("authorization")
        .or_else(|| headers.get("x-auth-token"))
        .ok_or_else(|| AppError::denied("missing_token", "Missing \"Authorization\" header"))?;
    let value = raw
        .to_str()
        .map_err(|_| AppError::denied("bad_token_header", "Invalid authorization header encoding"))?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AppError::denied(
            "bad_token_header",
            "Invalid authorization header: must start with \"Bearer \"",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    username: String,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Token validator backed by an HTTP endpoint.
pub struct HttpTokenValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenValidator {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into() }
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> AppResult<AuthenticatedUser> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|e| AppError::unavailable("auth_unreachable".to_string(), format!("token validator unreachable: {}", e)))?;
        let body: ValidateResponse = resp
            .json()
            .await
            .map_err(|e| AppError::internal("auth_bad_response".to_string(), format!("token validator returned malformed body: {}", e)))?;
        if !body.valid {
            let msg = body.error.unwrap_or_else(|| "invalid token".to_string());
            return Err(AppError::denied("invalid_token".to_string(), msg));
        }
        Ok(AuthenticatedUser { username: body.username, is_admin: body.is_admin })
    }
}
