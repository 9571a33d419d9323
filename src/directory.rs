//! User-directory port.
//!
//! In restricted mode, publish eligibility needs the acting user's group
//! memberships and numeric id. These come from an external directory service
//! (LDAP behind an HTTP facade); the core only consumes this narrow lookup.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Directory record for one user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryEntry {
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub group_names: Vec<String>,
    /// Numeric id as known to the filesystem (matched against file owner uid).
    pub numeric_id: u32,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve(&self, username: &str) -> AppResult<DirectoryEntry>;
}

/// Directory client backed by an HTTP endpoint serving
/// `GET <base>/users/{username}` as a JSON `DirectoryEntry`.
pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn resolve(&self, username: &str) -> AppResult<DirectoryEntry> {
        let url = format!("{}/users/{}", self.base_url.trim_end_matches('/'), username);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::unavailable("directory_unreachable".to_string(), format!("user directory unreachable: {}", e)))?;
        if resp.status().as_u16() == 404 {
            return Err(AppError::denied(
                "unknown_user".to_string(),
                format!("user {} not found in directory", username),
            ));
        }
        resp.json()
            .await
            .map_err(|e| AppError::internal("directory_bad_response".to_string(), format!("user directory returned malformed body: {}", e)))
    }
}
