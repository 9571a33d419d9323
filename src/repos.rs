//!
//! Repository catalog
//! ------------------
//! Configured publishable filesystem roots and their access policy. The
//! catalog is loaded once at startup from a YAML mapping of root path to
//! `{allowed_groups, allowed_users, has_baricadr}`. Roots are canonicalized
//! (symlinks resolved) and checked pairwise for overlap: no root may equal or
//! be a path-prefix of another, so any path resolves to at most one repo.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::auth::AuthenticatedUser;
use crate::directory::UserDirectory;
use crate::error::{AppError, AppResult};

/// Typed repository definition as it appears in the configuration file.
/// Non-list `allowed_groups`/`allowed_users` are rejected at parse time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoDef {
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub has_baricadr: bool,
}

/// One configured repository root with its publish policy.
#[derive(Debug, Clone)]
pub struct Repo {
    /// Canonical root path, no trailing separator.
    pub local_path: String,
    pub allowed_groups: Vec<String>,
    pub allowed_users: Vec<String>,
    /// Whether files under this root can be restored from archival storage.
    pub has_baricadr: bool,
}

fn with_trailing_sep(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

impl Repo {
    /// Prefix test scoped to this repo's root.
    pub fn is_in_repo(&self, path: &str) -> bool {
        with_trailing_sep(path).starts_with(&with_trailing_sep(&self.local_path))
    }

    /// Decide whether `user` may publish `path` from this repository.
    ///
    /// In restricted mode, access is granted when any of these holds:
    /// the user is an administrator; `allowed_groups` intersects the user's
    /// group ids or names; the user's username or numeric id appears in
    /// `allowed_users`; or both lists are empty and the file's owner uid
    /// equals the user's numeric id. The owner fallback never applies when
    /// either list is non-empty.
    pub async fn check_publish(
        &self,
        path: &str,
        user: &AuthenticatedUser,
        directory: &dyn UserDirectory,
        admin_users: &[String],
        restricted: bool,
    ) -> AppResult<()> {
        if !Path::new(path).exists() {
            return Err(AppError::not_found(
                "missing_path".to_string(),
                format!("target file {} does not exist", path),
            ));
        }

        if !restricted {
            return Ok(());
        }

        let entry = directory.resolve(&user.username).await?;

        let mut has_access = user.is_admin || admin_users.iter().any(|a| a == &user.username);

        if self
            .allowed_groups
            .iter()
            .any(|g| entry.group_ids.contains(g) || entry.group_names.contains(g))
        {
            has_access = true;
        }

        let numeric_id = entry.numeric_id.to_string();
        if self
            .allowed_users
            .iter()
            .any(|u| u == &user.username || *u == numeric_id)
        {
            has_access = true;
        }

        // Implicit owner grant, only when no ACL is configured at all.
        if self.allowed_users.is_empty() && self.allowed_groups.is_empty() {
            let meta = fs::metadata(path).map_err(|e| {
                AppError::not_found("missing_path".to_string(), format!("cannot stat {}: {}", path, e))
            })?;
            if meta.uid() == entry.numeric_id {
                has_access = true;
            }
        }

        if has_access {
            Ok(())
        } else {
            Err(AppError::denied(
                "publish_denied".to_string(),
                format!(
                    "user {} does not have permission to publish on repository {}",
                    user.username, self.local_path
                ),
            ))
        }
    }
}

/// Keyed collection of repositories by canonical root.
#[derive(Debug, Clone, Default)]
pub struct RepoCatalog {
    repos: Vec<Repo>,
}

impl RepoCatalog {
    /// Load repository definitions from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::config(
                "unreadable_conf".to_string(),
                format!("cannot read repository definitions {}: {}", path.as_ref().display(), e),
            )
        })?;
        Self::from_yaml(&content)
    }

    /// Parse repository definitions from a YAML string.
    ///
    /// Each root directory is created if absent (idempotent) and then
    /// canonicalized, so an aliasing symlink cannot smuggle in an overlapping
    /// root past the pairwise prefix check.
    pub fn from_yaml(content: &str) -> AppResult<Self> {
        let mapping: serde_yaml_ng::Mapping = serde_yaml_ng::from_str(content).map_err(|e| {
            AppError::config("bad_conf".to_string(), format!("malformed repository definitions: {}", e))
        })?;
        if mapping.is_empty() {
            return Err(AppError::config("empty_conf", "empty repository definitions"));
        }

        let mut repos: Vec<Repo> = Vec::new();
        for (key, value) in mapping {
            let raw_root = key.as_str().ok_or_else(|| {
                AppError::config("bad_conf".to_string(), "repository root must be a string path".to_string())
            })?;
            let def: RepoDef = serde_yaml_ng::from_value(value).map_err(|e| {
                AppError::config(
                    "bad_conf".to_string(),
                    format!("invalid definition for repository '{}': {}", raw_root, e),
                )
            })?;

            if !Path::new(raw_root).exists() {
                warn!(target: "datapub::repos", "directory '{}' does not exist, creating it", raw_root);
                fs::create_dir_all(raw_root).map_err(|e| {
                    AppError::config(
                        "bad_conf".to_string(),
                        format!("cannot create repository directory '{}': {}", raw_root, e),
                    )
                })?;
            }
            let canonical = fs::canonicalize(raw_root)
                .map_err(|e| {
                    AppError::config(
                        "bad_conf".to_string(),
                        format!("cannot canonicalize repository root '{}': {}", raw_root, e),
                    )
                })?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();

            for known in &repos {
                if known.local_path == canonical {
                    return Err(AppError::config(
                        "duplicate_repo".to_string(),
                        format!("duplicate repository root '{}'", canonical),
                    ));
                }
                if Self::roots_overlap(&known.local_path, &canonical) {
                    return Err(AppError::config(
                        "overlapping_repos".to_string(),
                        format!(
                            "repository root '{}' conflicts with '{}'",
                            canonical, known.local_path
                        ),
                    ));
                }
            }

            repos.push(Repo {
                local_path: canonical,
                allowed_groups: def.allowed_groups,
                allowed_users: def.allowed_users,
                has_baricadr: def.has_baricadr,
            });
        }

        Ok(Self { repos })
    }

    /// Two canonical roots overlap when, with trailing separators applied,
    /// one is a string-prefix of the other.
    fn roots_overlap(a: &str, b: &str) -> bool {
        let a = with_trailing_sep(a);
        let b = with_trailing_sep(b);
        a.starts_with(&b) || b.starts_with(&a)
    }

    /// Resolve a path to its owning repository. The non-overlap invariant
    /// guarantees at most one match.
    pub fn get_repo(&self, path: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.is_in_repo(path))
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.repos.iter().map(|r| r.local_path.as_str())
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}
