//!
//! Publication workflow
//! --------------------
//! Orchestrates the PublishedFile lifecycle: publish (eligibility check,
//! record creation, task dispatch), lazy status reconciliation on read
//! access, pull requests against archival storage, unpublish, and the
//! list/search queries.
//!
//! Status is a cache of external truth. No background polling exists: every
//! view/download recomputes the record's status from the live filesystem
//! state through the pure `reconcile` function and writes it back only when
//! it changed. Task dispatch is fire-and-forget; completion is inferred on
//! the next read.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::directory::UserDirectory;
use crate::error::{AppError, AppResult};
use crate::mail::MailValidator;
use crate::registry::{FileStatus, PublishedFile, SharedRegistry};
use crate::repos::RepoCatalog;
use crate::tasks::TaskDispatcher;

/// Compute the next status from the recorded one and the observed disk state.
///
/// `on_disk` carries the current on-disk size when the file exists. Each
/// transition is an idempotent assignment, so concurrent readers performing
/// the same check race harmlessly.
pub fn reconcile(
    status: FileStatus,
    on_disk: Option<u64>,
    recorded_size: u64,
    archival_backed: bool,
) -> FileStatus {
    match (status, on_disk) {
        // Terminal: nothing moves a record out of unpublished.
        (FileStatus::Unpublished, _) => FileStatus::Unpublished,
        // Copy finished: the worker gives no completion signal, so a pulling
        // file whose on-disk size matches the recorded size is done.
        (FileStatus::Pulling, Some(size)) if size == recorded_size => FileStatus::Available,
        // Defensive repair: the file reappeared.
        (FileStatus::Unavailable, Some(_)) => FileStatus::Available,
        (FileStatus::Available, None) => {
            if archival_backed {
                FileStatus::Pullable
            } else {
                FileStatus::Unavailable
            }
        }
        (s, _) => s,
    }
}

/// Summary row for list/search responses.
#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub uri: Uuid,
    pub file_name: String,
    pub size: u64,
    pub status: FileStatus,
    pub downloads: u64,
    pub publishing_date: String,
}

impl FileSummary {
    fn from_record(f: &PublishedFile) -> Self {
        Self {
            uri: f.id,
            file_name: f.file_name.clone(),
            size: f.size,
            status: f.status,
            downloads: f.downloads,
            publishing_date: f.publishing_date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Chain member summary included in detail views.
#[derive(Debug, Serialize)]
pub struct SiblingSummary {
    pub id: Uuid,
    pub version: u32,
    pub status: FileStatus,
}

/// Full record detail returned by `view`.
#[derive(Debug, Serialize)]
pub struct FileDetail {
    pub contact: Option<String>,
    pub owner: String,
    pub status: FileStatus,
    pub file_name: String,
    pub path: String,
    pub size: u64,
    pub hash: Option<String>,
    pub downloads: u64,
    pub version: u32,
    pub publishing_date: String,
    pub tags: Vec<String>,
    pub siblings: Vec<SiblingSummary>,
}

/// Outcome of a pull request.
#[derive(Debug, PartialEq, Eq)]
pub enum PullOutcome {
    AlreadyAvailable,
    Accepted,
}

/// Orchestrator over the registry, repo catalog, and outbound ports. All
/// collaborators are constructor dependencies; there is no ambient state.
pub struct PublicationWorkflow {
    registry: SharedRegistry,
    repos: RepoCatalog,
    dispatcher: Arc<dyn TaskDispatcher>,
    directory: Arc<dyn UserDirectory>,
    mail: Arc<dyn MailValidator>,
    admin_users: Vec<String>,
    restricted: bool,
}

impl PublicationWorkflow {
    pub fn new(
        registry: SharedRegistry,
        repos: RepoCatalog,
        dispatcher: Arc<dyn TaskDispatcher>,
        directory: Arc<dyn UserDirectory>,
        mail: Arc<dyn MailValidator>,
        admin_users: Vec<String>,
        restricted: bool,
    ) -> Self {
        Self { registry, repos, dispatcher, directory, mail, admin_users, restricted }
    }

    pub fn repos(&self) -> &RepoCatalog {
        &self.repos
    }

    fn parse_id(raw: &str) -> AppResult<Uuid> {
        // Malformed ids surface as 404, same as unknown ones.
        Uuid::parse_str(raw)
            .map_err(|_| AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", raw)))
    }

    fn normalize_opt_email(&self, address: Option<&str>) -> AppResult<Option<String>> {
        match address {
            Some(a) if !a.trim().is_empty() => Ok(Some(self.mail.normalize(a)?)),
            _ => Ok(None),
        }
    }

    /// Register a file for publication.
    ///
    /// Captures the size synchronously, assigns the version (joining the
    /// sibling chain of `linked_to` when given), persists the record, and
    /// dispatches the asynchronous publish task. Returns the new id and
    /// version without waiting for the copy/hash step.
    pub async fn publish(
        &self,
        path: &str,
        user: &AuthenticatedUser,
        email: Option<&str>,
        contact: Option<&str>,
        linked_to: Option<&str>,
        tags: &[String],
    ) -> AppResult<(Uuid, u32)> {
        let meta = fs::metadata(path).map_err(|_| {
            AppError::invalid("missing_path".to_string(), format!("file not found at path {}", path))
        })?;
        if meta.is_dir() {
            return Err(AppError::invalid("bad_path", "path must not be a folder"));
        }

        let repo = self.repos.get_repo(path).ok_or_else(|| {
            AppError::invalid(
                "outside_repos".to_string(),
                format!("file {} is not in any publishable repository", path),
            )
        })?;

        repo.check_publish(path, user, self.directory.as_ref(), &self.admin_users, self.restricted)
            .await?;

        if !self.dispatcher.available().await {
            warn!(target: "datapub::workflow", "publish request on '{}' refused: no task executor available", path);
            return Err(AppError::unavailable(
                "no_worker",
                "no task executor available to process the request",
            ));
        }

        let email = self.normalize_opt_email(email)?;
        let contact = self.normalize_opt_email(contact)?;

        let file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::invalid("bad_path", "path has no file name"))?;

        let id = Uuid::new_v4();
        let version = {
            let mut reg = self.registry.0.lock();

            let (version, version_of) = match linked_to {
                Some(raw) => {
                    let linked_id = Uuid::parse_str(raw).map_err(|_| {
                        AppError::invalid("bad_link".to_string(), format!("malformed linked_to id '{}'", raw))
                    })?;
                    let target = reg.get(&linked_id).ok_or_else(|| {
                        AppError::not_found("unknown_link".to_string(), format!("no published file with id {}", linked_id))
                    })?;
                    let root = reg.chain_root(&target);
                    (reg.max_version_in_chain(&target) + 1, Some(root))
                }
                None => (1, None),
            };

            let mut tag_ids = Vec::new();
            for label in tags {
                let tid = reg.find_or_create_tag(label)?;
                if !tag_ids.contains(&tid) {
                    tag_ids.push(tid);
                }
            }

            reg.insert(PublishedFile {
                id,
                file_name: file_name.clone(),
                file_path: path.to_string(),
                repo_path: repo.local_path.clone(),
                owner: user.username.clone(),
                contact,
                size: meta.len(),
                hash: None,
                status: FileStatus::Available,
                downloads: 0,
                publishing_date: Utc::now(),
                version,
                version_of,
                tags: tag_ids,
            })?;
            version
        };

        info!(target: "datapub::workflow", "published '{}' as {} (version {}) by {}", path, id, version, user.username);
        self.dispatcher
            .submit("publish", json!({ "file_id": id, "path": path, "email": email }))
            .await?;

        Ok((id, version))
    }

    /// Reconcile one record against the live filesystem and persist the new
    /// status when it changed. Reconciliation failures are swallowed: the
    /// prior status is kept and the read proceeds.
    fn reconcile_record(&self, record: PublishedFile) -> PublishedFile {
        let on_disk = fs::metadata(&record.file_path).ok().map(|m| m.len());
        let archival_backed = self
            .repos
            .get_repo(&record.repo_path)
            .map(|r| r.has_baricadr)
            .unwrap_or(false);
        let next = reconcile(record.status, on_disk, record.size, archival_backed);
        if next == record.status {
            return record;
        }
        info!(target: "datapub::workflow", "file {} status {} -> {}", record.id, record.status, next);
        let mut reg = self.registry.0.lock();
        match reg.update(&record.id, |f| f.status = next) {
            Ok(updated) => updated,
            Err(e) => {
                warn!(target: "datapub::workflow", "keeping stale status for {}: {}", record.id, e);
                record
            }
        }
    }

    /// Reconcile and return the record detail, including sibling summaries.
    pub fn view(&self, raw_id: &str) -> AppResult<FileDetail> {
        let id = Self::parse_id(raw_id)?;
        let record = {
            let reg = self.registry.0.lock();
            reg.get(&id)
        }
        .ok_or_else(|| AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", id)))?;

        let record = self.reconcile_record(record);

        let reg = self.registry.0.lock();
        let tags = reg.tag_labels(&record.tags);
        let siblings = reg
            .siblings(&record)
            .into_iter()
            .map(|s| SiblingSummary { id: s.id, version: s.version, status: s.status })
            .collect();

        Ok(FileDetail {
            contact: record.contact,
            owner: record.owner,
            status: record.status,
            file_name: record.file_name,
            path: record.file_path,
            size: record.size,
            hash: record.hash,
            downloads: record.downloads,
            version: record.version,
            publishing_date: record.publishing_date.format("%Y-%m-%d").to_string(),
            tags,
            siblings,
        })
    }

    /// Record a download: increments the counter atomically and returns the
    /// on-disk path for streaming. Unpublished and unknown records are 404,
    /// as is a record whose bytes are not on disk.
    pub fn download(&self, raw_id: &str) -> AppResult<(PathBuf, String)> {
        let id = Self::parse_id(raw_id)?;
        let record = {
            let reg = self.registry.0.lock();
            reg.get(&id)
        }
        .ok_or_else(|| AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", id)))?;

        if record.status == FileStatus::Unpublished {
            return Err(AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", id)));
        }

        let record = self.reconcile_record(record);

        if !Path::new(&record.file_path).exists() {
            return Err(AppError::not_found("missing_file", "missing file"));
        }

        let mut reg = self.registry.0.lock();
        let updated = reg.update(&id, |f| f.downloads += 1)?;
        Ok((PathBuf::from(updated.file_path), updated.file_name))
    }

    /// Request archival retrieval for a file that is no longer on disk.
    pub async fn pull(&self, raw_id: &str, email: Option<&str>) -> AppResult<PullOutcome> {
        let id = Self::parse_id(raw_id)?;
        let email = self.normalize_opt_email(email)?;

        let record = {
            let reg = self.registry.0.lock();
            reg.get(&id)
        }
        .ok_or_else(|| AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", id)))?;

        if Path::new(&record.file_path).exists() {
            return Ok(PullOutcome::AlreadyAvailable);
        }

        let archival_backed = self
            .repos
            .get_repo(&record.repo_path)
            .map(|r| r.has_baricadr)
            .unwrap_or(false);
        if !archival_backed {
            return Err(AppError::unavailable(
                "not_archived",
                "repository is not archival-backed, cannot pull",
            ));
        }

        self.dispatcher
            .submit("pull", json!({ "file_id": id, "email": email }))
            .await?;
        info!(target: "datapub::workflow", "pull task dispatched for {}", id);
        Ok(PullOutcome::Accepted)
    }

    /// Retire a record. Only the owner or an administrator may unpublish;
    /// the transition is irreversible.
    pub fn unpublish(&self, raw_id: &str, user: &AuthenticatedUser) -> AppResult<()> {
        let id = Self::parse_id(raw_id)?;
        let mut reg = self.registry.0.lock();
        let record = reg
            .get(&id)
            .ok_or_else(|| AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", id)))?;

        let is_admin = user.is_admin || self.admin_users.iter().any(|a| a == &user.username);
        if record.owner != user.username && !is_admin {
            return Err(AppError::denied(
                "unpublish_denied".to_string(),
                format!("user {} may not unpublish file {}", user.username, id),
            ));
        }

        reg.update(&id, |f| f.status = FileStatus::Unpublished)?;
        info!(target: "datapub::workflow", "file {} unpublished by {}", id, user.username);
        Ok(())
    }

    /// All records, newest first, plus the total unfiltered count.
    pub fn list(&self, offset: usize, limit: usize) -> (Vec<FileSummary>, usize) {
        let reg = self.registry.0.lock();
        let all = reg.all_by_date_desc();
        let total = all.len();
        let page = all
            .iter()
            .skip(offset)
            .take(limit)
            .map(FileSummary::from_record)
            .collect();
        (page, total)
    }

    /// Filtered search. Unpublished records are always excluded. A query
    /// that parses as an id matches by exact id, anything else matches as a
    /// case-insensitive substring of the file name. Tag filtering uses
    /// ANY-match semantics. The total reflects the full filtered count.
    pub fn search(
        &self,
        query: Option<&str>,
        tags: &[String],
        offset: usize,
        limit: usize,
    ) -> (Vec<FileSummary>, usize) {
        if query.is_none() && tags.is_empty() {
            return (Vec::new(), 0);
        }

        let reg = self.registry.0.lock();
        let needle = query.map(|q| q.to_lowercase());
        let query_id = query.and_then(|q| Uuid::parse_str(q).ok());

        let kept: Vec<PublishedFile> = reg
            .all_by_date_desc()
            .into_iter()
            .filter(|record| record.status != FileStatus::Unpublished)
            .filter(|record| match (&query_id, &needle) {
                (Some(qid), _) => record.id == *qid,
                (None, Some(n)) => record.file_name.to_lowercase().contains(n),
                (None, None) => true,
            })
            .filter(|record| {
                if tags.is_empty() {
                    return true;
                }
                let labels = reg.tag_labels(&record.tags);
                tags.iter().any(|t| labels.contains(t))
            })
            .collect();

        let total = kept.len();
        let page = kept
            .iter()
            .skip(offset)
            .take(limit)
            .map(FileSummary::from_record)
            .collect();
        (page, total)
    }
}
