//!
//! datapub registry store
//! ----------------------
//! Durable store for `PublishedFile` and `Tag` records. The store keeps the
//! full record set in memory and rewrites `published.json` / `tags.json`
//! under its root directory on every mutation.
//!
//! Key responsibilities:
//! - Record creation and single-record read-modify-write updates.
//! - Tag deduplication by label text.
//! - Sibling-chain queries (records linked through `version_of`).
//!
//! Records are never physically deleted: retirement is expressed through the
//! terminal `unpublished` status. The public API centers around the
//! `Registry` type, which is wrapped in a thread-safe `SharedRegistry`
//! (`Arc<Mutex<Registry>>`) elsewhere in the codebase; the mutex is what
//! provides the atomic read-modify-write that the downloads counter and
//! status reconciliation rely on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{fmt, fs};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Lifecycle status of a published file.
///
/// `Unpublished` is terminal: no reconciliation rule or operation moves a
/// record out of it. The other four states cycle among themselves as the
/// on-disk truth changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Unpublished,
    Pulling,
    Pullable,
    Available,
    Unavailable,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Unpublished => "unpublished",
            FileStatus::Pulling => "pulling",
            FileStatus::Pullable => "pullable",
            FileStatus::Available => "available",
            FileStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file registered for publication.
///
/// `file_path` is the absolute path under the owning repository root
/// (`repo_path`). `size` is captured synchronously at publish time; `hash` is
/// filled in later by the external worker. `version_of` is normalized to
/// always point at the first record of the sibling chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedFile {
    pub id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub repo_path: String,
    pub owner: String,
    pub contact: Option<String>,
    pub size: u64,
    pub hash: Option<String>,
    pub status: FileStatus,
    pub downloads: u64,
    pub publishing_date: DateTime<Utc>,
    pub version: u32,
    pub version_of: Option<Uuid>,
    pub tags: Vec<Uuid>,
}

/// Free-text label, deduplicated by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub tag: String,
}

const FILES_FILE: &str = "published.json";
const TAGS_FILE: &str = "tags.json";

/// On-disk registry handle.
pub struct Registry {
    root: PathBuf,
    files: HashMap<Uuid, PublishedFile>,
    tags: Vec<Tag>,
}

impl Registry {
    /// Open (or initialize) a registry rooted at the given directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create registry root {}", root.display()))?;

        let files_path = root.join(FILES_FILE);
        let files: Vec<PublishedFile> = if files_path.exists() {
            let raw = fs::read_to_string(&files_path)
                .with_context(|| format!("failed to read {}", files_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", files_path.display()))?
        } else {
            Vec::new()
        };

        let tags_path = root.join(TAGS_FILE);
        let tags: Vec<Tag> = if tags_path.exists() {
            let raw = fs::read_to_string(&tags_path)
                .with_context(|| format!("failed to read {}", tags_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", tags_path.display()))?
        } else {
            Vec::new()
        };

        debug!(target: "datapub::registry", "opened registry at '{}': {} files, {} tags", root.display(), files.len(), tags.len());
        Ok(Self {
            root,
            files: files.into_iter().map(|f| (f.id, f)).collect(),
            tags,
        })
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.root
    }

    fn persist_files(&self) -> AppResult<()> {
        let mut all: Vec<&PublishedFile> = self.files.values().collect();
        all.sort_by_key(|f| f.publishing_date);
        let body = serde_json::to_string_pretty(&all)
            .map_err(|e| AppError::internal("persist".to_string(), e.to_string()))?;
        fs::write(self.root.join(FILES_FILE), body)?;
        Ok(())
    }

    fn persist_tags(&self) -> AppResult<()> {
        let body = serde_json::to_string_pretty(&self.tags)
            .map_err(|e| AppError::internal("persist".to_string(), e.to_string()))?;
        fs::write(self.root.join(TAGS_FILE), body)?;
        Ok(())
    }

    /// Insert a new record and persist.
    pub fn insert(&mut self, file: PublishedFile) -> AppResult<()> {
        debug!(target: "datapub::registry", "insert file id={} name='{}'", file.id, file.file_name);
        self.files.insert(file.id, file);
        self.persist_files()
    }

    pub fn get(&self, id: &Uuid) -> Option<PublishedFile> {
        self.files.get(id).cloned()
    }

    /// Atomic single-record read-modify-write: apply `f` to the record and
    /// persist. The caller holds the registry mutex for the whole operation.
    pub fn update<F>(&mut self, id: &Uuid, f: F) -> AppResult<PublishedFile>
    where
        F: FnOnce(&mut PublishedFile),
    {
        let record = self
            .files
            .get_mut(id)
            .ok_or_else(|| AppError::not_found("unknown_file".to_string(), format!("no published file with id {}", id)))?;
        f(record);
        let updated = record.clone();
        self.persist_files()?;
        Ok(updated)
    }

    /// Return the id of an existing tag with this label, or create one.
    pub fn find_or_create_tag(&mut self, label: &str) -> AppResult<Uuid> {
        if let Some(t) = self.tags.iter().find(|t| t.tag == label) {
            return Ok(t.id);
        }
        let tag = Tag { id: Uuid::new_v4(), tag: label.to_string() };
        let id = tag.id;
        self.tags.push(tag);
        self.persist_tags()?;
        Ok(id)
    }

    /// Resolve tag ids into labels, skipping ids that no longer resolve.
    pub fn tag_labels(&self, ids: &[Uuid]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.tags.iter().find(|t| &t.id == id).map(|t| t.tag.clone()))
            .collect()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// First record of the sibling chain this record belongs to.
    pub fn chain_root(&self, file: &PublishedFile) -> Uuid {
        file.version_of.unwrap_or(file.id)
    }

    /// All chain members except `file` itself, ordered by version.
    pub fn siblings(&self, file: &PublishedFile) -> Vec<PublishedFile> {
        let root = self.chain_root(file);
        let mut members: Vec<PublishedFile> = self
            .files
            .values()
            .filter(|f| f.id != file.id && (f.id == root || f.version_of == Some(root)))
            .cloned()
            .collect();
        members.sort_by_key(|f| f.version);
        members
    }

    /// Highest version currently present in the chain `file` belongs to.
    pub fn max_version_in_chain(&self, file: &PublishedFile) -> u32 {
        let root = self.chain_root(file);
        self.files
            .values()
            .filter(|f| f.id == root || f.version_of == Some(root))
            .map(|f| f.version)
            .max()
            .unwrap_or(file.version)
    }

    /// All records ordered by publishing date, newest first.
    pub fn all_by_date_desc(&self) -> Vec<PublishedFile> {
        let mut all: Vec<PublishedFile> = self.files.values().cloned().collect();
        all.sort_by(|a, b| b.publishing_date.cmp(&a.publishing_date));
        all
    }
}

/// Thread-safe handle over the registry, shared between request handlers.
#[derive(Clone)]
pub struct SharedRegistry(pub Arc<Mutex<Registry>>);

impl SharedRegistry {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Registry::open(root)?))))
    }
}
