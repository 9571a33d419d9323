//! Shared fixtures: stub collaborator ports and a workflow builder over a
//! temporary repository root and registry.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use uuid::Uuid;

use datapub::auth::AuthenticatedUser;
use datapub::directory::{DirectoryEntry, UserDirectory};
use datapub::error::{AppError, AppResult};
use datapub::mail::RegexMailValidator;
use datapub::registry::{FileStatus, PublishedFile, SharedRegistry};
use datapub::repos::RepoCatalog;
use datapub::tasks::TaskDispatcher;
use datapub::workflow::PublicationWorkflow;

/// Dispatcher that records every submitted task instead of executing it.
pub struct RecordingDispatcher {
    pub submitted: Mutex<Vec<(String, Value)>>,
    pub up: bool,
}

impl RecordingDispatcher {
    pub fn up() -> Arc<Self> {
        Arc::new(Self { submitted: Mutex::new(Vec::new()), up: true })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self { submitted: Mutex::new(Vec::new()), up: false })
    }

    pub fn tasks(&self) -> Vec<(String, Value)> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn submit(&self, task: &str, payload: Value) -> AppResult<()> {
        self.submitted.lock().push((task.to_string(), payload));
        Ok(())
    }

    async fn available(&self) -> bool {
        self.up
    }
}

/// Directory stub answering every lookup with one fixed entry.
pub struct StubDirectory {
    pub entry: DirectoryEntry,
    pub fail: bool,
}

impl StubDirectory {
    pub fn with_entry(entry: DirectoryEntry) -> Arc<Self> {
        Arc::new(Self { entry, fail: false })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { entry: DirectoryEntry::default(), fail: true })
    }
}

#[async_trait]
impl UserDirectory for StubDirectory {
    async fn resolve(&self, username: &str) -> AppResult<DirectoryEntry> {
        if self.fail {
            return Err(AppError::denied(
                "unknown_user".to_string(),
                format!("user {} not found in directory", username),
            ));
        }
        Ok(self.entry.clone())
    }
}

pub fn user(name: &str, is_admin: bool) -> AuthenticatedUser {
    AuthenticatedUser { username: name.to_string(), is_admin }
}

pub struct TestEnv {
    pub workflow: PublicationWorkflow,
    pub registry: SharedRegistry,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub repo_root: PathBuf,
    _tmp: TempDir,
}

pub struct EnvOptions {
    pub repo_yaml_body: String,
    pub restricted: bool,
    pub directory: Arc<dyn UserDirectory>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub admin_users: Vec<String>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            repo_yaml_body: "  has_baricadr: false".to_string(),
            restricted: false,
            directory: StubDirectory::with_entry(DirectoryEntry::default()),
            dispatcher: RecordingDispatcher::up(),
            admin_users: vec!["admin".to_string()],
        }
    }
}

/// Build a workflow over a fresh temp directory: one repository root under
/// `<tmp>/repos/myrepo` and a registry under `<tmp>/data`.
pub fn build_env(opts: EnvOptions) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    // Canonicalize up front so record paths prefix-match the catalog roots.
    let base = tmp.path().canonicalize().unwrap();
    let repo_root = base.join("repos").join("myrepo");
    fs::create_dir_all(&repo_root).unwrap();

    let yaml = format!("{}:\n{}\n", repo_root.display(), opts.repo_yaml_body);
    let catalog = RepoCatalog::from_yaml(&yaml).unwrap();
    let registry = SharedRegistry::open(base.join("data")).unwrap();

    let workflow = PublicationWorkflow::new(
        registry.clone(),
        catalog,
        opts.dispatcher.clone(),
        opts.directory.clone(),
        Arc::new(RegexMailValidator),
        opts.admin_users.clone(),
        opts.restricted,
    );

    TestEnv { workflow, registry, dispatcher: opts.dispatcher, repo_root, _tmp: tmp }
}

pub fn default_env() -> TestEnv {
    build_env(EnvOptions::default())
}

pub fn archival_env() -> TestEnv {
    build_env(EnvOptions { repo_yaml_body: "  has_baricadr: true".to_string(), ..Default::default() })
}

/// Write a small file under the repo root and return its absolute path.
pub fn write_repo_file(repo_root: &Path, name: &str, content: &str) -> String {
    let path = repo_root.join(name);
    fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

/// Insert a record directly, bypassing the publish flow, the way the
/// external worker or an earlier deployment would have left it.
#[allow(clippy::too_many_arguments)]
pub fn mock_file(
    env: &TestEnv,
    name: &str,
    status: FileStatus,
    size: u64,
    publishing_date: DateTime<Utc>,
    owner: &str,
    tags: &[&str],
) -> Uuid {
    let mut reg = env.registry.0.lock();
    let tag_ids: Vec<Uuid> = tags.iter().map(|t| reg.find_or_create_tag(t).unwrap()).collect();
    let file = PublishedFile {
        id: Uuid::new_v4(),
        file_name: name.to_string(),
        file_path: env.repo_root.join(name).to_string_lossy().to_string(),
        repo_path: env.repo_root.to_string_lossy().to_string(),
        owner: owner.to_string(),
        contact: None,
        size,
        hash: None,
        status,
        downloads: 0,
        publishing_date,
        version: 1,
        version_of: None,
        tags: tag_ids,
    };
    let id = file.id;
    reg.insert(file).unwrap();
    id
}
