//! Test helpers for bim-ingest integration tests
//!
//! Every test gets its own source tree, destination root and in-memory
//! SQLite store.

#![allow(dead_code)]

use bim_ingest::store::SqliteStore;
use bim_ingest::{Collaborators, ImporterConfig, IngestStore, RunConfig, WorkerTopology};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TestEnv {
    pub source: TempDir,
    pub dest: TempDir,
    pub store: Arc<dyn IngestStore>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let store = SqliteStore::in_memory()
            .await
            .expect("Failed to open in-memory store");
        Self {
            source: TempDir::new().expect("Failed to create source dir"),
            dest: TempDir::new().expect("Failed to create dest dir"),
            store: Arc::new(store),
        }
    }

    /// Write a source file, creating parent directories
    pub fn touch(&self, path: &str, contents: &[u8]) {
        let path = self.source.path().join(path);
        std::fs::create_dir_all(path.parent().expect("file has a parent"))
            .expect("Failed to create source directories");
        std::fs::write(path, contents).expect("Failed to write source file");
    }

    pub fn mkdir(&self, path: &str) {
        std::fs::create_dir_all(self.source.path().join(path))
            .expect("Failed to create source directory");
    }

    /// Fast-polling local run that skips the review prompt
    pub fn config(&self) -> RunConfig {
        RunConfig {
            database_url: "sqlite::memory:".to_string(),
            workers: 2,
            topology: WorkerTopology::Local,
            poll_interval: Duration::from_millis(10),
            worker_backoff: Duration::from_millis(10),
            task_lease: None,
            assume_yes: true,
            dest_root: self.dest.path().to_path_buf(),
        }
    }

    /// Import of the source tree into project `study`
    pub fn importer(&self) -> ImporterConfig {
        let mut importer = ImporterConfig::new(self.source.path().to_string_lossy());
        importer.project = Some("study".to_string());
        importer
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(self.store.clone(), self.dest.path())
    }

    pub fn dest_path(&self, path: &str) -> PathBuf {
        self.dest.path().join(path)
    }

    pub fn dest_files(&self) -> Vec<String> {
        files_under(self.dest.path())
    }
}

/// Files below `root` as sorted `/`-separated relative paths
pub fn files_under(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .expect("walked path is below root")
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    files.sort();
    files
}
