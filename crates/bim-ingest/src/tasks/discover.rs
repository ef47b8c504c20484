//! Folder discovery: walk the source tree and enqueue one scan per directory
//!
//! Folder depth `d` below the source root is the `d`-th level of the
//! importer's template. A directory becomes a scan path when it sits at the
//! template's last level, or when it holds files directly.

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use super::{live_ingest, run_task, TaskEnv, TaskOutcome};
use crate::config::ImporterConfig;
use crate::model::{ItemContext, TaskPayload, TaskRecord};
use crate::queue::Task;

pub struct DiscoverTask {
    env: TaskEnv,
    record: TaskRecord,
}

impl DiscoverTask {
    pub fn new(env: TaskEnv, record: TaskRecord) -> Self {
        Self { env, record }
    }

    async fn run(&self) -> anyhow::Result<TaskOutcome> {
        let Some(ingest) = live_ingest(&self.env, &self.record).await? else {
            return Ok(TaskOutcome::aborted());
        };
        let importer = ingest.config.importer_config.clone();
        let root = PathBuf::from(&ingest.fs_path);

        let scanner = importer.scanner.clone();
        let targets =
            tokio::task::spawn_blocking(move || discover_scan_paths(&root, &importer)).await??;

        for (path, context) in &targets {
            let payload = TaskPayload::Scan {
                path: path.clone(),
                scanner: scanner.clone(),
                context: context.clone(),
            };
            self.env.store.insert_task(ingest.id, &payload).await?;
        }

        info!(ingest_id = %ingest.id, scan_tasks = targets.len(), "Discovery finished");
        Ok(TaskOutcome::Complete)
    }
}

#[async_trait]
impl Task for DiscoverTask {
    fn describe(&self) -> String {
        format!("discover ingest {}", self.record.ingest_id)
    }

    async fn execute(self: Box<Self>) {
        run_task(&self.env, &self.record, self.run()).await;
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn has_direct_files(dir: &Path, ignore_dot_files: bool) -> anyhow::Result<bool> {
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() && !(ignore_dot_files && is_hidden(&entry)) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Scan paths below `root` with their template context
///
/// Paths are relative to `root` and use `/` separators.
pub fn discover_scan_paths(
    root: &Path,
    importer: &ImporterConfig,
) -> anyhow::Result<Vec<(String, ItemContext)>> {
    if !root.is_dir() {
        bail!("source folder does not exist: {}", root.display());
    }

    let leaf_depth = importer.template.len();
    let ignore_dot_files = importer.ignore_dot_files;
    let base = ItemContext {
        group: importer.group.clone(),
        project: importer.project.clone(),
        ..Default::default()
    };

    if has_direct_files(root, ignore_dot_files)? {
        warn!(root = %root.display(), "Files directly in the source folder are not imported");
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(leaf_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(ignore_dot_files && is_hidden(entry)));

    let mut targets = Vec::new();
    for entry in walker {
        let entry = entry.context("Failed to walk source folder")?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.depth() < leaf_depth && !has_direct_files(entry.path(), ignore_dot_files)? {
            continue;
        }

        let relative = entry.path().strip_prefix(root)?;
        let components: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();

        let mut context = base.clone();
        for (level, label) in importer.template.iter().zip(&components) {
            context.set_label(*level, label.as_str());
        }
        targets.push((components.join("/"), context));
    }

    Ok(targets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, path: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn importer(root: &Path) -> ImporterConfig {
        let mut config = ImporterConfig::new(root.to_string_lossy());
        config.project = Some("study".into());
        config
    }

    #[test]
    fn test_leaf_directories_become_scan_paths() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-01/ses-01/t1/a.dcm");
        touch(dir.path(), "sub-01/ses-01/t2/b.dcm");
        touch(dir.path(), "sub-02/ses-01/t1/deeper/c.dcm");

        let targets = discover_scan_paths(dir.path(), &importer(dir.path())).unwrap();
        let paths: Vec<&str> = targets.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["sub-01/ses-01/t1", "sub-01/ses-01/t2", "sub-02/ses-01/t1"]);

        let context = &targets[0].1;
        assert_eq!(context.project.as_deref(), Some("study"));
        assert_eq!(context.subject.as_deref(), Some("sub-01"));
        assert_eq!(context.session.as_deref(), Some("ses-01"));
        assert_eq!(context.acquisition.as_deref(), Some("t1"));
    }

    #[test]
    fn test_files_above_leaf_level_get_their_own_scan() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-01/notes.txt");
        touch(dir.path(), "sub-01/ses-01/t1/a.dcm");

        let targets = discover_scan_paths(dir.path(), &importer(dir.path())).unwrap();
        let paths: Vec<&str> = targets.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["sub-01", "sub-01/ses-01/t1"]);
        assert_eq!(targets[0].1.session, None);
    }

    #[test]
    fn test_dot_directories_are_skipped() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), ".cache/ses/acq/a.dcm");
        touch(dir.path(), "sub-01/ses-01/t1/a.dcm");

        let targets = discover_scan_paths(dir.path(), &importer(dir.path())).unwrap();
        assert_eq!(targets.len(), 1);

        let mut config = importer(dir.path());
        config.ignore_dot_files = false;
        let targets = discover_scan_paths(dir.path(), &config).unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(discover_scan_paths(&missing, &importer(&missing)).is_err());
    }

    #[test]
    fn test_empty_tree_has_no_scan_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub-01/ses-01")).unwrap();
        let targets = discover_scan_paths(dir.path(), &importer(dir.path())).unwrap();
        assert!(targets.is_empty());
    }
}
