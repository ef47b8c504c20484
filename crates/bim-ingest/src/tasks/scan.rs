//! Scan tasks and the scanner plug-in registry

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{live_ingest, run_task, TaskEnv, TaskOutcome};
use crate::config::ImporterConfig;
use crate::model::{IngestItem, ItemContext, ItemType, PackfileSpec, TaskRecord};
use crate::queue::Task;

/// One scan path of an ingest
pub struct ScanRequest<'a> {
    pub ingest_id: Uuid,
    /// Source root of the ingest
    pub root: &'a Path,
    /// Scan path relative to `root`
    pub path: &'a str,
    pub context: &'a ItemContext,
    pub importer: &'a ImporterConfig,
}

impl ScanRequest<'_> {
    pub fn dir(&self) -> PathBuf {
        self.root.join(self.path)
    }

    /// Whether the path sits at the template's last level
    pub fn is_leaf(&self) -> bool {
        Path::new(self.path).components().count() >= self.importer.template.len()
    }
}

/// Groups the files of one scan path into ingest items
///
/// Scanners run on a blocking thread.
pub trait Scanner: Send + Sync {
    fn scan(&self, request: &ScanRequest<'_>) -> anyhow::Result<Vec<IngestItem>>;
}

/// Scanners by name
#[derive(Clone, Default)]
pub struct ScannerRegistry {
    scanners: HashMap<String, Arc<dyn Scanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `folder` scanner
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("folder", Arc::new(FolderScanner));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, scanner: Arc<dyn Scanner>) {
        self.scanners.insert(name.into(), scanner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scanner>> {
        self.scanners.get(name).cloned()
    }
}

/// Turns every non-empty scan path into one item
///
/// Leaf paths are scanned recursively; paths above the leaf level only
/// contribute the files they hold directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderScanner;

impl Scanner for FolderScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> anyhow::Result<Vec<IngestItem>> {
        let dir = request.dir();
        let leaf = request.is_leaf();
        let ignore_dot_files = request.importer.ignore_dot_files;

        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(if leaf { usize::MAX } else { 1 })
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(ignore_dot_files && entry.file_name().to_string_lossy().starts_with('.'))
            });

        let mut item = IngestItem::new(request.ingest_id, request.path, request.context.clone());
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry.metadata()?;
            let relative = entry.path().strip_prefix(&dir)?;
            item.files.push(
                relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            );
            item.size += metadata.len() as i64;
            if let Ok(modified) = metadata.modified() {
                let modified = DateTime::<Utc>::from(modified);
                item.mtime = Some(item.mtime.map_or(modified, |mtime| mtime.max(modified)));
            }
        }

        if item.files.is_empty() {
            return Ok(Vec::new());
        }

        if let (Some(spec), true) = (&request.importer.packfile, leaf) {
            let name = spec.name.clone().or_else(|| {
                Path::new(request.path)
                    .file_name()
                    .map(|name| format!("{}.{}", name.to_string_lossy(), spec.packfile_type))
            });
            item.item_type = ItemType::Packfile;
            item.context.packfile = Some(PackfileSpec {
                packfile_type: spec.packfile_type.clone(),
                name,
            });
        }

        Ok(vec![item])
    }
}

pub struct ScanTask {
    env: TaskEnv,
    record: TaskRecord,
    path: String,
    scanner: String,
    context: ItemContext,
}

impl ScanTask {
    pub fn new(
        env: TaskEnv,
        record: TaskRecord,
        path: String,
        scanner: String,
        context: ItemContext,
    ) -> Self {
        Self {
            env,
            record,
            path,
            scanner,
            context,
        }
    }

    async fn run(&self) -> anyhow::Result<TaskOutcome> {
        let Some(ingest) = live_ingest(&self.env, &self.record).await? else {
            return Ok(TaskOutcome::aborted());
        };
        let scanner = self
            .env
            .scanners
            .get(&self.scanner)
            .ok_or_else(|| anyhow!("unknown scanner: {}", self.scanner))?;

        let importer = ingest.config.importer_config.clone();
        let root = PathBuf::from(&ingest.fs_path);
        let path = self.path.clone();
        let context = self.context.clone();
        let ingest_id = ingest.id;

        let mut items = tokio::task::spawn_blocking(move || {
            scanner.scan(&ScanRequest {
                ingest_id,
                root: &root,
                path: &path,
                context: &context,
                importer: &importer,
            })
        })
        .await??;

        if let Some(mapping) = &ingest.config.importer_config.subjects_mapping {
            for item in &mut items {
                if let Some(subject) = item.context.subject.clone() {
                    let code = self
                        .env
                        .store
                        .subject_code(ingest_id, &subject, &mapping.code_prefix)
                        .await?;
                    item.context.subject = Some(code);
                }
            }
        }

        self.env.store.insert_items(&items).await?;
        debug!(ingest_id = %ingest_id, path = %self.path, items = items.len(), "Scanned path");
        Ok(TaskOutcome::Complete)
    }
}

#[async_trait]
impl Task for ScanTask {
    fn describe(&self) -> String {
        format!("{} scan of {}", self.scanner, self.path)
    }

    async fn execute(self: Box<Self>) {
        run_task(&self.env, &self.record, self.run()).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, path: &str, bytes: &[u8]) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn scan(root: &Path, path: &str, importer: &ImporterConfig) -> Vec<IngestItem> {
        FolderScanner
            .scan(&ScanRequest {
                ingest_id: Uuid::new_v4(),
                root,
                path,
                context: &ItemContext::default(),
                importer,
            })
            .unwrap()
    }

    #[test]
    fn test_leaf_scan_is_recursive() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "s1/ses/t1/a.dcm", b"aaaa");
        touch(dir.path(), "s1/ses/t1/echo2/b.dcm", b"bb");
        touch(dir.path(), "s1/ses/t1/.DS_Store", b"junk");

        let importer = ImporterConfig::new(dir.path().to_string_lossy());
        let items = scan(dir.path(), "s1/ses/t1", &importer);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].files, vec!["a.dcm", "echo2/b.dcm"]);
        assert_eq!(items[0].size, 6);
        assert_eq!(items[0].subdir, "s1/ses/t1");
        assert!(items[0].mtime.is_some());
        assert_eq!(items[0].item_type, ItemType::Files);
    }

    #[test]
    fn test_scan_above_leaf_takes_direct_files_only() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "s1/notes.txt", b"n");
        touch(dir.path(), "s1/ses/t1/a.dcm", b"a");

        let importer = ImporterConfig::new(dir.path().to_string_lossy());
        let items = scan(dir.path(), "s1", &importer);
        assert_eq!(items[0].files, vec!["notes.txt"]);
    }

    #[test]
    fn test_empty_directory_yields_no_item() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("s1/ses/t1")).unwrap();
        let importer = ImporterConfig::new(dir.path().to_string_lossy());
        assert!(scan(dir.path(), "s1/ses/t1", &importer).is_empty());
    }

    #[test]
    fn test_packfile_items_at_leaf_level() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "s1/ses/t1/a.dcm", b"a");
        let mut importer = ImporterConfig::new(dir.path().to_string_lossy());
        importer.packfile = Some(PackfileSpec {
            packfile_type: "dicom".into(),
            name: None,
        });

        let items = scan(dir.path(), "s1/ses/t1", &importer);
        assert_eq!(items[0].item_type, ItemType::Packfile);
        assert_eq!(
            items[0].context.packfile.as_ref().unwrap().name.as_deref(),
            Some("t1.dicom")
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ScannerRegistry::with_defaults();
        assert!(registry.get("folder").is_some());
        assert!(registry.get("dicom").is_none());
    }
}
