//! Work tasks: upload one item's files into its resolved target

use anyhow::Context;
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{live_ingest, run_task, TaskEnv, TaskOutcome};
use crate::model::{AuditLogEntry, ContainerRef, IngestItem, ItemType, TaskRecord};
use crate::queue::Task;

pub struct WorkTask {
    env: TaskEnv,
    record: TaskRecord,
    item_id: Uuid,
}

/// Zip `files` (relative to `source_dir`) into a temporary archive
pub fn build_packfile(source_dir: &Path, files: &[String]) -> anyhow::Result<NamedTempFile> {
    let mut archive = NamedTempFile::new().context("Failed to create packfile")?;
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut zip = ZipWriter::new(archive.as_file_mut());
    for name in files {
        let path = source_dir.join(name);
        let mut source =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        zip.start_file(name.as_str(), options)?;
        std::io::copy(&mut source, &mut zip)
            .with_context(|| format!("Failed to pack {}", path.display()))?;
    }
    zip.finish()?;

    Ok(archive)
}

impl WorkTask {
    pub fn new(env: TaskEnv, record: TaskRecord, item_id: Uuid) -> Self {
        Self {
            env,
            record,
            item_id,
        }
    }

    async fn run(&self) -> anyhow::Result<TaskOutcome> {
        let Some(ingest) = live_ingest(&self.env, &self.record).await? else {
            return Ok(TaskOutcome::aborted());
        };
        let mut item = self.env.store.find_item(self.item_id).await?;

        let Some(target) = item.context.target.clone() else {
            let reason = "item has no resolved target container".to_string();
            item.errors.push(reason.clone());
            self.env.store.update_item(&item).await?;
            return Ok(TaskOutcome::Failed(reason));
        };

        let source_dir = Path::new(&ingest.fs_path).join(&item.subdir);
        let entries = match item.item_type {
            ItemType::Files => self.upload_files(&mut item, &target, &source_dir).await,
            ItemType::Packfile => self.upload_packfile(&mut item, &target, &source_dir).await?,
        };

        let failed = entries.iter().filter(|entry| entry.failed).count();
        self.env.store.insert_audit_entries(&entries).await?;

        if failed > 0 {
            self.env.store.update_item(&item).await?;
            return Ok(TaskOutcome::Failed(format!(
                "{} of {} files failed",
                failed,
                entries.len()
            )));
        }

        debug!(item_id = %item.id, files = entries.len(), "Uploaded item");
        Ok(TaskOutcome::Complete)
    }

    async fn upload_files(
        &self,
        item: &mut IngestItem,
        target: &ContainerRef,
        source_dir: &Path,
    ) -> Vec<AuditLogEntry> {
        let mut entries = Vec::with_capacity(item.files.len());

        for name in &item.files {
            let src = source_dir.join(name);
            let entry = match self.env.uploader.upload(target, name, &src).await {
                Ok(dest_path) => self.audit(&src, dest_path, None),
                Err(e) => {
                    warn!(src = %src.display(), error = %e, "File upload failed");
                    item.errors.push(format!("{}: {}", name, e));
                    self.audit(&src, format!("{}/{}", target.id, name), Some(e.to_string()))
                }
            };
            entries.push(entry);
        }

        entries
    }

    async fn upload_packfile(
        &self,
        item: &mut IngestItem,
        target: &ContainerRef,
        source_dir: &Path,
    ) -> anyhow::Result<Vec<AuditLogEntry>> {
        let spec = item.context.packfile.clone().unwrap_or_default();
        let name = format!(
            "{}.zip",
            spec.name.unwrap_or_else(|| format!("{}.{}", item.id, spec.packfile_type))
        );

        let dir = source_dir.to_path_buf();
        let files = item.files.clone();
        let packed = tokio::task::spawn_blocking(move || build_packfile(&dir, &files)).await?;

        let result = match packed {
            Ok(archive) => self
                .env
                .uploader
                .upload(target, &name, archive.path())
                .await
                .map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        let sources: Vec<PathBuf> = item.files.iter().map(|file| source_dir.join(file)).collect();
        let entries = match result {
            Ok(dest_path) => sources
                .iter()
                .map(|src| self.audit(src, dest_path.clone(), None))
                .collect(),
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(packfile = %name, error = %message, "Packfile upload failed");
                item.errors.push(format!("{}: {}", name, message));
                let dest_path = format!("{}/{}", target.id, name);
                sources
                    .iter()
                    .map(|src| self.audit(src, dest_path.clone(), Some(message.clone())))
                    .collect()
            }
        };

        Ok(entries)
    }

    fn audit(&self, src: &Path, dest_path: String, error: Option<String>) -> AuditLogEntry {
        AuditLogEntry {
            ingest_id: self.record.ingest_id,
            src_path: src.display().to_string(),
            dest_path,
            failed: error.is_some(),
            message: error,
        }
    }
}

#[async_trait]
impl Task for WorkTask {
    fn describe(&self) -> String {
        format!("work on item {}", self.item_id)
    }

    async fn execute(self: Box<Self>) {
        run_task(&self.env, &self.record, self.run()).await;
    }
}
