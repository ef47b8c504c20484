//! Upload into resolved destination containers

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::model::ContainerRef;

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `local_path` as `name` into `container`; returns the
    /// destination path of the uploaded file
    async fn upload(&self, container: &ContainerRef, name: &str, local_path: &Path)
        -> Result<String>;
}

/// Copies files into container directories below a destination root
#[derive(Debug, Clone)]
pub struct FsUploader {
    root: PathBuf,
}

impl FsUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Reject names that would escape the container directory
fn checked_name(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(path)
    } else {
        Err(IngestError::upload(format!("invalid file name: {}", name)))
    }
}

#[async_trait]
impl Uploader for FsUploader {
    async fn upload(
        &self,
        container: &ContainerRef,
        name: &str,
        local_path: &Path,
    ) -> Result<String> {
        let container_dir = self.root.join(&container.id);
        if !tokio::fs::try_exists(&container_dir).await? {
            return Err(IngestError::upload(format!(
                "{} '{}' does not exist",
                container.container_type, container.label
            )));
        }

        let dest = container_dir.join(checked_name(name)?);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(local_path, &dest).await.map_err(|e| {
            IngestError::upload(format!("{}: {}", local_path.display(), e))
        })?;

        debug!(dest = %dest.display(), bytes, "Uploaded file");
        Ok(format!("{}/{}", container.id, name))
    }
}
