//! Destination container hierarchy
//!
//! The resolver maps an item's context onto the destination hierarchy
//! (group / project / subject / session / acquisition). Resolution only
//! records nodes; nothing is created until [`ContainerResolver::create_containers`]
//! runs after the operator confirmed the import.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::model::{ContainerRef, ContainerType, ItemContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerNode {
    pub container_type: ContainerType,
    /// Path of the container below the destination root
    pub id: String,
    pub label: String,
    pub exists: bool,
}

impl ContainerNode {
    pub fn to_ref(&self) -> ContainerRef {
        ContainerRef {
            container_type: self.container_type,
            id: self.id.clone(),
            label: self.label.clone(),
        }
    }
}

/// Existing and to-be-created containers per level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelCount {
    pub existing: u64,
    pub new: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub levels: BTreeMap<ContainerType, LevelCount>,
}

impl ContainerSummary {
    pub fn new_containers(&self) -> u64 {
        self.levels.values().map(|count| count.new).sum()
    }
}

#[async_trait]
pub trait ContainerResolver: Send + Sync {
    /// Deepest container for `context`, or `None` when the context does not
    /// describe a valid destination
    async fn resolve(&self, context: &ItemContext) -> Result<Option<ContainerNode>>;

    /// Create every resolved container that does not exist yet
    async fn create_containers(&self) -> Result<u64>;

    fn first_project(&self) -> Option<ContainerNode>;

    fn summary(&self) -> ContainerSummary;
}

/// Container hierarchy materialized as directories below `root`
#[derive(Debug)]
pub struct FsContainerFactory {
    root: PathBuf,
    nodes: Mutex<Vec<ContainerNode>>,
}

impl FsContainerFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            nodes: Mutex::new(Vec::new()),
        }
    }

    fn nodes(&self) -> Result<std::sync::MutexGuard<'_, Vec<ContainerNode>>> {
        self.nodes
            .lock()
            .map_err(|_| IngestError::config("container registry lock poisoned"))
    }
}

/// Directory name for a label, or `None` when the label cannot name one
fn segment(label: &str) -> Option<String> {
    let segment = label.trim().replace(['/', '\\'], "_");
    match segment.as_str() {
        "" | "." | ".." => None,
        _ => Some(segment),
    }
}

/// Levels present in `context` as (type, label, id) triples
///
/// Group is optional; project is required; below project the levels must be
/// contiguous.
fn chain(context: &ItemContext) -> Option<Vec<(ContainerType, String, String)>> {
    let mut chain = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut ended = false;

    for level in ContainerType::ALL {
        match context.label(level) {
            Some(label) => {
                if ended {
                    return None;
                }
                path.push(segment(label)?);
                chain.push((level, label.to_string(), path.join("/")));
            }
            None if level == ContainerType::Group => {}
            None if level == ContainerType::Project => return None,
            None => ended = true,
        }
    }

    Some(chain)
}

#[async_trait]
impl ContainerResolver for FsContainerFactory {
    async fn resolve(&self, context: &ItemContext) -> Result<Option<ContainerNode>> {
        let Some(chain) = chain(context) else {
            return Ok(None);
        };

        let mut deepest = None;
        for (container_type, label, id) in chain {
            let known = self.nodes()?.iter().find(|node| node.id == id).cloned();
            let node = match known {
                Some(node) => node,
                None => {
                    let exists = tokio::fs::try_exists(self.root.join(&id)).await?;
                    let node = ContainerNode {
                        container_type,
                        id,
                        label,
                        exists,
                    };
                    let mut nodes = self.nodes()?;
                    if !nodes.iter().any(|known| known.id == node.id) {
                        nodes.push(node.clone());
                    }
                    node
                }
            };
            deepest = Some(node);
        }

        Ok(deepest)
    }

    async fn create_containers(&self) -> Result<u64> {
        let pending: Vec<String> = self
            .nodes()?
            .iter()
            .filter(|node| !node.exists)
            .map(|node| node.id.clone())
            .collect();

        for id in &pending {
            tokio::fs::create_dir_all(self.root.join(id)).await?;
            debug!(container = %id, "Created container");
        }

        let mut nodes = self.nodes()?;
        for node in nodes.iter_mut().filter(|node| pending.contains(&node.id)) {
            node.exists = true;
        }
        info!(created = pending.len(), "Created destination containers");
        Ok(pending.len() as u64)
    }

    fn first_project(&self) -> Option<ContainerNode> {
        self.nodes
            .lock()
            .ok()?
            .iter()
            .find(|node| node.container_type == ContainerType::Project)
            .cloned()
    }

    fn summary(&self) -> ContainerSummary {
        let mut summary = ContainerSummary::default();
        if let Ok(nodes) = self.nodes.lock() {
            for node in nodes.iter() {
                let count = summary.levels.entry(node.container_type).or_default();
                if node.exists {
                    count.existing += 1;
                } else {
                    count.new += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(project: Option<&str>, subject: Option<&str>, session: Option<&str>) -> ItemContext {
        ItemContext {
            group: Some("lab".into()),
            project: project.map(String::from),
            subject: subject.map(String::from),
            session: session.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_records_without_creating() {
        let dest = TempDir::new().unwrap();
        let factory = FsContainerFactory::new(dest.path());

        let node = factory
            .resolve(&context(Some("study"), Some("sub-01"), Some("ses-01")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.container_type, ContainerType::Session);
        assert_eq!(node.id, "lab/study/sub-01/ses-01");
        assert!(!node.exists);
        assert!(!dest.path().join("lab").exists());

        let summary = factory.summary();
        assert_eq!(summary.new_containers(), 4);
        assert_eq!(factory.first_project().unwrap().label, "study");
    }

    #[tokio::test]
    async fn test_create_containers_materializes_nodes() {
        let dest = TempDir::new().unwrap();
        std::fs::create_dir_all(dest.path().join("lab/study")).unwrap();
        let factory = FsContainerFactory::new(dest.path());
        factory
            .resolve(&context(Some("study"), Some("sub-01"), None))
            .await
            .unwrap();

        let summary = factory.summary();
        assert_eq!(summary.levels[&ContainerType::Project].existing, 1);
        assert_eq!(summary.levels[&ContainerType::Subject].new, 1);

        assert_eq!(factory.create_containers().await.unwrap(), 1);
        assert!(dest.path().join("lab/study/sub-01").is_dir());
        assert_eq!(factory.summary().new_containers(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_contexts() {
        let dest = TempDir::new().unwrap();
        let factory = FsContainerFactory::new(dest.path());

        // No project.
        assert!(factory
            .resolve(&context(None, Some("sub-01"), None))
            .await
            .unwrap()
            .is_none());
        // Session without subject.
        assert!(factory
            .resolve(&context(Some("study"), None, Some("ses-01")))
            .await
            .unwrap()
            .is_none());
        // Label that cannot name a directory.
        assert!(factory
            .resolve(&context(Some(".."), None, None))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_segment_replaces_separators() {
        assert_eq!(segment("a/b").as_deref(), Some("a_b"));
        assert_eq!(segment("  x "), Some("x".to_string()));
        assert_eq!(segment(""), None);
    }
}
