//! Durable records shared between the orchestrator and the workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::ImporterConfig;
use crate::error::IngestError;

/// Persisted stage of an ingest operation
///
/// This is the durable checkpoint `watch` resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Scan,
    Review,
    Processing,
    Complete,
    Aborted,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Scan => "scan",
            IngestStage::Review => "review",
            IngestStage::Processing => "processing",
            IngestStage::Complete => "complete",
            IngestStage::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestStage::Complete | IngestStage::Aborted)
    }

    fn rank(&self) -> u8 {
        match self {
            IngestStage::Scan => 0,
            IngestStage::Review => 1,
            IngestStage::Processing => 2,
            IngestStage::Complete | IngestStage::Aborted => 3,
        }
    }

    /// Stages only move forward, and a terminal stage is final.
    /// Re-writing the current stage is allowed.
    pub fn can_move_to(&self, next: IngestStage) -> bool {
        *self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl FromStr for IngestStage {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(IngestStage::Scan),
            "review" => Ok(IngestStage::Review),
            "processing" => Ok(IngestStage::Processing),
            "complete" => Ok(IngestStage::Complete),
            "aborted" => Ok(IngestStage::Aborted),
            other => Err(IngestError::InvalidStage(other.to_string())),
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level of the destination container hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Group,
    Project,
    Subject,
    Session,
    Acquisition,
}

impl ContainerType {
    pub const ALL: [ContainerType; 5] = [
        ContainerType::Group,
        ContainerType::Project,
        ContainerType::Subject,
        ContainerType::Session,
        ContainerType::Acquisition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Group => "group",
            ContainerType::Project => "project",
            ContainerType::Subject => "subject",
            ContainerType::Session => "session",
            ContainerType::Acquisition => "acquisition",
        }
    }
}

impl FromStr for ContainerType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "group" => Ok(ContainerType::Group),
            "project" => Ok(ContainerType::Project),
            "subject" => Ok(ContainerType::Subject),
            "session" => Ok(ContainerType::Session),
            "acquisition" => Ok(ContainerType::Acquisition),
            other => Err(IngestError::config(format!(
                "Unknown container level: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a resolved destination container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_type: ContainerType,
    pub id: String,
    pub label: String,
}

/// Configuration blob materialized on the ingest operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub importer_config: ImporterConfig,
    #[serde(default)]
    pub target_project: Option<ContainerRef>,
}

/// One bulk-import run (maps to the ingest_operations table)
#[derive(Debug, Clone)]
pub struct IngestOperation {
    pub id: Uuid,
    pub name: String,
    pub fs_path: String,
    pub config: IngestConfig,
    pub stage: IngestStage,
    pub created_at: DateTime<Utc>,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
}

impl IngestOperation {
    pub fn new(name: impl Into<String>, importer_config: ImporterConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            fs_path: importer_config.folder.clone(),
            config: IngestConfig {
                importer_config,
                target_project: None,
            },
            stage: IngestStage::Scan,
            created_at: Utc::now(),
            processing_start: None,
            processing_end: None,
        }
    }
}

/// Partial update of an ingest operation; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct IngestUpdate {
    pub stage: Option<IngestStage>,
    pub config: Option<IngestConfig>,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
}

impl IngestUpdate {
    pub fn stage(stage: IngestStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Files,
    Packfile,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Files => "files",
            ItemType::Packfile => "packfile",
        }
    }
}

impl From<String> for ItemType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "packfile" => ItemType::Packfile,
            _ => ItemType::Files,
        }
    }
}

/// Packfile request: the item's files are zipped into one archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackfileSpec {
    pub packfile_type: String,
    pub name: Option<String>,
}

/// Destination hints for an item
///
/// Container labels come from the folder template; `target` is written
/// during review once the destination is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packfile: Option<PackfileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ContainerRef>,
}

impl ItemContext {
    pub fn label(&self, level: ContainerType) -> Option<&str> {
        match level {
            ContainerType::Group => self.group.as_deref(),
            ContainerType::Project => self.project.as_deref(),
            ContainerType::Subject => self.subject.as_deref(),
            ContainerType::Session => self.session.as_deref(),
            ContainerType::Acquisition => self.acquisition.as_deref(),
        }
    }

    pub fn set_label(&mut self, level: ContainerType, label: impl Into<String>) {
        let label = Some(label.into());
        match level {
            ContainerType::Group => self.group = label,
            ContainerType::Project => self.project = label,
            ContainerType::Subject => self.subject = label,
            ContainerType::Session => self.session = label,
            ContainerType::Acquisition => self.acquisition = label,
        }
    }
}

/// One discovered unit of import work (maps to the ingest_items table)
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub id: Uuid,
    pub ingest_id: Uuid,
    /// Source directory relative to the ingest's `fs_path`
    pub subdir: String,
    /// File paths relative to `subdir`
    pub files: Vec<String>,
    pub size: i64,
    pub mtime: Option<DateTime<Utc>>,
    pub item_type: ItemType,
    pub context: ItemContext,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl IngestItem {
    pub fn new(ingest_id: Uuid, subdir: impl Into<String>, context: ItemContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            ingest_id,
            subdir: subdir.into(),
            files: Vec::new(),
            size: 0,
            mtime: None,
            item_type: ItemType::Files,
            context,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Named persistent task queues, in scheduling priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Discover,
    Scan,
    Work,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Discover, QueueName::Scan, QueueName::Work];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Discover => "discover",
            QueueName::Scan => "scan",
            QueueName::Work => "work",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status; transitions are monotone: waiting -> running -> complete | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(IngestError::InvalidTaskStatus(other.to_string())),
        }
    }
}

/// Typed task payload; the variant decides which queue the task lives on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Discover,
    Scan {
        path: String,
        scanner: String,
        context: ItemContext,
    },
    Work {
        item_id: Uuid,
    },
}

impl TaskPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            TaskPayload::Discover => QueueName::Discover,
            TaskPayload::Scan { .. } => QueueName::Scan,
            TaskPayload::Work { .. } => QueueName::Work,
        }
    }
}

/// Queued task record (maps to the tasks table)
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub ingest_id: Uuid,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-status task counts for one queue of one ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub running: u64,
    pub complete: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Waiting => self.waiting += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Complete => self.complete += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.running + self.complete + self.failed
    }

    pub fn finished(&self) -> u64 {
        self.complete + self.failed
    }

    /// No task is waiting or running
    pub fn is_drained(&self) -> bool {
        self.waiting == 0 && self.running == 0
    }
}

/// Per-file outcome written by work tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub ingest_id: Uuid,
    pub src_path: String,
    pub dest_path: String,
    pub failed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectMap {
    pub ingest_id: Uuid,
    pub subject_id: String,
    pub subject_code: String,
    pub field_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeidLogEntry {
    pub ingest_id: Uuid,
    pub path: String,
    pub log_type: String,
    pub field_values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateTag {
    pub ingest_id: Uuid,
    pub private_creator: String,
    pub tag: String,
    pub vr: String,
    pub description: String,
    pub vm: String,
}

/// Aggregate over an ingest's items, shown at the review gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemSummary {
    pub items: u64,
    pub files: u64,
    pub bytes: u64,
    pub packfiles: u64,
    pub with_errors: u64,
}

impl ItemSummary {
    pub fn from_items(items: &[IngestItem]) -> Self {
        items.iter().fold(Self::default(), |mut summary, item| {
            summary.items += 1;
            summary.files += item.files.len() as u64;
            summary.bytes += item.size.max(0) as u64;
            if item.item_type == ItemType::Packfile {
                summary.packfiles += 1;
            }
            if !item.errors.is_empty() {
                summary.with_errors += 1;
            }
            summary
        })
    }
}
