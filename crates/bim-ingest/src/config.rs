//! Run and importer configuration
//!
//! [`RunConfig`] describes how this process takes part in an ingest (store,
//! worker topology, polling). [`ImporterConfig`] describes what to import; it
//! is serialized into the ingest operation so workers and `watch` read back
//! exactly what the orchestrator was started with.

use bim_common::env;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::model::{ContainerType, PackfileSpec};

// ============================================================================
// Defaults
// ============================================================================

/// Default store when none is configured: a local SQLite file
pub const DEFAULT_DATABASE_URL: &str = "sqlite://bim-ingest.db";

/// Default interval between completion-predicate checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default sleep of an idle worker before probing the queues again
pub const DEFAULT_WORKER_BACKOFF: Duration = Duration::from_secs(1);

/// Where the workers serving an ingest run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTopology {
    /// Workers are started inside the orchestrator process
    #[default]
    Local,
    /// Workers are deployed separately and already running
    Remote,
}

impl FromStr for WorkerTopology {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(WorkerTopology::Local),
            "remote" => Ok(WorkerTopology::Remote),
            other => Err(IngestError::config(format!(
                "Invalid worker topology: {} (expected local or remote)",
                other
            ))),
        }
    }
}

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Store connection string (`sqlite://...` or `postgres://...`)
    pub database_url: String,

    /// Number of workers started by this process
    pub workers: usize,

    /// Whether this orchestrator starts its own workers
    pub topology: WorkerTopology,

    /// Interval between completion-predicate checks
    pub poll_interval: Duration,

    /// Idle worker backoff
    pub worker_backoff: Duration,

    /// Running tasks without a heartbeat for this long are failed
    pub task_lease: Option<Duration>,

    /// Skip the review confirmation prompt
    pub assume_yes: bool,

    /// Root directory of the filesystem destination
    pub dest_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            workers: default_workers(),
            topology: WorkerTopology::Local,
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_backoff: DEFAULT_WORKER_BACKOFF,
            task_lease: None,
            assume_yes: false,
            dest_root: PathBuf::from("./bim-dest"),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RunConfig {
    /// Load configuration from `BIM_*` environment variables
    ///
    /// - `BIM_DATABASE_URL`
    /// - `BIM_WORKERS`
    /// - `BIM_WORKER_TOPOLOGY` (local | remote)
    /// - `BIM_POLL_INTERVAL_MS`
    /// - `BIM_WORKER_BACKOFF_MS`
    /// - `BIM_TASK_LEASE_SECS`
    /// - `BIM_ASSUME_YES`
    /// - `BIM_DEST_ROOT`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_url: env::var("BIM_DATABASE_URL").unwrap_or(defaults.database_url),
            workers: env::parse_or("BIM_WORKERS", defaults.workers)?,
            topology: env::parse_or("BIM_WORKER_TOPOLOGY", defaults.topology)?,
            poll_interval: env::parse::<u64>("BIM_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            worker_backoff: env::parse::<u64>("BIM_WORKER_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_backoff),
            task_lease: env::parse::<u64>("BIM_TASK_LEASE_SECS")?.map(Duration::from_secs),
            assume_yes: env::flag("BIM_ASSUME_YES", defaults.assume_yes)?,
            dest_root: env::var("BIM_DEST_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.dest_root),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestError::config("workers must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(IngestError::config("poll interval must be positive"));
        }
        if matches!(self.task_lease, Some(lease) if lease.is_zero()) {
            return Err(IngestError::config("task lease must be positive"));
        }
        Ok(())
    }

    /// Interval at which running tasks refresh their heartbeat
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.task_lease
            .map(|lease| (lease / 3).max(Duration::from_millis(100)))
    }
}

/// Subject re-coding: map source subject labels to generated codes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectsMappingConfig {
    /// Existing mapping CSV loaded when the ingest is created
    #[serde(default)]
    pub load_from: Option<PathBuf>,

    /// Mapping CSV written when the ingest completes
    #[serde(default)]
    pub save_to: Option<PathBuf>,

    /// Extra columns carried in the mapping CSV
    #[serde(default)]
    pub fields: Vec<String>,

    /// Prefix of generated subject codes
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,
}

fn default_code_prefix() -> String {
    "ex".to_string()
}

/// What to import and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImporterConfig {
    /// Source folder
    pub folder: String,

    /// Fixed group label (otherwise taken from the template)
    #[serde(default)]
    pub group: Option<String>,

    /// Fixed project label (otherwise taken from the template)
    #[serde(default)]
    pub project: Option<String>,

    /// Container level of each folder depth below `folder`
    #[serde(default = "default_template")]
    pub template: Vec<ContainerType>,

    /// Scanner plug-in used for every scan task
    #[serde(default = "default_scanner")]
    pub scanner: String,

    #[serde(default = "default_true")]
    pub ignore_dot_files: bool,

    /// Zip each acquisition into a packfile of this type
    #[serde(default)]
    pub packfile: Option<PackfileSpec>,

    #[serde(default)]
    pub no_audit_log: bool,

    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,

    /// Keep the audit log at `audit_log_path` in addition to uploading it
    #[serde(default)]
    pub save_audit_locally: bool,

    #[serde(default)]
    pub subjects_mapping: Option<SubjectsMappingConfig>,

    /// De-identification log CSV written when the ingest completes
    #[serde(default)]
    pub deid_log_path: Option<PathBuf>,

    /// Private tag definitions CSV loaded when the ingest is created
    #[serde(default)]
    pub private_tags_path: Option<PathBuf>,
}

fn default_template() -> Vec<ContainerType> {
    vec![
        ContainerType::Subject,
        ContainerType::Session,
        ContainerType::Acquisition,
    ]
}

fn default_scanner() -> String {
    "folder".to_string()
}

fn default_true() -> bool {
    true
}

impl ImporterConfig {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            group: None,
            project: None,
            template: default_template(),
            scanner: default_scanner(),
            ignore_dot_files: true,
            packfile: None,
            no_audit_log: false,
            audit_log_path: None,
            save_audit_locally: false,
            subjects_mapping: None,
            deid_log_path: None,
            private_tags_path: None,
        }
    }

    /// Parse a template such as `subject/session/acquisition`
    pub fn parse_template(template: &str) -> Result<Vec<ContainerType>> {
        let levels = template
            .split(['/', ','])
            .filter(|level| !level.trim().is_empty())
            .map(|level| level.trim().parse())
            .collect::<Result<Vec<ContainerType>>>()?;

        if levels.is_empty() {
            return Err(IngestError::config("template must name at least one level"));
        }
        if levels.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(IngestError::config(format!(
                "template levels must descend the hierarchy: {}",
                template
            )));
        }
        Ok(levels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.template.is_empty() {
            return Err(IngestError::config("template must name at least one level"));
        }
        let covers_project = self.project.is_some()
            || self.template.contains(&ContainerType::Project);
        if !covers_project {
            return Err(IngestError::config(
                "a project is required: pass one or include it in the template",
            ));
        }
        if self.group.is_some() && self.template.contains(&ContainerType::Group) {
            return Err(IngestError::config(
                "group is both fixed and part of the template",
            ));
        }
        if self.project.is_some() && self.template.contains(&ContainerType::Project) {
            return Err(IngestError::config(
                "project is both fixed and part of the template",
            ));
        }
        Ok(())
    }
}
