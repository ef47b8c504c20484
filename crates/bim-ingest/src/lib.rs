//! BIM bulk-import ingest pipeline
//!
//! Walks a source folder, groups its files into importable items, gates on
//! operator review, and uploads the items into a destination container
//! hierarchy through a pool of workers fed by persistent task queues.
//!
//! # Pipeline
//!
//! ```text
//! discover task ──▶ scan tasks ──▶ items ──▶ review ──▶ work tasks ──▶ audit log
//! ```
//!
//! The orchestrator ([`BulkImport`]) runs the [`stage`] machine; workers
//! ([`BulkImportExecutor`]) claim tasks from the [`store`]. The store is the
//! only state the two share, so workers can run in the orchestrator process
//! (SQLite) or on separate hosts (PostgreSQL).
//!
//! # Example
//!
//! ```no_run
//! use bim_ingest::{BulkImport, Collaborators, ImporterConfig, RunConfig};
//!
//! # async fn example() -> bim_ingest::Result<()> {
//! let config = RunConfig::from_env()?;
//! let store = bim_ingest::store::connect(&config.database_url).await?;
//! let collaborators = Collaborators::new(store, &config.dest_root);
//!
//! let mut importer = ImporterConfig::new("/data/study");
//! importer.project = Some("study".to_string());
//!
//! let outcome = BulkImport::new(config, importer, collaborators).run().await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bulk_import;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod model;
pub mod prompt;
pub mod queue;
pub mod reporter;
pub mod stage;
pub mod store;
pub mod tabular;
pub mod tasks;
pub mod upload;

pub use bulk_import::{BulkImport, InterruptHandler, RunOutcome};
pub use config::{ImporterConfig, RunConfig, SubjectsMappingConfig, WorkerTopology};
pub use error::{IngestError, Result};
pub use executor::BulkImportExecutor;
pub use model::{IngestItem, IngestOperation, IngestStage, QueueName, TaskStatus};
pub use stage::{Collaborators, RunSignals, StageKind};
pub use store::IngestStore;
