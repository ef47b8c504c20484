//! BIM Ingest - bulk-import command line

use anyhow::{Context, Result};
use bim_common::logging::{init_logging, LogConfig, LogLevel};
use bim_ingest::config::ImporterConfig;
use bim_ingest::model::PackfileSpec;
use bim_ingest::prompt::{AutoConfirm, TerminalPrompt};
use bim_ingest::reporter::TerminalReporter;
use bim_ingest::{
    store, BulkImport, Collaborators, RunConfig, RunOutcome, SubjectsMappingConfig,
    WorkerTopology,
};
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "bim-ingest")]
#[command(author, version, about = "Bulk-import a folder tree into a destination hierarchy")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store connection string (sqlite://... or postgres://...)
    #[arg(long, global = true, env = "BIM_DATABASE_URL")]
    database_url: Option<String>,

    /// Number of workers started by this process
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Where the workers run: local or remote
    #[arg(long, global = true)]
    topology: Option<WorkerTopology>,

    /// Root directory of the destination hierarchy
    #[arg(long, global = true)]
    dest_root: Option<PathBuf>,

    /// Fail running tasks without a heartbeat for this many seconds
    #[arg(long, global = true)]
    task_lease_secs: Option<u64>,

    /// Milliseconds between completion checks
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Skip the review confirmation
    #[arg(short = 'y', long, global = true)]
    yes: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a folder
    Run(RunArgs),

    /// Re-attach to an ingest and resume it from its persisted stage
    Watch {
        /// Ingest id printed by `run`
        ingest_id: Uuid,
    },

    /// Host workers for ingests orchestrated elsewhere
    Worker,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source folder
    folder: PathBuf,

    /// Fixed group label
    #[arg(long)]
    group: Option<String>,

    /// Fixed project label
    #[arg(long)]
    project: Option<String>,

    /// Container level of each folder depth, e.g. subject/session/acquisition
    #[arg(long, default_value = "subject/session/acquisition")]
    template: String,

    /// Scanner plug-in
    #[arg(long, default_value = "folder")]
    scanner: String,

    /// Import dot files and dot directories
    #[arg(long)]
    include_dot_files: bool,

    /// Zip each acquisition into a packfile of this type
    #[arg(long)]
    packfile_type: Option<String>,

    /// Packfile name (defaults to the acquisition folder name)
    #[arg(long, requires = "packfile_type")]
    packfile_name: Option<String>,

    /// Do not write an audit log
    #[arg(long)]
    no_audit_log: bool,

    /// Write the audit log to this path
    #[arg(long, conflicts_with = "no_audit_log")]
    audit_log_path: Option<PathBuf>,

    /// Keep a local copy of the audit log in the working directory
    #[arg(long, conflicts_with = "no_audit_log")]
    save_audit_locally: bool,

    /// Subject mapping CSV to load
    #[arg(long)]
    load_subjects: Option<PathBuf>,

    /// Subject mapping CSV to write when the ingest completes
    #[arg(long)]
    save_subjects: Option<PathBuf>,

    /// Extra subject mapping columns
    #[arg(long, value_delimiter = ',')]
    subject_fields: Vec<String>,

    /// Prefix of generated subject codes
    #[arg(long, default_value = "ex")]
    subject_code_prefix: String,

    /// De-identification log CSV written when the ingest completes
    #[arg(long)]
    deid_log: Option<PathBuf>,

    /// Private tag definitions CSV
    #[arg(long)]
    private_tags: Option<PathBuf>,
}

impl RunArgs {
    fn importer_config(self) -> Result<ImporterConfig> {
        let folder = std::fs::canonicalize(&self.folder)
            .with_context(|| format!("Source folder not found: {}", self.folder.display()))?;

        let mut importer = ImporterConfig::new(folder.to_string_lossy());
        importer.group = self.group;
        importer.project = self.project;
        importer.template = ImporterConfig::parse_template(&self.template)?;
        importer.scanner = self.scanner;
        importer.ignore_dot_files = !self.include_dot_files;
        importer.packfile = self.packfile_type.map(|packfile_type| PackfileSpec {
            packfile_type,
            name: self.packfile_name,
        });
        importer.no_audit_log = self.no_audit_log;
        importer.audit_log_path = self.audit_log_path;
        importer.save_audit_locally = self.save_audit_locally;
        if self.load_subjects.is_some() || self.save_subjects.is_some() {
            importer.subjects_mapping = Some(SubjectsMappingConfig {
                load_from: self.load_subjects,
                save_to: self.save_subjects,
                fields: self.subject_fields,
                code_prefix: self.subject_code_prefix,
            });
        }
        importer.deid_log_path = self.deid_log;
        importer.private_tags_path = self.private_tags;

        importer.validate()?;
        Ok(importer)
    }
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::from_env()?;
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(topology) = self.topology {
            config.topology = topology;
        }
        if let Some(dest_root) = &self.dest_root {
            config.dest_root = dest_root.clone();
        }
        if let Some(secs) = self.task_lease_secs {
            config.task_lease = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        config.assume_yes |= self.yes;
        config.validate()?;
        Ok(config)
    }
}

async fn collaborators(config: &RunConfig) -> Result<Collaborators> {
    let store = store::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open store {}", config.database_url))?;
    let collaborators = Collaborators::new(store.clone(), &config.dest_root);

    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    if interactive {
        Ok(collaborators
            .with_reporter(Arc::new(TerminalReporter::new(store, config.poll_interval)))
            .with_prompt(Arc::new(TerminalPrompt))
            .with_interrupt_prompt(Arc::new(TerminalPrompt)))
    } else {
        // Headless interrupts detach from remote ingests
        Ok(collaborators.with_interrupt_prompt(Arc::new(AutoConfirm(true))))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("bim-ingest")
        .filter_directives("sqlx=warn")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = cli.run_config()?;
    let collaborators = collaborators(&config).await?;

    let result = match cli.command {
        Command::Run(args) => {
            let importer = args.importer_config()?;
            BulkImport::new(config, importer, collaborators).run().await
        }
        Command::Watch { ingest_id } => {
            BulkImport::watcher(config, collaborators)
                .watch(ingest_id)
                .await
        }
        Command::Worker => BulkImport::worker(config, collaborators).run().await,
    };

    match result {
        Ok(RunOutcome::Completed { ingest_id }) => {
            info!(ingest_id = %ingest_id, "Ingest complete");
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Aborted { ingest_id }) => {
            info!(ingest_id = ?ingest_id, "Ingest aborted");
            Ok(ExitCode::from(2))
        }
        Ok(RunOutcome::Detached { ingest_id }) => {
            if let Some(ingest_id) = ingest_id {
                println!("Detached. Re-attach with: bim-ingest watch {}", ingest_id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::WorkersStopped) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Ingest failed");
            Err(e.into())
        }
    }
}
