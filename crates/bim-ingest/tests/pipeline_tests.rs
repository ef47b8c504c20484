//! End-to-end pipeline tests
//!
//! Each test drives a full run against a temporary source tree, an
//! in-memory SQLite store and a filesystem destination.

mod helpers;

use async_trait::async_trait;
use bim_ingest::config::WorkerTopology;
use bim_ingest::model::{ContainerRef, IngestItem, ItemContext, QueueName};
use bim_ingest::prompt::AutoConfirm;
use bim_ingest::tasks::{ScanRequest, Scanner, ScannerRegistry};
use bim_ingest::upload::{FsUploader, Uploader};
use bim_ingest::{BulkImport, IngestError, IngestStage, RunOutcome};
use helpers::{files_under, TestEnv, TEST_TIMEOUT};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

async fn run(import: &mut BulkImport) -> RunOutcome {
    tokio::time::timeout(TEST_TIMEOUT, import.run())
        .await
        .expect("run timed out")
        .expect("run failed")
}

fn read_audit_log(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("Failed to read audit log")
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_lands_files_and_writes_audit_log() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");
    env.touch("sub-01/ses-01/t1/echo2/b.dcm", b"second");
    env.touch("sub-02/ses-01/t2/c.dcm", b"third");

    let audit_path = env.source.path().join("audit.csv");
    let mut importer = env.importer();
    importer.audit_log_path = Some(audit_path.clone());

    let mut import = BulkImport::new(env.config(), importer, env.collaborators())
        .without_interrupt_handler();
    let outcome = run(&mut import).await;

    let RunOutcome::Completed { ingest_id } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };

    let landed: Vec<String> = env
        .dest_files()
        .into_iter()
        .filter(|path| !path.contains("audit_log-"))
        .collect();
    assert_eq!(
        landed,
        vec![
            "study/sub-01/ses-01/t1/a.dcm",
            "study/sub-01/ses-01/t1/echo2/b.dcm",
            "study/sub-02/ses-01/t2/c.dcm",
        ]
    );
    assert_eq!(
        std::fs::read(env.dest_path("study/sub-01/ses-01/t1/echo2/b.dcm")).unwrap(),
        b"second"
    );

    let ingest = env.store.find_ingest(ingest_id).await.unwrap();
    assert_eq!(ingest.stage, IngestStage::Complete);
    assert!(ingest.processing_start.is_some());
    assert!(ingest.processing_end.is_some());
    assert_eq!(
        ingest.config.target_project.as_ref().map(|project| project.id.as_str()),
        Some("study")
    );

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!((work.complete, work.failed, work.total()), (2, 0, 2));

    let audit = read_audit_log(&audit_path);
    assert_eq!(audit[0], "Source Path,Destination Path,Failed,Message");
    assert_eq!(audit.len(), 4);
    assert!(audit
        .iter()
        .any(|line| line.ends_with("study/sub-02/ses-01/t2/c.dcm,false,")));

    let uploaded_logs: Vec<String> = files_under(&env.dest_path("study"))
        .into_iter()
        .filter(|path| path.starts_with("audit_log-") && path.ends_with(".csv"))
        .collect();
    assert_eq!(uploaded_logs.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_items_complete_without_work_tasks() {
    let env = TestEnv::new().await;
    env.mkdir("sub-01/ses-01");

    let audit_path = env.source.path().join("audit.csv");
    let mut importer = env.importer();
    importer.audit_log_path = Some(audit_path.clone());

    let mut import = BulkImport::new(env.config(), importer, env.collaborators())
        .without_interrupt_handler();
    let outcome = run(&mut import).await;

    let RunOutcome::Completed { ingest_id } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!(work.total(), 0);
    assert!(env.store.items_for_ingest(ingest_id).await.unwrap().is_empty());
    assert_eq!(
        read_audit_log(&audit_path),
        vec!["Source Path,Destination Path,Failed,Message"]
    );
    assert!(env.dest_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_withheld_confirmation_aborts_without_creating_containers() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");

    let mut config = env.config();
    config.assume_yes = false;
    let collaborators = env.collaborators().with_prompt(Arc::new(AutoConfirm(false)));

    let mut import =
        BulkImport::new(config, env.importer(), collaborators).without_interrupt_handler();
    let outcome = run(&mut import).await;

    let RunOutcome::Aborted {
        ingest_id: Some(ingest_id),
    } = outcome
    else {
        panic!("expected abort, got {:?}", outcome);
    };

    let ingest = env.store.find_ingest(ingest_id).await.unwrap();
    assert_eq!(ingest.stage, IngestStage::Aborted);
    assert!(ingest.config.target_project.is_none());

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!(work.total(), 0);
    assert!(std::fs::read_dir(env.dest.path()).unwrap().next().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_confirmed_prompt_proceeds() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");

    let mut config = env.config();
    config.assume_yes = false;
    let collaborators = env.collaborators().with_prompt(Arc::new(AutoConfirm(true)));

    let mut import =
        BulkImport::new(config, env.importer(), collaborators).without_interrupt_handler();
    let outcome = run(&mut import).await;

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert!(env.dest_path("study/sub-01/ses-01/t1/a.dcm").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_before_start_never_creates_an_ingest() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");

    let mut import = BulkImport::new(env.config(), env.importer(), env.collaborators())
        .without_interrupt_handler();
    import.abort();
    import.abort();

    let outcome = run(&mut import).await;
    assert_eq!(outcome, RunOutcome::Aborted { ingest_id: None });
    assert!(env.dest_files().is_empty());
}

/// Scanner that takes a while, so the run can be interrupted mid-scan
struct SlowScanner {
    delay: Duration,
}

impl Scanner for SlowScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> anyhow::Result<Vec<IngestItem>> {
        std::thread::sleep(self.delay);
        let mut item = IngestItem::new(request.ingest_id, request.path, request.context.clone());
        item.files.push("a.dcm".to_string());
        Ok(vec![item])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_mid_scan_leaves_no_running_tasks() {
    let env = TestEnv::new().await;
    for subject in ["sub-01", "sub-02", "sub-03", "sub-04"] {
        env.touch(&format!("{}/ses-01/t1/a.dcm", subject), b"x");
    }

    let mut scanners = ScannerRegistry::with_defaults();
    scanners.register(
        "slow",
        Arc::new(SlowScanner {
            delay: Duration::from_millis(150),
        }),
    );
    let mut importer = env.importer();
    importer.scanner = "slow".to_string();

    let mut import = BulkImport::new(
        env.config(),
        importer,
        env.collaborators().with_scanners(scanners),
    )
    .without_interrupt_handler();

    let signals = import.signals();
    let store = env.store.clone();
    tokio::spawn(async move {
        loop {
            if let Some(ingest_id) = signals.ingest_id() {
                let scan = store.queue_counts(ingest_id, QueueName::Scan).await;
                if scan.map(|counts| counts.running > 0).unwrap_or(false) {
                    signals.abort();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let outcome = run(&mut import).await;
    let RunOutcome::Aborted {
        ingest_id: Some(ingest_id),
    } = outcome
    else {
        panic!("expected abort, got {:?}", outcome);
    };

    let ingest = env.store.find_ingest(ingest_id).await.unwrap();
    assert_eq!(ingest.stage, IngestStage::Aborted);

    for queue in QueueName::ALL {
        let counts = env.store.queue_counts(ingest_id, queue).await.unwrap();
        assert_eq!(counts.running, 0, "{} task left running", queue);
    }
    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!(work.total(), 0);
    assert!(env.dest_files().is_empty());
}

/// Uploader that rejects one file name
struct RejectingUploader {
    inner: FsUploader,
    reject: &'static str,
}

#[async_trait]
impl Uploader for RejectingUploader {
    async fn upload(
        &self,
        container: &ContainerRef,
        name: &str,
        local_path: &Path,
    ) -> bim_ingest::Result<String> {
        if name.ends_with(self.reject) {
            return Err(IngestError::upload("quota exceeded"));
        }
        self.inner.upload(container, name, local_path).await
    }
}

/// Uploader that holds every file for a while before landing it
struct SlowUploader {
    inner: FsUploader,
    delay: Duration,
}

#[async_trait]
impl Uploader for SlowUploader {
    async fn upload(
        &self,
        container: &ContainerRef,
        name: &str,
        local_path: &Path,
    ) -> bim_ingest::Result<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.upload(container, name, local_path).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_mid_process_audits_in_flight_uploads() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");
    env.touch("sub-02/ses-01/t1/b.dcm", b"second");

    let audit_path = env.source.path().join("audit.csv");
    let mut importer = env.importer();
    importer.audit_log_path = Some(audit_path.clone());

    let mut collaborators = env.collaborators();
    collaborators.uploader = Arc::new(SlowUploader {
        inner: FsUploader::new(env.dest.path()),
        delay: Duration::from_millis(400),
    });

    let mut import =
        BulkImport::new(env.config(), importer, collaborators).without_interrupt_handler();
    let signals = import.signals();
    let store = env.store.clone();
    let aborter = tokio::spawn(async move {
        loop {
            if let Some(ingest_id) = signals.ingest_id() {
                let work = store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
                if work.running > 0 {
                    signals.abort();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let outcome = run(&mut import).await;
    aborter.await.unwrap();
    let RunOutcome::Aborted {
        ingest_id: Some(ingest_id),
    } = outcome
    else {
        panic!("expected abort, got {:?}", outcome);
    };

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!(work.running, 0);

    let stored = env.store.audit_entries(ingest_id).await.unwrap();
    assert!(!stored.is_empty());
    let audit = read_audit_log(&audit_path);
    assert_eq!(audit.len() - 1, stored.len());
    let landed = env
        .dest_files()
        .into_iter()
        .filter(|path| !path.contains("audit_log-"))
        .count();
    assert_eq!(landed, stored.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_upload_is_recorded_without_halting_the_batch() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"ok");
    env.touch("sub-01/ses-01/t1/b.dcm", b"rejected");
    env.touch("sub-02/ses-01/t1/c.dcm", b"ok");

    let mut collaborators = env.collaborators();
    collaborators.uploader = Arc::new(RejectingUploader {
        inner: FsUploader::new(env.dest.path()),
        reject: "b.dcm",
    });

    let mut import = BulkImport::new(env.config(), env.importer(), collaborators)
        .without_interrupt_handler();
    let outcome = run(&mut import).await;
    let RunOutcome::Completed { ingest_id } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!((work.complete, work.failed), (1, 1));

    let audit = env.store.audit_entries(ingest_id).await.unwrap();
    assert_eq!(audit.len(), 3);
    let failed: Vec<_> = audit.iter().filter(|entry| entry.failed).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].src_path.ends_with("b.dcm"));
    assert_eq!(failed[0].message.as_deref(), Some("Upload error: quota exceeded"));

    let items = env.store.items_for_ingest(ingest_id).await.unwrap();
    let broken = items
        .iter()
        .find(|item| item.subdir == "sub-01/ses-01/t1")
        .unwrap();
    assert_eq!(broken.errors.len(), 1);
    assert!(env.dest_path("study/sub-02/ses-01/t1/c.dcm").exists());
}

/// Scanner that yields one item without any destination hints
struct OrphanScanner;

impl Scanner for OrphanScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> anyhow::Result<Vec<IngestItem>> {
        let mut item = IngestItem::new(request.ingest_id, request.path, ItemContext::default());
        item.files.push("a.dcm".to_string());
        Ok(vec![item])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unresolved_items_are_excluded_from_processing() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"x");

    let mut scanners = ScannerRegistry::with_defaults();
    scanners.register("orphan", Arc::new(OrphanScanner));
    let mut importer = env.importer();
    importer.scanner = "orphan".to_string();

    let mut import = BulkImport::new(
        env.config(),
        importer,
        env.collaborators().with_scanners(scanners),
    )
    .without_interrupt_handler();
    let outcome = run(&mut import).await;
    let RunOutcome::Completed { ingest_id } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };

    let items = env.store.items_for_ingest(ingest_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].errors, vec!["could not determine the target container"]);
    assert!(items[0].context.target.is_none());

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!(work.total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_packfile_items_upload_one_archive() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");
    env.touch("sub-01/ses-01/t1/b.dcm", b"second");

    let mut importer = env.importer();
    importer.no_audit_log = true;
    importer.packfile = Some(bim_ingest::model::PackfileSpec {
        packfile_type: "dicom".to_string(),
        name: None,
    });

    let mut import = BulkImport::new(env.config(), importer, env.collaborators())
        .without_interrupt_handler();
    let outcome = run(&mut import).await;
    let RunOutcome::Completed { ingest_id } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };

    assert_eq!(env.dest_files(), vec!["study/sub-01/ses-01/t1/t1.dicom.zip"]);
    let audit = env.store.audit_entries(ingest_id).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert!(audit
        .iter()
        .all(|entry| entry.dest_path == "study/sub-01/ses-01/t1/t1.dicom.zip"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subject_mapping_recodes_subjects() {
    let env = TestEnv::new().await;
    env.touch("pat-7/ses-01/t1/a.dcm", b"x");
    env.touch("pat-9/ses-01/t1/b.dcm", b"y");

    // Files in the source root are not imported
    let mapping_in = env.source.path().join("mapping-in.csv");
    std::fs::write(&mapping_in, "SubjectId,SubjectCode\npat-9,ex0042\n").unwrap();
    let mapping_out = env.source.path().join("mapping-out.csv");

    let mut importer = env.importer();
    importer.no_audit_log = true;
    importer.subjects_mapping = Some(bim_ingest::SubjectsMappingConfig {
        load_from: Some(mapping_in.clone()),
        save_to: Some(mapping_out.clone()),
        fields: Vec::new(),
        code_prefix: "ex".to_string(),
    });

    let mut import = BulkImport::new(env.config(), importer, env.collaborators())
        .without_interrupt_handler();
    let outcome = run(&mut import).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let landed = env.dest_files();
    assert!(landed.contains(&"study/ex0042/ses-01/t1/b.dcm".to_string()));
    assert!(landed
        .iter()
        .any(|path| path.ends_with("/ses-01/t1/a.dcm") && !path.contains("pat-7")));

    let saved = std::fs::read_to_string(&mapping_out).unwrap();
    assert!(saved.starts_with("SubjectId,SubjectCode\n"));
    assert!(saved.contains("pat-9,ex0042"));
    assert!(saved.contains("pat-7,"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sparse_loaded_mapping_keeps_every_subject() {
    let env = TestEnv::new().await;
    env.touch("pat-7/ses-01/t1/a.dcm", b"x");
    env.touch("pat-9/ses-01/t1/b.dcm", b"y");

    let mapping_in = env.source.path().join("mapping-in.csv");
    std::fs::write(&mapping_in, "SubjectId,SubjectCode\npat-9,ex0002\n").unwrap();

    let mut importer = env.importer();
    importer.no_audit_log = true;
    importer.subjects_mapping = Some(bim_ingest::SubjectsMappingConfig {
        load_from: Some(mapping_in),
        save_to: None,
        fields: Vec::new(),
        code_prefix: "ex".to_string(),
    });

    let mut import = BulkImport::new(env.config(), importer, env.collaborators())
        .without_interrupt_handler();
    let RunOutcome::Completed { ingest_id } = run(&mut import).await else {
        panic!("expected completion");
    };

    assert_eq!(
        env.dest_files(),
        vec!["study/ex0002/ses-01/t1/b.dcm", "study/ex0003/ses-01/t1/a.dcm"]
    );
    let scan = env.store.queue_counts(ingest_id, QueueName::Scan).await.unwrap();
    assert_eq!(scan.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_persisted_by_another_controller_stops_the_run() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"x");

    // No workers anywhere: the run waits on discovery
    let mut config = env.config();
    config.topology = WorkerTopology::Remote;

    let mut import = BulkImport::new(config, env.importer(), env.collaborators())
        .without_interrupt_handler();
    let signals = import.signals();
    let store = env.store.clone();
    let other_controller = tokio::spawn(async move {
        let ingest_id = loop {
            if let Some(ingest_id) = signals.ingest_id() {
                break ingest_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        store
            .update_ingest(
                ingest_id,
                bim_ingest::model::IngestUpdate::stage(IngestStage::Aborted),
            )
            .await
            .unwrap();
    });

    let outcome = run(&mut import).await;
    other_controller.await.unwrap();

    let RunOutcome::Aborted {
        ingest_id: Some(ingest_id),
    } = outcome
    else {
        panic!("expected abort, got {:?}", outcome);
    };
    let ingest = env.store.find_ingest(ingest_id).await.unwrap();
    assert_eq!(ingest.stage, IngestStage::Aborted);
    assert!(env.dest_files().is_empty());

    // A finished abort is final
    let reopened = env
        .store
        .update_ingest(
            ingest_id,
            bim_ingest::model::IngestUpdate::stage(IngestStage::Complete),
        )
        .await;
    assert!(matches!(reopened, Err(IngestError::StageConflict { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_topology_detach_then_watch_resumes() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"x");

    // No workers anywhere: the orchestrator waits on discovery until detached
    let mut config = env.config();
    config.topology = WorkerTopology::Remote;
    let collaborators = env
        .collaborators()
        .with_interrupt_prompt(Arc::new(AutoConfirm(true)));

    let mut import =
        BulkImport::new(config, env.importer(), collaborators).without_interrupt_handler();
    let handler = import.interrupt_handler();
    let signals = import.signals();
    tokio::spawn(async move {
        while signals.ingest_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handler.handle().await;
    });

    let outcome = run(&mut import).await;
    let RunOutcome::Detached {
        ingest_id: Some(ingest_id),
    } = outcome
    else {
        panic!("expected detach, got {:?}", outcome);
    };
    let ingest = env.store.find_ingest(ingest_id).await.unwrap();
    assert_eq!(ingest.stage, IngestStage::Scan);

    // Re-attach with local workers and finish the ingest
    let mut watcher = BulkImport::watcher(env.config(), env.collaborators())
        .without_interrupt_handler();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, watcher.watch(ingest_id))
        .await
        .expect("watch timed out")
        .expect("watch failed");

    assert_eq!(outcome, RunOutcome::Completed { ingest_id });
    assert!(env.dest_path("study/sub-01/ses-01/t1/a.dcm").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_unknown_ingest_fails() {
    let env = TestEnv::new().await;
    let mut watcher = BulkImport::watcher(env.config(), env.collaborators())
        .without_interrupt_handler();

    let missing = uuid::Uuid::new_v4();
    let result = watcher.watch(missing).await;
    assert!(matches!(result, Err(IngestError::IngestNotFound(id)) if id == missing));
}
