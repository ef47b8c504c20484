//! Remote topology tests
//!
//! An orchestrator and a worker host share one store. The orchestrator
//! never starts workers of its own.

mod helpers;

use bim_ingest::model::QueueName;
use bim_ingest::{BulkImport, RunOutcome, WorkerTopology};
use helpers::{TestEnv, TEST_TIMEOUT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_workers_complete_the_ingest() {
    let env = TestEnv::new().await;
    env.touch("sub-01/ses-01/t1/a.dcm", b"first");
    env.touch("sub-01/ses-02/t1/b.dcm", b"second");

    let mut config = env.config();
    config.topology = WorkerTopology::Remote;

    let mut orchestrator = BulkImport::new(config.clone(), env.importer(), env.collaborators())
        .without_interrupt_handler();
    let mut worker =
        BulkImport::worker(config, env.collaborators()).without_interrupt_handler();
    let stop_workers = worker.interrupt_handler();

    let (orchestrated, hosted) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            async {
                let outcome = orchestrator.run().await;
                stop_workers.handle().await;
                outcome
            },
            worker.run()
        )
    })
    .await
    .expect("runs timed out");

    let RunOutcome::Completed { ingest_id } = orchestrated.expect("orchestrator failed") else {
        panic!("expected completion");
    };
    assert_eq!(hosted.expect("worker failed"), RunOutcome::WorkersStopped);

    assert!(env.dest_path("study/sub-01/ses-01/t1/a.dcm").exists());
    assert!(env.dest_path("study/sub-01/ses-02/t1/b.dcm").exists());

    let work = env.store.queue_counts(ingest_id, QueueName::Work).await.unwrap();
    assert_eq!((work.complete, work.total()), (2, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_worker_host_stops() {
    let env = TestEnv::new().await;

    let mut worker =
        BulkImport::worker(env.config(), env.collaborators()).without_interrupt_handler();
    let interrupt = worker.interrupt_handler();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        interrupt.handle().await;
    });

    let outcome = tokio::time::timeout(TEST_TIMEOUT, worker.run())
        .await
        .expect("worker did not stop")
        .expect("worker failed");
    stopper.await.unwrap();

    assert_eq!(outcome, RunOutcome::WorkersStopped);
    assert!(env.dest_files().is_empty());
}
