//! One function per stage

use chrono::Utc;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::Context;
use crate::error::{IngestError, Result};
use crate::model::{
    IngestOperation, IngestStage, IngestUpdate, ItemSummary, QueueName, TaskPayload,
};
use crate::reporter::{format_bytes, ProcessSummary};
use crate::tabular;

const UNRESOLVED_TARGET: &str = "could not determine the target container";

pub(super) async fn initialize(ctx: &mut Context) -> Result<()> {
    ctx.store.initialize().await?;
    debug!(
        worker_mode = ctx.predicates().worker_mode,
        topology = ?ctx.config.topology,
        "Store initialized"
    );
    Ok(())
}

pub(super) async fn start_workers(ctx: &mut Context) -> Result<()> {
    let worker_mode = ctx.predicates().worker_mode;
    let scope = if worker_mode {
        None
    } else {
        Some(ctx.ingest()?.id)
    };
    ctx.start_executor(scope)?;

    if !worker_mode {
        return Ok(());
    }

    info!(workers = ctx.config.workers, "Worker host running; interrupt to stop");
    let signals = ctx.signals.clone();
    if let Some(executor) = ctx.executor.as_mut() {
        tokio::select! {
            _ = executor.join() => {}
            _ = signals.detached() => {}
        }
        executor.shutdown().await;
    }
    info!("Worker host stopped");
    Ok(())
}

fn ingest_name(folder: &str) -> String {
    Path::new(folder)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.to_string())
}

pub(super) async fn create_ingest(ctx: &mut Context) -> Result<()> {
    let importer = ctx.importer_config.clone().ok_or_else(|| {
        IngestError::InvalidStage("create_ingest requires an importer configuration".to_string())
    })?;
    importer.validate()?;

    let ingest = IngestOperation::new(ingest_name(&importer.folder), importer.clone());
    let ingest_id = ingest.id;
    ctx.store.insert_ingest(&ingest).await?;
    ctx.set_ingest(ingest);
    info!(ingest_id = %ingest_id, folder = %importer.folder, "Created ingest");
    ctx.reporter.start(ingest_id);

    let mapping_input = importer
        .subjects_mapping
        .as_ref()
        .and_then(|mapping| mapping.load_from.as_ref());
    if let Some(path) = mapping_input {
        let maps = tabular::load_subject_mappings(path, ingest_id)?;
        for map in &maps {
            ctx.store.insert_subject_map(map).await?;
        }
        info!(path = %path.display(), count = maps.len(), "Loaded subject mappings");
    }

    if let Some(path) = &importer.private_tags_path {
        let tags = tabular::load_private_tags(path, ingest_id)?;
        for tag in &tags {
            ctx.store.insert_private_tag(tag).await?;
        }
        info!(path = %path.display(), count = tags.len(), "Loaded private tags");
    }

    ctx.store
        .insert_task(ingest_id, &TaskPayload::Discover)
        .await?;
    Ok(())
}

pub(super) async fn wait_for_discover(ctx: &mut Context) -> Result<()> {
    if ctx.wait_until_drained(QueueName::Discover).await? {
        debug!("Discovery drained");
    }
    Ok(())
}

pub(super) async fn wait_for_scan(ctx: &mut Context) -> Result<()> {
    if ctx.wait_until_drained(QueueName::Scan).await? {
        let counts = ctx
            .store
            .queue_counts(ctx.ingest()?.id, QueueName::Scan)
            .await?;
        info!(complete = counts.complete, failed = counts.failed, "Scan finished");
    }
    Ok(())
}

async fn confirm(ctx: &Context, message: String) -> Result<bool> {
    if ctx.config.assume_yes {
        return Ok(true);
    }
    let prompt = ctx.prompt.clone();
    let confirmed = tokio::task::spawn_blocking(move || prompt.confirm(&message))
        .await
        .map_err(anyhow::Error::from)?;
    Ok(confirmed)
}

pub(super) async fn review(ctx: &mut Context) -> Result<()> {
    ctx.update_ingest(IngestUpdate::stage(IngestStage::Review))
        .await?;
    let ingest_id = ctx.ingest()?.id;

    let mut items = ctx.store.items_for_ingest(ingest_id).await?;
    let mut targets = Vec::with_capacity(items.len());
    for item in &items {
        targets.push(ctx.containers.resolve(&item.context).await?);
    }

    let summary = ItemSummary::from_items(&items);
    let containers = ctx.containers.summary();
    ctx.reporter.suspend();
    ctx.reporter.report_review_summary(&summary, &containers);

    let message = format!(
        "Import {} items ({} files, {}) and create {} containers?",
        summary.items,
        summary.files,
        format_bytes(summary.bytes),
        containers.new_containers()
    );
    if !confirm(ctx, message).await? {
        info!(ingest_id = %ingest_id, "Import not confirmed");
        ctx.abort();
        return Ok(());
    }

    ctx.containers.create_containers().await?;

    let mut config = ctx.ingest()?.config.clone();
    if let Some(project) = ctx.containers.first_project() {
        config.target_project = Some(project.to_ref());
    }
    ctx.update_ingest(IngestUpdate {
        config: Some(config),
        processing_start: Some(Utc::now()),
        ..Default::default()
    })
    .await?;
    ctx.reporter.resume();

    let mut queued = 0;
    let mut unresolved = 0;
    for (item, target) in items.iter_mut().zip(targets) {
        if item.context.target.is_some() {
            continue;
        }
        match target {
            Some(node) => {
                item.context.target = Some(node.to_ref());
                ctx.store.queue_item_work(item).await?;
                queued += 1;
            }
            None => {
                if !item.errors.iter().any(|error| error == UNRESOLVED_TARGET) {
                    item.errors.push(UNRESOLVED_TARGET.to_string());
                    ctx.store.update_item(item).await?;
                }
                warn!(item_id = %item.id, subdir = %item.subdir, "{}", UNRESOLVED_TARGET);
                unresolved += 1;
            }
        }
    }

    info!(ingest_id = %ingest_id, queued, unresolved, "Queued work tasks");
    Ok(())
}

pub(super) async fn process(ctx: &mut Context) -> Result<()> {
    ctx.reporter.begin_processing();
    ctx.update_ingest(IngestUpdate::stage(IngestStage::Processing))
        .await?;

    if !ctx.wait_until_drained(QueueName::Work).await? {
        return Ok(());
    }

    ctx.update_ingest(IngestUpdate {
        processing_end: Some(Utc::now()),
        ..Default::default()
    })
    .await?;

    let ingest = ctx.ingest()?;
    let work = ctx.store.queue_counts(ingest.id, QueueName::Work).await?;
    let entries = ctx.store.audit_entries(ingest.id).await?;
    let files_failed = entries.iter().filter(|entry| entry.failed).count() as u64;
    let elapsed = match (ingest.processing_start, ingest.processing_end) {
        (Some(start), Some(end)) => (end - start).to_std().ok(),
        _ => None,
    };

    ctx.reporter.report_process_summary(&ProcessSummary {
        work,
        files_uploaded: entries.len() as u64 - files_failed,
        files_failed,
        elapsed,
    });
    ctx.reporter.shutdown();
    Ok(())
}

pub(super) async fn completed(ctx: &mut Context) -> Result<()> {
    save_audit_log(ctx).await?;
    ctx.update_ingest(IngestUpdate::stage(IngestStage::Complete))
        .await?;
    if ctx.signals.is_aborted() {
        return Ok(());
    }

    let ingest = ctx.ingest()?;
    let importer = &ingest.config.importer_config;

    if let Some(mapping) = &importer.subjects_mapping {
        if let Some(path) = &mapping.save_to {
            let maps = ctx.store.subject_maps(ingest.id).await?;
            if tabular::save_subject_mappings(path, &maps, &mapping.fields)? {
                info!(path = %path.display(), count = maps.len(), "Saved subject mappings");
            }
        }
    }

    if let Some(path) = &importer.deid_log_path {
        let entries = ctx.store.deid_logs(ingest.id).await?;
        if tabular::save_deid_log(path, &entries)? {
            info!(path = %path.display(), count = entries.len(), "Saved de-identification log");
        }
    }

    info!(ingest_id = %ingest.id, "Ingest complete");
    Ok(())
}

pub(super) async fn aborted(ctx: &mut Context) -> Result<()> {
    let Some((ingest_id, stage)) = ctx.ingest.as_ref().map(|ingest| (ingest.id, ingest.stage))
    else {
        info!("Aborted before an ingest was created");
        return Ok(());
    };

    if stage != IngestStage::Aborted {
        ctx.update_ingest(IngestUpdate::stage(IngestStage::Aborted))
            .await?;
    }

    // In-flight tasks still write audit entries; let them land first
    if let Some(mut executor) = ctx.executor.take() {
        executor.shutdown().await;
    }
    save_audit_log(ctx).await?;

    warn!(ingest_id = %ingest_id, "Ingest aborted");
    Ok(())
}

pub(super) async fn shutdown(ctx: &mut Context) -> Result<()> {
    if let Some(mut executor) = ctx.executor.take() {
        executor.shutdown().await;
    }
    if ctx.reporter.is_running() {
        ctx.reporter.shutdown();
    }
    debug!("Shutdown complete");
    Ok(())
}

/// Write the audit log locally and upload it into the target project
///
/// A failed upload is logged and does not fail the stage.
async fn save_audit_log(ctx: &Context) -> Result<()> {
    let ingest = ctx.ingest()?;
    let importer = &ingest.config.importer_config;
    if importer.no_audit_log {
        debug!("Audit log disabled");
        return Ok(());
    }

    let entries = ctx.store.audit_entries(ingest.id).await?;
    let file_name = format!("audit_log-{}.csv", Utc::now().format("%Y%m%d-%H%M%S"));

    let local = importer
        .audit_log_path
        .clone()
        .or_else(|| importer.save_audit_locally.then(|| PathBuf::from(&file_name)));
    if let Some(path) = local {
        let file = std::fs::File::create(&path)?;
        tabular::write_audit_log(file, &entries)?;
        info!(path = %path.display(), entries = entries.len(), "Audit log written");
    }

    let Some(target) = &ingest.config.target_project else {
        debug!("No target project resolved; audit log upload skipped");
        return Ok(());
    };

    let staged = NamedTempFile::new()?;
    tabular::write_audit_log(staged.as_file(), &entries)?;
    match ctx.uploader.upload(target, &file_name, staged.path()).await {
        Ok(dest) => info!(dest = %dest, entries = entries.len(), "Audit log uploaded"),
        Err(e) => warn!(error = %e, "Audit log upload failed"),
    }
    Ok(())
}
