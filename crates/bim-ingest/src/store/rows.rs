//! Row types shared by both backends

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::IngestError;
use crate::model::{
    AuditLogEntry, DeidLogEntry, IngestConfig, IngestItem, IngestOperation, ItemContext,
    PrivateTag, SubjectMap, TaskPayload, TaskRecord,
};

#[derive(Debug, FromRow)]
pub(crate) struct IngestRow {
    pub id: Uuid,
    pub name: String,
    pub fs_path: String,
    pub config: Json<IngestConfig>,
    pub stage: String,
    pub created_at: DateTime<Utc>,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
}

impl TryFrom<IngestRow> for IngestOperation {
    type Error = IngestError;

    fn try_from(row: IngestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            fs_path: row.fs_path,
            config: row.config.0,
            stage: row.stage.parse()?,
            created_at: row.created_at,
            processing_start: row.processing_start,
            processing_end: row.processing_end,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub id: Uuid,
    pub ingest_id: Uuid,
    pub payload: Json<TaskPayload>,
    pub status: String,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = IngestError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            ingest_id: row.ingest_id,
            payload: row.payload.0,
            status: row.status.parse()?,
            worker_id: row.worker_id,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            completed_at: row.completed_at,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ItemRow {
    pub id: Uuid,
    pub ingest_id: Uuid,
    pub subdir: String,
    pub files: Json<Vec<String>>,
    pub size: i64,
    pub mtime: Option<DateTime<Utc>>,
    pub item_type: String,
    pub context: Json<ItemContext>,
    pub warnings: Json<Vec<String>>,
    pub errors: Json<Vec<String>>,
}

impl From<ItemRow> for IngestItem {
    fn from(row: ItemRow) -> Self {
        Self {
            id: row.id,
            ingest_id: row.ingest_id,
            subdir: row.subdir,
            files: row.files.0,
            size: row.size,
            mtime: row.mtime,
            item_type: row.item_type.into(),
            context: row.context.0,
            warnings: row.warnings.0,
            errors: row.errors.0,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AuditRow {
    pub ingest_id: Uuid,
    pub src_path: String,
    pub dest_path: String,
    pub failed: bool,
    pub message: Option<String>,
}

impl From<AuditRow> for AuditLogEntry {
    fn from(row: AuditRow) -> Self {
        Self {
            ingest_id: row.ingest_id,
            src_path: row.src_path,
            dest_path: row.dest_path,
            failed: row.failed,
            message: row.message,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SubjectMapRow {
    pub ingest_id: Uuid,
    pub subject_id: String,
    pub subject_code: String,
    pub field_values: Json<Vec<String>>,
}

impl From<SubjectMapRow> for SubjectMap {
    fn from(row: SubjectMapRow) -> Self {
        Self {
            ingest_id: row.ingest_id,
            subject_id: row.subject_id,
            subject_code: row.subject_code,
            field_values: row.field_values.0,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeidRow {
    pub ingest_id: Uuid,
    pub path: String,
    pub log_type: String,
    pub field_values: Json<BTreeMap<String, String>>,
}

impl From<DeidRow> for DeidLogEntry {
    fn from(row: DeidRow) -> Self {
        Self {
            ingest_id: row.ingest_id,
            path: row.path,
            log_type: row.log_type,
            field_values: row.field_values.0,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PrivateTagRow {
    pub ingest_id: Uuid,
    pub private_creator: String,
    pub tag: String,
    pub vr: String,
    pub description: String,
    pub vm: String,
}

impl From<PrivateTagRow> for PrivateTag {
    fn from(row: PrivateTagRow) -> Self {
        Self {
            ingest_id: row.ingest_id,
            private_creator: row.private_creator,
            tag: row.tag,
            vr: row.vr,
            description: row.description,
            vm: row.vm,
        }
    }
}
