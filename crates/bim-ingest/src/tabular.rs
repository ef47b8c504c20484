//! CSV import and export at the edges of a run
//!
//! Formats:
//! - subject mapping: `SubjectId,SubjectCode,<fields...>`
//! - de-identification log: `path,type,<fields...>`
//! - private tags: `PrivateCreator,Tag,VR,Description,VM`
//! - audit log: `Source Path,Destination Path,Failed,Message`

use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::model::{AuditLogEntry, DeidLogEntry, PrivateTag, SubjectMap};

const SUBJECT_ID: &str = "SubjectId";
const SUBJECT_CODE: &str = "SubjectCode";

/// Read subject mappings; columns other than the id and code become field values
pub fn load_subject_mappings(path: &Path, ingest_id: Uuid) -> Result<Vec<SubjectMap>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let column = |name: &str| {
        headers.iter().position(|header| header == name).ok_or_else(|| {
            IngestError::config(format!(
                "{}: missing column {}",
                path.display(),
                name
            ))
        })
    };
    let id_column = column(SUBJECT_ID)?;
    let code_column = column(SUBJECT_CODE)?;

    let mut maps = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field_values = record
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != id_column && *index != code_column)
            .map(|(_, value)| value.to_string())
            .collect();

        maps.push(SubjectMap {
            ingest_id,
            subject_id: record.get(id_column).unwrap_or_default().to_string(),
            subject_code: record.get(code_column).unwrap_or_default().to_string(),
            field_values,
        });
    }

    Ok(maps)
}

/// Write subject mappings; nothing is written when there are none
pub fn save_subject_mappings(path: &Path, maps: &[SubjectMap], fields: &[String]) -> Result<bool> {
    if maps.is_empty() {
        return Ok(false);
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(
        [SUBJECT_ID, SUBJECT_CODE]
            .into_iter()
            .chain(fields.iter().map(String::as_str)),
    )?;
    for map in maps {
        writer.write_record(
            [map.subject_id.as_str(), map.subject_code.as_str()]
                .into_iter()
                .chain(map.field_values.iter().map(String::as_str)),
        )?;
    }
    writer.flush()?;

    Ok(true)
}

/// Write the de-identification log; field columns come from the first entry
pub fn save_deid_log(path: &Path, entries: &[DeidLogEntry]) -> Result<bool> {
    let Some(first) = entries.first() else {
        return Ok(false);
    };
    let fields: Vec<&String> = first.field_values.keys().collect();

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(
        ["path", "type"]
            .into_iter()
            .chain(fields.iter().map(|field| field.as_str())),
    )?;
    for entry in entries {
        writer.write_record(
            [entry.path.as_str(), entry.log_type.as_str()].into_iter().chain(
                fields.iter().map(|field| {
                    entry
                        .field_values
                        .get(*field)
                        .map(String::as_str)
                        .unwrap_or_default()
                }),
            ),
        )?;
    }
    writer.flush()?;

    Ok(true)
}

#[derive(Debug, Deserialize)]
struct PrivateTagRecord {
    #[serde(rename = "PrivateCreator")]
    private_creator: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "VR")]
    vr: String,
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "VM", default)]
    vm: Option<String>,
}

/// Read private tag definitions; a missing VM defaults to `1`
pub fn load_private_tags(path: &Path, ingest_id: Uuid) -> Result<Vec<PrivateTag>> {
    let mut reader = csv::Reader::from_path(path)?;

    reader
        .deserialize::<PrivateTagRecord>()
        .map(|record| {
            let record = record?;
            Ok(PrivateTag {
                ingest_id,
                private_creator: record.private_creator,
                tag: record.tag,
                vr: record.vr,
                description: record.description,
                vm: record
                    .vm
                    .filter(|vm| !vm.trim().is_empty())
                    .unwrap_or_else(|| "1".to_string()),
            })
        })
        .collect()
}

/// Write the audit log, header included even when there are no entries
pub fn write_audit_log<W: Write>(writer: W, entries: &[AuditLogEntry]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["Source Path", "Destination Path", "Failed", "Message"])?;
    for entry in entries {
        writer.write_record([
            entry.src_path.as_str(),
            entry.dest_path.as_str(),
            if entry.failed { "true" } else { "false" },
            entry.message.as_deref().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
