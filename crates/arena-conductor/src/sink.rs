use crate::session::SessionRecord;
use anyhow::{Context, Result};
use arena_core::{
    atomic_write_json_pretty, ensure_dir, session_dir, SESSION_RECORD_FILENAME,
    SESSION_RESULTS_FILENAME, SESSION_TRACE_FILENAME,
};
use arena_provenance::{artifact_digests, default_attestation, write_attestation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRow {
    pub session_id: String,
    pub seq: usize,
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub session_id: String,
    pub problem_id: String,
    pub key: String,
    pub value: Value,
}

/// Destination for finalized sessions.
pub trait SessionSink {
    /// Persists the record and returns where it landed.
    fn write_session(&mut self, record: &SessionRecord) -> Result<PathBuf>;
}

/// Writes each session into `<root>/<session_id>/` as a pretty record plus
/// JSONL trace and result rows, then attests the written artifacts.
pub struct JsonlSessionSink {
    root: PathBuf,
}

impl JsonlSessionSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SessionSink for JsonlSessionSink {
    fn write_session(&mut self, record: &SessionRecord) -> Result<PathBuf> {
        let record_value = serde_json::to_value(record)?;
        arena_schemas::validate_value(arena_schemas::SESSION_SCHEMA, &record_value)
            .with_context(|| format!("session {} failed validation", record.session_id))?;

        let dir = session_dir(&self.root, &record.session_id);
        ensure_dir(&dir)?;
        atomic_write_json_pretty(&dir.join(SESSION_RECORD_FILENAME), &record_value)?;

        let mut trace_writer = open_truncate(dir.join(SESSION_TRACE_FILENAME))?;
        for (seq, entry) in record.history.iter().enumerate() {
            append_row(
                &mut trace_writer,
                &TraceRow {
                    session_id: record.session_id.clone(),
                    seq,
                    role: entry.role.as_str().to_string(),
                    content: entry.content.clone(),
                },
            )?;
        }
        trace_writer.flush()?;

        let mut results_writer = open_truncate(dir.join(SESSION_RESULTS_FILENAME))?;
        for (key, value) in &record.results {
            append_row(
                &mut results_writer,
                &ResultRow {
                    session_id: record.session_id.clone(),
                    problem_id: record.problem_id.clone(),
                    key: key.clone(),
                    value: value.clone(),
                },
            )?;
        }
        results_writer.flush()?;

        let attestation = default_attestation(
            &record.session_id,
            &record.problem_id,
            record.trace_head.as_deref(),
            serde_json::to_value(&record.results)?,
            artifact_digests(&dir)?,
        );
        write_attestation(&dir, &attestation)?;

        info!(
            session_id = %record.session_id,
            path = %dir.display(),
            "session persisted"
        );
        Ok(dir)
    }
}

fn open_truncate(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
