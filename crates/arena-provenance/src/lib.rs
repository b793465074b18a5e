use anyhow::{anyhow, Result};
use arena_core::{
    atomic_write_json_pretty, canonical_json_digest, sha256_file, SESSION_ATTESTATION_FILENAME, SESSION_RECORD_FILENAME,
    SESSION_RESULTS_FILENAME, SESSION_TRACE_FILENAME,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;

pub const ATTESTATION_SCHEMA_VERSION: &str = "attestation_v1";

pub fn write_attestation(session_dir: &Path, payload: &Value) -> Result<PathBuf> {
    let path = session_dir.join(SESSION_ATTESTATION_FILENAME);
    atomic_write_json_pretty(&path, payload)?;
    Ok(path)
}

/// sha256 of each session artifact present in `session_dir`.
pub fn artifact_digests(session_dir: &Path) -> Result<Value> {
    let mut digests = Map::new();
    for name in [
        SESSION_RECORD_FILENAME,
        SESSION_TRACE_FILENAME,
        SESSION_RESULTS_FILENAME,
    ] {
        let path = session_dir.join(name);
        if path.exists() {
            digests.insert(name.to_string(), json!(sha256_file(&path)?));
        }
    }
    Ok(Value::Object(digests))
}

pub fn default_attestation(
    session_id: &str,
    problem_id: &str,
    trace_head: Option<&str>,
    results: Value,
    artifacts: Value,
) -> Value {
    json!({
        "schema_version": ATTESTATION_SCHEMA_VERSION,
        "created_at": Utc::now().to_rfc3339(),
        "session_id": session_id,
        "problem_id": problem_id,
        "trace_hashchain_head": trace_head,
        "artifacts": artifacts,
        "results_digest": canonical_json_digest(&results),
        "results": results,
        "generator": {
            "name": "arena",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn archive_name(session_dir: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(session_dir).map_err(|_| {
        anyhow!(
            "{} is not inside {}",
            path.display(),
            session_dir.display()
        )
    })?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Zips every file under `session_dir` into `out_path`. Returns the number of
/// archived files.
pub fn build_debug_bundle(session_dir: &Path, out_path: &Path) -> Result<usize> {
    if !session_dir.join(SESSION_RECORD_FILENAME).exists() {
        return Err(anyhow!(
            "{} does not look like a session directory (missing {})",
            session_dir.display(),
            SESSION_RECORD_FILENAME
        ));
    }
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = fs::File::create(out_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let out_abs = fs::canonicalize(out_path).ok();
    let mut count = 0;
    for entry in walkdir::WalkDir::new(session_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if out_abs.is_some() && fs::canonicalize(path).ok() == out_abs {
            continue;
        }
        zip.start_file(archive_name(session_dir, path)?, opts)?;
        zip.write_all(&fs::read(path)?)?;
        count += 1;
    }

    zip.finish()?;
    Ok(count)
}
