//! File helpers shared by every artifact writer.

use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::{NodemapError, NodemapResult};

/// Suffix of in-flight temp files; stray ones are swept by the orchestrator.
pub const TEMP_SUFFIX: &str = ".tmp";

fn persist_error(path: &Path, reason: impl std::fmt::Display) -> NodemapError {
    NodemapError::Persist {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Serialize `value` as 2-space-indented JSON into a temp file next to
/// `path`, then rename it over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> NodemapResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| persist_error(path, e))?;

    let tmp = tempfile::Builder::new()
        .prefix(".nodemap-")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(&parent)
        .map_err(|e| persist_error(path, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| persist_error(path, e))?;
        writer.flush().map_err(|e| persist_error(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| persist_error(path, e))?;
    tmp.persist(path).map_err(|e| persist_error(path, e.error))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> NodemapResult<T> {
    if !path.exists() {
        return Err(NodemapError::MissingInput(path.to_path_buf()));
    }
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Lowercase hex SHA-256 of a file's bytes.
pub fn file_sha256(path: &Path) -> NodemapResult<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Delete leftover `*.tmp` files directly inside `dir`. Returns how many
/// were removed; failures to remove individual files are logged.
pub fn remove_temp_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_temp = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
        if !is_temp {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("could not remove {}: {e}", path.display()),
        }
    }
    removed
}
