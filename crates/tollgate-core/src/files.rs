//! JSON file helpers shared by tokens, registry, traces and rate-limit state.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::errors::GateError;

/// Write pretty JSON via a sibling temp file and rename, so readers never see
/// a partial document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), GateError> {
    let mut encoded = serde_json::to_vec_pretty(value)
        .map_err(|e| GateError::Internal(format!("encode {}: {e}", path.display())))?;
    encoded.push(b'\n');
    write_bytes_atomic(path, &encoded)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), GateError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| GateError::io(format!("create directory {}", dir.display()), e))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| GateError::io(format!("create temp file in {}", dir.display()), e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| GateError::io(format!("write {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| GateError::io(format!("persist {}", path.display()), e.error))?;
    Ok(())
}

/// Read and parse a JSON document. Malformed content is invalid input.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, GateError> {
    let raw = std::fs::read(path).map_err(|e| GateError::io(format!("read {}", path.display()), e))?;
    serde_json::from_slice(&raw)
        .map_err(|e| GateError::InvalidInput(format!("parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &json!({"v": 1})).unwrap();
        write_json_atomic(&path, &json!({"v": 2})).unwrap();

        let back: Value = read_json(&path).unwrap();
        assert_eq!(back["v"], 2);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn test_read_json_error_categories() {
        let dir = tempfile::tempdir().unwrap();
        let missing = read_json::<Value>(&dir.path().join("missing.json")).unwrap_err();
        assert_eq!(missing.code(), "io_failure");

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{nope").unwrap();
        let err = read_json::<Value>(&bad).unwrap_err();
        assert_eq!(err.code(), "input_invalid");
    }
}
