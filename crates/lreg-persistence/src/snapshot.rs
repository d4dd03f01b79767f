//! ---
//! lreg_section: "04-persistence"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Snapshot persistence for replicated registry state."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{PersistenceError, Result};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// On-disk wrapper. The payload is stored as a JSON value so the hash is
/// computed over the same canonical form on write and on read, whatever the
/// file encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    state: Value,
}

/// Persist `state` to `path`.
///
/// The serializer is selected based on file extension: `.cbor` writes CBOR,
/// all other extensions default to JSON. The file is written to a temporary
/// sibling first and renamed into place.
pub fn save_snapshot<T: Serialize>(state: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let state = serde_json::to_value(state)?;
    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(&state)?,
        state,
    };

    let staging = path.with_extension(match extension(path) {
        Some("cbor") => "cbor.partial",
        _ => "json.partial",
    });
    {
        let mut writer = BufWriter::new(File::create(&staging)?);
        match extension(path) {
            Some("cbor") => {
                let bytes = serde_cbor::to_vec(&envelope)?;
                writer.write_all(&bytes)?;
            }
            _ => {
                let json = serde_json::to_vec_pretty(&envelope)?;
                writer.write_all(&json)?;
            }
        }
        writer.flush()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}

/// Load a snapshot from disk, verifying its hash before decoding the payload.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let envelope = load_envelope(path)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(envelope.version));
    }
    if compute_hash(&envelope.state)? != envelope.hash {
        return Err(PersistenceError::HashMismatch);
    }
    Ok(serde_json::from_value(envelope.state)?)
}

/// Verify the integrity of a snapshot without decoding the payload.
pub fn verify_snapshot(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.state)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<SnapshotEnvelope> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope = match extension(path) {
        Some("cbor") => serde_cbor::from_slice(&bytes)?,
        _ => serde_json::from_slice(&bytes)?,
    };
    Ok(envelope)
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn compute_hash(state: &Value) -> Result<String> {
    let serialized = serde_json::to_vec(state)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        version: u64,
        names: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            version: 3,
            names: vec!["shield".into(), "marvel".into()],
        }
    }

    #[test]
    fn save_and_load_json_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        save_snapshot(&sample(), &path).unwrap();
        assert!(verify_snapshot(&path));
        assert!(!dir.path().join("snapshot.json.partial").exists());
        assert_eq!(load_snapshot::<Sample>(&path).unwrap(), sample());
    }

    #[test]
    fn save_and_load_cbor_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.cbor");
        save_snapshot(&sample(), &path).unwrap();
        assert!(verify_snapshot(&path));
        assert_eq!(load_snapshot::<Sample>(&path).unwrap(), sample());
    }

    #[test]
    fn verify_rejects_tampered_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        save_snapshot(&sample(), &path).unwrap();

        let mut envelope: Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["state"]["version"] = serde_json::json!(999);
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(!verify_snapshot(&path));
        assert!(matches!(
            load_snapshot::<Sample>(&path),
            Err(PersistenceError::HashMismatch)
        ));
    }
}
