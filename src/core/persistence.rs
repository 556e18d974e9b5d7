// src/core/persistence.rs

//! Loads and saves the Controller's serialisable state to a versioned
//! sidecar file adjacent to the config file: `.{config_basename}.state.{version_tag}`.
//!
//! The on-disk envelope is `SPALLOC1` magic + a bincode-encoded body + a
//! trailing CRC-64 checksum, in the spirit of the database's own snapshot
//! format. Corrupt or absent files are both treated as a cold start.

use crate::core::Controller;
use crc::{Crc, CRC_64_REDIS};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STATE_MAGIC: &[u8] = b"SPALLOC1";
const CHECKSUM_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// The version tag embedded in the sidecar filename. Bumped whenever the
/// snapshot body's shape changes in a way that would make an old file
/// undecodable; since a decode failure is already treated as a cold start,
/// this mostly exists to keep stale files from different versions from
/// silently colliding on disk.
const STATE_VERSION_TAG: &str = "v1";

/// Computes the sidecar state file path for a given config file path.
pub fn state_file_path(config_path: &Path) -> PathBuf {
    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let basename = config_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "spalloc.cfg".to_string());
    dir.join(format!(".{basename}.state.{STATE_VERSION_TAG}"))
}

/// Writes the controller's state to its sidecar file. Errors are logged and
/// swallowed by the caller at the server level; a failed save should not
/// crash a running daemon.
pub fn save(controller: &Controller, config_path: &Path) -> std::io::Result<()> {
    let path = state_file_path(config_path);
    let body = controller.snapshot();

    let mut buf = Vec::with_capacity(STATE_MAGIC.len() + body.len() + 8);
    buf.extend_from_slice(STATE_MAGIC);
    buf.extend_from_slice(&body);
    let checksum = CHECKSUM_ALGO.checksum(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &buf)?;
    std::fs::rename(&tmp_path, &path)?;
    info!(path = %path.display(), bytes = buf.len(), "wrote state sidecar file");
    Ok(())
}

/// Attempts to restore a controller's state from its sidecar file.
///
/// Returns `Ok(true)` if state was restored (hot start), `Ok(false)` if no
/// usable state was found (cold start, whether because the file is absent,
/// empty, corrupt, or `force_cold_start` was requested). Restoring never
/// fails the caller: a corrupt file is logged and treated exactly like an
/// absent one.
pub fn restore(
    controller: &mut Controller,
    config_path: &Path,
    force_cold_start: bool,
) -> bool {
    if force_cold_start {
        info!("cold start requested, ignoring any existing state file");
        return false;
    }

    let path = state_file_path(config_path);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no state file found, starting cold");
            return false;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state file, starting cold");
            return false;
        }
    };

    match decode(&bytes) {
        Ok(body) => match controller.restore_snapshot(&body) {
            Ok(()) => {
                info!(path = %path.display(), "restored state from sidecar file");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file failed to decode, starting cold");
                false
            }
        },
        Err(reason) => {
            warn!(path = %path.display(), reason, "state file is corrupt, starting cold");
            false
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Vec<u8>, &'static str> {
    if bytes.len() < STATE_MAGIC.len() + 8 {
        return Err("file too short");
    }
    if &bytes[..STATE_MAGIC.len()] != STATE_MAGIC {
        return Err("bad magic");
    }
    let (data_part, checksum_part) = bytes.split_at(bytes.len() - 8);
    let expected: [u8; 8] = checksum_part.try_into().unwrap();
    let expected = u64::from_le_bytes(expected);
    let actual = CHECKSUM_ALGO.checksum(data_part);
    if actual != expected {
        return Err("checksum mismatch");
    }
    Ok(data_part[STATE_MAGIC.len()..].to_vec())
}
