//! Local piggyback store.
//!
//! Raw data lives at `tmp/check_mk/piggyback/<piggybacked_host>/<source_host>`,
//! with the file mtime set to the message timestamp. The last contact with a
//! source host is the mtime of `tmp/check_mk/piggyback_sources/<source_host>`.
//!
//! Writes are atomic (temp file, then rename) and overwrite previous data for
//! the same source/piggybacked pair, so storing the same payload twice is
//! harmless.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use hub_core::message::{HostName, PiggybackPayload};
use hub_core::paths::{piggyback_dir, piggyback_sources_dir};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("invalid host name {0:?}")]
    InvalidHostName(String),
}

/// Who sent what, for whom, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiggybackMeta {
    pub source: HostName,
    pub piggybacked: HostName,
    /// Epoch seconds.
    pub message_timestamp: i64,
    /// Epoch seconds of the last contact with `source`, if known.
    pub contact_timestamp: Option<i64>,
}

/// One locally stored piggyback message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiggybackMessage {
    pub meta: PiggybackMeta,
    pub raw_data: Bytes,
}

impl PiggybackMessage {
    /// Wire payload carrying this message to another site.
    pub fn to_payload(&self) -> PiggybackPayload {
        PiggybackPayload {
            source_host: self.meta.source.clone(),
            raw_data: BTreeMap::from([(
                self.meta.piggybacked.clone(),
                vec![self.raw_data.clone()],
            )]),
            message_timestamp: self.meta.message_timestamp,
            contact_timestamp: self.meta.contact_timestamp,
        }
    }
}

/// Store the raw data `source` collected for each piggybacked host.
///
/// Blocks of one piggybacked host are joined with newlines.
pub fn store_piggyback_raw_data(
    source: &str,
    raw_data: &BTreeMap<HostName, Vec<Bytes>>,
    message_timestamp: i64,
    contact_timestamp: Option<i64>,
    root: &Path,
) -> Result<(), StoreError> {
    check_host_name(source)?;
    let modified = to_system_time(message_timestamp);

    for (piggybacked, blocks) in raw_data {
        check_host_name(piggybacked)?;
        let path = piggyback_dir(root).join(piggybacked).join(source);
        write_atomic(&path, &join_blocks(blocks), modified)?;
    }

    if let Some(contact) = contact_timestamp {
        let path = piggyback_sources_dir(root).join(source);
        write_atomic(&path, b"", to_system_time(contact))?;
    }

    tracing::debug!(
        source,
        hosts = raw_data.len(),
        message_timestamp,
        "piggyback data stored"
    );
    Ok(())
}

/// Store a payload received from another site.
pub fn store_payload(payload: &PiggybackPayload, root: &Path) -> Result<(), StoreError> {
    store_piggyback_raw_data(
        &payload.source_host,
        &payload.raw_data,
        payload.message_timestamp,
        payload.contact_timestamp,
        root,
    )
}

/// All messages currently stored for `piggybacked`, one per source host.
pub fn get_messages_for(piggybacked: &str, root: &Path) -> Result<Vec<PiggybackMessage>, StoreError> {
    check_host_name(piggybacked)?;
    let dir = piggyback_dir(root).join(piggybacked);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::ReadFailed(dir, e)),
    };

    let mut messages = Vec::new();
    for entry in entries.flatten() {
        let source = entry.file_name().to_string_lossy().into_owned();
        if source.starts_with('.') {
            continue;
        }
        // Vanished between listing and reading: someone replaced or removed it.
        if let Some(message) = read_message(piggybacked, &source, root)? {
            messages.push(message);
        }
    }
    messages.sort_by(|a, b| a.meta.source.cmp(&b.meta.source));
    Ok(messages)
}

/// Read one stored message. `None` if it does not exist (anymore).
pub fn read_message(
    piggybacked: &str,
    source: &str,
    root: &Path,
) -> Result<Option<PiggybackMessage>, StoreError> {
    let path = piggyback_dir(root).join(piggybacked).join(source);
    let raw_data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::ReadFailed(path, e)),
    };
    let message_timestamp = match mtime_secs(&path) {
        Some(ts) => ts,
        None => return Ok(None),
    };

    Ok(Some(PiggybackMessage {
        meta: PiggybackMeta {
            source: source.to_string(),
            piggybacked: piggybacked.to_string(),
            message_timestamp,
            contact_timestamp: mtime_secs(&piggyback_sources_dir(root).join(source)),
        },
        raw_data: Bytes::from(raw_data),
    }))
}

pub(crate) fn mtime_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    })
}

fn to_system_time(epoch_secs: i64) -> SystemTime {
    if epoch_secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(epoch_secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(epoch_secs.unsigned_abs())
    }
}

fn join_blocks(blocks: &[Bytes]) -> Vec<u8> {
    let mut data = Vec::with_capacity(blocks.iter().map(|b| b.len() + 1).sum());
    for block in blocks {
        data.extend_from_slice(block);
        if !block.ends_with(b"\n") {
            data.push(b'\n');
        }
    }
    data
}

// Host names become path components.
fn check_host_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(StoreError::InvalidHostName(name.to_string()));
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8], modified: SystemTime) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed(parent.to_path_buf(), e))?;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{name}.new{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| StoreError::WriteFailed(tmp_path.clone(), e))?;
        file.write_all(data)
            .and_then(|()| file.set_modified(modified))
            .map_err(|e| StoreError::WriteFailed(tmp_path.clone(), e))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::WriteFailed(path.to_path_buf(), e)
    })
}
