//! Persisted routing config.
//!
//! One JSON line at `etc/check_mk/piggyback_hub.conf`. Writes go to a
//! temporary sibling and are renamed over the canonical path, so a reader
//! sees either the old or the new file, never a partial one.

use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::message::RoutingConfig;
use crate::paths::routing_config_path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(serde_json::Error),
}

/// Store `config` as the routing config of the site at `root`.
pub fn save(root: &Path, config: &RoutingConfig) -> Result<(), ConfigStoreError> {
    let path = routing_config_path(root);

    if let Some(parent) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o770)
            .create(parent)
            .map_err(|e| ConfigStoreError::WriteFailed(parent.to_path_buf(), e))?;
    }

    let mut line = serde_json::to_vec(config).map_err(ConfigStoreError::SerializeFailed)?;
    line.push(b'\n');

    let tmp_path = temp_path(&path);
    {
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| ConfigStoreError::WriteFailed(tmp_path.clone(), e))?;
        file.write_all(&line)
            .and_then(|()| file.sync_all())
            .map_err(|e| ConfigStoreError::WriteFailed(tmp_path.clone(), e))?;
    }

    fs::rename(&tmp_path, &path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        ConfigStoreError::WriteFailed(path.clone(), e)
    })
}

/// Read the routing config at `path`. A missing file is an empty config.
pub fn load(path: &Path) -> Result<RoutingConfig, ConfigStoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RoutingConfig::default()),
        Err(e) => return Err(ConfigStoreError::ReadFailed(path.to_path_buf(), e)),
    };
    serde_json::from_str(&text).map_err(|e| ConfigStoreError::ParseFailed(path.to_path_buf(), e))
}

/// [`load`] from the canonical location below `root`.
pub fn load_for_site(root: &Path) -> Result<RoutingConfig, ConfigStoreError> {
    load(&routing_config_path(root))
}

// Unique per writer process, hidden, same directory as the target so the
// rename never crosses a filesystem.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.new{}", std::process::id()))
}
