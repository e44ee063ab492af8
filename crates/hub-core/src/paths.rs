//! Site filesystem layout. Every path is relative to the OMD root of one site.

use std::path::{Path, PathBuf};

/// Persisted routing config (host → site).
pub fn routing_config_path(root: &Path) -> PathBuf {
    root.join("etc/check_mk/piggyback_hub.conf")
}

/// Optional daemon tunables.
pub fn settings_path(root: &Path) -> PathBuf {
    root.join("etc/check_mk/piggyback_hub.toml")
}

/// `omd config` key/value file.
pub fn site_conf_path(root: &Path) -> PathBuf {
    root.join("etc/omd/site.conf")
}

pub fn broker_ssl_dir(root: &Path) -> PathBuf {
    root.join("etc/rabbitmq/ssl")
}

/// `<piggyback_dir>/<piggybacked_host>/<source_host>`
pub fn piggyback_dir(root: &Path) -> PathBuf {
    root.join("tmp/check_mk/piggyback")
}

/// `<piggyback_sources_dir>/<source_host>`, mtime is the last contact.
pub fn piggyback_sources_dir(root: &Path) -> PathBuf {
    root.join("tmp/check_mk/piggyback_sources")
}

pub fn crash_dir(root: &Path) -> PathBuf {
    root.join("var/check_mk/crashes/piggyback-hub")
}
