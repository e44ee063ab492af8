//! Crash reports for fatal worker errors.
//!
//! Workers receive a [`CrashReporter`] at construction and call it right
//! before they give up. The filesystem implementation writes a
//! `crash.info` JSON document per crash below `var/check_mk/crashes`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use hub_core::paths::crash_dir;

pub const CRASH_TYPE: &str = "piggyback-hub";

pub trait CrashReporter: Send + Sync {
    /// Record that `component` failed with `error`.
    fn report(&self, component: &str, error: &anyhow::Error);
}

#[derive(Debug, Serialize)]
struct CrashInfo<'a> {
    id: String,
    crash_type: &'static str,
    time: f64,
    component: &'a str,
    exc_type: String,
    exc_value: String,
    exc_chain: Vec<String>,
    backtrace: String,
    version: &'static str,
}

/// Writes crash reports to `<root>/var/check_mk/crashes/piggyback-hub/<id>/crash.info`.
#[derive(Debug, Clone)]
pub struct CrashReportStore {
    dir: PathBuf,
}

impl CrashReportStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: crash_dir(root),
        }
    }

    /// Write one report and return its path.
    pub fn write(&self, component: &str, error: &anyhow::Error) -> std::io::Result<PathBuf> {
        let id = Uuid::new_v4();
        let info = CrashInfo {
            id: id.to_string(),
            crash_type: CRASH_TYPE,
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            component,
            exc_type: error_kind(error),
            exc_value: error.to_string(),
            exc_chain: error.chain().skip(1).map(|c| c.to_string()).collect(),
            backtrace: error.backtrace().to_string(),
            version: env!("CARGO_PKG_VERSION"),
        };

        let report_dir = self.dir.join(id.to_string());
        fs::create_dir_all(&report_dir)?;
        let path = report_dir.join("crash.info");
        let json = serde_json::to_vec_pretty(&info).map_err(std::io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

impl CrashReporter for CrashReportStore {
    fn report(&self, component: &str, error: &anyhow::Error) {
        match self.write(component, error) {
            Ok(path) => tracing::error!(
                component,
                report = %path.display(),
                "crash report written"
            ),
            Err(e) => tracing::error!(
                component,
                error = %e,
                "failed to write crash report"
            ),
        }
    }
}

// Innermost cause, as a type-ish label for the report.
fn error_kind(error: &anyhow::Error) -> String {
    let root = error.root_cause();
    if root.is::<crate::broker::BrokerError>() {
        "BrokerError".to_string()
    } else if root.is::<std::io::Error>() {
        "IoError".to_string()
    } else if root.is::<serde_json::Error>() {
        "DecodeError".to_string()
    } else {
        "Error".to_string()
    }
}
