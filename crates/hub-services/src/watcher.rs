//! Watches the local piggyback directory for new messages.
//!
//! An inotify thread wakes the watcher whenever a file is renamed into (or
//! written in) a host directory below `tmp/check_mk/piggyback`; a periodic
//! rescan covers lost events and hosts without inotify. Scans walk the tree
//! on the blocking pool.
//!
//! Files already present at startup are not reported; afterwards a file is
//! reported when it appears or is replaced. Replacement is detected by inode
//! and size as well as mtime: stored messages carry second-resolution
//! timestamps and may be rewritten within the same second. A file that
//! cannot be read yet is retried on the next scan.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tokio::sync::{broadcast, mpsc};

use hub_core::paths::piggyback_dir;

use crate::piggyback::{read_message, PiggybackMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    inode: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct Scanner {
    root: PathBuf,
    seen: HashMap<(String, String), FileStamp>,
}

pub struct PiggybackWatcher {
    scanner: Scanner,
    rescan_interval: Duration,
    tx: mpsc::Sender<PiggybackMessage>,
    shutdown: broadcast::Receiver<()>,
}

impl PiggybackWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        rescan_interval: Duration,
        tx: mpsc::Sender<PiggybackMessage>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            scanner: Scanner {
                root: root.into(),
                seen: HashMap::new(),
            },
            rescan_interval,
            tx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let dir = piggyback_dir(&self.scanner.root);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let mut watching = match spawn_watch_thread(&dir, wake_tx) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "inotify unavailable, relying on periodic rescans");
                false
            }
        };

        let existing = self.rescan().await?.len();
        tracing::info!(dir = %dir.display(), existing, watching, "watching for piggyback messages");

        let mut interval = tokio::time::interval(self.rescan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("piggyback watcher shutting down");
                    return Ok(());
                }

                wake = wake_rx.recv(), if watching => {
                    if wake.is_none() {
                        tracing::warn!("inotify thread stopped, relying on periodic rescans");
                        watching = false;
                        continue;
                    }
                }

                _ = interval.tick() => {}
            }

            for message in self.rescan().await? {
                if self.tx.send(message).await.is_err() {
                    tracing::info!("message consumer dropped, piggyback watcher exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn rescan(&mut self) -> anyhow::Result<Vec<PiggybackMessage>> {
        let mut scanner = std::mem::take(&mut self.scanner);
        let (scanner, messages) = tokio::task::spawn_blocking(move || {
            let messages = scanner.scan();
            (scanner, messages)
        })
        .await
        .context("piggyback scan failed")?;
        self.scanner = scanner;
        Ok(messages)
    }
}

impl Scanner {
    /// Messages that appeared or changed since the previous scan, oldest first.
    fn scan(&mut self) -> Vec<PiggybackMessage> {
        let dir = piggyback_dir(&self.root);
        let Ok(hosts) = fs::read_dir(&dir) else {
            self.seen.clear();
            return Vec::new();
        };

        let mut current = HashMap::with_capacity(self.seen.len());
        let mut messages = Vec::new();
        for host_entry in hosts.flatten() {
            let piggybacked = host_entry.file_name().to_string_lossy().into_owned();
            let Ok(sources) = fs::read_dir(host_entry.path()) else {
                continue;
            };
            for source_entry in sources.flatten() {
                let source = source_entry.file_name().to_string_lossy().into_owned();
                if source.starts_with('.') {
                    continue;
                }
                let Some(stamp) = stamp_of(&source_entry.path()) else {
                    continue;
                };
                let key = (piggybacked.clone(), source);
                if self.seen.get(&key) == Some(&stamp) {
                    current.insert(key, stamp);
                    continue;
                }
                // Only remember what was read; everything else comes round again.
                match read_message(&key.0, &key.1, &self.root) {
                    Ok(Some(message)) => {
                        messages.push(message);
                        current.insert(key, stamp);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "failed to read piggyback message"),
                }
            }
        }
        self.seen = current;

        messages.sort_by_key(|m| m.meta.message_timestamp);
        messages
    }
}

fn stamp_of(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: meta.modified().ok()?,
        inode: meta.ino(),
        len: meta.len(),
    })
}

/// Watch `dir` and every host directory below it; signal `wake` on changes.
///
/// Watches are in place when this returns. The thread ends once the
/// receiving side of `wake` is gone and the next event arrives.
fn spawn_watch_thread(
    dir: &Path,
    wake: mpsc::Sender<()>,
) -> nix::Result<std::thread::JoinHandle<()>> {
    let host_mask = AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_CLOSE_WRITE;
    let root_mask = AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_ONLYDIR;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)?;
    let root_watch = inotify.add_watch(dir, root_mask)?;
    for entry in fs::read_dir(dir).into_iter().flatten().flatten() {
        if entry.path().is_dir() {
            inotify.add_watch(entry.path().as_path(), host_mask)?;
        }
    }

    let dir = dir.to_path_buf();
    Ok(std::thread::spawn(move || loop {
        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "inotify read failed");
                return;
            }
        };

        let mut changed = false;
        for event in events {
            if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                changed = true;
                continue;
            }
            let Some(name) = event.name else { continue };
            if event.wd == root_watch {
                if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                    let host_dir = dir.join(&name);
                    if let Err(e) = inotify.add_watch(host_dir.as_path(), host_mask) {
                        tracing::warn!(dir = %host_dir.display(), error = %e, "cannot watch host directory");
                    }
                    changed = true;
                }
            } else if !name.to_string_lossy().starts_with('.') {
                changed = true;
            }
        }

        if changed && matches!(wake.try_send(()), Err(mpsc::error::TrySendError::Closed(_))) {
            return;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piggyback::store_piggyback_raw_data;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn store(root: &Path, source: &str, host: &str, data: &'static [u8], ts: i64) {
        let raw = BTreeMap::from([(host.to_string(), vec![Bytes::from_static(data)])]);
        store_piggyback_raw_data(source, &raw, ts, None, root).unwrap();
    }

    fn scanner(root: &Path) -> Scanner {
        Scanner {
            root: root.to_path_buf(),
            seen: HashMap::new(),
        }
    }

    #[test]
    fn missing_piggyback_dir_reports_nothing() {
        let root = tempfile::tempdir().unwrap();
        assert!(scanner(root.path()).scan().is_empty());
    }

    #[test]
    fn existing_files_are_primed_not_reported_twice() {
        let root = tempfile::tempdir().unwrap();
        store(root.path(), "src", "hostA", b"a", 100);

        let mut s = scanner(root.path());
        assert_eq!(s.scan().len(), 1);
        assert!(s.scan().is_empty());
    }

    #[test]
    fn new_and_replaced_files_are_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut s = scanner(root.path());
        assert!(s.scan().is_empty());

        store(root.path(), "src", "hostA", b"first", 100);
        let found = s.scan();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].meta.piggybacked, "hostA");

        // Same timestamp, new content: caught by the inode change.
        store(root.path(), "src", "hostA", b"second", 100);
        let found = s.scan();
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].raw_data[..], b"second\n");
    }

    #[test]
    fn reports_oldest_first() {
        let root = tempfile::tempdir().unwrap();
        let mut s = scanner(root.path());
        s.scan();

        store(root.path(), "s1", "hostB", b"b", 300);
        store(root.path(), "s2", "hostA", b"a", 200);

        let stamps: Vec<i64> = s.scan().iter().map(|m| m.meta.message_timestamp).collect();
        assert_eq!(stamps, vec![200, 300]);
    }

    #[test]
    fn unreadable_message_is_retried_on_the_next_scan() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let mut s = scanner(root.path());
        s.scan();

        store(root.path(), "src", "hostA", b"data", 100);
        let path = piggyback_dir(root.path()).join("hostA").join("src");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&path).is_ok() {
            // Running as root: permissions do not stop us.
            return;
        }
        assert!(s.scan().is_empty());

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let found = s.scan();
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].raw_data[..], b"data\n");
    }

    #[tokio::test]
    async fn new_messages_are_forwarded_without_waiting_for_a_rescan() {
        let root = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(
            PiggybackWatcher::new(root.path(), Duration::from_secs(3600), tx, shutdown_rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        store(root.path(), "src", "hostA", b"fresh", 100);

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.meta.source, "src");

        // A host directory that appeared after startup is watched as well.
        store(root.path(), "src", "hostA", b"again", 101);
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&message.raw_data[..], b"again\n");

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_rescan_finds_messages() {
        let root = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(
            PiggybackWatcher::new(root.path(), Duration::from_millis(20), tx, shutdown_rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        store(root.path(), "src", "hostB", b"polled", 100);

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.meta.piggybacked, "hostB");

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
