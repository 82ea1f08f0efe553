//! Connection registry
//!
//! Records live under the control directory, one JSON file per connection:
//!
//! ```text
//! <control_dir>/records/<key>.json
//! <control_dir>/sockets/<key>.sock
//! <control_dir>/logs/<host>_<device>_<unix-ts>.log
//! ```
//!
//! `<key>` is a short hash of the locator so that socket paths stay within
//! the Unix domain socket length limit. `records/` only ever holds live
//! records; logs accumulate separately and are pruned by age.
//!
//! Writes are atomic per record (temp file plus rename). There is no lock
//! across records, so two processes connecting the same device at the same
//! moment may both launch an agent.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::StorageError;
use crate::process;
use crate::time::unix_now_secs;
use crate::types::{ConnectionRecord, DeviceLocator};

const RECORDS_DIR: &str = "records";
const SOCKETS_DIR: &str = "sockets";
const LOGS_DIR: &str = "logs";

/// Records without a pid younger than this are assumed to be mid-launch
const LAUNCH_GRACE: Duration = Duration::from_secs(60);

/// On-disk index of device connections
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    records: PathBuf,
    sockets: PathBuf,
    logs: PathBuf,
}

impl Registry {
    /// Open the registry rooted at `control_dir`, creating its directories
    pub fn open(control_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = control_dir.into();
        let registry = Self {
            records: root.join(RECORDS_DIR),
            sockets: root.join(SOCKETS_DIR),
            logs: root.join(LOGS_DIR),
            root,
        };
        registry.ensure_dirs()?;
        Ok(registry)
    }

    /// Create the registry directories if missing
    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.records, &self.sockets, &self.logs] {
            fs::create_dir_all(dir).map_err(|e| StorageError::io("create", dir, e))?;
        }
        Ok(())
    }

    /// The control directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding agent logs
    pub fn logs_dir(&self) -> &Path {
        &self.logs
    }

    /// Stable short key for a locator
    pub fn key(locator: &DeviceLocator) -> String {
        let mut hasher = Sha256::new();
        hasher.update(locator.service_endpoint.as_bytes());
        hasher.update([0u8]);
        hasher.update(locator.host.as_bytes());
        hasher.update([0u8]);
        hasher.update(locator.device_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }

    fn record_path(&self, locator: &DeviceLocator) -> PathBuf {
        self.records.join(format!("{}.json", Self::key(locator)))
    }

    /// Control socket path for a locator
    pub fn socket_path(&self, locator: &DeviceLocator) -> PathBuf {
        self.sockets.join(format!("{}.sock", Self::key(locator)))
    }

    /// Fresh log file path for a new connection attempt
    pub fn new_log_path(&self, locator: &DeviceLocator) -> PathBuf {
        self.logs.join(format!(
            "{}_{}_{}.log",
            file_safe(&locator.host),
            file_safe(&locator.device_id),
            unix_now_secs()
        ))
    }

    /// Insert or overwrite a record
    pub fn put(&self, record: &ConnectionRecord) -> Result<(), StorageError> {
        let path = self.record_path(&record.locator);
        let json = serde_json::to_vec_pretty(record)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.records)
            .map_err(|e| StorageError::io("create temp file in", &self.records, e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StorageError::io("write", tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StorageError::io("rename into", &path, e.error))?;

        tracing::debug!("Stored connection record for {}", record.locator);
        Ok(())
    }

    /// Look up the record for a locator
    pub fn get(&self, locator: &DeviceLocator) -> Result<Option<ConnectionRecord>, StorageError> {
        let path = self.record_path(locator);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io("read", &path, e)),
        };
        let record = serde_json::from_slice(&data)
            .map_err(|source| StorageError::Corrupt { path, source })?;
        Ok(Some(record))
    }

    /// Every parseable record for a host
    pub fn list_by_host(&self, host: &str) -> Result<Vec<ConnectionRecord>, StorageError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|r| r.locator.host == host)
            .collect())
    }

    /// Every parseable record, ordered by host then device
    ///
    /// Unparseable files are skipped with a warning.
    pub fn list_all(&self) -> Result<Vec<ConnectionRecord>, StorageError> {
        let entries =
            fs::read_dir(&self.records).map_err(|e| StorageError::io("list", &self.records, e))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("list", &self.records, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_slice::<ConnectionRecord>(&data).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable connection record {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| {
            (&a.locator.host, &a.locator.device_id).cmp(&(&b.locator.host, &b.locator.device_id))
        });
        Ok(records)
    }

    /// Remove the record for a locator; absent records are fine
    pub fn remove(&self, locator: &DeviceLocator) -> Result<(), StorageError> {
        let path = self.record_path(locator);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed connection record for {}", locator);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove", &path, e)),
        }
    }

    /// Delete agent logs last modified more than `max_age` ago
    ///
    /// Keeps going past individual failures and reports them together.
    pub fn prune_stale_logs(&self, max_age: Duration) -> Result<usize, StorageError> {
        let entries =
            fs::read_dir(&self.logs).map_err(|e| StorageError::io("list", &self.logs, e))?;
        let now = SystemTime::now();

        let mut removed = 0;
        let mut failures = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };
            let path = entry.path();
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    failures.push(format!("{:?}: {}", path, e));
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("{:?}: {}", path, e)),
            }
        }

        if failures.is_empty() {
            if removed > 0 {
                tracing::debug!("Pruned {} old agent logs", removed);
            }
            Ok(removed)
        } else {
            Err(StorageError::LogPrune { removed, failures })
        }
    }

    /// Drop records whose agent is no longer running
    ///
    /// Stale control sockets are deleted with their record. Returns the
    /// removed records.
    pub fn reconcile(&self) -> Result<Vec<ConnectionRecord>, StorageError> {
        let now = unix_now_secs();
        let mut removed = Vec::new();

        for record in self.list_all()? {
            let alive = match record.agent_pid {
                Some(pid) => process::is_process_alive(pid),
                None => now.saturating_sub(record.created_at) < LAUNCH_GRACE.as_secs(),
            };
            if alive {
                continue;
            }

            tracing::info!(
                "Removing stale connection {} (agent pid {:?} gone)",
                record.locator,
                record.agent_pid
            );
            remove_socket_file(&record.control_socket)?;
            self.remove(&record.locator)?;
            removed.push(record);
        }

        Ok(removed)
    }
}

/// Delete a control socket file; a missing file is not an error
pub fn remove_socket_file(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io("remove", path, e)),
    }
}

fn file_safe(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvdr_protocol::ConnectionStatus;
    use tempfile::TempDir;

    use crate::types::AgentKind;

    fn create_test_registry() -> (Registry, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("connections")).unwrap();
        (registry, dir)
    }

    fn record(registry: &Registry, host: &str, device: &str, pid: Option<u32>) -> ConnectionRecord {
        let locator = DeviceLocator::new("http://svc", host, device);
        ConnectionRecord {
            status: ConnectionStatus::connected(5555),
            agent_pid: pid,
            agent_kind: AgentKind::Proxy,
            log_file: registry.new_log_path(&locator),
            control_socket: registry.socket_path(&locator),
            created_at: unix_now_secs(),
            locator,
        }
    }

    #[test]
    fn test_open_creates_layout() {
        let (registry, _dir) = create_test_registry();
        assert!(registry.root().join("records").is_dir());
        assert!(registry.root().join("sockets").is_dir());
        assert!(registry.logs_dir().is_dir());
    }

    #[test]
    fn test_put_get_remove() {
        let (registry, _dir) = create_test_registry();
        let rec = record(&registry, "host-1", "dev-7", Some(std::process::id()));

        assert!(registry.get(&rec.locator).unwrap().is_none());
        registry.put(&rec).unwrap();
        assert_eq!(registry.get(&rec.locator).unwrap(), Some(rec.clone()));

        registry.remove(&rec.locator).unwrap();
        assert!(registry.get(&rec.locator).unwrap().is_none());
        // Second remove is a no-op
        registry.remove(&rec.locator).unwrap();
    }

    #[test]
    fn test_put_overwrites() {
        let (registry, _dir) = create_test_registry();
        let mut rec = record(&registry, "host-1", "dev-7", None);
        rec.status = ConnectionStatus::connecting();
        registry.put(&rec).unwrap();

        rec.status = ConnectionStatus::connected(5556);
        rec.agent_pid = Some(42);
        registry.put(&rec).unwrap();

        let stored = registry.get(&rec.locator).unwrap().unwrap();
        assert_eq!(stored.status.control_port, Some(5556));
        assert_eq!(registry.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_record_is_error_on_get_and_skipped_on_list() {
        let (registry, _dir) = create_test_registry();
        let good = record(&registry, "host-1", "dev-1", None);
        registry.put(&good).unwrap();

        let bad = DeviceLocator::new("http://svc", "host-1", "dev-2");
        fs::write(registry.record_path(&bad), b"{ not json").unwrap();

        assert!(matches!(
            registry.get(&bad),
            Err(StorageError::Corrupt { .. })
        ));
        let all = registry.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].locator, good.locator);
    }

    #[test]
    fn test_list_by_host() {
        let (registry, _dir) = create_test_registry();
        for (host, dev) in [("host-1", "b"), ("host-2", "a"), ("host-1", "a")] {
            registry.put(&record(&registry, host, dev, None)).unwrap();
        }

        let host1: Vec<_> = registry
            .list_by_host("host-1")
            .unwrap()
            .into_iter()
            .map(|r| r.locator.device_id)
            .collect();
        assert_eq!(host1, vec!["a", "b"]);
        assert!(registry.list_by_host("host-3").unwrap().is_empty());
    }

    #[test]
    fn test_keys_differ_per_field() {
        let a = DeviceLocator::new("http://svc", "host-1", "dev-7");
        let b = DeviceLocator::new("http://svc", "host-1dev-7", "");
        let c = DeviceLocator::new("http://other", "host-1", "dev-7");
        assert_eq!(Registry::key(&a).len(), 16);
        assert_ne!(Registry::key(&a), Registry::key(&b));
        assert_ne!(Registry::key(&a), Registry::key(&c));
        assert_eq!(Registry::key(&a), Registry::key(&a.clone()));
    }

    #[test]
    fn test_log_path_is_file_safe() {
        let (registry, _dir) = create_test_registry();
        let locator = DeviceLocator::new("http://svc", "host/1", "cvd 1");
        let path = registry.new_log_path(&locator);
        assert_eq!(path.parent().unwrap(), registry.logs_dir());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("host_1_cvd_1_"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_prune_stale_logs() {
        let (registry, _dir) = create_test_registry();
        let old = registry.logs_dir().join("old.log");
        fs::write(&old, b"old").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.prune_stale_logs(Duration::from_secs(3600)).unwrap(), 0);
        assert!(old.exists());

        assert_eq!(registry.prune_stale_logs(Duration::ZERO).unwrap(), 1);
        assert!(!old.exists());
    }

    #[test]
    fn test_reconcile_drops_dead_agents() {
        let (registry, _dir) = create_test_registry();
        let live = record(&registry, "host-1", "live", Some(std::process::id()));
        let dead = record(&registry, "host-1", "dead", Some(999_999_999));
        let launching = record(&registry, "host-1", "launching", None);
        let mut abandoned = record(&registry, "host-1", "abandoned", None);
        abandoned.created_at -= 3600;

        fs::write(&dead.control_socket, b"").unwrap();
        for rec in [&live, &dead, &launching, &abandoned] {
            registry.put(rec).unwrap();
        }

        let removed: Vec<_> = registry
            .reconcile()
            .unwrap()
            .into_iter()
            .map(|r| r.locator.device_id)
            .collect();

        assert_eq!(removed, vec!["abandoned", "dead"]);
        assert!(!dead.control_socket.exists());
        assert!(registry.get(&live.locator).unwrap().is_some());
        assert!(registry.get(&launching.locator).unwrap().is_some());
    }

    #[test]
    fn test_remove_missing_socket_file_is_ok() {
        let dir = TempDir::new().unwrap();
        remove_socket_file(&dir.path().join("gone.sock")).unwrap();
    }
}
