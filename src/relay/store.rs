//! Relay registration record persisted at `data_dir/relay.json`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Relay host that is served over plain HTTP/WS during local development.
pub const LOCAL_RELAY_HOST: &str = "local.pockode.com";

const RECORD_FILE: &str = "relay.json";

/// Subdomain and credentials assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub subdomain: String,
    pub relay_server: String,
    pub relay_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<String>,
}

impl RegistrationRecord {
    fn is_local(&self) -> bool {
        self.relay_server == LOCAL_RELAY_HOST
    }

    /// URL viewers use to reach this server through the relay.
    pub fn public_url(&self) -> String {
        let scheme = if self.is_local() { "http" } else { "https" };
        format!("{scheme}://{}.{}", self.subdomain, self.relay_server)
    }

    /// WebSocket URL of the tunnel endpoint.
    pub fn tunnel_url(&self) -> String {
        let scheme = if self.is_local() { "ws" } else { "wss" };
        format!("{scheme}://{}.{}/relay", self.subdomain, self.relay_server)
    }
}

/// File-backed store for the single registration record.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(RECORD_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> io::Result<Option<RegistrationRecord>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the stored record atomically. Owner-only on unix.
    pub fn save(&self, record: &RegistrationRecord) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)
    }

    /// Remove the stored record. Missing files are not an error.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(server: &str) -> RegistrationRecord {
        RegistrationRecord {
            subdomain: "abc123".into(),
            relay_server: server.into(),
            relay_token: "tok".into(),
            announcement: None,
        }
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.load().unwrap(), None);

        let rec = record("relay.pockode.com");
        store.save(&rec).unwrap();
        assert_eq!(store.load().unwrap(), Some(rec));

        store.delete().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.delete().unwrap();
    }

    #[test]
    fn test_save_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(&dir.path().join("nested/data"));
        store.save(&record("relay.pockode.com")).unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save(&record("relay.pockode.com")).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        fs::write(store.path(), b"{not json").unwrap();
        assert_eq!(
            store.load().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_record_parses_without_announcement() {
        let rec: RegistrationRecord = serde_json::from_str(
            r#"{"subdomain":"s","relay_server":"r.example","relay_token":"t"}"#,
        )
        .unwrap();
        assert_eq!(rec.announcement, None);
    }

    #[test]
    fn test_urls() {
        let rec = record("relay.pockode.com");
        assert_eq!(rec.public_url(), "https://abc123.relay.pockode.com");
        assert_eq!(rec.tunnel_url(), "wss://abc123.relay.pockode.com/relay");

        let local = record(LOCAL_RELAY_HOST);
        assert_eq!(local.public_url(), "http://abc123.local.pockode.com");
        assert_eq!(local.tunnel_url(), "ws://abc123.local.pockode.com/relay");
    }
}
