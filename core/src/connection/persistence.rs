//! Non-secret connection persistence (§4.C): a document store keyed by
//! connection id. Passwords never go into this store — only the config
//! shape named in §4.C ("a document store keyed by `id` holds
//! `{id, name, host, port, username, privateKey?, lastUsed, tags}`").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConnection {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: Option<String>,
    pub last_used: i64,
    pub tags: Vec<String>,
}

/// JSON-file-backed document store for connection records.
pub struct ConnectionStore {
    path: PathBuf,
    records: RwLock<HashMap<String, PersistedConnection>>,
}

impl ConnectionStore {
    pub fn open(path: PathBuf) -> Self {
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            path,
            records: RwLock::new(records),
        }
    }

    pub fn upsert(&self, record: PersistedConnection) -> std::io::Result<()> {
        {
            let mut records = self.records.write().expect("connection store lock poisoned");
            records.insert(record.id.clone(), record);
        }
        self.flush()
    }

    pub fn remove(&self, id: &str) -> std::io::Result<()> {
        {
            let mut records = self.records.write().expect("connection store lock poisoned");
            records.remove(id);
        }
        self.flush()
    }

    pub fn get(&self, id: &str) -> Option<PersistedConnection> {
        self.records
            .read()
            .expect("connection store lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<PersistedConnection> {
        self.records
            .read()
            .expect("connection store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn flush(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let records = self.records.read().expect("connection store lock poisoned");
        let json = serde_json::to_string_pretty(&*records)?;
        std::fs::write(&self.path, json)
    }
}

pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("connections.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str) -> PersistedConnection {
        PersistedConnection {
            id: id.into(),
            name: Some("box".into()),
            host: "example.com".into(),
            port: 22,
            username: "root".into(),
            private_key: None,
            last_used: 0,
            tags: vec![],
        }
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = ConnectionStore::open(dir.path().join("connections.json"));
        store.upsert(record("a")).unwrap();
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
    }

    #[test]
    fn survives_reload_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("connections.json");
        ConnectionStore::open(path.clone()).upsert(record("a")).unwrap();
        let reopened = ConnectionStore::open(path);
        assert_eq!(reopened.list().len(), 1);
    }

    #[test]
    fn remove_deletes_record() {
        let dir = tempdir().unwrap();
        let store = ConnectionStore::open(dir.path().join("connections.json"));
        store.upsert(record("a")).unwrap();
        store.remove("a").unwrap();
        assert!(store.get("a").is_none());
    }
}
