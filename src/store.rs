//! Persistence store (C2): durable key->document storage over named JSON
//! files, rooted at a per-server data directory.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::pf_warn;

/// Named-document store rooted at a data directory, with an isolated
/// `replication/` sub-namespace for election/replication/sync bookkeeping.
/// Mirrors `common_utils/persistence.py::DataStore`: missing files and
/// parse failures both yield the caller's `default`, logged but never
/// propagated as an error, because the original protocol's correctness
/// depends on "no file yet" meaning "empty state", not "broken state".
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
    replication_root: PathBuf,
}

impl DataStore {
    /// Creates the store rooted at `root`, creating `root` and
    /// `root/replication` if they don't already exist.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        let replication_root = root.join("replication");
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(&replication_root)?;
        Ok(DataStore {
            root,
            replication_root,
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn replication_path_for(&self, name: &str) -> PathBuf {
        self.replication_root.join(format!("{name}.json"))
    }

    /// Loads the document named `name`, or `default` if the file is
    /// missing or unparseable.
    pub fn load<T>(&self, name: &str, default: T) -> T
    where
        T: DeserializeOwned,
    {
        Self::load_path(&self.path_for(name), default)
    }

    /// Overwrites the document named `name` with `value`, pretty-printed
    /// UTF-8 JSON.
    pub fn save<T>(&self, name: &str, value: &T) -> std::io::Result<()>
    where
        T: Serialize,
    {
        Self::save_path(&self.path_for(name), value)
    }

    /// Loads the document named `name` as a `Vec<T>` (defaulting to
    /// empty), appends `item`, and rewrites the whole file. Not atomic
    /// across processes -- acceptable since each server owns its
    /// directory exclusively.
    pub fn append<T>(&self, name: &str, item: T) -> std::io::Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut items: Vec<T> = self.load(name, Vec::new());
        items.push(item);
        self.save(name, &items)
    }

    /// Loads `server_name`'s document from the `replication/`
    /// sub-namespace.
    pub fn replication_load<T>(&self, server_name: &str, default: T) -> T
    where
        T: DeserializeOwned,
    {
        Self::load_path(&self.replication_path_for(server_name), default)
    }

    /// Saves `server_name`'s document into the `replication/`
    /// sub-namespace.
    pub fn replication_save<T>(&self, server_name: &str, value: &T) -> std::io::Result<()>
    where
        T: Serialize,
    {
        Self::save_path(&self.replication_path_for(server_name), value)
    }

    fn load_path<T>(path: &Path, default: T) -> T
    where
        T: DeserializeOwned,
    {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return default,
            Err(e) => {
                pf_warn!("failed to read {}: {}", path.display(), e);
                return default;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                pf_warn!("failed to parse {}: {}", path.display(), e);
                default
            }
        }
    }

    fn save_path<T>(path: &Path, value: &T) -> std::io::Result<()>
    where
        T: Serialize,
    {
        let text = serde_json::to_string_pretty(value)
            .unwrap_or_else(|e| panic!("value not JSON-serializable: {e}"));
        std::fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
    struct Doc {
        n: u32,
    }

    fn temp_store() -> (DataStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn load_missing_returns_default() {
        let (store, _dir) = temp_store();
        let d: Doc = store.load("nope", Doc::default());
        assert_eq!(d, Doc::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let (store, _dir) = temp_store();
        store.save("doc", &Doc { n: 7 }).unwrap();
        let d: Doc = store.load("doc", Doc::default());
        assert_eq!(d, Doc { n: 7 });
    }

    #[test]
    fn append_accumulates() {
        let (store, _dir) = temp_store();
        store.append("items", Doc { n: 1 }).unwrap();
        store.append("items", Doc { n: 2 }).unwrap();
        let items: Vec<Doc> = store.load("items", Vec::new());
        assert_eq!(items, vec![Doc { n: 1 }, Doc { n: 2 }]);
    }

    #[test]
    fn replication_namespace_is_isolated() {
        let (store, _dir) = temp_store();
        store.save("peer", &Doc { n: 1 }).unwrap();
        let from_replication: Doc = store.replication_load("peer", Doc::default());
        assert_eq!(from_replication, Doc::default());
    }

    #[test]
    fn corrupt_file_returns_default() {
        let (store, dir) = temp_store();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let d: Doc = store.load("bad", Doc::default());
        assert_eq!(d, Doc::default());
    }
}
