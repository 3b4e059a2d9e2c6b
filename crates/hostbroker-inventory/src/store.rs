//! File-backed inventory store
//!
//! The inventory is a YAML sequence of flat maps. Every read and write goes
//! through one process-wide lock, and writes replace the file atomically
//! (temp file in the same directory, then rename).

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::entry::InventoryEntry;
use crate::error::InventoryError;
use crate::filter::Filter;

/// Serializes all inventory access within the process
static INVENTORY_LOCK: Mutex<()> = Mutex::const_new(());

/// Handle to an inventory file
#[derive(Debug, Clone)]
pub struct InventoryStore {
    path: PathBuf,
}

impl InventoryStore {
    /// Create a store for `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the inventory file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all entries, optionally filtered
    ///
    /// A missing file is an empty inventory.
    ///
    /// # Errors
    /// Returns `InventoryError` if the file cannot be read or parsed
    pub async fn load(&self, filter: Option<&Filter>) -> Result<Vec<InventoryEntry>, InventoryError> {
        let entries = {
            let _guard = INVENTORY_LOCK.lock().await;
            self.read_unlocked().await?
        };
        Ok(match filter {
            Some(filter) => filter.apply(entries),
            None => entries,
        })
    }

    /// Add and remove entries in one locked read-modify-write
    ///
    /// Entries matching any id in `remove` (by hostname or name) are dropped.
    /// An added entry replaces any existing entry for the same host; the old
    /// entry's data fills gaps in the new one. Removing ids that are not
    /// present is a no-op.
    ///
    /// # Errors
    /// Returns `InventoryError` if the file cannot be read, parsed or written
    #[instrument(skip(self, add, remove), fields(add = add.len(), remove = remove.len()))]
    pub async fn update(
        &self,
        add: Vec<InventoryEntry>,
        remove: &[String],
    ) -> Result<(), InventoryError> {
        let _guard = INVENTORY_LOCK.lock().await;
        let current = self.read_unlocked().await?;
        let before = current.len();

        let mut add = add;
        let mut kept = Vec::with_capacity(current.len() + add.len());
        for old in current {
            let removed = remove.iter().any(|id| old.matches(id));
            let replaced = add.iter_mut().find(|new| new.same_host(&old));
            match (removed, replaced) {
                (_, Some(new)) => *new = new.filled_from(&old),
                (true, None) => {}
                (false, None) => kept.push(old),
            }
        }
        let removed = before - kept.len();
        let added = add.len();
        kept.extend(add);

        self.write_unlocked(&kept).await?;
        debug!(added, removed, total = kept.len(), "inventory updated");
        Ok(())
    }

    /// Record new hosts
    ///
    /// # Errors
    /// Returns `InventoryError` on read or write failure
    pub async fn add(&self, entries: Vec<InventoryEntry>) -> Result<(), InventoryError> {
        self.update(entries, &[]).await
    }

    /// Forget hosts by hostname or name
    ///
    /// # Errors
    /// Returns `InventoryError` on read or write failure
    pub async fn remove(&self, ids: &[String]) -> Result<(), InventoryError> {
        self.update(Vec::new(), ids).await
    }

    async fn read_unlocked(&self) -> Result<Vec<InventoryEntry>, InventoryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(InventoryError::io(&self.path, &e)),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: Option<Vec<InventoryEntry>> = serde_yaml::from_str(&content)
            .map_err(|e| InventoryError::ParseError(format!("{}: {e}", self.path.display())))?;
        Ok(entries.unwrap_or_default())
    }

    async fn write_unlocked(&self, entries: &[InventoryEntry]) -> Result<(), InventoryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| InventoryError::io(parent, &e))?;
        }

        let yaml = serde_yaml::to_string(entries)
            .map_err(|e| InventoryError::SerializeError(e.to_string()))?;

        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "inventory".into(), |n| n.to_string_lossy().into_owned());
        let temp = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        tokio::fs::write(&temp, yaml)
            .await
            .map_err(|e| InventoryError::io(&temp, &e))?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(InventoryError::io(&self.path, &e));
        }

        info!(path = %self.path.display(), entries = entries.len(), "inventory written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(value: serde_json::Value) -> InventoryEntry {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("nope.yaml"));
        assert!(store.load(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("inventory.yaml"));
        store
            .add(vec![
                entry(json!({"hostname": "host.example.com"})),
                entry(json!({"hostname": "other.example.com"})),
            ])
            .await
            .unwrap();

        let ids = vec!["host.example.com".to_string()];
        store.remove(&ids).await.unwrap();
        let after_first = store.load(None).await.unwrap();
        store.remove(&ids).await.unwrap();
        let after_second = store.load(None).await.unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 1);
        assert_eq!(after_second[0].hostname(), Some("other.example.com"));
    }

    #[tokio::test]
    async fn test_merge_on_replace_keeps_extra() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("inventory.yaml"));
        store
            .add(vec![entry(json!({"hostname": "h", "extra": "keepme", "os": "old"}))])
            .await
            .unwrap();

        store
            .update(
                vec![entry(json!({"hostname": "h", "os": "new"}))],
                &["h".to_string()],
            )
            .await
            .unwrap();

        let entries = store.load(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get_str("extra"), Some("keepme"));
        assert_eq!(entries[0].get_str("os"), Some("new"));
    }

    #[tokio::test]
    async fn test_readding_same_host_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("inventory.yaml"));
        store.add(vec![entry(json!({"name": "vm-1", "a": 1}))]).await.unwrap();
        store.add(vec![entry(json!({"name": "vm-1", "b": 2}))]).await.unwrap();

        let entries = store.load(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get("a"), Some(&json!(1)));
        assert_eq!(entries[0].get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_creates_parent_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("inventory.yaml");
        let store = InventoryStore::new(&path);
        store.add(vec![entry(json!({"hostname": "h"}))]).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("inventory.yaml")]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("inventory.yaml"));

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .add(vec![entry(json!({"hostname": format!("host-{i}")}))])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.load(None).await.unwrap().len(), 20);
    }
}
