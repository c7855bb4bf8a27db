use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::types::{CacheKey, SchemaDescriptor};

/// On-disk form of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: CacheKey,
    pub schema: SchemaDescriptor,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

/// One JSON file per cache key. Supports point lookup, overwrite, deletion.
#[derive(Debug, Clone)]
pub struct SchemaStore {
    dir: PathBuf,
}

impl SchemaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    pub fn load(&self, key: &CacheKey) -> Result<Option<PersistedEntry>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cached schema {}", path.display()))?;
        let entry: PersistedEntry = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt cached schema {}", path.display()))?;
        if &entry.key != key {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Write to a temporary file and rename over the target, so readers see
    /// either the old entry or the new one.
    pub fn save(&self, entry: &PersistedEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&entry.key);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entry)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to publish cached schema {}", path.display()))?;
        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::schema::types::{Relation, RelationKind};

    fn entry(key: CacheKey) -> PersistedEntry {
        PersistedEntry {
            key,
            schema: SchemaDescriptor::new(
                Backend::Postgres,
                vec![Relation::new("orders", RelationKind::Table)],
            ),
            created_at: Utc::now(),
            ttl_ms: 60_000,
        }
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        let key = CacheKey::new(Backend::Postgres, "localhost:5432", "shop");

        assert!(store.load(&key).unwrap().is_none());
        store.save(&entry(key.clone())).unwrap();

        let loaded = store.load(&key).unwrap().unwrap();
        assert_eq!(loaded.schema.relations[0].name, "orders");
        assert_eq!(loaded.ttl_ms, 60_000);

        store.remove(&key).unwrap();
        assert!(store.load(&key).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        let key = CacheKey::new(Backend::Postgres, "localhost:5432", "shop");
        store.save(&entry(key.clone())).unwrap();
        store.save(&entry(key.clone())).unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with(".json"));
    }

    #[test]
    fn test_similar_keys_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        let dotted = CacheKey::new(Backend::Postgres, "db.example", "shop");
        let underscored = CacheKey::new(Backend::Postgres, "db_example", "shop");

        store.save(&entry(dotted.clone())).unwrap();
        store.save(&entry(underscored.clone())).unwrap();

        assert_eq!(store.load(&dotted).unwrap().unwrap().key, dotted);
        assert_eq!(store.load(&underscored).unwrap().unwrap().key, underscored);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_file_for_other_key_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        let a = CacheKey::new(Backend::Postgres, "a", "c");
        let b = CacheKey::new(Backend::Postgres, "b", "c");
        store.save(&entry(a.clone())).unwrap();
        std::fs::rename(store.path_for(&a), store.path_for(&b)).unwrap();
        assert!(store.load(&b).unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        store
            .save(&entry(CacheKey::new(Backend::Postgres, "h1", "d")))
            .unwrap();
        store
            .save(&entry(CacheKey::new(Backend::Postgres, "h2", "d")))
            .unwrap();
        store.clear().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
