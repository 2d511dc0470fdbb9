use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::MacroError;
use crate::model::{Macro, MacroRecord, MacroSummary};

pub const MACROS_KEY: &str = "macros";
/// Copy of a stored blob that did not fully decode.
pub const BAD_KEY: &str = "macros.bad";

/// Opaque key/value persistence for the macro collection.
pub trait BlobStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&mut self, key: &str, value: &str) -> Result<()>;
}

/// One `<key>.json` file per key, replaced atomically on write.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(Some(s))
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.path(key);
        let tmp = path.with_extension("json.new");
        fs::write(&tmp, value).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }
}

/// Clones share the same map, so a test can hold one and watch writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBlobStore {
    pub fn with(key: &str, value: &str) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().insert(key.into(), value.into());
        store
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().unwrap().insert(key.into(), value.into());
        Ok(())
    }
}

pub struct MacroStore {
    blob: Box<dyn BlobStore>,
    macros: Vec<Macro>,
}

impl MacroStore {
    /// Entries that fail to decode are skipped with a warning. Whenever
    /// anything is skipped, the raw blob is first copied to [`BAD_KEY`] so the
    /// next write cannot destroy it; if that copy fails, loading fails.
    pub fn load(mut blob: Box<dyn BlobStore>) -> Result<Self> {
        let Some(raw) = blob.get(MACROS_KEY).context("load macro blob")? else {
            info!("macro: loaded 0");
            return Ok(Self { blob, macros: Vec::new() });
        };

        let (macros, skipped) = match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
            Ok(entries) => decode_entries(entries),
            Err(e) => {
                warn!("macro: stored collection unreadable: {}", e);
                (Vec::new(), 1)
            }
        };
        if skipped > 0 {
            blob.put(BAD_KEY, &raw).context("back up unreadable macro blob")?;
            warn!("macro: {} stored entries skipped; original kept under {:?}", skipped, BAD_KEY);
        }
        info!("macro: loaded {}", macros.len());
        Ok(Self { blob, macros })
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn list(&self) -> Vec<MacroSummary> {
        self.macros.iter().map(MacroSummary::from).collect()
    }

    pub fn get(&self, id: &str) -> Option<Macro> {
        self.macros.iter().find(|m| m.id == id).cloned()
    }

    pub fn save_json(&mut self, json: &str) -> Result<String, MacroError> {
        self.save(MacroRecord::parse(json)?)
    }

    /// Upserts by id, assigning a fresh one when absent. Returns the id.
    pub fn save(&mut self, record: MacroRecord) -> Result<String, MacroError> {
        record.validate()?;
        let id = match record.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.fresh_id(),
        };
        let saved = record.into_macro(id.clone());
        let (name, steps) = (saved.name.clone(), saved.steps.len());

        let previous = self.macros.clone();
        match self.macros.iter_mut().find(|m| m.id == id) {
            Some(slot) => *slot = saved,
            None => self.macros.push(saved),
        }
        if let Err(e) = self.persist() {
            self.macros = previous;
            return Err(e);
        }
        info!("macro: saved {} ({} steps)", name, steps);
        Ok(id)
    }

    pub fn delete(&mut self, id: &str) -> Result<Macro, MacroError> {
        let idx = self
            .macros
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MacroError::NotFound(id.to_string()))?;
        let removed = self.macros.remove(idx);
        if let Err(e) = self.persist() {
            self.macros.insert(idx, removed);
            return Err(e);
        }
        info!("macro: deleted {}", removed.name);
        Ok(removed)
    }

    fn persist(&mut self) -> Result<(), MacroError> {
        let raw = serde_json::to_string(&self.macros).map_err(|e| MacroError::Persist(e.into()))?;
        self.blob.put(MACROS_KEY, &raw).map_err(MacroError::Persist)
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = format!("{:08x}", rand::random::<u32>());
            if !self.macros.iter().any(|m| m.id == id) {
                return id;
            }
        }
    }
}

fn decode_entries(entries: Vec<serde_json::Value>) -> (Vec<Macro>, usize) {
    let mut macros: Vec<Macro> = Vec::with_capacity(entries.len());
    let mut skipped = 0;
    for (i, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<Macro>(entry) {
            Ok(m) if macros.iter().any(|k| k.id == m.id) => {
                warn!("macro: stored entry {} repeats id {}, skipped", i + 1, m.id);
                skipped += 1;
            }
            Ok(m) => macros.push(m),
            Err(e) => {
                warn!("macro: stored entry {} unreadable, skipped: {}", i + 1, e);
                skipped += 1;
            }
        }
    }
    (macros, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepKind;

    fn empty() -> (MacroStore, MemoryBlobStore) {
        let blob = MemoryBlobStore::default();
        (MacroStore::load(Box::new(blob.clone())).unwrap(), blob)
    }

    #[test]
    fn save_assigns_id_and_persists() {
        let (mut store, blob) = empty();
        let id = store
            .save_json(r#"{"name":"Projector on","icon":"P","steps":[{"kind":"tcp","target":"10.0.0.5","port":4352,"payload":"%1POWR 1","suffix":"\\r"}]}"#)
            .unwrap();
        assert_eq!(id.len(), 8);

        let raw = blob.get(MACROS_KEY).unwrap().unwrap();
        let persisted: Vec<Macro> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, id);
        assert_eq!(persisted[0].steps[0].kind, StepKind::Tcp);
    }

    #[test]
    fn save_with_id_upserts_in_place() {
        let (mut store, _) = empty();
        let a = store.save_json(r#"{"name":"A"}"#).unwrap();
        let b = store.save_json(r#"{"name":"B"}"#).unwrap();
        let again = store.save_json(&format!(r#"{{"id":"{}","name":"A2","steps":[{{"kind":"delay","delayMs":10}}]}}"#, a)).unwrap();
        assert_eq!(again, a);

        let list = store.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a);
        assert_eq!(list[0].name, "A2");
        assert_eq!(list[0].step_count, 1);
        assert_eq!(list[1].id, b);
    }

    #[test]
    fn malformed_save_changes_nothing() {
        let (mut store, blob) = empty();
        assert!(matches!(store.save_json("{not json"), Err(MacroError::Validation(_))));
        assert!(matches!(
            store.save_json(r#"{"steps":[{"kind":"telnet"}]}"#),
            Err(MacroError::Validation(_))
        ));
        assert!(store.is_empty());
        assert!(blob.get(MACROS_KEY).unwrap().is_none());
    }

    #[test]
    fn delete_reports_missing_ids() {
        let (mut store, _) = empty();
        let id = store.save_json(r#"{"name":"A"}"#).unwrap();
        assert!(matches!(store.delete("nope"), Err(MacroError::NotFound(_))));
        assert_eq!(store.delete(&id).unwrap().name, "A");
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn load_reads_legacy_blob() {
        let blob = MemoryBlobStore::with(
            MACROS_KEY,
            r#"[{"id":"m1","name":"Wall on","icon":"W","steps":[{"type":"rs232","payload":"PWR ON","suffix":"\\r","delay":0}]}]"#,
        );
        let store = MacroStore::load(Box::new(blob)).unwrap();
        let m = store.get("m1").unwrap();
        assert_eq!(m.steps[0].kind, StepKind::Rs232);
        assert_eq!(m.steps[0].delay_ms, 0);
    }

    #[test]
    fn bad_entry_does_not_take_good_ones_down() {
        let raw = r#"[{"id":"keep","name":"Wall on","steps":[{"type":"rs232","payload":"PWR ON"}]},{"id":"old","steps":[{"type":"ir","payload":"x"}]}]"#;
        let blob = MemoryBlobStore::with(MACROS_KEY, raw);
        let mut store = MacroStore::load(Box::new(blob.clone())).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(blob.get(BAD_KEY).unwrap().as_deref(), Some(raw));

        let new_id = store.save_json(r#"{"name":"New"}"#).unwrap();
        let persisted: Vec<Macro> = serde_json::from_str(&blob.get(MACROS_KEY).unwrap().unwrap()).unwrap();
        let ids: Vec<&str> = persisted.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["keep", new_id.as_str()]);
        assert_eq!(blob.get(BAD_KEY).unwrap().as_deref(), Some(raw));
    }

    #[test]
    fn unreadable_blob_is_kept_before_starting_empty() {
        let blob = MemoryBlobStore::with(MACROS_KEY, "garbage");
        let mut store = MacroStore::load(Box::new(blob.clone())).unwrap();
        assert!(store.is_empty());
        store.save_json(r#"{"name":"A"}"#).unwrap();
        assert_eq!(blob.get(BAD_KEY).unwrap().as_deref(), Some("garbage"));
    }

    #[test]
    fn clean_load_writes_no_backup() {
        let blob = MemoryBlobStore::with(MACROS_KEY, r#"[{"id":"a"}]"#);
        MacroStore::load(Box::new(blob.clone())).unwrap();
        assert!(blob.get(BAD_KEY).unwrap().is_none());
    }

    struct ReadOnlyBlob(MemoryBlobStore);

    impl BlobStore for ReadOnlyBlob {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }

        fn put(&mut self, _key: &str, _value: &str) -> Result<()> {
            anyhow::bail!("read-only")
        }
    }

    #[test]
    fn load_fails_when_backup_cannot_be_written() {
        let blob = ReadOnlyBlob(MemoryBlobStore::with(MACROS_KEY, "garbage"));
        assert!(MacroStore::load(Box::new(blob)).is_err());
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("avgate-store-{}", rand::random::<u32>()));
        let id = {
            let mut store = MacroStore::load(Box::new(FileBlobStore::new(&dir))).unwrap();
            store.save_json(r#"{"name":"Lights"}"#).unwrap()
        };
        let store = MacroStore::load(Box::new(FileBlobStore::new(&dir))).unwrap();
        assert_eq!(store.get(&id).unwrap().name, "Lights");
        let _ = fs::remove_dir_all(&dir);
    }
}
