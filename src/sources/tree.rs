//! A key/value tree, kept in memory or persisted as a JSON file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Source, SourceEntry};
use crate::error::{ConfError, ConfResult};
use crate::key::Key;
use crate::value::Value;

/// What is stored at a single key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    /// Locale-specific schema values, keyed by locale name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub localized: BTreeMap<String, Value>,
}

impl StoredEntry {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.schema_name.is_none() && self.localized.is_empty()
    }

    fn resolve(&self, locales: &[String]) -> Option<Value> {
        locales
            .iter()
            .find_map(|l| self.localized.get(l))
            .or(self.value.as_ref())
            .cloned()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tree {
    #[serde(default)]
    entries: BTreeMap<String, StoredEntry>,
}

#[derive(Debug)]
enum Backing {
    Memory,
    JsonFile(PathBuf),
}

/// The only concrete [`Source`]: a flat map from key to [`StoredEntry`].
pub struct TreeSource {
    address: String,
    writable: bool,
    backing: Backing,
    tree: Option<Tree>,
    dirty: bool,
}

impl TreeSource {
    /// A tree that lives only as long as the daemon.
    pub fn in_memory(address: impl Into<String>, writable: bool) -> Self {
        Self {
            address: address.into(),
            writable,
            backing: Backing::Memory,
            tree: Some(Tree::default()),
            dirty: false,
        }
    }

    /// A tree persisted at `path`, loaded on first access.
    pub fn json_file(address: impl Into<String>, path: PathBuf, writable: bool) -> Self {
        Self {
            address: address.into(),
            writable,
            backing: Backing::JsonFile(path),
            tree: None,
            dirty: false,
        }
    }

    /// Whether the parsed tree is currently held in memory.
    pub fn is_loaded(&self) -> bool {
        self.tree.is_some()
    }

    fn tree(&mut self) -> ConfResult<&mut Tree> {
        if self.tree.is_none() {
            let loaded = match &self.backing {
                Backing::Memory => Tree::default(),
                Backing::JsonFile(path) => load_tree(path)?,
            };
            self.tree = Some(loaded);
        }
        match self.tree.as_mut() {
            Some(tree) => Ok(tree),
            None => Err(ConfError::Failed(format!(
                "{}: tree unavailable after load",
                self.address
            ))),
        }
    }

    fn require_writable(&self, key: &Key) -> ConfResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(ConfError::NoPermission(format!(
                "{} is read-only, cannot modify `{}`",
                self.address, key
            )))
        }
    }
}

fn load_tree(path: &Path) -> ConfResult<Tree> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Source file missing, starting empty");
            return Ok(Tree::default());
        }
        Err(e) => return Err(ConfError::from_io(&path.display().to_string(), &e)),
    };
    if content.trim().is_empty() {
        return Ok(Tree::default());
    }
    serde_json::from_str(&content)
        .map_err(|e| ConfError::Corrupt(format!("{}: {}", path.display(), e)))
}

fn write_tree(path: &Path, tree: &Tree) -> ConfResult<()> {
    let context = path.display().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfError::from_io(&context, &e))?;
    }
    let json = serde_json::to_string_pretty(tree)
        .map_err(|e| ConfError::Failed(format!("{}: {}", context, e)))?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&tmp, json).map_err(|e| ConfError::from_io(&context, &e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ConfError::from_io(&context, &e)
    })
}

/// The prefix every strict descendant of `dir` starts with.
fn child_prefix(dir: &Key) -> String {
    if dir.is_root() {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

impl Source for TreeSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_writable(&self, _key: &Key) -> bool {
        self.writable
    }

    fn query_value(&mut self, key: &Key, locales: &[String]) -> ConfResult<Option<Value>> {
        let tree = self.tree()?;
        Ok(tree
            .entries
            .get(key.as_str())
            .and_then(|e| e.resolve(locales)))
    }

    fn query_schema_name(&mut self, key: &Key) -> ConfResult<Option<String>> {
        let tree = self.tree()?;
        Ok(tree
            .entries
            .get(key.as_str())
            .and_then(|e| e.schema_name.clone()))
    }

    fn set_value(&mut self, key: &Key, value: &Value) -> ConfResult<()> {
        self.require_writable(key)?;
        let tree = self.tree()?;
        let entry = tree.entries.entry(key.to_string()).or_default();
        match value.as_schema().and_then(|s| s.locale.clone()) {
            Some(locale) => {
                entry.localized.insert(locale, value.clone());
            }
            None => entry.value = Some(value.clone()),
        }
        self.dirty = true;
        Ok(())
    }

    fn unset_value(&mut self, key: &Key, locale: Option<&str>) -> ConfResult<bool> {
        self.require_writable(key)?;
        let tree = self.tree()?;
        let Some(entry) = tree.entries.get_mut(key.as_str()) else {
            return Ok(false);
        };
        let removed = match locale {
            Some(locale) if entry.localized.remove(locale).is_some() => true,
            Some(_) => entry.value.take().is_some(),
            None => {
                let had_localized = !entry.localized.is_empty();
                entry.localized.clear();
                entry.value.take().is_some() || had_localized
            }
        };
        if entry.is_empty() {
            tree.entries.remove(key.as_str());
        }
        if removed {
            self.dirty = true;
        }
        Ok(removed)
    }

    fn all_entries(&mut self, dir: &Key, locales: &[String]) -> ConfResult<Vec<SourceEntry>> {
        let prefix = child_prefix(dir);
        let tree = self.tree()?;
        Ok(tree
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, e)| {
                let name = &k[prefix.len()..];
                if name.contains('/') {
                    return None;
                }
                Some(SourceEntry {
                    name: name.to_string(),
                    value: e.resolve(locales),
                    schema_name: e.schema_name.clone(),
                })
            })
            .collect())
    }

    fn all_dirs(&mut self, dir: &Key) -> ConfResult<Vec<String>> {
        let prefix = child_prefix(dir);
        let tree = self.tree()?;
        let dirs: BTreeSet<String> = tree
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                rest.find('/').map(|idx| rest[..idx].to_string())
            })
            .collect();
        Ok(dirs.into_iter().collect())
    }

    fn dir_exists(&mut self, dir: &Key) -> ConfResult<bool> {
        if dir.is_root() {
            return Ok(true);
        }
        let prefix = child_prefix(dir);
        let tree = self.tree()?;
        Ok(tree
            .entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix)))
    }

    fn remove_dir(&mut self, dir: &Key) -> ConfResult<()> {
        self.require_writable(dir)?;
        let prefix = child_prefix(dir);
        let tree = self.tree()?;
        let before = tree.entries.len();
        tree.entries.retain(|k, _| !k.starts_with(&prefix));
        if tree.entries.len() != before {
            self.dirty = true;
        }
        Ok(())
    }

    fn set_schema(&mut self, key: &Key, schema_key: Option<&Key>) -> ConfResult<()> {
        self.require_writable(key)?;
        let tree = self.tree()?;
        match schema_key {
            Some(schema_key) => {
                tree.entries.entry(key.to_string()).or_default().schema_name =
                    Some(schema_key.to_string());
            }
            None => {
                let Some(entry) = tree.entries.get_mut(key.as_str()) else {
                    return Ok(());
                };
                entry.schema_name = None;
                if entry.is_empty() {
                    tree.entries.remove(key.as_str());
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn sync(&mut self) -> ConfResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let (Backing::JsonFile(path), Some(tree)) = (&self.backing, &self.tree) {
            write_tree(path, tree)?;
            info!(address = %self.address, entries = tree.entries.len(), "Wrote source");
        }
        self.dirty = false;
        Ok(())
    }

    fn clear_cache(&mut self) {
        if matches!(self.backing, Backing::JsonFile(_)) && !self.dirty {
            self.tree = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::value::{Schema, ValueType};
    use tempfile::TempDir;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    #[test]
    fn set_query_unset() {
        let mut src = TreeSource::in_memory("mem:readwrite:test", true);
        src.set_value(&key("/apps/x"), &Value::Int(1)).unwrap();
        assert_eq!(src.query_value(&key("/apps/x"), &[]).unwrap(), Some(Value::Int(1)));
        assert!(src.unset_value(&key("/apps/x"), None).unwrap());
        assert!(!src.unset_value(&key("/apps/x"), None).unwrap());
        assert_eq!(src.query_value(&key("/apps/x"), &[]).unwrap(), None);
    }

    #[test]
    fn readonly_rejects_writes() {
        let mut src = TreeSource::in_memory("mem:readonly:test", false);
        let err = src.set_value(&key("/a"), &Value::Bool(true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPermission);
    }

    #[test]
    fn entries_and_dirs_are_direct_children() {
        let mut src = TreeSource::in_memory("mem:readwrite:test", true);
        for k in ["/apps/a", "/apps/b", "/apps/sub/c", "/apps/sub/deep/d", "/appsx/e"] {
            src.set_value(&key(k), &Value::Int(0)).unwrap();
        }
        let names: Vec<String> = src
            .all_entries(&key("/apps"), &[])
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(src.all_dirs(&key("/apps")).unwrap(), vec!["sub"]);
        assert_eq!(src.all_dirs(&Key::root()).unwrap(), vec!["apps", "appsx"]);
        assert!(src.dir_exists(&key("/apps/sub")).unwrap());
        assert!(!src.dir_exists(&key("/apps/a")).unwrap());
    }

    #[test]
    fn remove_dir_drops_subtree() {
        let mut src = TreeSource::in_memory("mem:readwrite:test", true);
        src.set_value(&key("/apps/sub/c"), &Value::Int(0)).unwrap();
        src.set_value(&key("/apps/subx"), &Value::Int(0)).unwrap();
        src.remove_dir(&key("/apps/sub")).unwrap();
        assert!(!src.dir_exists(&key("/apps/sub")).unwrap());
        assert!(src.query_value(&key("/apps/subx"), &[]).unwrap().is_some());
    }

    #[test]
    fn localized_schemas_resolve_by_locale() {
        let mut src = TreeSource::in_memory("mem:readwrite:test", true);
        let k = key("/schemas/apps/x");
        let plain = Value::Schema(Box::new(Schema::new(ValueType::Int)));
        let french = Value::Schema(Box::new(Schema::new(ValueType::Int).with_locale("fr")));
        src.set_value(&k, &plain).unwrap();
        src.set_value(&k, &french).unwrap();

        let locales = vec!["fr_FR".to_string(), "fr".to_string(), "C".to_string()];
        assert_eq!(src.query_value(&k, &locales).unwrap(), Some(french));
        assert_eq!(src.query_value(&k, &[]).unwrap(), Some(plain.clone()));

        assert!(src.unset_value(&k, Some("fr")).unwrap());
        assert_eq!(src.query_value(&k, &locales).unwrap(), Some(plain));
    }

    #[test]
    fn schema_names_keep_entry_alive() {
        let mut src = TreeSource::in_memory("mem:readwrite:test", true);
        let k = key("/apps/x");
        src.set_schema(&k, Some(&key("/schemas/apps/x"))).unwrap();
        assert_eq!(
            src.query_schema_name(&k).unwrap().as_deref(),
            Some("/schemas/apps/x")
        );
        assert_eq!(src.all_entries(&key("/apps"), &[]).unwrap().len(), 1);
        src.set_schema(&k, None).unwrap();
        assert!(src.all_entries(&key("/apps"), &[]).unwrap().is_empty());
    }

    #[test]
    fn json_file_persists_on_sync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tree.json");

        let mut src = TreeSource::json_file("json:readwrite:t", path.clone(), true);
        src.set_value(&key("/apps/x"), &Value::String("hi".into())).unwrap();
        assert!(!path.exists());
        src.sync().unwrap();
        assert!(path.exists());

        let mut reopened = TreeSource::json_file("json:readonly:t", path, false);
        assert_eq!(
            reopened.query_value(&key("/apps/x"), &[]).unwrap(),
            Some(Value::String("hi".into()))
        );
    }

    #[test]
    fn clear_cache_rereads_clean_tree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        let mut src = TreeSource::json_file("json:readwrite:t", path.clone(), true);
        src.set_value(&key("/a"), &Value::Int(1)).unwrap();

        // Dirty trees survive a cache clear.
        src.clear_cache();
        assert!(src.is_loaded());
        src.sync().unwrap();

        fs::write(&path, r#"{"entries":{"/a":{"value":{"type":"int","value":2}}}}"#).unwrap();
        src.clear_cache();
        assert!(!src.is_loaded());
        assert_eq!(src.query_value(&key("/a"), &[]).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn unparseable_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        fs::write(&path, "{ not json").unwrap();
        let mut src = TreeSource::json_file("json:readonly:t", path, false);
        let err = src.query_value(&key("/a"), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
