//! Ordered chains of configuration sources.
//!
//! A [`SourceSet`] is searched front to back. Reads return the first value
//! found; writes go to the first writable source, unless a read-only source
//! in front of it already holds a value for the key.

pub mod locale;
pub mod tree;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{ConfError, ConfResult};
use crate::key::Key;
use crate::value::{Entry, Lookup, Schema, Value};

pub use locale::{expand_locale, LocaleCache, LOCALE_CACHE_MAX_AGE};
pub use tree::{StoredEntry, TreeSource};

/// A directory entry as a single source sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    pub name: String,
    pub value: Option<Value>,
    pub schema_name: Option<String>,
}

/// A single backing store.
///
/// Queries take `&mut self` so implementations can load lazily.
pub trait Source: Send {
    fn address(&self) -> &str;
    fn is_writable(&self, key: &Key) -> bool;
    fn query_value(&mut self, key: &Key, locales: &[String]) -> ConfResult<Option<Value>>;
    fn query_schema_name(&mut self, key: &Key) -> ConfResult<Option<String>>;
    fn set_value(&mut self, key: &Key, value: &Value) -> ConfResult<()>;
    /// Returns whether anything was removed.
    fn unset_value(&mut self, key: &Key, locale: Option<&str>) -> ConfResult<bool>;
    fn all_entries(&mut self, dir: &Key, locales: &[String]) -> ConfResult<Vec<SourceEntry>>;
    fn all_dirs(&mut self, dir: &Key) -> ConfResult<Vec<String>>;
    fn dir_exists(&mut self, dir: &Key) -> ConfResult<bool>;
    fn remove_dir(&mut self, dir: &Key) -> ConfResult<()>;
    fn set_schema(&mut self, key: &Key, schema_key: Option<&Key>) -> ConfResult<()>;
    fn sync(&mut self) -> ConfResult<()>;
    fn clear_cache(&mut self);
}

/// Options for [`SourceSet::recursive_unset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UnsetFlags {
    #[serde(default)]
    pub including_schema_names: bool,
}

/// Outcome of a recursive unset: the keys whose state changed and the first
/// error hit along the way.
#[derive(Debug, Default)]
pub struct RecursiveUnset {
    pub affected: Vec<Key>,
    /// Addresses of the sources that lost something.
    pub modified: Vec<String>,
    pub first_error: Option<ConfError>,
}

impl RecursiveUnset {
    fn note_modified(&mut self, addresses: Vec<String>) -> bool {
        let changed = !addresses.is_empty();
        for address in addresses {
            if !self.modified.contains(&address) {
                self.modified.push(address);
            }
        }
        changed
    }
}

/// Whether two addresses name the same backing store. Flags are ignored:
/// `json:readonly:/a` and `json:readwrite:/a` are one file. In-memory
/// stores belong to the chain that created them and are never shared.
pub fn same_resource(a: &str, b: &str) -> bool {
    fn split(address: &str) -> Option<(&str, &str)> {
        let mut parts = address.splitn(3, ':');
        let backend = parts.next()?;
        let _flags = parts.next()?;
        Some((backend, parts.next()?))
    }
    match (split(a), split(b)) {
        (Some(("mem", _)), _) | (_, Some(("mem", _))) => false,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Resolve a `<backend>:<flags>:<path>` address into a source.
pub fn resolve_address(address: &str) -> ConfResult<Box<dyn Source>> {
    let mut parts = address.splitn(3, ':');
    let (Some(backend), Some(flags), Some(path)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ConfError::bad_address(
            address,
            "expected <backend>:<flags>:<path>",
        ));
    };
    if path.is_empty() {
        return Err(ConfError::bad_address(address, "missing path"));
    }

    let mut writable = false;
    for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        match flag {
            "readwrite" => writable = true,
            "readonly" => writable = false,
            other => {
                return Err(ConfError::bad_address(
                    address,
                    format!("unknown flag `{}`", other),
                ))
            }
        }
    }

    match backend {
        "mem" => Ok(Box::new(TreeSource::in_memory(address, writable))),
        "json" => Ok(Box::new(TreeSource::json_file(
            address,
            expand_home(path),
            writable,
        ))),
        other => Err(ConfError::bad_address(
            address,
            format!("unknown backend `{}`", other),
        )),
    }
}

fn expand_home(path: &str) -> PathBuf {
    let home = dirs::home_dir();
    if let (Some(rest), Some(home)) = (path.strip_prefix("~/"), home.as_ref()) {
        return home.join(rest);
    }
    if let (Some(rest), Some(home)) = (path.strip_prefix("$(HOME)"), home.as_ref()) {
        return home.join(rest.trim_start_matches('/'));
    }
    PathBuf::from(path)
}

/// An ordered chain of sources.
pub struct SourceSet {
    sources: Vec<Box<dyn Source>>,
}

impl SourceSet {
    /// Build a set from already-constructed sources.
    pub fn new(sources: Vec<Box<dyn Source>>) -> Self {
        Self { sources }
    }

    /// Resolve each address in order. Addresses that fail to resolve are
    /// skipped with a warning; it is an error only if none resolve.
    pub fn from_addresses(addresses: &[String]) -> ConfResult<Self> {
        let mut sources = Vec::new();
        let mut first_error = None;
        for address in addresses {
            match resolve_address(address) {
                Ok(source) => sources.push(source),
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to load source");
                    first_error.get_or_insert(e);
                }
            }
        }
        if sources.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let set = Self::new(sources);
        set.log_layout();
        Ok(set)
    }

    fn log_layout(&self) {
        let root = Key::root();
        let mut any_writable = false;
        for (position, source) in self.sources.iter().enumerate() {
            if source.is_writable(&root) {
                any_writable = true;
                info!(position, address = %source.address(), "Resolved writable source");
            } else {
                info!(position, address = %source.address(), "Resolved read-only source");
            }
        }
        if !any_writable {
            warn!("None of the resolved sources are writable; changes will not be saved");
        }
    }

    /// Source addresses in chain order.
    pub fn addresses(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.address().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Look up `key`, falling back to its schema default when
    /// `use_schema_default` is set.
    pub fn query_value(
        &mut self,
        key: &Key,
        locales: &[String],
        use_schema_default: bool,
    ) -> ConfResult<Lookup> {
        let mut value = None;
        let mut schema_name = None;
        let mut is_writable = false;

        for source in self.sources.iter_mut() {
            if value.is_none() {
                if source.is_writable(key) {
                    is_writable = true;
                }
                value = source.query_value(key, locales)?;
            }
            if schema_name.is_none() {
                schema_name = source.query_schema_name(key)?;
            }
            if value.is_some() && schema_name.is_some() {
                break;
            }
        }

        if value.is_some() {
            return Ok(Lookup {
                value,
                is_default: false,
                is_writable,
                schema_name,
            });
        }

        match schema_name {
            Some(name) => {
                let default = if use_schema_default {
                    self.schema_default(&name, key, locales)?
                } else {
                    None
                };
                Ok(Lookup {
                    value: default,
                    is_default: true,
                    is_writable,
                    schema_name: Some(name),
                })
            }
            None => Ok(Lookup {
                value: None,
                is_default: false,
                is_writable,
                schema_name: None,
            }),
        }
    }

    /// The schema default for `key` alone, ignoring any stored value.
    pub fn query_default_value(
        &mut self,
        key: &Key,
        locales: &[String],
    ) -> ConfResult<(Option<Value>, bool)> {
        let is_writable = self.key_is_writable(key)?;
        let mut schema_name = None;
        for source in self.sources.iter_mut() {
            schema_name = source.query_schema_name(key)?;
            if schema_name.is_some() {
                break;
            }
        }
        let value = match schema_name {
            Some(name) => self.schema_default(&name, key, locales)?,
            None => None,
        };
        Ok((value, is_writable))
    }

    /// The schema named for `key`, if any.
    pub fn schema_for(&mut self, key: &Key, locales: &[String]) -> ConfResult<Option<Schema>> {
        let lookup = self.query_value(key, locales, false)?;
        let Some(name) = lookup.schema_name else {
            return Ok(None);
        };
        self.load_schema(&name, key, locales)
    }

    fn load_schema(
        &mut self,
        schema_name: &str,
        key: &Key,
        locales: &[String],
    ) -> ConfResult<Option<Schema>> {
        let schema_key = Key::parse(schema_name).map_err(|e| {
            ConfError::Failed(format!("schema name for `{}` is invalid: {}", key, e))
        })?;
        let lookup = self.query_value(&schema_key, locales, false)?;
        match lookup.value {
            None => Ok(None),
            Some(Value::Schema(schema)) => Ok(Some(*schema)),
            Some(other) => Err(ConfError::TypeMismatch(format!(
                "key `{}` is listed as a schema for `{}` but stores a {} value",
                schema_key,
                key,
                other.value_type()
            ))),
        }
    }

    fn schema_default(
        &mut self,
        schema_name: &str,
        key: &Key,
        locales: &[String],
    ) -> ConfResult<Option<Value>> {
        let Some(schema) = self.load_schema(schema_name, key, locales)? else {
            return Ok(None);
        };
        match schema.default_value.as_deref() {
            Some(default) => {
                schema.check(default).map_err(|e| {
                    ConfError::TypeMismatch(format!(
                        "default for `{}` disagrees with schema `{}`: {}",
                        key, schema_name, e
                    ))
                })?;
                Ok(Some(default.clone()))
            }
            None => Ok(None),
        }
    }

    /// Whether a write to `key` would land somewhere.
    pub fn key_is_writable(&mut self, key: &Key) -> ConfResult<bool> {
        for source in self.sources.iter_mut() {
            if source.is_writable(key) {
                return Ok(true);
            }
            if source.query_value(key, &[])?.is_some() {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Store `value` in the first writable source. Returns the address that
    /// took the write.
    pub fn set_value(&mut self, key: &Key, value: &Value) -> ConfResult<String> {
        value.validate()?;
        if key.is_root() {
            return Err(ConfError::IsDir(key.to_string()));
        }

        for source in self.sources.iter_mut() {
            if source.is_writable(key) {
                source.set_value(key, value)?;
                debug!(key = %key, address = %source.address(), "Set value");
                return Ok(source.address().to_string());
            }
            if source.query_value(key, &[])?.is_some() {
                return Err(ConfError::Overridden(key.to_string()));
            }
        }
        Err(ConfError::NoWritableDatabase(key.to_string()))
    }

    /// Remove `key` from every writable source. Returns the addresses that
    /// actually held something.
    pub fn unset_value(&mut self, key: &Key, locale: Option<&str>) -> ConfResult<Vec<String>> {
        let mut modified = Vec::new();
        for source in self.sources.iter_mut() {
            if !source.is_writable(key) {
                continue;
            }
            if source.unset_value(key, locale)? {
                modified.push(source.address().to_string());
            }
        }
        Ok(modified)
    }

    /// Unset everything below and including `key`.
    ///
    /// Subdirectories are handled first, then the entries of `key`, then `key`
    /// itself. Errors don't stop the walk.
    pub fn recursive_unset(
        &mut self,
        key: &Key,
        locale: Option<&str>,
        flags: UnsetFlags,
    ) -> RecursiveUnset {
        let mut out = RecursiveUnset::default();
        self.recursive_unset_into(key, locale, flags, &mut out);
        out
    }

    fn recursive_unset_into(
        &mut self,
        key: &Key,
        locale: Option<&str>,
        flags: UnsetFlags,
        out: &mut RecursiveUnset,
    ) {
        fn note(out: &mut RecursiveUnset, err: ConfError) {
            debug!(error = %err, "Error during recursive unset");
            out.first_error.get_or_insert(err);
        }

        match self.all_dirs(key) {
            Ok(subdirs) => {
                for name in subdirs {
                    match key.join(&name) {
                        Ok(child) => self.recursive_unset_into(&child, locale, flags, out),
                        Err(e) => note(out, e),
                    }
                }
            }
            Err(e) => note(out, e),
        }

        match self.raw_entries(key, &[]) {
            Ok(entries) => {
                for name in entries.into_keys() {
                    let child = match key.join(&name) {
                        Ok(child) => child,
                        Err(e) => {
                            note(out, e);
                            continue;
                        }
                    };
                    let mut changed = match self.unset_value(&child, locale) {
                        Ok(modified) => out.note_modified(modified),
                        Err(e) => {
                            note(out, e);
                            false
                        }
                    };
                    if flags.including_schema_names {
                        match self.clear_schema_names(&child) {
                            Ok(cleared) => changed |= out.note_modified(cleared),
                            Err(e) => note(out, e),
                        }
                    }
                    if changed {
                        out.affected.push(child);
                    }
                }
            }
            Err(e) => note(out, e),
        }

        if !key.is_root() {
            match self.unset_value(key, locale) {
                Ok(modified) => {
                    if out.note_modified(modified) {
                        out.affected.push(key.clone());
                    }
                }
                Err(e) => note(out, e),
            }
        }
    }

    fn clear_schema_names(&mut self, key: &Key) -> ConfResult<Vec<String>> {
        let mut cleared = Vec::new();
        for source in self.sources.iter_mut() {
            if source.is_writable(key) && source.query_schema_name(key)?.is_some() {
                source.set_schema(key, None)?;
                cleared.push(source.address().to_string());
            }
        }
        Ok(cleared)
    }

    pub fn dir_exists(&mut self, dir: &Key) -> ConfResult<bool> {
        for source in self.sources.iter_mut() {
            if source.dir_exists(dir)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove `dir` from every writable source.
    pub fn remove_dir(&mut self, dir: &Key) -> ConfResult<()> {
        if self.query_value(dir, &[], false)?.value.is_some() {
            return Err(ConfError::IsKey(dir.to_string()));
        }
        for source in self.sources.iter_mut() {
            if source.is_writable(dir) {
                source.remove_dir(dir)?;
            }
        }
        Ok(())
    }

    fn raw_entries(
        &mut self,
        dir: &Key,
        locales: &[String],
    ) -> ConfResult<BTreeMap<String, SourceEntry>> {
        let mut merged: BTreeMap<String, SourceEntry> = BTreeMap::new();
        for source in self.sources.iter_mut() {
            for entry in source.all_entries(dir, locales)? {
                match merged.get_mut(&entry.name) {
                    None => {
                        merged.insert(entry.name.clone(), entry);
                    }
                    Some(existing) => {
                        if existing.value.is_none() {
                            existing.value = entry.value;
                        }
                        if existing.schema_name.is_none() {
                            existing.schema_name = entry.schema_name;
                        }
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Merged listing of the keys directly inside `dir`, with schema
    /// defaults filled in for keys that have no value.
    pub fn all_entries(&mut self, dir: &Key, locales: &[String]) -> ConfResult<Vec<Entry>> {
        let merged = self.raw_entries(dir, locales)?;
        let mut out = Vec::with_capacity(merged.len());
        for (name, raw) in merged {
            let full = dir.join(&name)?;
            let is_writable = self.key_is_writable(&full)?;
            let mut value = raw.value;
            let mut is_default = false;
            if value.is_none() {
                if let Some(schema_name) = raw.schema_name.as_deref() {
                    match self.schema_default(schema_name, &full, locales) {
                        Ok(default) => {
                            is_default = default.is_some();
                            value = default;
                        }
                        Err(e) => debug!(key = %full, error = %e, "Ignoring bad schema default"),
                    }
                }
            }
            out.push(Entry {
                key: name,
                value,
                schema_name: raw.schema_name,
                is_default,
                is_writable,
            });
        }
        Ok(out)
    }

    /// Union of subdirectory names directly inside `dir`.
    pub fn all_dirs(&mut self, dir: &Key) -> ConfResult<Vec<String>> {
        let mut dirs = BTreeSet::new();
        for source in self.sources.iter_mut() {
            dirs.extend(source.all_dirs(dir)?);
        }
        Ok(dirs.into_iter().collect())
    }

    /// Point `key` at `schema_key` (or clear it) in the first writable source.
    pub fn set_schema(&mut self, key: &Key, schema_key: Option<&Key>) -> ConfResult<()> {
        if key.is_root() {
            return Err(ConfError::IsDir(key.to_string()));
        }
        for source in self.sources.iter_mut() {
            if source.is_writable(key) {
                return source.set_schema(key, schema_key);
            }
        }
        Err(ConfError::NoWritableDatabase(key.to_string()))
    }

    /// Flush every source. All sources are attempted; the first error wins.
    pub fn sync_all(&mut self) -> ConfResult<()> {
        let mut first_error = None;
        for source in self.sources.iter_mut() {
            if let Err(e) = source.sync() {
                warn!(address = %source.address(), error = %e, "Failed to sync source");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn clear_cache(&mut self) {
        for source in self.sources.iter_mut() {
            source.clear_cache();
        }
    }

    /// Whether this chain reads from the store behind `address`.
    pub fn contains_resource(&self, address: &str) -> bool {
        self.sources
            .iter()
            .any(|source| same_resource(source.address(), address))
    }

    /// Whether a change to `key` in the store behind `address` is visible
    /// through this chain: the store is part of it and no source in front
    /// of it holds a value for `key`.
    pub fn is_affected(&mut self, address: &str, key: &Key) -> ConfResult<bool> {
        let Some(position) = self
            .sources
            .iter()
            .position(|source| same_resource(source.address(), address))
        else {
            return Ok(false);
        };
        for source in self.sources[..position].iter_mut() {
            if source.query_value(key, &[])?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Flush the source behind `address`.
    pub fn sync_resource(&mut self, address: &str) -> ConfResult<()> {
        for source in self.sources.iter_mut() {
            if same_resource(source.address(), address) {
                source.sync()?;
            }
        }
        Ok(())
    }

    /// Forget the cached contents of the source behind `address` so the
    /// next query rereads it.
    pub fn clear_resource_cache(&mut self, address: &str) {
        for source in self.sources.iter_mut() {
            if same_resource(source.address(), address) {
                source.clear_cache();
            }
        }
    }
}
