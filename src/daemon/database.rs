//! A source set together with the listeners subscribed to it.

use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

use crate::daemon::listeners::{ConnectionId, ListenerRegistry, SubscriptionJournal};
use crate::daemon::peer::RemotePeer;
use crate::error::{ConfError, ConfResult};
use crate::key::Key;
use crate::sources::{SourceSet, UnsetFlags};
use crate::value::{Entry, Lookup, Value};

/// Name of a database, derived from its source addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseSignature(String);

impl DatabaseSignature {
    const DEFAULT: &'static str = "def";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The database built from the configured default sources.
    pub fn default_database() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    /// Signature for an ordered address list. An empty list names the
    /// default database.
    pub fn from_addresses(addresses: &[String]) -> Self {
        if addresses.is_empty() {
            return Self::default_database();
        }
        Self(addresses.join(";"))
    }

    /// The address list this signature was built from; `None` for the
    /// default database, whose addresses come from configuration.
    pub fn addresses(&self) -> Option<Vec<String>> {
        match self.0.as_str() {
            Self::DEFAULT => None,
            joined => Some(joined.split(';').map(str::to_string).collect()),
        }
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A write that landed in one source of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    pub address: String,
    pub key: Key,
}

/// One open configuration database: a source chain and its listeners.
///
/// Writes notify this database's own listeners directly. They are also
/// recorded as [`SourceChange`]s so the owner can pass them on to other
/// databases reading the same stores (see [`Database::reflect_changes`]).
/// `sync_pending` stays set until a write-back succeeds.
pub struct Database {
    signature: DatabaseSignature,
    sources: SourceSet,
    listeners: ListenerRegistry,
    last_access: Instant,
    sync_pending: bool,
    sync_requested: bool,
    sync_count: u64,
    changes: Vec<SourceChange>,
}

impl Database {
    pub fn new(signature: DatabaseSignature, sources: SourceSet) -> Self {
        Self {
            listeners: ListenerRegistry::new(signature.clone()),
            signature,
            sources,
            last_access: Instant::now(),
            sync_pending: false,
            sync_requested: false,
            sync_count: 0,
            changes: Vec::new(),
        }
    }

    pub fn signature(&self) -> &DatabaseSignature {
        &self.signature
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sources.addresses()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.listeners
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Unsaved changes are waiting for a write-back.
    pub fn sync_pending(&self) -> bool {
        self.sync_pending
    }

    /// Number of successful write-backs.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn query_value(
        &mut self,
        key: &Key,
        locales: &[String],
        use_schema_default: bool,
    ) -> ConfResult<Lookup> {
        self.touch();
        self.sources.query_value(key, locales, use_schema_default)
    }

    pub fn query_default_value(
        &mut self,
        key: &Key,
        locales: &[String],
    ) -> ConfResult<(Option<Value>, bool)> {
        self.touch();
        self.sources.query_default_value(key, locales)
    }

    /// Store a value and notify listeners of `key`.
    pub fn set(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        key: &Key,
        value: Value,
    ) -> ConfResult<()> {
        self.touch();
        if value.as_schema().is_none() {
            if let Some(schema) = self.sources.schema_for(key, &[])? {
                schema.check(&value).map_err(|e| {
                    ConfError::TypeMismatch(format!("value for `{}`: {}", key, e))
                })?;
            }
        }
        let address = self.sources.set_value(key, &value)?;
        self.listeners.notify(journal, key, Some(&value), false, true);
        self.sync_pending = true;
        self.changes.push(SourceChange {
            address,
            key: key.clone(),
        });
        Ok(())
    }

    /// Remove `key` from every writable source. A key with nothing to remove
    /// is left alone and nobody is notified.
    pub fn unset(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        key: &Key,
        locale: Option<&str>,
    ) -> ConfResult<()> {
        self.touch();
        let modified = self.sources.unset_value(key, locale)?;
        if modified.is_empty() {
            debug!(key = %key, "Unset of a key with no value");
            return Ok(());
        }
        self.notify_default(journal, key);
        self.sync_pending = true;
        self.changes.extend(modified.into_iter().map(|address| SourceChange {
            address,
            key: key.clone(),
        }));
        Ok(())
    }

    /// Unset a whole subtree. Every affected key is notified once the walk is
    /// over; the first error seen is returned.
    pub fn recursive_unset(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        key: &Key,
        locale: Option<&str>,
        flags: UnsetFlags,
    ) -> ConfResult<()> {
        self.touch();
        let result = self.sources.recursive_unset(key, locale, flags);
        if !result.affected.is_empty() {
            self.sync_pending = true;
        }
        for affected in &result.affected {
            self.notify_default(journal, affected);
            for address in &result.modified {
                self.changes.push(SourceChange {
                    address: address.clone(),
                    key: affected.clone(),
                });
            }
        }
        match result.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn notify_default(&mut self, journal: &mut dyn SubscriptionJournal, key: &Key) {
        match self.sources.query_value(key, &[], true) {
            Ok(lookup) => {
                self.listeners.notify(
                    journal,
                    key,
                    lookup.value.as_ref(),
                    true,
                    lookup.is_writable,
                );
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to requery unset key");
                self.listeners.notify(journal, key, None, true, true);
            }
        }
    }

    pub fn dir_exists(&mut self, dir: &Key) -> ConfResult<bool> {
        self.touch();
        self.sources.dir_exists(dir)
    }

    pub fn remove_dir(&mut self, dir: &Key) -> ConfResult<()> {
        self.touch();
        self.sources.remove_dir(dir)?;
        self.sync_pending = true;
        Ok(())
    }

    pub fn all_entries(&mut self, dir: &Key, locales: &[String]) -> ConfResult<Vec<Entry>> {
        self.touch();
        self.sources.all_entries(dir, locales)
    }

    pub fn all_dirs(&mut self, dir: &Key) -> ConfResult<Vec<String>> {
        self.touch();
        self.sources.all_dirs(dir)
    }

    pub fn set_schema(&mut self, key: &Key, schema_key: Option<&Key>) -> ConfResult<()> {
        self.touch();
        self.sources.set_schema(key, schema_key)?;
        self.sync_pending = true;
        Ok(())
    }

    pub fn add_listener(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        peer: Box<dyn RemotePeer>,
        name: Option<String>,
        location: Key,
    ) -> ConnectionId {
        self.touch();
        self.listeners.add(journal, peer, name, location)
    }

    pub fn remove_listener(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        id: ConnectionId,
    ) -> bool {
        self.touch();
        self.listeners.remove(journal, id)
    }

    /// Ask for a write-back on the next loop turn.
    pub fn sync(&mut self) {
        self.touch();
        self.sync_pending = true;
        self.sync_requested = true;
    }

    /// Whether `sync` was called since the last check. Clears the request.
    pub fn take_sync_request(&mut self) -> bool {
        std::mem::take(&mut self.sync_requested)
    }

    /// Flush every source now. On failure the changes stay pending and
    /// the next sync tries again.
    pub fn synchronous_sync(&mut self) -> ConfResult<()> {
        self.touch();
        self.sync_requested = false;
        debug!(database = %self.signature, "Syncing sources");
        self.sources.sync_all()?;
        self.sync_pending = false;
        self.sync_count += 1;
        Ok(())
    }

    /// Changes written since the last call.
    pub fn take_changes(&mut self) -> Vec<SourceChange> {
        std::mem::take(&mut self.changes)
    }

    /// Whether this database reads from the store behind `address`.
    pub fn shares_resource(&self, address: &str) -> bool {
        self.sources.contains_resource(address)
    }

    /// Write back the store behind `address` so other readers see it.
    pub fn flush_resource(&mut self, address: &str) -> ConfResult<()> {
        self.sources.sync_resource(address)
    }

    /// Pick up changes another database wrote to a store this one shares,
    /// and notify the listeners of every key whose visible value may have
    /// moved. Returns the number of keys notified.
    pub fn reflect_changes(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        changes: &[SourceChange],
    ) -> usize {
        let mut reread: Vec<&str> = Vec::new();
        for change in changes {
            if self.shares_resource(&change.address) && !reread.contains(&change.address.as_str()) {
                self.sources.clear_resource_cache(&change.address);
                reread.push(&change.address);
            }
        }
        if reread.is_empty() {
            return 0;
        }

        let mut notified = 0;
        for change in changes {
            match self.sources.is_affected(&change.address, &change.key) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(database = %self.signature, key = %change.key, error = %e, "Failed to check shared change");
                    continue;
                }
            }
            match self.sources.query_value(&change.key, &[], true) {
                Ok(lookup) => {
                    self.listeners.notify(
                        journal,
                        &change.key,
                        lookup.value.as_ref(),
                        lookup.is_default,
                        lookup.is_writable,
                    );
                    notified += 1;
                }
                Err(e) => {
                    warn!(database = %self.signature, key = %change.key, error = %e, "Failed to requery shared change");
                }
            }
        }
        notified
    }

    pub fn clear_cache(&mut self) {
        self.touch();
        self.sources.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::peer::LocalEndpoint;
    use crate::daemon::state_log::LogEntry;
    use crate::error::ErrorKind;
    use crate::sources::{Source, TreeSource};
    use crate::value::{Schema, ValueType};

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    fn db() -> Database {
        let source: Box<dyn Source> = Box::new(TreeSource::in_memory("mem:readwrite:t", true));
        Database::new(
            DatabaseSignature::default_database(),
            SourceSet::new(vec![source]),
        )
    }

    #[test]
    fn signature_roundtrips_addresses() {
        let addrs = vec!["mem:readonly:a".to_string(), "json:readwrite:/tmp/b.json".to_string()];
        let sig = DatabaseSignature::from_addresses(&addrs);
        assert_eq!(sig.as_str(), "mem:readonly:a;json:readwrite:/tmp/b.json");
        assert_eq!(sig.addresses(), Some(addrs));
        assert!(DatabaseSignature::from_addresses(&[]).is_default());
        assert_eq!(DatabaseSignature::default_database().addresses(), None);
    }

    #[test]
    fn set_notifies_and_marks_pending() {
        let mut db = db();
        let mut journal: Vec<LogEntry> = Vec::new();
        let peer = LocalEndpoint::new("p");
        db.add_listener(&mut journal, peer.peer(), None, key("/apps"));

        db.set(&mut journal, &key("/apps/x"), Value::Int(1)).unwrap();
        assert!(db.sync_pending());
        let got = peer.take_notifications();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, Some(Value::Int(1)));
        assert!(!got[0].is_default);
        assert!(got[0].is_writable);
    }

    #[test]
    fn set_checks_schema_type() {
        let mut db = db();
        let mut journal: Vec<LogEntry> = Vec::new();
        let schema = Schema::new(ValueType::Bool);
        db.set(&mut journal, &key("/schemas/flag"), Value::Schema(Box::new(schema)))
            .unwrap();
        db.set_schema(&key("/apps/flag"), Some(&key("/schemas/flag"))).unwrap();

        let err = db
            .set(&mut journal, &key("/apps/flag"), Value::Int(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        db.set(&mut journal, &key("/apps/flag"), Value::Bool(true)).unwrap();
    }

    #[test]
    fn unset_without_override_is_silent() {
        let mut db = db();
        let mut journal: Vec<LogEntry> = Vec::new();
        let peer = LocalEndpoint::new("p");
        db.add_listener(&mut journal, peer.peer(), None, key("/apps"));

        db.unset(&mut journal, &key("/apps/never"), None).unwrap();
        assert!(peer.take_notifications().is_empty());
        assert!(!db.sync_pending());

        db.set(&mut journal, &key("/apps/x"), Value::Int(1)).unwrap();
        peer.take_notifications();
        db.unset(&mut journal, &key("/apps/x"), None).unwrap();
        let got = peer.take_notifications();
        assert_eq!(got.len(), 1);
        assert!(got[0].is_default);
        assert_eq!(got[0].value, None);
    }

    #[test]
    fn recursive_unset_notifies_after_walk() {
        let mut db = db();
        let mut journal: Vec<LogEntry> = Vec::new();
        let peer = LocalEndpoint::new("p");
        for k in ["/apps/a", "/apps/sub/b"] {
            db.set(&mut journal, &key(k), Value::Int(1)).unwrap();
        }
        db.add_listener(&mut journal, peer.peer(), None, key("/apps"));

        db.recursive_unset(&mut journal, &key("/apps"), None, UnsetFlags::default())
            .unwrap();
        let keys: Vec<String> = peer.take_notifications().into_iter().map(|n| n.key).collect();
        assert_eq!(keys, vec!["/apps/sub/b", "/apps/a"]);
        assert!(db.all_entries(&key("/apps"), &[]).unwrap().is_empty());
    }

    #[test]
    fn sync_request_is_taken_once() {
        let mut db = db();
        db.sync();
        assert!(db.sync_pending());
        assert!(db.take_sync_request());
        assert!(!db.take_sync_request());
        db.synchronous_sync().unwrap();
        assert!(!db.sync_pending());
        assert_eq!(db.sync_count(), 1);
    }

    fn json_db(address: &str, path: std::path::PathBuf) -> Database {
        let source: Box<dyn Source> = Box::new(TreeSource::json_file(address, path, true));
        Database::new(
            DatabaseSignature::new(address),
            SourceSet::new(vec![source]),
        )
    }

    #[test]
    fn failed_sync_stays_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("store");
        let path = blocker.join("user.json");
        let mut db = json_db(&format!("json:readwrite:{}", path.display()), path.clone());
        let mut journal: Vec<LogEntry> = Vec::new();

        db.set(&mut journal, &key("/a"), Value::Int(7)).unwrap();
        std::fs::write(&blocker, "not a directory").unwrap();
        assert!(db.synchronous_sync().is_err());
        assert!(db.sync_pending());
        assert_eq!(db.sync_count(), 0);

        std::fs::remove_file(&blocker).unwrap();
        db.synchronous_sync().unwrap();
        assert!(!db.sync_pending());
        assert_eq!(db.sync_count(), 1);
        assert!(path.exists());
    }

    #[test]
    fn changes_reach_databases_sharing_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shared.json");
        let address = format!("json:readwrite:{}", path.display());
        let mut writer = json_db(&address, path.clone());
        let mut reader = json_db(&address, path);
        let mut journal: Vec<LogEntry> = Vec::new();
        let peer = LocalEndpoint::new("p");
        reader.add_listener(&mut journal, peer.peer(), None, key("/apps"));
        assert_eq!(reader.query_value(&key("/apps/x"), &[], true).unwrap().value, None);

        writer.set(&mut journal, &key("/apps/x"), Value::Int(5)).unwrap();
        let changes = writer.take_changes();
        assert_eq!(
            changes,
            vec![SourceChange {
                address: address.clone(),
                key: key("/apps/x"),
            }]
        );
        assert!(writer.take_changes().is_empty());
        writer.flush_resource(&address).unwrap();

        assert_eq!(reader.reflect_changes(&mut journal, &changes), 1);
        let got = peer.take_notifications();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, Some(Value::Int(5)));
        assert!(!got[0].is_default);

        // A database on an unrelated store ignores the change.
        let mut unrelated = db();
        assert_eq!(unrelated.reflect_changes(&mut journal, &changes), 0);
    }
}
