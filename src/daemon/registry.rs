//! Daemon-wide state: open databases, known clients and the saved-state log.
//!
//! The registry is owned by the core thread. It answers requests, restores
//! subscriptions from the log at startup and performs the periodic cleanup;
//! the event loop decides when each of those happens.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DaemonSettings;
use crate::daemon::database::{Database, DatabaseSignature};
use crate::daemon::listeners::{ConnectionId, SubscriptionJournal};
use crate::daemon::peer::{PeerConnector, PeerError, PeerToken, RemotePeer};
use crate::daemon::protocol::{
    DaemonRequest, DaemonResponse, DaemonStatus, DatabaseStatus, ListenerUpdate,
};
use crate::daemon::state_log::{ListenerRecord, LogEntry, StateLog};
use crate::error::{ConfError, ConfResult};
use crate::key::Key;
use crate::sources::{LocaleCache, SourceSet, LOCALE_CACHE_MAX_AGE};

/// Everything the daemon knows, owned by the core thread.
///
/// Databases open on first use and may be hibernated or rebuilt later.
/// Listener ids keep increasing per database across both, so an id is never
/// handed out twice while the daemon runs.
pub struct DaemonRegistry {
    settings: DaemonSettings,
    databases: BTreeMap<DatabaseSignature, Database>,
    issued_ids: BTreeMap<DatabaseSignature, ConnectionId>,
    clients: BTreeMap<PeerToken, Box<dyn RemotePeer>>,
    log: StateLog,
    locales: LocaleCache,
    connector: Box<dyn PeerConnector>,
    in_shutdown: bool,
    started_at: DateTime<Utc>,
}

impl DaemonRegistry {
    /// Create the registry and open the default database. Fails if none of
    /// the default sources can be loaded.
    pub fn new(settings: DaemonSettings, connector: Box<dyn PeerConnector>) -> ConfResult<Self> {
        let log = StateLog::in_dir(&settings.state_dir);
        let mut registry = Self {
            settings,
            databases: BTreeMap::new(),
            issued_ids: BTreeMap::new(),
            clients: BTreeMap::new(),
            log,
            locales: LocaleCache::new(),
            connector,
            in_shutdown: false,
            started_at: Utc::now(),
        };
        registry.open_database(&DatabaseSignature::default_database())?;
        Ok(registry)
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn log(&self) -> &StateLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut StateLog {
        &mut self.log
    }

    pub fn in_shutdown(&self) -> bool {
        self.in_shutdown
    }

    pub fn database(&self, signature: &DatabaseSignature) -> Option<&Database> {
        self.databases.get(signature)
    }

    pub fn database_mut(&mut self, signature: &DatabaseSignature) -> Option<&mut Database> {
        self.databases.get_mut(signature)
    }

    pub fn databases_mut(&mut self) -> impl Iterator<Item = &mut Database> {
        self.databases.values_mut()
    }

    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn open_database(&mut self, signature: &DatabaseSignature) -> ConfResult<()> {
        if self.databases.contains_key(signature) {
            return Ok(());
        }
        let addresses = signature
            .addresses()
            .unwrap_or_else(|| self.settings.default_sources.clone());
        let sources = SourceSet::from_addresses(&addresses)?;
        info!(database = %signature, sources = sources.len(), "Opened database");
        let mut db = Database::new(signature.clone(), sources);
        if let Some(last) = self.issued_ids.get(signature) {
            db.listeners_mut().ensure_next_id_above(*last);
        }
        self.databases.insert(signature.clone(), db);
        Ok(())
    }

    /// Close a database, remembering the ids it handed out.
    fn retire_database(&mut self, signature: &DatabaseSignature) -> Option<Database> {
        let db = self.databases.remove(signature)?;
        if let Some(last) = db.listeners().last_issued() {
            let mark = self.issued_ids.entry(signature.clone()).or_insert(last);
            *mark = (*mark).max(last);
        }
        Some(db)
    }

    /// Find or open the database for `addresses`. An empty list is the
    /// default database.
    pub fn obtain_database(&mut self, addresses: &[String]) -> ConfResult<DatabaseSignature> {
        if self.in_shutdown {
            return Err(ConfError::InShutdown);
        }
        let signature = DatabaseSignature::from_addresses(addresses);
        self.open_database(&signature)?;
        Ok(signature)
    }

    /// Run `f` against a database (opening it if it was hibernated) and the
    /// journal.
    fn with_database<T>(
        &mut self,
        name: Option<String>,
        f: impl FnOnce(&mut Database, &mut StateLog) -> ConfResult<T>,
    ) -> ConfResult<T> {
        if self.in_shutdown {
            return Err(ConfError::InShutdown);
        }
        let signature = name
            .map(DatabaseSignature::new)
            .unwrap_or_else(DatabaseSignature::default_database);
        self.open_database(&signature)?;
        let result = {
            let Self { databases, log, .. } = self;
            match databases.get_mut(&signature) {
                Some(db) => f(db, log),
                None => Err(ConfError::Failed(format!(
                    "database `{}` unavailable",
                    signature
                ))),
            }
        };
        self.propagate_changes(&signature);
        result
    }

    /// Hand the writes made through `origin` to every other open database
    /// that reads the same stores. The written store is flushed first so
    /// the others reread the new contents.
    fn propagate_changes(&mut self, origin: &DatabaseSignature) {
        let Self { databases, log, .. } = self;
        let Some(changes) = databases.get_mut(origin).map(Database::take_changes) else {
            return;
        };
        if changes.is_empty() {
            return;
        }

        let mut shared: Vec<&str> = Vec::new();
        for change in &changes {
            let is_shared = databases
                .iter()
                .any(|(signature, db)| signature != origin && db.shares_resource(&change.address));
            if is_shared && !shared.contains(&change.address.as_str()) {
                shared.push(&change.address);
            }
        }
        if shared.is_empty() {
            return;
        }

        if let Some(db) = databases.get_mut(origin) {
            for address in &shared {
                if let Err(e) = db.flush_resource(address) {
                    warn!(database = %origin, address = %address, error = %e, "Failed to flush shared source");
                }
            }
        }
        for (signature, db) in databases.iter_mut() {
            if signature == origin {
                continue;
            }
            let notified = db.reflect_changes(log, &changes);
            if notified > 0 {
                debug!(database = %signature, from = %origin, notified, "Notified listeners of shared change");
            }
        }
    }

    /// Register a client. Returns false if it was already known.
    pub fn add_client(&mut self, peer: Box<dyn RemotePeer>) -> bool {
        let token = peer.token().clone();
        if self.clients.contains_key(&token) {
            debug!(peer = %token, "Client already registered");
            return false;
        }
        self.log.record(&LogEntry::client_add(token.clone()));
        self.clients.insert(token.clone(), peer);
        debug!(peer = %token, "Added client");
        true
    }

    pub fn remove_client(&mut self, token: &PeerToken) -> bool {
        if self.clients.remove(token).is_none() {
            warn!(peer = %token, "Client to remove not found");
            return false;
        }
        self.log.record(&LogEntry::client_remove(token.clone()));
        debug!(peer = %token, "Removed client");
        true
    }

    /// Rebuild clients and listeners from the saved-state log, then compact.
    pub fn recover(&mut self) {
        let state = match self.log.read() {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Failed to read saved state, starting with no listeners");
                return;
            }
        };

        let mut clients = 0;
        for token in &state.clients {
            match self.connector.connect(token) {
                Some(peer) if peer.is_alive() => {
                    if self.add_client(peer) {
                        clients += 1;
                    }
                }
                _ => debug!(peer = %token, "Dropping unreachable client from saved state"),
            }
        }

        let mut restored = 0;
        let mut dropped = 0;
        for record in &state.listeners {
            let max_id = state.max_ids.get(&record.database).copied();
            if self.restore_listener(record, max_id) {
                restored += 1;
            } else {
                dropped += 1;
            }
        }

        info!(clients, restored, dropped, "Restored saved state");
        self.compact();
    }

    fn restore_listener(&mut self, record: &ListenerRecord, max_id: Option<ConnectionId>) -> bool {
        if let Err(e) = self.open_database(&record.database) {
            warn!(database = %record.database, error = %e, "Dropping listener on unloadable database");
            self.log.record(&LogEntry::remove(record.clone()));
            return false;
        }

        let peer = match self.connector.connect(&record.peer) {
            Some(peer) if peer.is_alive() => peer,
            _ => {
                debug!(peer = %record.peer, id = %record.connection_id, "Dropping listener with unreachable peer");
                self.log.record(&LogEntry::remove(record.clone()));
                return false;
            }
        };

        let Some(db) = self.databases.get_mut(&record.database) else {
            self.log.record(&LogEntry::remove(record.clone()));
            return false;
        };
        let listeners = db.listeners_mut();
        if let Some(max_id) = max_id {
            listeners.ensure_next_id_above(max_id);
        }
        let new_id = listeners.readd(peer, None, record.location.clone());

        let update = ListenerUpdate {
            database: record.database.to_string(),
            location: record.location.to_string(),
            old_id: record.connection_id,
            new_id,
        };
        let handshake = match listeners.get(new_id) {
            Some(listener) => listener.peer.update_listener(&update),
            None => Err(PeerError::Unreachable(record.peer.to_string())),
        };

        self.log.record(&LogEntry::remove(record.clone()));
        match handshake {
            Ok(()) => {
                let renewed = ListenerRecord {
                    connection_id: new_id,
                    ..record.clone()
                };
                self.log.record(&LogEntry::add(renewed));
                debug!(old = %record.connection_id, new = %new_id, location = %record.location, "Restored listener");
                true
            }
            Err(e) => {
                listeners.take(new_id);
                debug!(id = %record.connection_id, error = %e, "Listener update failed, dropping listener");
                false
            }
        }
    }

    /// Journal entries describing the current state, clients first.
    fn snapshot(&self) -> Vec<LogEntry> {
        let clients = self.clients.keys().cloned().map(LogEntry::client_add);
        let listeners = self
            .databases
            .values()
            .flat_map(|db| db.listeners().records())
            .map(LogEntry::add);
        clients.chain(listeners).collect()
    }

    /// Rewrite the saved-state log from the live state.
    pub fn compact(&mut self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.log.compact(&snapshot) {
            error!(error = %e, "Failed to compact saved state");
        }
    }

    /// Flush one database's sources.
    pub fn sync_database(&mut self, signature: &DatabaseSignature) {
        let Some(db) = self.databases.get_mut(signature) else {
            debug!(database = %signature, "Sync for a database that is no longer open");
            return;
        };
        if let Err(e) = db.synchronous_sync() {
            error!(database = %signature, error = %e, "Failed to sync database");
        }
    }

    /// Sweep dead peers, hibernate idle databases, expire cached locales and
    /// compact the log if it has accumulated removals. Returns the
    /// databases that were hibernated.
    pub fn cleanup(&mut self, now: Instant) -> Vec<DatabaseSignature> {
        let dead_clients: Vec<PeerToken> = self
            .clients
            .values()
            .filter(|peer| !peer.is_alive())
            .map(|peer| peer.token().clone())
            .collect();
        for token in &dead_clients {
            self.remove_client(token);
        }

        let Self { databases, log, .. } = self;
        let dead_listeners: usize = databases
            .values_mut()
            .map(|db| db.listeners_mut().sweep_dead(log))
            .sum();

        let hibernate_after = self.settings.hibernate_after;
        let idle: Vec<DatabaseSignature> = self
            .databases
            .values()
            .filter(|db| {
                !db.signature().is_default()
                    && db.listeners().is_empty()
                    && now.saturating_duration_since(db.last_access()) >= hibernate_after
            })
            .map(|db| db.signature().clone())
            .collect();
        let mut hibernated = Vec::new();
        for signature in idle {
            let Some(db) = self.databases.get_mut(&signature) else {
                continue;
            };
            if let Err(e) = db.synchronous_sync() {
                warn!(database = %signature, error = %e, "Failed to sync idle database, keeping it open");
                continue;
            }
            self.retire_database(&signature);
            info!(database = %signature, "Hibernated idle database");
            hibernated.push(signature);
        }

        let expired = self.locales.expire(LOCALE_CACHE_MAX_AGE, now);

        if self.log.needs_compaction() {
            self.compact();
        }

        debug!(
            dead_clients = dead_clients.len(),
            dead_listeners,
            hibernated = hibernated.len(),
            expired_locales = expired,
            "Cleanup finished"
        );
        hibernated
    }

    /// Nothing is using the daemon: only the default database is open, it
    /// has no listeners and no clients are registered.
    pub fn should_exit_idle(&self) -> bool {
        self.clients.is_empty()
            && self
                .databases
                .iter()
                .all(|(signature, db)| signature.is_default() && db.listeners().is_empty())
    }

    /// Flush and drop every database, then rebuild from configuration and
    /// the saved state. If any database fails to flush, nothing is dropped
    /// and the error is returned.
    pub fn reload(&mut self) -> ConfResult<()> {
        if self.in_shutdown {
            return Err(ConfError::InShutdown);
        }
        info!("Reloading configuration databases");
        for db in self.databases.values_mut() {
            if let Err(e) = db.synchronous_sync() {
                error!(database = %db.signature(), error = %e, "Failed to sync database, reload abandoned");
                return Err(e);
            }
        }
        self.compact();
        let signatures: Vec<DatabaseSignature> = self.databases.keys().cloned().collect();
        for signature in &signatures {
            self.retire_database(signature);
        }
        self.open_database(&DatabaseSignature::default_database())?;
        self.recover();

        for peer in self.clients.values() {
            if let Err(e) = peer.drop_all_caches() {
                debug!(peer = %peer.token(), error = %e, "Client did not drop caches");
            }
        }
        Ok(())
    }

    /// Flush everything and stop accepting mutations.
    pub fn shutdown(&mut self) {
        if self.in_shutdown {
            return;
        }
        info!("Shutting down configuration databases");
        self.in_shutdown = true;
        for db in self.databases.values_mut() {
            if let Err(e) = db.synchronous_sync() {
                error!(database = %db.signature(), error = %e, "Failed to sync database on shutdown");
            }
        }
        self.compact();
        self.log.close();
        self.databases.clear();
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: std::process::id(),
            started_at: self.started_at,
            in_shutdown: self.in_shutdown,
            clients: self.clients.len(),
            databases: self
                .databases
                .values()
                .map(|db| DatabaseStatus {
                    signature: db.signature().to_string(),
                    addresses: db.addresses(),
                    listeners: db.listeners().len(),
                    sync_pending: db.sync_pending(),
                    sync_count: db.sync_count(),
                })
                .collect(),
        }
    }

    /// Answer one request.
    pub fn handle(&mut self, request: DaemonRequest) -> DaemonResponse {
        match self.try_handle(request) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Request failed");
                e.into()
            }
        }
    }

    fn try_handle(&mut self, request: DaemonRequest) -> ConfResult<DaemonResponse> {
        if self.in_shutdown && request.is_mutating() {
            return Err(ConfError::InShutdown);
        }
        let now = Instant::now();

        let response = match request {
            DaemonRequest::Ping => DaemonResponse::Pong,
            DaemonRequest::Status => DaemonResponse::Status(self.status()),
            DaemonRequest::Shutdown => {
                info!("Handling Shutdown request");
                DaemonResponse::ShuttingDown
            }
            DaemonRequest::Reload => {
                self.reload()?;
                DaemonResponse::Reloaded
            }
            DaemonRequest::GetDatabase { addresses } => {
                let signature = self.obtain_database(&addresses)?;
                DaemonResponse::Database {
                    signature: signature.to_string(),
                }
            }
            DaemonRequest::Lookup {
                database,
                key,
                locale,
                use_schema_default,
            } => {
                let key = Key::parse(&key)?;
                let locales = self.locales.lookup(locale.as_deref(), now);
                let lookup = self.with_database(database, |db, _| {
                    db.query_value(&key, &locales, use_schema_default)
                })?;
                DaemonResponse::Value(lookup)
            }
            DaemonRequest::LookupDefault {
                database,
                key,
                locale,
            } => {
                let key = Key::parse(&key)?;
                let locales = self.locales.lookup(locale.as_deref(), now);
                let (value, is_writable) = self
                    .with_database(database, |db, _| db.query_default_value(&key, &locales))?;
                DaemonResponse::DefaultValue { value, is_writable }
            }
            DaemonRequest::Set {
                database,
                key,
                value,
            } => {
                let key = Key::parse(&key)?;
                self.with_database(database, |db, log| db.set(log, &key, value))?;
                DaemonResponse::Done
            }
            DaemonRequest::Unset {
                database,
                key,
                locale,
            } => {
                let key = Key::parse(&key)?;
                self.with_database(database, |db, log| db.unset(log, &key, locale.as_deref()))?;
                DaemonResponse::Done
            }
            DaemonRequest::RecursiveUnset {
                database,
                key,
                locale,
                flags,
            } => {
                let key = Key::parse(&key)?;
                self.with_database(database, |db, log| {
                    db.recursive_unset(log, &key, locale.as_deref(), flags)
                })?;
                DaemonResponse::Done
            }
            DaemonRequest::DirExists { database, dir } => {
                let dir = Key::parse(&dir)?;
                let exists = self.with_database(database, |db, _| db.dir_exists(&dir))?;
                DaemonResponse::Exists(exists)
            }
            DaemonRequest::RemoveDir { database, dir } => {
                let dir = Key::parse(&dir)?;
                self.with_database(database, |db, _| db.remove_dir(&dir))?;
                DaemonResponse::Done
            }
            DaemonRequest::AllEntries {
                database,
                dir,
                locale,
            } => {
                let dir = Key::parse(&dir)?;
                let locales = self.locales.lookup(locale.as_deref(), now);
                let entries =
                    self.with_database(database, |db, _| db.all_entries(&dir, &locales))?;
                DaemonResponse::Entries(entries)
            }
            DaemonRequest::AllDirs { database, dir } => {
                let dir = Key::parse(&dir)?;
                let dirs = self.with_database(database, |db, _| db.all_dirs(&dir))?;
                DaemonResponse::Dirs(dirs)
            }
            DaemonRequest::SetSchema {
                database,
                key,
                schema_key,
            } => {
                let key = Key::parse(&key)?;
                let schema_key = schema_key.as_deref().map(Key::parse).transpose()?;
                self.with_database(database, |db, _| db.set_schema(&key, schema_key.as_ref()))?;
                DaemonResponse::Done
            }
            DaemonRequest::AddListener {
                database,
                location,
                peer,
                name,
            } => {
                let location = Key::parse(&location)?;
                let peer = self.connector.connect(&peer).ok_or_else(|| {
                    ConfError::Failed(format!("cannot reach listener peer `{}`", peer))
                })?;
                let connection_id = self.with_database(database, |db, log| {
                    Ok(db.add_listener(log, peer, name, location))
                })?;
                DaemonResponse::ListenerAdded { connection_id }
            }
            DaemonRequest::RemoveListener {
                database,
                connection_id,
            } => {
                let removed = self.with_database(database, |db, log| {
                    Ok(db.remove_listener(log, connection_id))
                })?;
                DaemonResponse::ListenerRemoved { removed }
            }
            DaemonRequest::Sync { database } => {
                self.with_database(database, |db, _| {
                    db.sync();
                    Ok(())
                })?;
                DaemonResponse::Done
            }
            DaemonRequest::SynchronousSync { database } => {
                self.with_database(database, |db, _| db.synchronous_sync())?;
                DaemonResponse::Done
            }
            DaemonRequest::ClearCache { database } => {
                self.with_database(database, |db, _| {
                    db.clear_cache();
                    Ok(())
                })?;
                DaemonResponse::Done
            }
            DaemonRequest::AddClient { peer } => {
                let handle = self.connector.connect(&peer).ok_or_else(|| {
                    ConfError::Failed(format!("cannot reach client `{}`", peer))
                })?;
                self.add_client(handle);
                DaemonResponse::Done
            }
            DaemonRequest::RemoveClient { peer } => {
                self.remove_client(&peer);
                DaemonResponse::Done
            }
        };
        Ok(response)
    }
}
