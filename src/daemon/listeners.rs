//! Per-database listener registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::daemon::database::DatabaseSignature;
use crate::daemon::peer::{PeerError, RemotePeer};
use crate::daemon::protocol::Notification;
use crate::daemon::state_log::{ListenerRecord, LogEntry};
use crate::key::Key;
use crate::value::Value;

/// Identifier of a subscription, unique within one database for the life of
/// the daemon. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ConnectionId)
    }
}

/// Somewhere subscription changes get recorded.
pub trait SubscriptionJournal {
    fn record(&mut self, entry: &LogEntry);
}

/// Collects entries in memory.
impl SubscriptionJournal for Vec<LogEntry> {
    fn record(&mut self, entry: &LogEntry) {
        self.push(entry.clone());
    }
}

/// A subscription to every key at or below `location`.
pub struct Listener {
    pub connection_id: ConnectionId,
    pub location: Key,
    pub peer: Box<dyn RemotePeer>,
    pub name: String,
}

/// The subscriptions of one database.
///
/// Ids are handed out in increasing order and never reused while the
/// registry lives. Owners that rebuild a registry carry the high-water mark
/// across with [`last_issued`](Self::last_issued) and
/// [`ensure_next_id_above`](Self::ensure_next_id_above).
pub struct ListenerRegistry {
    database: DatabaseSignature,
    listeners: BTreeMap<ConnectionId, Listener>,
    next_id: u64,
}

impl ListenerRegistry {
    pub fn new(database: DatabaseSignature) -> Self {
        Self {
            database,
            listeners: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Register a listener and journal it.
    pub fn add(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        peer: Box<dyn RemotePeer>,
        name: Option<String>,
        location: Key,
    ) -> ConnectionId {
        let id = self.readd(peer, name, location);
        if let Some(record) = self.record_for(id) {
            journal.record(&LogEntry::add(record));
        }
        id
    }

    /// Register a listener without journaling it.
    pub fn readd(
        &mut self,
        peer: Box<dyn RemotePeer>,
        name: Option<String>,
        location: Key,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let name = name.unwrap_or_else(|| id.to_string());
        debug!(database = %self.database, id = %id, location = %location, peer = %peer.token(), "Added listener");
        self.listeners.insert(
            id,
            Listener {
                connection_id: id,
                location,
                peer,
                name,
            },
        );
        id
    }

    /// Remove a listener and journal it. Unknown ids are ignored.
    pub fn remove(&mut self, journal: &mut dyn SubscriptionJournal, id: ConnectionId) -> bool {
        let Some(record) = self.record_for(id) else {
            warn!(database = %self.database, id = %id, "Listener to remove not found");
            return false;
        };
        self.listeners.remove(&id);
        journal.record(&LogEntry::remove(record));
        debug!(database = %self.database, id = %id, "Removed listener");
        true
    }

    /// Remove a listener without journaling it.
    pub fn take(&mut self, id: ConnectionId) -> Option<Listener> {
        self.listeners.remove(&id)
    }

    /// Deliver a change to every listener whose location covers `key`.
    /// Listeners whose peer is gone are dropped. Returns the number of
    /// successful deliveries.
    pub fn notify(
        &mut self,
        journal: &mut dyn SubscriptionJournal,
        key: &Key,
        value: Option<&Value>,
        is_default: bool,
        is_writable: bool,
    ) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for listener in self.listeners.values() {
            if !listener.location.is_prefix_of(key) {
                continue;
            }
            let notification = Notification {
                database: self.database.to_string(),
                connection_id: listener.connection_id,
                key: key.to_string(),
                value: value.cloned(),
                is_default,
                is_writable,
            };
            match listener.peer.notify(&notification) {
                Ok(()) => delivered += 1,
                Err(PeerError::Unreachable(reason)) => {
                    debug!(id = %listener.connection_id, reason = %reason, "Failed to notify listener, dropping it");
                    dead.push(listener.connection_id);
                }
                Err(PeerError::Unsupported) => {
                    debug!(id = %listener.connection_id, "Listener refused notification");
                }
            }
        }
        for id in dead {
            self.remove(journal, id);
        }
        delivered
    }

    /// Check every peer and drop the listeners whose peer is gone.
    pub fn sweep_dead(&mut self, journal: &mut dyn SubscriptionJournal) -> usize {
        let dead: Vec<ConnectionId> = self
            .listeners
            .values()
            .filter(|l| !l.peer.is_alive())
            .map(|l| l.connection_id)
            .collect();
        for id in &dead {
            self.remove(journal, *id);
        }
        dead.len()
    }

    /// Make sure the next issued id is greater than `id`.
    pub fn ensure_next_id_above(&mut self, id: ConnectionId) {
        if self.next_id <= id.0 {
            self.next_id = id.0 + 1;
        }
    }

    /// The highest id handed out so far.
    pub fn last_issued(&self) -> Option<ConnectionId> {
        (self.next_id > 1).then(|| ConnectionId(self.next_id - 1))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Listener> {
        self.listeners.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.values()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Log records for every live listener, in id order.
    pub fn records(&self) -> Vec<ListenerRecord> {
        self.listeners
            .keys()
            .filter_map(|id| self.record_for(*id))
            .collect()
    }

    fn record_for(&self, id: ConnectionId) -> Option<ListenerRecord> {
        self.listeners.get(&id).map(|l| ListenerRecord {
            connection_id: id,
            database: self.database.clone(),
            location: l.location.clone(),
            peer: l.peer.token().clone(),
        })
    }
}
