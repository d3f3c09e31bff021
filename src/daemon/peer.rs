//! Handles to the remote processes the daemon calls back into.
//!
//! A listener owns a [`RemotePeer`]; the core never branches on how the peer
//! is reached. [`LocalPeer`] delivers into an in-process inbox and is what the
//! registry tests drive; the socket implementation lives in `socket_peer`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

use crate::daemon::protocol::{ListenerUpdate, Notification};

/// Stable, serializable identity of a peer. Written to the saved-state log and
/// resolved back into a live handle by a [`PeerConnector`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerToken(String);

impl PeerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from calling out to a peer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    /// The peer is gone; its subscriptions should be dropped.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The peer is alive but does not implement the call.
    #[error("peer does not support this call")]
    Unsupported,
}

/// A capability to call back into a subscriber.
pub trait RemotePeer: Send {
    fn token(&self) -> &PeerToken;

    /// Deliver a change notification.
    fn notify(&self, notification: &Notification) -> Result<(), PeerError>;

    /// Cheap liveness check.
    fn is_alive(&self) -> bool;

    /// Tell the peer a pre-restart subscription was re-armed under a new id.
    fn update_listener(&self, _update: &ListenerUpdate) -> Result<(), PeerError> {
        Err(PeerError::Unsupported)
    }

    /// Ask the peer to forget any values it cached.
    fn drop_all_caches(&self) -> Result<(), PeerError> {
        Ok(())
    }
}

/// Turns a [`PeerToken`] read back from the log into a live handle.
pub trait PeerConnector: Send {
    /// `None` when the token cannot be resolved to anything.
    fn connect(&self, token: &PeerToken) -> Option<Box<dyn RemotePeer>>;
}

#[derive(Default)]
struct Inbox {
    notifications: Mutex<Vec<Notification>>,
    updates: Mutex<Vec<ListenerUpdate>>,
    cache_drops: AtomicUsize,
    supports_update: AtomicBool,
}

/// The receiving side of an in-process peer. Dropping it makes every
/// [`LocalPeer`] pointing at it unreachable.
pub struct LocalEndpoint {
    token: PeerToken,
    inbox: Arc<Inbox>,
}

impl LocalEndpoint {
    pub fn new(token: impl Into<String>) -> Self {
        let inbox = Inbox {
            supports_update: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            token: PeerToken::new(token),
            inbox: Arc::new(inbox),
        }
    }

    pub fn token(&self) -> &PeerToken {
        &self.token
    }

    /// A fresh sending handle.
    pub fn peer(&self) -> Box<dyn RemotePeer> {
        Box::new(LocalPeer {
            token: self.token.clone(),
            inbox: Arc::downgrade(&self.inbox),
        })
    }

    /// Whether `update_listener` calls are accepted.
    pub fn set_supports_update(&self, supported: bool) {
        self.inbox.supports_update.store(supported, Ordering::SeqCst);
    }

    /// Take every notification received so far.
    pub fn take_notifications(&self) -> Vec<Notification> {
        match self.inbox.notifications.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Take every listener update received so far.
    pub fn take_updates(&self) -> Vec<ListenerUpdate> {
        match self.inbox.updates.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn cache_drops(&self) -> usize {
        self.inbox.cache_drops.load(Ordering::SeqCst)
    }
}

/// In-process [`RemotePeer`].
pub struct LocalPeer {
    token: PeerToken,
    inbox: Weak<Inbox>,
}

impl LocalPeer {
    fn inbox(&self) -> Result<Arc<Inbox>, PeerError> {
        self.inbox
            .upgrade()
            .ok_or_else(|| PeerError::Unreachable(self.token.to_string()))
    }
}

impl RemotePeer for LocalPeer {
    fn token(&self) -> &PeerToken {
        &self.token
    }

    fn notify(&self, notification: &Notification) -> Result<(), PeerError> {
        let inbox = self.inbox()?;
        let mut guard = inbox
            .notifications
            .lock()
            .map_err(|_| PeerError::Unreachable(self.token.to_string()))?;
        guard.push(notification.clone());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.inbox.strong_count() > 0
    }

    fn update_listener(&self, update: &ListenerUpdate) -> Result<(), PeerError> {
        let inbox = self.inbox()?;
        if !inbox.supports_update.load(Ordering::SeqCst) {
            return Err(PeerError::Unsupported);
        }
        let mut guard = inbox
            .updates
            .lock()
            .map_err(|_| PeerError::Unreachable(self.token.to_string()))?;
        guard.push(update.clone());
        Ok(())
    }

    fn drop_all_caches(&self) -> Result<(), PeerError> {
        let inbox = self.inbox()?;
        inbox.cache_drops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Resolves tokens of [`LocalEndpoint`]s that registered with it.
#[derive(Clone, Default)]
pub struct LocalConnector {
    endpoints: Arc<Mutex<HashMap<PeerToken, Weak<Inbox>>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint reachable through this connector.
    pub fn endpoint(&self, token: impl Into<String>) -> LocalEndpoint {
        let endpoint = LocalEndpoint::new(token);
        if let Ok(mut map) = self.endpoints.lock() {
            map.insert(endpoint.token.clone(), Arc::downgrade(&endpoint.inbox));
        }
        endpoint
    }
}

impl PeerConnector for LocalConnector {
    fn connect(&self, token: &PeerToken) -> Option<Box<dyn RemotePeer>> {
        let map = self.endpoints.lock().ok()?;
        let inbox = map.get(token)?;
        Some(Box::new(LocalPeer {
            token: token.clone(),
            inbox: inbox.clone(),
        }))
    }
}
