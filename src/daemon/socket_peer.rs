//! Listener peers reached over a Unix socket.
//!
//! A subscriber that wants callbacks binds its own socket and registers the
//! token `unix:<path>`. Every call-out opens a short-lived connection, writes
//! one [`PeerRequest`] line and waits for one [`PeerReply`] line. The core
//! thread is blocking, so this uses std sockets with read and write timeouts.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::daemon::peer::{PeerConnector, PeerError, PeerToken, RemotePeer};
use crate::daemon::protocol::{ListenerUpdate, Notification, PeerReply, PeerRequest};

/// Token scheme for socket peers
pub const UNIX_SCHEME: &str = "unix:";

/// Token for a peer listening on `path`.
pub fn unix_token(path: &Path) -> PeerToken {
    PeerToken::new(format!("{}{}", UNIX_SCHEME, path.display()))
}

pub struct SocketPeer {
    token: PeerToken,
    path: PathBuf,
    timeout: Duration,
}

impl SocketPeer {
    pub fn new(token: PeerToken, path: PathBuf, timeout: Duration) -> Self {
        Self {
            token,
            path,
            timeout,
        }
    }

    fn unreachable(&self, reason: impl std::fmt::Display) -> PeerError {
        PeerError::Unreachable(format!("{}: {}", self.token, reason))
    }

    fn call(&self, request: &PeerRequest) -> Result<(), PeerError> {
        let mut stream = UnixStream::connect(&self.path).map_err(|e| self.unreachable(e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| self.unreachable(e))?;

        let mut line = serde_json::to_string(request).map_err(|e| self.unreachable(e))?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| self.unreachable(e))?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        let read = reader.read_line(&mut reply).map_err(|e| self.unreachable(e))?;
        if read == 0 {
            return Err(self.unreachable("connection closed without a reply"));
        }

        match serde_json::from_str::<PeerReply>(&reply) {
            Ok(PeerReply::Ok) => Ok(()),
            Ok(PeerReply::Unsupported) => Err(PeerError::Unsupported),
            Ok(PeerReply::Error { message }) => Err(self.unreachable(message)),
            Err(e) => Err(self.unreachable(format!("invalid reply: {}", e))),
        }
    }
}

impl RemotePeer for SocketPeer {
    fn token(&self) -> &PeerToken {
        &self.token
    }

    fn notify(&self, notification: &Notification) -> Result<(), PeerError> {
        self.call(&PeerRequest::Notify(notification.clone()))
    }

    fn is_alive(&self) -> bool {
        match self.call(&PeerRequest::Ping) {
            Ok(()) | Err(PeerError::Unsupported) => true,
            Err(e) => {
                debug!(peer = %self.token, error = %e, "Peer failed liveness check");
                false
            }
        }
    }

    fn update_listener(&self, update: &ListenerUpdate) -> Result<(), PeerError> {
        self.call(&PeerRequest::UpdateListener(update.clone()))
    }

    fn drop_all_caches(&self) -> Result<(), PeerError> {
        self.call(&PeerRequest::DropAllCaches)
    }
}

/// Resolves `unix:` tokens into [`SocketPeer`]s.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PeerConnector for SocketConnector {
    fn connect(&self, token: &PeerToken) -> Option<Box<dyn RemotePeer>> {
        let path = token.as_str().strip_prefix(UNIX_SCHEME)?;
        if path.is_empty() {
            return None;
        }
        Some(Box::new(SocketPeer::new(
            token.clone(),
            PathBuf::from(path),
            self.timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::listeners::ConnectionId;
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::TempDir;

    /// Answer `count` requests with `reply`, forwarding each request.
    fn serve(
        listener: UnixListener,
        count: usize,
        reply: PeerReply,
    ) -> mpsc::Receiver<PeerRequest> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for _ in 0..count {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                tx.send(serde_json::from_str(&line).unwrap()).unwrap();
                let mut stream = stream;
                let out = serde_json::to_string(&reply).unwrap();
                stream.write_all(out.as_bytes()).unwrap();
                stream.write_all(b"\n").unwrap();
            }
        });
        rx
    }

    fn notification() -> Notification {
        Notification {
            database: "def".to_string(),
            connection_id: ConnectionId(1),
            key: "/apps/x".to_string(),
            value: None,
            is_default: false,
            is_writable: true,
        }
    }

    #[test]
    fn connector_only_resolves_unix_tokens() {
        let connector = SocketConnector::new(Duration::from_millis(100));
        assert!(connector.connect(&PeerToken::new("local:abc")).is_none());
        assert!(connector.connect(&PeerToken::new("unix:")).is_none());
        let peer = connector
            .connect(&PeerToken::new("unix:/tmp/peer.sock"))
            .unwrap();
        assert_eq!(peer.token().as_str(), "unix:/tmp/peer.sock");
    }

    #[test]
    fn notify_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peer.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let requests = serve(listener, 1, PeerReply::Ok);

        let peer = SocketPeer::new(unix_token(&path), path, Duration::from_secs(2));
        peer.notify(&notification()).unwrap();

        match requests.recv().unwrap() {
            PeerRequest::Notify(n) => assert_eq!(n, notification()),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn unsupported_update_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peer.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _requests = serve(listener, 2, PeerReply::Unsupported);

        let peer = SocketPeer::new(unix_token(&path), path, Duration::from_secs(2));
        let update = ListenerUpdate {
            database: "def".to_string(),
            location: "/apps".to_string(),
            old_id: ConnectionId(5),
            new_id: ConnectionId(6),
        };
        assert_eq!(peer.update_listener(&update), Err(PeerError::Unsupported));
        // A peer that answers at all is alive.
        assert!(peer.is_alive());
    }

    #[test]
    fn missing_socket_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.sock");
        let peer = SocketPeer::new(unix_token(&path), path, Duration::from_millis(200));
        assert!(!peer.is_alive());
        assert!(matches!(
            peer.notify(&notification()),
            Err(PeerError::Unreachable(_))
        ));
    }
}
